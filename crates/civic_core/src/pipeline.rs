//! One end-to-end run: fetch, summarize, merge, publish, notify.
//!
//! Only archive failures and lock contention end a run early. Everything
//! else becomes a warning on the [`RunReport`].

use crate::archive::Archive;
use crate::config::{Config, DataPaths};
use crate::dates::{format_timestamp, run_id};
use crate::error::PipelineError;
use crate::fetch::{ConfiguredSource, DocumentSource, FetchRequest, LookbackWindow, fetch_all};
use crate::notify::{Notifier, NotifyOutcome};
use crate::publish::{build_snapshot, write_snapshot};
use crate::schema::{ArchiveRecord, DocumentType, PublishedSnapshot};
use crate::summarize::Summarizer;
use anyhow::Context;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Idle,
    Fetching,
    Summarizing,
    Merging,
    Publishing,
    Notifying,
    Failed,
}

/// Exclusive advisory lock held for the duration of a run.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(PipelineError::RunLocked {
                    path: path.to_path_buf(),
                });
            }
            return Err(PipelineError::Io(err));
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub days_back: u32,
    pub dry_run: bool,
    pub now: OffsetDateTime,
}

impl RunOptions {
    pub fn from_config(config: &Config, now: OffsetDateTime) -> Self {
        Self {
            days_back: config.general.days_back,
            dry_run: false,
            now,
        }
    }
}

/// A fetched document as listed in the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRef {
    pub id: String,
    pub body: String,
    pub title: String,
    pub date: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: String,
    pub dry_run: bool,
    pub stages: Vec<RunStage>,
    pub documents: Vec<DocumentRef>,
    pub skipped_known: usize,
    pub skipped_stale: usize,
    pub fetch_failures: usize,
    pub ai_summaries: usize,
    pub fallback_summaries: usize,
    pub api_calls: usize,
    pub archived: Vec<ArchiveRecord>,
    pub skipped_existing: usize,
    pub published: bool,
    pub notified: bool,
    pub warnings: Vec<String>,
}

impl RunReport {
    fn new(run_id: String, started_at: String, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            dry_run,
            stages: vec![RunStage::Idle],
            documents: Vec::new(),
            skipped_known: 0,
            skipped_stale: 0,
            fetch_failures: 0,
            ai_summaries: 0,
            fallback_summaries: 0,
            api_calls: 0,
            archived: Vec::new(),
            skipped_existing: 0,
            published: false,
            notified: false,
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, stage: RunStage) {
        info!(run_id = %self.run_id, stage = ?stage, "stage");
        self.stages.push(stage);
    }

    fn warn(&mut self, message: String) {
        warn!(run_id = %self.run_id, "{message}");
        self.warnings.push(message);
    }

    pub fn current_stage(&self) -> RunStage {
        self.stages.last().copied().unwrap_or(RunStage::Idle)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "run {}: {} new documents archived ({} AI, {} fallback, {} API calls), {} already known, {} warnings",
            self.run_id,
            self.archived.len(),
            self.ai_summaries,
            self.fallback_summaries,
            self.api_calls,
            self.skipped_known,
            self.warnings.len()
        )
    }
}

pub struct Pipeline<'a, S> {
    config: &'a Config,
    paths: DataPaths,
    source: S,
    summarizer: Summarizer,
    notifier: Notifier,
    last_report: Option<RunReport>,
}

impl<'a> Pipeline<'a, ConfiguredSource> {
    /// Production wiring from configuration.
    pub fn from_config(config: &'a Config) -> anyhow::Result<Self> {
        let source = ConfiguredSource::new().context("building HTTP client")?;
        let summarizer = Summarizer::from_config(&config.llm).context("building LLM client")?;
        let paths = config.paths();
        let notifier =
            Notifier::from_config(&config.email, &paths.reports_dir).context("building notifier")?;
        Ok(Self::new(config, source, summarizer, notifier))
    }
}

impl<'a, S: DocumentSource> Pipeline<'a, S> {
    pub fn new(config: &'a Config, source: S, summarizer: Summarizer, notifier: Notifier) -> Self {
        Self {
            paths: config.paths(),
            config,
            source,
            summarizer,
            notifier,
            last_report: None,
        }
    }

    pub fn run(&mut self, options: &RunOptions) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new(
            run_id(options.now),
            format_timestamp(options.now),
            options.dry_run,
        );
        info!(run_id = %report.run_id, dry_run = options.dry_run, days_back = options.days_back, "run started");

        let result = self.run_stages(options, &mut report);
        if let Err(err) = &result {
            report.enter(RunStage::Failed);
            error!(run_id = %report.run_id, error = %err, "run failed");
        }
        report.enter(RunStage::Idle);
        self.last_report = Some(report.clone());
        match result {
            Ok(()) => {
                info!("{}", report.summary_line());
                Ok(report)
            }
            Err(err) => Err(err),
        }
    }

    /// Report of the most recent run, including runs that failed.
    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }

    fn run_stages(&mut self, options: &RunOptions, report: &mut RunReport) -> Result<(), PipelineError> {
        self.paths.ensure()?;
        let _lock = RunLock::acquire(&self.paths.lock_file)?;
        let mut archive = Archive::open(&self.paths.archive_dir)?;

        report.enter(RunStage::Fetching);
        let request = FetchRequest {
            bodies: &self.config.bodies,
            window: LookbackWindow::days_back(options.now.date(), options.days_back),
            known_ids: archive.known_ids(),
            concurrency: self.config.general.fetch_concurrency,
        };
        let fetched = fetch_all(&self.source, &request);
        report.skipped_known = fetched.skipped_known;
        report.skipped_stale = fetched.skipped_stale;
        report.fetch_failures = fetched.failure_count();
        for (body, err) in &fetched.body_failures {
            report.warn(format!("fetch failed for {body}: {err}"));
        }
        for (body, err) in &fetched.document_failures {
            report.warn(format!("document skipped for {body}: {err}"));
        }
        report.documents = fetched
            .documents
            .iter()
            .map(|d| DocumentRef {
                id: d.id.clone(),
                body: d.body.clone(),
                title: d.title.clone(),
                date: d.date.clone(),
                doc_type: d.doc_type,
            })
            .collect();

        if options.dry_run {
            for doc in &report.documents {
                info!(id = %doc.id, title = %doc.title, "would archive");
            }
            return Ok(());
        }

        report.enter(RunStage::Summarizing);
        let records: Vec<ArchiveRecord> = fetched
            .documents
            .iter()
            .map(|document| {
                let summary = self.summarizer.summarize(document);
                ArchiveRecord::new(document, summary, &report.run_id, &report.started_at)
            })
            .collect();
        let stats = self.summarizer.stats();
        report.ai_summaries = stats.ai_generated;
        report.fallback_summaries = stats.fallback;
        report.api_calls = stats.api_calls;

        report.enter(RunStage::Merging);
        let merged = archive.merge(records)?;
        report.skipped_existing = merged.skipped_existing;
        report.archived = merged.added;

        report.enter(RunStage::Publishing);
        let snapshot = build_snapshot(&archive, &report.started_at);
        match write_snapshot(&snapshot, &self.paths.public_dir) {
            Ok(_) => report.published = true,
            Err(err) => report.warn(format!("publishing read model failed: {err}")),
        }

        report.enter(RunStage::Notifying);
        match self
            .notifier
            .notify(&report.archived, options.now, options.days_back)
        {
            NotifyOutcome::Skipped { reason } => info!(reason, "notification skipped"),
            NotifyOutcome::Sent { delivered, failed } => {
                report.notified = !delivered.is_empty();
                for (transport, err) in failed {
                    report.warn(format!("{transport} delivery failed: {err}"));
                }
            }
        }
        Ok(())
    }

    pub fn summarizer(&self) -> &Summarizer {
        &self.summarizer
    }
}

/// Rebuilds the read model from the archive alone.
pub fn republish(paths: &DataPaths, now: OffsetDateTime) -> anyhow::Result<PublishedSnapshot> {
    let archive = Archive::open(&paths.archive_dir).context("loading archive")?;
    let snapshot = build_snapshot(&archive, &format_timestamp(now));
    write_snapshot(&snapshot, &paths.public_dir).context("writing read model")?;
    Ok(snapshot)
}
