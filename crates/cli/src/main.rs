use anyhow::{Context, Result, bail};
use civic_core::alert::{Alerter, Severity};
use civic_core::archive::Archive;
use civic_core::config::Config;
use civic_core::dates::format_timestamp;
use civic_core::pipeline::{self, Pipeline, RunOptions, RunReport};
use civic_core::publish::{self, SearchQuery};
use civic_core::schedule;
use civic_core::schema::DocumentType;
use clap::{Parser, Subcommand};
use schemars::schema_for;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "civic-summaries")]
#[command(about = "La Cañada Flintridge civic meeting summaries", long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(long, global = true, default_value = "civic.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, summarize, archive, publish and notify once
    Run {
        /// Lookback window in days (default from config)
        #[arg(long)]
        days_back: Option<u32>,
        /// Fetch only; nothing is summarized, archived or sent
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the pipeline on the weekly schedule until stopped
    Schedule,
    /// Check configuration, data directory and schedule
    Check,
    /// Regenerate the read model from the archive
    Publish,
    /// Search published summaries
    Search {
        q: String,
        #[arg(long)]
        body: Option<String>,
        /// agenda or minutes
        #[arg(long = "type")]
        doc_type: Option<String>,
    },
    /// Obsidian vault rendering of the archive
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },
    /// Export canonical JSON Schemas to the ./schemas directory
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
}

#[derive(Subcommand)]
enum VaultCommands {
    /// Write notes and indexes for every archived document
    Build {
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Export JSON Schema files for canonical types
    Export {
        /// Output directory (default: ./schemas)
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Schema { command } = &cli.command {
        init_tracing(false);
        return match command {
            SchemaCommands::Export { out_dir } => schema_export(out_dir),
        };
    }

    let config = Config::load(&cli.config)?;
    init_tracing(config.general.debug);

    match cli.command {
        Commands::Run { days_back, dry_run } => {
            let mut options = RunOptions::from_config(&config, OffsetDateTime::now_utc());
            if let Some(days) = days_back {
                options.days_back = days;
            }
            options.dry_run = dry_run;
            let report = run_once(&config, &options).inspect_err(|err| {
                alerter(&config).alert_quietly(Severity::Error, &format!("Pipeline run failed: {err:#}"))
            })?;
            print_report(&report);
            Ok(())
        }
        Commands::Schedule => run_schedule(&config),
        Commands::Check => check(&config),
        Commands::Publish => {
            let snapshot = pipeline::republish(&config.paths(), OffsetDateTime::now_utc())?;
            println!(
                "Published {} current and {} archived documents to {}",
                snapshot.current.stats.total_documents,
                snapshot.archive.stats.total_documents,
                config.paths().public_dir.display()
            );
            Ok(())
        }
        Commands::Search { q, body, doc_type } => search(&config, q, body, doc_type),
        Commands::Vault { command } => match command {
            VaultCommands::Build { out } => vault_build(&config, &out),
        },
        Commands::Schema { .. } => Ok(()),
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("CIVIC_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn alerter(config: &Config) -> Alerter {
    Alerter::new(config.alerts.webhook_url.as_deref(), &config.general.environment)
}

/// One pipeline run; a run that finishes with warnings is alerted.
fn run_once(config: &Config, options: &RunOptions) -> Result<RunReport> {
    let alerter = alerter(config);
    let mut pipeline = Pipeline::from_config(config)?;
    match pipeline.run(options) {
        Ok(report) => {
            if !report.warnings.is_empty() && !report.dry_run {
                alerter.alert_quietly(
                    Severity::Warning,
                    &format!("Run {} finished with {} warnings", report.run_id, report.warnings.len()),
                );
            }
            Ok(report)
        }
        Err(err) => {
            error!(error = %err, "run failed");
            Err(err).context("pipeline run failed")
        }
    }
}

fn print_report(report: &RunReport) {
    if report.dry_run {
        println!("Dry run {}: {} documents would be summarized", report.run_id, report.documents.len());
        for doc in &report.documents {
            println!("  {} [{}] {} ({})", doc.date, doc.doc_type, doc.title, doc.body);
        }
    } else {
        println!("{}", report.summary_line());
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
}

fn run_schedule(config: &Config) -> Result<()> {
    let trigger = config.schedule.trigger()?;
    let retry = config.schedule.retry();
    let alerter = alerter(config);
    info!(
        day = %config.schedule.day,
        time = %config.schedule.time,
        utc_offset = %config.schedule.utc_offset,
        max_attempts = retry.max_attempts,
        "starting weekly scheduler"
    );
    schedule::run_forever(
        trigger,
        || {
            let started = Instant::now();
            let report = retry.run(
                || run_once(config, &RunOptions::from_config(config, OffsetDateTime::now_utc())),
                std::thread::sleep,
            )?;
            let elapsed = started.elapsed().as_secs_f64();
            info!(elapsed_secs = elapsed, "{}", report.summary_line());
            alerter.alert_quietly(
                Severity::Info,
                &format!("Scheduled run completed in {elapsed:.2}s: {}", report.summary_line()),
            );
            Ok(())
        },
        |err| {
            alerter.alert_quietly(
                Severity::Error,
                &format!("Scheduled run failed after {} attempts: {err:#}", retry.max_attempts),
            )
        },
    )
}

fn check(config: &Config) -> Result<()> {
    let mut problems = 0;
    println!("Environment: {}", config.general.environment);
    println!("Bodies tracked: {}", config.bodies.len());

    let missing = config.missing_settings();
    if missing.is_empty() {
        println!("Settings: ok");
    } else {
        problems += 1;
        println!("Missing settings: {}", missing.join(", "));
    }
    if config.email.enabled && (config.email.smtp_server.trim().is_empty() || config.email.smtp_port == 0) {
        problems += 1;
        println!("SMTP server is not configured");
    }

    let paths = config.paths();
    match probe_writable(&paths.root) {
        Ok(()) => println!("Data directory {}: writable", paths.root.display()),
        Err(err) => {
            problems += 1;
            println!("Data directory {}: {err:#}", paths.root.display());
        }
    }

    let trigger = config.schedule.trigger()?;
    let now = OffsetDateTime::now_utc();
    println!(
        "Schedule: every {} at {} (UTC{}), next run {}",
        config.schedule.day,
        config.schedule.time,
        config.schedule.utc_offset,
        format_timestamp(trigger.next_run_after(now))
    );

    let snapshot = publish::load_snapshot(&paths.public_dir).ok();
    let health = publish::health(snapshot.as_ref(), &format_timestamp(now));
    println!("{}", serde_json::to_string_pretty(&health)?);

    if problems > 0 {
        bail!("{problems} configuration problem(s) found");
    }
    println!("Configuration ok");
    Ok(())
}

fn probe_writable(root: &Path) -> Result<()> {
    fs::create_dir_all(root).context("cannot create")?;
    let probe = root.join(".write-probe");
    fs::write(&probe, b"ok").context("not writable")?;
    fs::remove_file(&probe).context("cannot clean up probe file")?;
    Ok(())
}

fn search(config: &Config, q: String, body: Option<String>, doc_type: Option<String>) -> Result<()> {
    let doc_type = match doc_type {
        Some(raw) => Some(
            DocumentType::parse(&raw).with_context(|| format!("unknown document type {raw:?}"))?,
        ),
        None => None,
    };
    let snapshot = publish::load_snapshot(&config.paths().public_dir)
        .context("no published read model; run `publish` first")?;
    let results = publish::search(&snapshot, &SearchQuery { q, body, doc_type })?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn vault_build(config: &Config, out: &Path) -> Result<()> {
    let archive = Archive::open(&config.paths().archive_dir).context("loading archive")?;
    if archive.is_empty() {
        warn!("archive is empty, writing an empty vault");
    }
    let summary = obsidian::build_vault(&archive, out, OffsetDateTime::now_utc())?;
    println!(
        "Vault written to {} ({} notes, {} bodies)",
        out.display(),
        summary.records,
        summary.bodies
    );
    Ok(())
}

fn schema_export(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("Document", schema_for!(civic_core::schema::Document)),
        ("Summary", schema_for!(civic_core::schema::Summary)),
        ("ArchiveRecord", schema_for!(civic_core::schema::ArchiveRecord)),
        ("ArchiveStats", schema_for!(civic_core::archive::ArchiveStats)),
        ("PublishedSnapshot", schema_for!(civic_core::schema::PublishedSnapshot)),
        ("PublishedSection", schema_for!(civic_core::schema::PublishedSection)),
        ("PublishedEntry", schema_for!(civic_core::schema::PublishedEntry)),
        ("Report", schema_for!(civic_core::notify::Report)),
        ("Health", schema_for!(civic_core::publish::Health)),
        ("BodiesList", schema_for!(civic_core::publish::BodiesList)),
        ("SearchResults", schema_for!(civic_core::publish::SearchResults)),
    ];
    for (name, schema) in schemas {
        let json = serde_json::to_string_pretty(&schema)?;
        fs::write(out_dir.join(format!("{name}.schema.json")), json)?;
    }

    println!("Exported schemas to {}", out_dir.display());
    Ok(())
}
