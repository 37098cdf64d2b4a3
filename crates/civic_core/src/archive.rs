//! Append-only archive of summarized documents, partitioned by the year and
//! month of the document date: `archive/<YYYY>/<MM>.json`.

use crate::dates::parse_iso_date;
use crate::error::{ArchiveReadError, ArchiveWriteError};
use crate::fsutil::{commit, stage, tmp_path, write_atomic};
use crate::schema::{ArchiveRecord, DocumentType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const STATS_FILE: &str = "stats.json";
const JOURNAL_FILE: &str = ".merge-journal.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u8,
}

impl PartitionKey {
    pub fn for_date(date: &str) -> Option<Self> {
        let date = parse_iso_date(date)?;
        Some(Self {
            year: date.year(),
            month: u8::from(date.month()),
        })
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(format!("{:04}", self.year))
            .join(format!("{:02}.json", self.month))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Totals written to `archive/stats.json` after every merge that adds records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveStats {
    pub total_records: usize,
    pub agendas: usize,
    pub minutes: usize,
    pub ai_generated: usize,
    pub fallback: usize,
    pub bodies: BTreeMap<String, usize>,
    pub months: Vec<String>,
    pub years: Vec<i32>,
    pub last_run_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub added: Vec<ArchiveRecord>,
    pub skipped_existing: usize,
    pub partitions_written: Vec<PartitionKey>,
}

#[derive(Debug)]
pub struct Archive {
    root: PathBuf,
    partitions: BTreeMap<PartitionKey, Vec<ArchiveRecord>>,
    ids: HashSet<String>,
}

impl Archive {
    /// Loads every partition under `root`, first completing a merge that was
    /// interrupted after its commit point. A missing directory is an empty archive.
    pub fn open(root: &Path) -> Result<Self, ArchiveReadError> {
        let mut archive = Self {
            root: root.to_path_buf(),
            partitions: BTreeMap::new(),
            ids: HashSet::new(),
        };
        if !root.exists() {
            return Ok(archive);
        }
        recover_interrupted_merge(root)?;

        for (key, path) in partition_files(root)? {
            let raw = fs::read_to_string(&path).map_err(|source| ArchiveReadError::Io {
                path: path.clone(),
                source,
            })?;
            let records: Vec<ArchiveRecord> = serde_json::from_str(&raw)
                .map_err(|source| ArchiveReadError::Parse { path: path.clone(), source })?;
            archive.ids.extend(records.iter().map(|r| r.id.clone()));
            archive.partitions.insert(key, records);
        }
        debug!(root = %root.display(), records = archive.len(), "archive loaded");
        Ok(archive)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn known_ids(&self) -> &HashSet<String> {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, newest partition first.
    pub fn records(&self) -> impl Iterator<Item = &ArchiveRecord> {
        self.partitions.values().rev().flatten()
    }

    pub fn partition_keys(&self) -> impl Iterator<Item = &PartitionKey> {
        self.partitions.keys()
    }

    /// Run ids are UTC timestamps, so the greatest one is the most recent run.
    pub fn latest_run_id(&self) -> Option<&str> {
        self.records().map(|r| r.run_id.as_str()).max()
    }

    pub fn records_for_run<'a>(&'a self, run_id: &'a str) -> impl Iterator<Item = &'a ArchiveRecord> {
        self.records().filter(move |r| r.run_id == run_id)
    }

    /// Appends records whose ids are not archived yet. Existing records are
    /// never touched, and within `incoming` the first record for an id wins.
    ///
    /// The merge is all or nothing on disk. Every touched partition and
    /// `stats.json` is staged next to its target first; a failure while
    /// staging discards the staged files and leaves the archive as it was.
    /// Once everything is staged a journal is written, and from then on the
    /// merge counts as committed: if moving the staged files into place is
    /// interrupted, [`Archive::open`] finishes it from the journal.
    pub fn merge(&mut self, incoming: Vec<ArchiveRecord>) -> Result<MergeOutcome, ArchiveWriteError> {
        let mut outcome = MergeOutcome::default();
        let mut batch_ids = HashSet::new();
        let mut grouped: BTreeMap<PartitionKey, Vec<ArchiveRecord>> = BTreeMap::new();

        for record in incoming {
            if self.ids.contains(&record.id) || !batch_ids.insert(record.id.clone()) {
                outcome.skipped_existing += 1;
                continue;
            }
            let key = PartitionKey::for_date(&record.date).ok_or_else(|| {
                ArchiveWriteError::InvalidDate {
                    id: record.id.clone(),
                    date: record.date.clone(),
                }
            })?;
            grouped.entry(key).or_default().push(record);
        }

        let mut next = self.partitions.clone();
        let mut writes = Vec::new();
        for (key, new_records) in &grouped {
            let combined = next.entry(*key).or_default();
            combined.extend(new_records.iter().cloned());
            sort_newest_first(combined);
            writes.push((key.path(&self.root), serde_json::to_vec_pretty(&*combined)?));
        }

        let stats_path = self.root.join(STATS_FILE);
        if !grouped.is_empty() || !stats_path.exists() {
            writes.push((stats_path, serde_json::to_vec_pretty(&compute_stats(&next))?));
        }

        if !writes.is_empty() {
            self.commit_writes(writes)?;
        }

        self.partitions = next;
        for (key, new_records) in grouped {
            debug!(partition = %key, added = new_records.len(), "partition written");
            self.ids.extend(new_records.iter().map(|r| r.id.clone()));
            outcome.partitions_written.push(key);
            outcome.added.extend(new_records);
        }

        info!(
            added = outcome.added.len(),
            skipped = outcome.skipped_existing,
            partitions = outcome.partitions_written.len(),
            total = self.len(),
            "archive merged"
        );
        Ok(outcome)
    }

    fn commit_writes(&self, writes: Vec<(PathBuf, Vec<u8>)>) -> Result<(), ArchiveWriteError> {
        let mut staged: Vec<PathBuf> = Vec::new();
        for (path, data) in &writes {
            if let Err(source) = stage(path, data) {
                discard_staged(&staged);
                return Err(ArchiveWriteError::Io {
                    path: path.clone(),
                    source,
                });
            }
            staged.push(path.clone());
        }

        let journal = MergeJournal {
            files: staged
                .iter()
                .map(|path| path.strip_prefix(&self.root).unwrap_or(path.as_path()).to_path_buf())
                .collect(),
        };
        let journal_path = self.root.join(JOURNAL_FILE);
        let written = serde_json::to_vec_pretty(&journal)
            .map_err(ArchiveWriteError::from)
            .and_then(|data| {
                write_atomic(&journal_path, &data).map_err(|source| ArchiveWriteError::Io {
                    path: journal_path.clone(),
                    source,
                })
            });
        if let Err(err) = written {
            discard_staged(&staged);
            return Err(err);
        }

        apply_journal(&self.root, &journal)
            .map_err(|(path, source)| ArchiveWriteError::Io { path, source })?;
        fs::remove_file(&journal_path).map_err(|source| ArchiveWriteError::Io {
            path: journal_path,
            source,
        })?;
        Ok(())
    }

    pub fn stats(&self) -> ArchiveStats {
        compute_stats(&self.partitions)
    }
}

/// Staged files of a committed merge, relative to the archive root.
#[derive(Debug, Serialize, Deserialize)]
struct MergeJournal {
    files: Vec<PathBuf>,
}

/// Moves every staged file of `journal` into place. Files already moved are
/// skipped, so replaying a journal twice is harmless.
fn apply_journal(root: &Path, journal: &MergeJournal) -> Result<(), (PathBuf, std::io::Error)> {
    for relative in &journal.files {
        let target = root.join(relative);
        let tmp = tmp_path(&target);
        if tmp.exists() {
            commit(&tmp, &target).map_err(|source| (target.clone(), source))?;
        }
    }
    Ok(())
}

fn discard_staged(targets: &[PathBuf]) {
    for target in targets {
        let _ = fs::remove_file(tmp_path(target));
    }
}

/// Finishes a merge whose journal was written but not cleared.
fn recover_interrupted_merge(root: &Path) -> Result<(), ArchiveReadError> {
    let journal_path = root.join(JOURNAL_FILE);
    if !journal_path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(&journal_path).map_err(|source| ArchiveReadError::Io {
        path: journal_path.clone(),
        source,
    })?;
    let journal: MergeJournal = serde_json::from_str(&raw).map_err(|source| ArchiveReadError::Parse {
        path: journal_path.clone(),
        source,
    })?;
    apply_journal(root, &journal).map_err(|(path, source)| ArchiveReadError::Io { path, source })?;
    fs::remove_file(&journal_path).map_err(|source| ArchiveReadError::Io {
        path: journal_path,
        source,
    })?;
    info!(root = %root.display(), files = journal.files.len(), "completed interrupted archive merge");
    Ok(())
}

fn compute_stats(partitions: &BTreeMap<PartitionKey, Vec<ArchiveRecord>>) -> ArchiveStats {
    let mut stats = ArchiveStats::default();
    let mut years = BTreeSet::new();
    for (key, records) in partitions {
        if records.is_empty() {
            continue;
        }
        years.insert(key.year);
        stats.months.push(key.to_string());
        for record in records {
            stats.total_records += 1;
            match record.doc_type {
                DocumentType::Agenda => stats.agendas += 1,
                DocumentType::Minutes => stats.minutes += 1,
            }
            if record.ai_generated() {
                stats.ai_generated += 1;
            } else {
                stats.fallback += 1;
            }
            *stats.bodies.entry(record.body.clone()).or_default() += 1;
        }
    }
    stats.months.reverse();
    stats.years = years.into_iter().rev().collect();
    stats.last_run_id = partitions
        .values()
        .flatten()
        .map(|r| r.run_id.as_str())
        .max()
        .map(str::to_string);
    stats
}

/// Newest document date first, ties broken by id.
pub fn sort_newest_first(records: &mut [ArchiveRecord]) {
    records.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
}

fn partition_files(root: &Path) -> Result<Vec<(PartitionKey, PathBuf)>, ArchiveReadError> {
    let read_dir = |dir: &Path| {
        fs::read_dir(dir).map_err(|source| ArchiveReadError::Io {
            path: dir.to_path_buf(),
            source,
        })
    };

    let mut files = Vec::new();
    for year_entry in read_dir(root)?.filter_map(|e| e.ok()) {
        let year_path = year_entry.path();
        let Some(year) = year_path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| n.len() == 4)
            .and_then(|n| n.parse::<i32>().ok())
        else {
            continue;
        };
        if !year_path.is_dir() {
            continue;
        }
        for month_entry in read_dir(&year_path)?.filter_map(|e| e.ok()) {
            let path = month_entry.path();
            let Some(month) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .filter(|m| m.len() == 2)
                .and_then(|m| m.parse::<u8>().ok())
                .filter(|m| (1..=12).contains(m))
            else {
                continue;
            };
            if !path.is_file() {
                continue;
            }
            files.push((PartitionKey { year, month }, path));
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{GenerationMethod, Summary};

    fn record(id: &str, date: &str, run_id: &str) -> ArchiveRecord {
        ArchiveRecord {
            id: id.to_string(),
            body: "Planning Commission".to_string(),
            title: format!("Planning Commission Agenda {date}"),
            date: date.to_string(),
            url: format!("https://lcf.ca.gov/{id}.pdf"),
            doc_type: DocumentType::Agenda,
            summary: Summary {
                document_id: id.to_string(),
                text: format!("Summary of {id}"),
                method: GenerationMethod::Ai,
                model: Some("gpt-3.5-turbo".to_string()),
                usage: None,
            },
            archived_at: "2025-07-20T16:00:05Z".to_string(),
            run_id: run_id.to_string(),
        }
    }

    fn snapshot_dir(root: &Path) -> BTreeMap<PathBuf, String> {
        let mut files = BTreeMap::new();
        for (_, path) in partition_files(root).unwrap() {
            files.insert(path.clone(), fs::read_to_string(&path).unwrap());
        }
        let stats = root.join(STATS_FILE);
        files.insert(stats.clone(), fs::read_to_string(&stats).unwrap());
        files
    }

    #[test]
    fn merge_writes_partitions_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path()).unwrap();
        assert!(archive.is_empty());

        let outcome = archive
            .merge(vec![
                record("a", "2025-06-03", "20250720T160005Z"),
                record("b", "2025-07-16", "20250720T160005Z"),
                record("c", "2025-07-01", "20250720T160005Z"),
            ])
            .unwrap();
        assert_eq!(outcome.added.len(), 3);
        assert_eq!(outcome.partitions_written.len(), 2);
        assert!(dir.path().join("2025").join("06.json").exists());
        assert!(dir.path().join("2025").join("07.json").exists());

        let reopened = Archive::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 3);
        let ids: Vec<_> = reopened.records().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(reopened.latest_run_id(), Some("20250720T160005Z"));
    }

    #[test]
    fn merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let batch = vec![
            record("a", "2025-06-03", "run1"),
            record("b", "2025-07-16", "run1"),
        ];
        let mut archive = Archive::open(dir.path()).unwrap();
        archive.merge(batch.clone()).unwrap();
        let before = snapshot_dir(dir.path());

        let outcome = archive.merge(batch).unwrap();
        assert!(outcome.added.is_empty());
        assert_eq!(outcome.skipped_existing, 2);
        assert!(outcome.partitions_written.is_empty());
        assert_eq!(snapshot_dir(dir.path()), before);
    }

    #[test]
    fn existing_records_are_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path()).unwrap();
        archive.merge(vec![record("a", "2025-07-02", "run1")]).unwrap();

        let mut changed = record("a", "2025-07-02", "run2");
        changed.summary.text = "A different summary".to_string();
        let outcome = archive
            .merge(vec![changed, record("b", "2025-07-09", "run2")])
            .unwrap();
        assert_eq!(outcome.added.len(), 1);

        let reopened = Archive::open(dir.path()).unwrap();
        let a = reopened.records().find(|r| r.id == "a").unwrap();
        assert_eq!(a.summary.text, "Summary of a");
        assert_eq!(a.run_id, "run1");
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn first_record_in_batch_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path()).unwrap();
        let mut second = record("a", "2025-07-02", "run1");
        second.title = "Second copy".to_string();
        let outcome = archive
            .merge(vec![record("a", "2025-07-02", "run1"), second])
            .unwrap();
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.skipped_existing, 1);
        assert_ne!(archive.records().next().unwrap().title, "Second copy");
    }

    #[test]
    fn invalid_date_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path()).unwrap();
        let err = archive
            .merge(vec![record("a", "2025-07-02", "run1"), record("b", "someday", "run1")])
            .unwrap_err();
        assert!(matches!(err, ArchiveWriteError::InvalidDate { .. }));
        assert!(archive.is_empty());
        assert!(!dir.path().join("2025").exists());
    }

    #[test]
    fn leftover_tmp_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path()).unwrap();
        archive.merge(vec![record("a", "2025-07-02", "run1")]).unwrap();
        fs::write(dir.path().join("2025").join("07.json.tmp"), "[ half written").unwrap();

        let reopened = Archive::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn failed_partition_leaves_archive_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path()).unwrap();
        archive.merge(vec![record("old", "2025-05-20", "run1")]).unwrap();
        let before = snapshot_dir(dir.path());

        // a directory where the July partition belongs makes the second partition unwritable
        fs::create_dir_all(dir.path().join("2025").join("07.json")).unwrap();
        let err = archive
            .merge(vec![
                record("a", "2025-06-03", "run2"),
                record("b", "2025-07-16", "run2"),
            ])
            .unwrap_err();
        assert!(matches!(err, ArchiveWriteError::Io { .. }));

        assert!(!dir.path().join("2025").join("06.json").exists());
        assert!(!dir.path().join("2025").join("06.json.tmp").exists());
        assert!(!dir.path().join(STATS_FILE).with_extension("json.tmp").exists());
        assert!(!dir.path().join(JOURNAL_FILE).exists());
        assert_eq!(archive.len(), 1);
        assert!(!archive.contains("a"));

        fs::remove_dir(dir.path().join("2025").join("07.json")).unwrap();
        assert_eq!(snapshot_dir(dir.path()), before);
        let outcome = archive
            .merge(vec![
                record("a", "2025-06-03", "run2"),
                record("b", "2025-07-16", "run2"),
            ])
            .unwrap();
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(Archive::open(dir.path()).unwrap().len(), 3);
    }

    #[test]
    fn open_completes_a_committed_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path()).unwrap();
        archive.merge(vec![record("a", "2025-07-02", "run1")]).unwrap();

        // state after the journal was written but before the staged files moved
        let mut july = archive.partitions[&PartitionKey { year: 2025, month: 7 }].clone();
        july.push(record("b", "2025-07-09", "run2"));
        sort_newest_first(&mut july);
        let august = vec![record("c", "2025-08-01", "run2")];
        let july_path = dir.path().join("2025").join("07.json");
        let august_path = dir.path().join("2025").join("08.json");
        stage(&july_path, &serde_json::to_vec_pretty(&july).unwrap()).unwrap();
        stage(&august_path, &serde_json::to_vec_pretty(&august).unwrap()).unwrap();
        let journal = MergeJournal {
            files: vec![PathBuf::from("2025/07.json"), PathBuf::from("2025/08.json")],
        };
        fs::write(dir.path().join(JOURNAL_FILE), serde_json::to_vec(&journal).unwrap()).unwrap();

        let reopened = Archive::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 3);
        assert!(reopened.contains("b") && reopened.contains("c"));
        assert!(!dir.path().join(JOURNAL_FILE).exists());
        assert!(!tmp_path(&july_path).exists());

        // replaying again is a no-op
        assert_eq!(Archive::open(dir.path()).unwrap().len(), 3);
    }

    #[test]
    fn corrupt_partition_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2025")).unwrap();
        fs::write(dir.path().join("2025").join("07.json"), "{ not an array").unwrap();
        let err = Archive::open(dir.path()).unwrap_err();
        assert!(matches!(err, ArchiveReadError::Parse { .. }));
    }

    #[test]
    fn stats_summarize_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path()).unwrap();
        let mut minutes = record("m", "2024-12-10", "run1");
        minutes.doc_type = DocumentType::Minutes;
        minutes.summary.method = GenerationMethod::Fallback;
        minutes.body = "City Council".to_string();
        archive
            .merge(vec![record("a", "2025-07-02", "run2"), minutes])
            .unwrap();

        let stats = archive.stats();
        assert_eq!(stats.total_records, 2);
        assert_eq!((stats.agendas, stats.minutes), (1, 1));
        assert_eq!((stats.ai_generated, stats.fallback), (1, 1));
        assert_eq!(stats.months, vec!["2025-07", "2024-12"]);
        assert_eq!(stats.years, vec![2025, 2024]);
        assert_eq!(stats.last_run_id.as_deref(), Some("run2"));

        let on_disk: ArchiveStats =
            serde_json::from_str(&fs::read_to_string(dir.path().join(STATS_FILE)).unwrap()).unwrap();
        assert_eq!(on_disk, stats);
    }
}
