//! Read model served to the API layer and the static site.
//!
//! The snapshot is rebuilt from the archive on every run. Records of the most
//! recent run form the `current` section, everything older is `archive`.

use crate::archive::Archive;
use crate::error::PublishError;
use crate::fsutil::write_atomic;
use crate::schema::{
    ArchiveRecord, BodyEntries, DocumentType, PublishedEntry, PublishedSection, PublishedSnapshot,
    SectionStats,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CURRENT_FILE: &str = "current.json";
pub const ARCHIVE_FILE: &str = "archive.json";
pub const ALL_FILE: &str = "all.json";
pub const BODIES_FILE: &str = "bodies.json";

const SERVICE_NAME: &str = "LCF Civic Summaries API";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BodiesList {
    pub bodies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Health {
    pub status: String,
    pub timestamp: String,
    pub service: String,
    pub last_updated: Option<String>,
    pub total_documents: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub q: String,
    pub body: Option<String>,
    pub doc_type: Option<DocumentType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchResults {
    pub query: String,
    pub results: Vec<PublishedEntry>,
    pub count: usize,
}

pub fn build_snapshot(archive: &Archive, generated_at: &str) -> PublishedSnapshot {
    let run_id = archive.latest_run_id().map(str::to_string);
    let (current, historical): (Vec<&ArchiveRecord>, Vec<&ArchiveRecord>) = archive
        .records()
        .partition(|record| Some(record.run_id.as_str()) == run_id.as_deref());

    PublishedSnapshot {
        last_updated: generated_at.to_string(),
        current: build_section(&current, false, generated_at),
        archive: build_section(&historical, true, generated_at),
        run_id,
    }
}

fn build_section(records: &[&ArchiveRecord], historical: bool, generated_at: &str) -> PublishedSection {
    let mut data: BTreeMap<String, BodyEntries> = BTreeMap::new();
    let mut months = Vec::new();
    let mut seen_months = BTreeSet::new();

    for record in records {
        let month = record.month_label();
        if let Some(label) = &month {
            if seen_months.insert(label.clone()) {
                months.push(label.clone());
            }
        }
        data.entry(record.body.clone())
            .or_default()
            .push(to_entry(record, if historical { month } else { None }));
    }

    PublishedSection {
        stats: section_stats(&data, months),
        data,
        last_updated: generated_at.to_string(),
    }
}

fn to_entry(record: &ArchiveRecord, month: Option<String>) -> PublishedEntry {
    PublishedEntry {
        id: record.id.clone(),
        title: record.title.clone(),
        date: record.date.clone(),
        summary: record.summary.text.clone(),
        url: record.url.clone(),
        doc_type: record.doc_type,
        ai_generated: record.ai_generated(),
        body: record.body.clone(),
        month,
        source: None,
    }
}

fn section_stats(data: &BTreeMap<String, BodyEntries>, months: Vec<String>) -> SectionStats {
    let entries = || data.values().flat_map(BodyEntries::iter);
    SectionStats {
        total_documents: entries().count(),
        total_bodies: data.len(),
        total_agendas: data.values().map(|b| b.agendas.len()).sum(),
        total_minutes: data.values().map(|b| b.minutes.len()).sum(),
        ai_summaries: entries().filter(|e| e.ai_generated).count(),
        months,
    }
}

/// Writes every read-model file atomically and returns their paths.
pub fn write_snapshot(snapshot: &PublishedSnapshot, public_dir: &Path) -> Result<Vec<PathBuf>, PublishError> {
    let files = [
        (CURRENT_FILE, serde_json::to_vec_pretty(&snapshot.current)?),
        (ARCHIVE_FILE, serde_json::to_vec_pretty(&snapshot.archive)?),
        (ALL_FILE, serde_json::to_vec_pretty(snapshot)?),
        (BODIES_FILE, serde_json::to_vec_pretty(&BodiesList { bodies: bodies(snapshot) })?),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (name, data) in files {
        let path = public_dir.join(name);
        write_atomic(&path, &data).map_err(|source| PublishError::Io {
            path: path.clone(),
            source,
        })?;
        written.push(path);
    }
    info!(
        current = snapshot.current.stats.total_documents,
        archive = snapshot.archive.stats.total_documents,
        dir = %public_dir.display(),
        "read model published"
    );
    Ok(written)
}

pub fn load_snapshot(public_dir: &Path) -> Result<PublishedSnapshot, PublishError> {
    let path = public_dir.join(ALL_FILE);
    let raw = fs::read_to_string(&path).map_err(|source| PublishError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| PublishError::Parse { path, source })
}

pub fn bodies(snapshot: &PublishedSnapshot) -> Vec<String> {
    snapshot
        .current
        .data
        .keys()
        .chain(snapshot.archive.data.keys())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn health(snapshot: Option<&PublishedSnapshot>, now: &str) -> Health {
    Health {
        status: "healthy".to_string(),
        timestamp: now.to_string(),
        service: SERVICE_NAME.to_string(),
        last_updated: snapshot.map(|s| s.last_updated.clone()),
        total_documents: snapshot
            .map(|s| s.current.stats.total_documents + s.archive.stats.total_documents)
            .unwrap_or(0),
    }
}

/// Case-insensitive substring search over titles and summaries, newest first.
pub fn search(snapshot: &PublishedSnapshot, query: &SearchQuery) -> Result<SearchResults, PublishError> {
    let needle = query.q.trim().to_lowercase();
    if needle.is_empty() {
        return Err(PublishError::EmptyQuery);
    }

    let mut results = Vec::new();
    for (source, section) in [("current", &snapshot.current), ("archive", &snapshot.archive)] {
        for (body, entries) in &section.data {
            if query.body.as_deref().is_some_and(|wanted| wanted != body.as_str()) {
                continue;
            }
            for entry in entries.iter() {
                if query.doc_type.is_some_and(|wanted| wanted != entry.doc_type) {
                    continue;
                }
                if entry.title.to_lowercase().contains(&needle)
                    || entry.summary.to_lowercase().contains(&needle)
                {
                    let mut hit = entry.clone();
                    hit.source = Some(source.to_string());
                    results.push(hit);
                }
            }
        }
    }
    results.sort_by(|a, b| b.date.cmp(&a.date));

    Ok(SearchResults {
        query: needle,
        count: results.len(),
        results,
    })
}
