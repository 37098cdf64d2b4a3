//! Error taxonomy for a pipeline run.
//!
//! Only archive failures and lock contention abort a run. Everything else is
//! caught by the stage that produced it and turned into a run warning.

use std::path::PathBuf;
use thiserror::Error;

/// Network, parse or extraction failure while collecting one body's documents.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("text extraction failed for {name}: {message}")]
    Extraction { name: String, message: String },

    #[error("no text could be extracted from {name}")]
    EmptyText { name: String },
}

/// Failure of the AI summarization path. Always recovered by the fallback.
#[derive(Debug, Error)]
pub enum SummarizationError {
    #[error("AI summaries are disabled (no API key configured)")]
    Disabled,

    #[error("API call budget of {limit} calls exhausted")]
    BudgetExhausted { limit: usize },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed API response: {0}")]
    MalformedResponse(String),

    #[error("API returned an empty completion")]
    EmptyCompletion,
}

#[derive(Debug, Error)]
pub enum ArchiveReadError {
    #[error("failed to read archive partition {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive partition {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Disk or serialization failure while persisting the archive.
#[derive(Debug, Error)]
pub enum ArchiveWriteError {
    #[error("failed to write archive file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize archive partition: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("record {id} has no usable date ({date:?})")]
    InvalidDate { id: String, date: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read model {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize read model: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("query parameter \"q\" is required")]
    EmptyQuery,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("failed to write report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("delivery request failed: {0}")]
    Http(String),

    #[error("delivery endpoint rejected the report with HTTP {status}")]
    Rejected { status: u16 },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that end a run early.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    ArchiveRead(#[from] ArchiveReadError),

    #[error(transparent)]
    ArchiveWrite(#[from] ArchiveWriteError),

    #[error("another run holds the lock at {path}")]
    RunLocked { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
