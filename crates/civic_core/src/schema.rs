use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Agenda,
    Minutes,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Agenda => "agenda",
            DocumentType::Minutes => "minutes",
        }
    }

    /// Key used by the read model (`agendas` / `minutes`).
    pub fn plural(&self) -> &'static str {
        match self {
            DocumentType::Agenda => "agendas",
            DocumentType::Minutes => "minutes",
        }
    }

    /// Accepts singular and plural spellings.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "agenda" | "agendas" => Some(DocumentType::Agenda),
            "minute" | "minutes" => Some(DocumentType::Minutes),
            _ => None,
        }
    }

    /// Classifies a link text or file name. Unclear names count as agendas.
    pub fn classify(text: &str) -> Self {
        let lowered = text.to_lowercase();
        if lowered.contains("agenda") {
            DocumentType::Agenda
        } else if lowered.contains("minute") {
            DocumentType::Minutes
        } else {
            DocumentType::Agenda
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fetched meeting document with its extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Document {
    pub id: String,
    pub body: String,
    pub title: String,
    pub date: String, // ISO-8601 calendar date, YYYY-MM-DD
    pub url: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMethod {
    Ai,
    Fallback,
}

impl GenerationMethod {
    pub fn is_ai(&self) -> bool {
        matches!(self, GenerationMethod::Ai)
    }
}

impl fmt::Display for GenerationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            GenerationMethod::Ai => "ai",
            GenerationMethod::Fallback => "fallback",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Summary {
    pub document_id: String,
    pub text: String,
    pub method: GenerationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// One archived document. Never rewritten once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveRecord {
    pub id: String,
    pub body: String,
    pub title: String,
    pub date: String,
    pub url: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub summary: Summary,
    pub archived_at: String, // RFC 3339 timestamp
    pub run_id: String,
}

impl ArchiveRecord {
    pub fn new(document: &Document, summary: Summary, run_id: &str, archived_at: &str) -> Self {
        Self {
            id: document.id.clone(),
            body: document.body.clone(),
            title: document.title.clone(),
            date: document.date.clone(),
            url: document.url.clone(),
            doc_type: document.doc_type,
            summary,
            archived_at: archived_at.to_string(),
            run_id: run_id.to_string(),
        }
    }

    pub fn ai_generated(&self) -> bool {
        self.summary.method.is_ai()
    }

    /// "June 2025", or `None` when the stored date is not a calendar date.
    pub fn month_label(&self) -> Option<String> {
        crate::dates::parse_iso_date(&self.date).map(crate::dates::month_label)
    }
}

/// Entry shape served by the read model and the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PublishedEntry {
    pub id: String,
    pub title: String,
    pub date: String,
    pub summary: String,
    pub url: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub ai_generated: bool,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>, // "current" | "archive", set on search results
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BodyEntries {
    pub agendas: Vec<PublishedEntry>,
    pub minutes: Vec<PublishedEntry>,
}

impl BodyEntries {
    pub fn push(&mut self, entry: PublishedEntry) {
        match entry.doc_type {
            DocumentType::Agenda => self.agendas.push(entry),
            DocumentType::Minutes => self.minutes.push(entry),
        }
    }

    pub fn len(&self) -> usize {
        self.agendas.len() + self.minutes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublishedEntry> {
        self.agendas.iter().chain(self.minutes.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SectionStats {
    pub total_documents: usize,
    pub total_bodies: usize,
    pub total_agendas: usize,
    pub total_minutes: usize,
    pub ai_summaries: usize,
    pub months: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PublishedSection {
    pub data: BTreeMap<String, BodyEntries>,
    pub stats: SectionStats,
    pub last_updated: String,
}

/// Read model regenerated from the archive on every run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PublishedSnapshot {
    pub last_updated: String,
    pub run_id: Option<String>,
    pub current: PublishedSection,
    pub archive: PublishedSection,
}
