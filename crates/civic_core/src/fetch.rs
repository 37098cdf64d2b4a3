//! Document discovery and retrieval for each tracked body.
//!
//! Discovery only reads listing metadata (title, date, URL), so documents
//! already archived are skipped before their content is downloaded. A body
//! whose listing cannot be read is reported and the remaining bodies carry
//! on.

use crate::config::{BodyConfig, SourceConfig};
use crate::dates::{self, format_iso_date};
use crate::error::FetchError;
use crate::extract::{ContentKind, extract_text};
use crate::identity::document_id;
use crate::schema::{Document, DocumentType};
use rayon::prelude::*;
use reqwest::Url;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use time::Date;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; civic-summaries/0.1)";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_ATTEMPTS: u32 = 3;
const HTTP_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Where a listed document's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingLocation {
    Remote(String),
    File(PathBuf),
}

/// Metadata for a document discovered on a listing page or in a drop folder.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub body: String,
    pub title: String,
    pub date: Date,
    pub url: String,
    pub doc_type: DocumentType,
    pub location: ListingLocation,
}

impl Listing {
    pub fn document_id(&self) -> String {
        document_id(&self.body, self.doc_type, &format_iso_date(self.date), &self.title)
    }

    fn into_document(self, id: String, text: String) -> Document {
        Document {
            id,
            date: format_iso_date(self.date),
            body: self.body,
            title: self.title,
            url: self.url,
            doc_type: self.doc_type,
            text,
        }
    }
}

pub trait DocumentSource: Sync {
    fn discover(&self, body: &BodyConfig) -> Result<Vec<Listing>, FetchError>;

    fn retrieve(&self, listing: &Listing) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackWindow {
    pub earliest: Date,
}

impl LookbackWindow {
    pub fn days_back(today: Date, days: u32) -> Self {
        Self {
            earliest: dates::days_before(today, days),
        }
    }

    pub fn contains(&self, date: Date) -> bool {
        date >= self.earliest
    }
}

pub struct FetchRequest<'a> {
    pub bodies: &'a [BodyConfig],
    pub window: LookbackWindow,
    pub known_ids: &'a HashSet<String>,
    pub concurrency: usize,
}

#[derive(Debug, Default)]
struct BodyFetch {
    documents: Vec<Document>,
    skipped_known: usize,
    skipped_stale: usize,
    errors: Vec<FetchError>,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub documents: Vec<Document>,
    pub skipped_known: usize,
    pub skipped_stale: usize,
    /// Bodies whose listing could not be read at all.
    pub body_failures: Vec<(String, FetchError)>,
    /// Individual documents that failed to download or extract.
    pub document_failures: Vec<(String, FetchError)>,
}

impl FetchOutcome {
    pub fn failure_count(&self) -> usize {
        self.body_failures.len() + self.document_failures.len()
    }
}

pub fn fetch_all<S: DocumentSource>(source: &S, request: &FetchRequest<'_>) -> FetchOutcome {
    let run_one = |body: &BodyConfig| (body.name.clone(), fetch_body(source, body, request));

    let results: Vec<(String, Result<BodyFetch, FetchError>)> =
        if request.concurrency <= 1 || request.bodies.len() <= 1 {
            request.bodies.iter().map(run_one).collect()
        } else {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(request.concurrency)
                .build()
            {
                Ok(pool) => pool.install(|| request.bodies.par_iter().map(run_one).collect()),
                Err(err) => {
                    warn!(error = %err, "worker pool unavailable, fetching sequentially");
                    request.bodies.iter().map(run_one).collect()
                }
            }
        };

    let mut outcome = FetchOutcome::default();
    let mut seen = HashSet::new();
    for (body, result) in results {
        match result {
            Ok(fetched) => {
                outcome.skipped_known += fetched.skipped_known;
                outcome.skipped_stale += fetched.skipped_stale;
                outcome
                    .document_failures
                    .extend(fetched.errors.into_iter().map(|err| (body.clone(), err)));
                for document in fetched.documents {
                    if seen.insert(document.id.clone()) {
                        outcome.documents.push(document);
                    }
                }
            }
            Err(err) => {
                warn!(body = %body, error = %err, "fetching failed for body");
                outcome.body_failures.push((body, err));
            }
        }
    }
    outcome
}

fn fetch_body<S: DocumentSource + ?Sized>(
    source: &S,
    body: &BodyConfig,
    request: &FetchRequest<'_>,
) -> Result<BodyFetch, FetchError> {
    let listings = source.discover(body)?;
    let mut fetched = BodyFetch::default();
    let mut seen = HashSet::new();

    for listing in listings {
        if !request.window.contains(listing.date) {
            fetched.skipped_stale += 1;
            continue;
        }
        let id = listing.document_id();
        if request.known_ids.contains(&id) {
            debug!(id = %id, "already archived, not downloading");
            fetched.skipped_known += 1;
            continue;
        }
        if !seen.insert(id.clone()) {
            continue;
        }

        let text = source.retrieve(&listing).and_then(|bytes| {
            let kind = ContentKind::detect(&listing.url, &bytes);
            extract_text(&bytes, kind, &listing.title)
        });
        match text {
            Ok(text) => {
                debug!(id = %id, chars = text.len(), "document extracted");
                fetched.documents.push(listing.into_document(id, text));
            }
            Err(err) => {
                warn!(body = %body.name, title = %listing.title, error = %err, "document skipped");
                fetched.errors.push(err);
            }
        }
    }

    info!(
        body = %body.name,
        new = fetched.documents.len(),
        known = fetched.skipped_known,
        stale = fetched.skipped_stale,
        failed = fetched.errors.len(),
        "body fetched"
    );
    Ok(fetched)
}

/// Finds PDF links on a listing page that belong to `body`.
pub fn parse_listing_page(
    html: &str,
    base_url: &str,
    body: &BodyConfig,
) -> Result<Vec<Listing>, FetchError> {
    let base = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl {
        url: base_url.to_string(),
        message: e.to_string(),
    })?;
    let selector = Selector::parse("a[href]").map_err(|e| FetchError::Extraction {
        name: base_url.to_string(),
        message: e.to_string(),
    })?;

    let page = Html::parse_document(html);
    let mut listings = Vec::new();
    let mut seen_urls = HashSet::new();

    for anchor in page.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let title = anchor.text().collect::<Vec<_>>().join(" ");
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        if href.trim().is_empty() || title.is_empty() {
            continue;
        }
        let Ok(url) = base.join(href.trim()) else {
            continue;
        };
        if !url.path().to_ascii_lowercase().ends_with(".pdf") {
            continue;
        }
        if !body.matches(&title) {
            continue;
        }
        let Some(date) = dates::find_date(&title).or_else(|| dates::find_date(url.path())) else {
            warn!(body = %body.name, title = %title, "listing has no recognizable date, skipped");
            continue;
        };
        if !seen_urls.insert(url.to_string()) {
            continue;
        }
        listings.push(Listing {
            body: body.name.clone(),
            doc_type: DocumentType::classify(&title),
            date,
            url: url.to_string(),
            location: ListingLocation::Remote(url.to_string()),
            title,
        });
    }
    Ok(listings)
}

/// Scans a manual drop folder for PDFs and text files that belong to `body`.
pub fn scan_folder(dir: &Path, body: &BodyConfig) -> Result<Vec<Listing>, FetchError> {
    let entries = fs::read_dir(dir).map_err(|source| FetchError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut listings = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        if !matches!(ext.as_deref(), Some("pdf") | Some("txt")) {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if !body.matches(&file_name) {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&file_name)
            .to_string();
        // The date is part of the document id, so it has to come from the name.
        let Some(date) = dates::find_date(&stem) else {
            warn!(file = %path.display(), "no date in dropped file name, skipped");
            continue;
        };
        let title = stem
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        listings.push(Listing {
            body: body.name.clone(),
            doc_type: DocumentType::classify(&file_name),
            date,
            url: format!("manual://{file_name}"),
            location: ListingLocation::File(path),
            title,
        });
    }
    listings.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(listings)
}

/// HTTP client for listing pages and PDF downloads.
pub struct WebSource {
    client: reqwest::blocking::Client,
    attempts: u32,
    retry_delay: Duration,
    pages: Mutex<HashMap<String, String>>,
}

impl WebSource {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Http {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            attempts: HTTP_ATTEMPTS,
            retry_delay: HTTP_RETRY_DELAY,
            pages: Mutex::new(HashMap::new()),
        })
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.client.get(url).send() {
                Ok(response) if response.status().is_success() => {
                    return response
                        .bytes()
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| FetchError::Http {
                            url: url.to_string(),
                            message: e.to_string(),
                        });
                }
                Ok(response) => {
                    last_error = Some(FetchError::Status {
                        url: url.to_string(),
                        status: response.status().as_u16(),
                    });
                }
                Err(err) => {
                    last_error = Some(FetchError::Http {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
            if attempt < self.attempts {
                warn!(url = %url, attempt, "request failed, retrying");
                std::thread::sleep(self.retry_delay * attempt);
            }
        }
        Err(last_error.unwrap_or_else(|| FetchError::Http {
            url: url.to_string(),
            message: "no attempts made".to_string(),
        }))
    }

    /// Listing pages are shared by several bodies; each is downloaded once.
    fn page(&self, url: &str) -> Result<String, FetchError> {
        if let Ok(cache) = self.pages.lock() {
            if let Some(html) = cache.get(url) {
                return Ok(html.clone());
            }
        }
        let html = String::from_utf8_lossy(&self.get(url)?).into_owned();
        if let Ok(mut cache) = self.pages.lock() {
            cache.insert(url.to_string(), html.clone());
        }
        Ok(html)
    }
}

/// Routes each body to the web or the drop folder, as configured.
pub struct ConfiguredSource {
    web: WebSource,
}

impl ConfiguredSource {
    pub fn new() -> Result<Self, FetchError> {
        Ok(Self {
            web: WebSource::new()?,
        })
    }
}

impl DocumentSource for ConfiguredSource {
    fn discover(&self, body: &BodyConfig) -> Result<Vec<Listing>, FetchError> {
        match &body.source {
            SourceConfig::Web { url } => {
                let html = self.web.page(url)?;
                parse_listing_page(&html, url, body)
            }
            SourceConfig::Folder { path } => scan_folder(path, body),
        }
    }

    fn retrieve(&self, listing: &Listing) -> Result<Vec<u8>, FetchError> {
        match &listing.location {
            ListingLocation::Remote(url) => self.web.get(url),
            ListingLocation::File(path) => fs::read(path).map_err(|source| FetchError::Io {
                path: path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LISTING_URL;
    use time::macros::date;

    const PAGE: &str = r#"
<html><body>
  <ul>
    <li><a href="/wp-content/uploads/2025/07/cc-agenda-0716.pdf">City Council Agenda July 16, 2025</a></li>
    <li><a href="https://lcf.ca.gov/docs/cc-min.pdf">City Council Minutes 07/02/2025</a></li>
    <li><a href="/docs/cc-min.pdf">City Council Minutes 07/02/2025</a></li>
    <li><a href="/docs/pc-agenda.pdf">Planning Commission Agenda 2025-07-15</a></li>
    <li><a href="/docs/cc-budget.html">City Council Budget 07/01/2025</a></li>
    <li><a href="/docs/cc-undated.pdf">City Council Special Meeting</a></li>
  </ul>
</body></html>"#;

    fn council() -> BodyConfig {
        BodyConfig::web("City Council", &["city council"], DEFAULT_LISTING_URL)
    }

    #[test]
    fn listing_page_keeps_dated_pdfs_for_the_body() {
        let listings = parse_listing_page(PAGE, DEFAULT_LISTING_URL, &council()).unwrap();
        assert_eq!(listings.len(), 2);

        assert_eq!(listings[0].doc_type, DocumentType::Agenda);
        assert_eq!(listings[0].date, date!(2025 - 07 - 16));
        assert_eq!(
            listings[0].url,
            "https://lcf.ca.gov/wp-content/uploads/2025/07/cc-agenda-0716.pdf"
        );

        assert_eq!(listings[1].doc_type, DocumentType::Minutes);
        assert_eq!(listings[1].date, date!(2025 - 07 - 02));
    }

    #[test]
    fn listing_page_with_bad_base_url_is_an_error() {
        let err = parse_listing_page(PAGE, "not a url", &council()).unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }

    #[test]
    fn drop_folder_matches_body_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("city_council_agenda_2025-07-16.txt"), "agenda").unwrap();
        fs::write(dir.path().join("planning_minutes_2025-07-01.txt"), "minutes").unwrap();
        fs::write(dir.path().join("city_council_notes.docx"), "ignored").unwrap();

        let listings = scan_folder(dir.path(), &council()).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].date, date!(2025 - 07 - 16));
        assert_eq!(listings[0].title, "city council agenda 2025 07 16");
        assert_eq!(listings[0].url, "manual://city_council_agenda_2025-07-16.txt");
        assert!(matches!(listings[0].location, ListingLocation::File(_)));
    }

    #[test]
    fn missing_drop_folder_is_a_fetch_error() {
        let err = scan_folder(Path::new("/definitely/not/here"), &council()).unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }

    #[test]
    fn lookback_window_is_inclusive() {
        let window = LookbackWindow::days_back(date!(2025 - 07 - 31), 30);
        assert!(window.contains(date!(2025 - 07 - 01)));
        assert!(!window.contains(date!(2025 - 06 - 30)));
    }

    #[test]
    fn huge_lookback_reaches_back_to_the_earliest_date() {
        let window = LookbackWindow::days_back(date!(2025 - 07 - 21), 10_000_000);
        assert_eq!(window.earliest, Date::MIN);
        assert!(window.contains(date!(1990 - 01 - 01)));
    }

    #[test]
    fn undated_drop_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("city_council_agenda_2025-07-16.txt"), "agenda").unwrap();
        fs::write(dir.path().join("city_council_special_agenda.txt"), "agenda").unwrap();

        let listings = scan_folder(dir.path(), &council()).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].date, date!(2025 - 07 - 16));
    }
}
