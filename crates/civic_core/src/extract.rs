//! Text extraction from downloaded or dropped meeting documents.

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Pdf,
    Text,
}

impl ContentKind {
    /// Decides from the payload's magic bytes, then from the file extension.
    pub fn detect(location: &str, bytes: &[u8]) -> Self {
        if bytes.starts_with(b"%PDF") {
            return ContentKind::Pdf;
        }
        let path = location
            .split(['?', '#'])
            .next()
            .unwrap_or(location)
            .to_ascii_lowercase();
        if path.ends_with(".pdf") {
            ContentKind::Pdf
        } else {
            ContentKind::Text
        }
    }
}

pub fn extract_text(bytes: &[u8], kind: ContentKind, name: &str) -> Result<String, FetchError> {
    let raw = match kind {
        ContentKind::Pdf => {
            // pdf-extract panics on some malformed files; keep that local to the document.
            let result = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
                .map_err(|_| FetchError::Extraction {
                    name: name.to_string(),
                    message: "PDF parser panicked".to_string(),
                })?;
            result.map_err(|e| FetchError::Extraction {
                name: name.to_string(),
                message: e.to_string(),
            })?
        }
        ContentKind::Text => String::from_utf8_lossy(bytes).into_owned(),
    };

    let text = normalize_whitespace(&raw);
    if text.is_empty() {
        return Err(FetchError::EmptyText {
            name: name.to_string(),
        });
    }
    Ok(text)
}

/// Collapses runs of spaces inside lines and runs of blank lines, keeping
/// paragraph breaks intact.
pub fn normalize_whitespace(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0usize;
    for line in raw.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run > 0 {
                out.push('\n');
            }
        }
        blank_run = 0;
        out.push_str(&collapsed);
    }
    out
}
