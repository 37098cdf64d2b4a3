//! Stable document identifiers.
//!
//! An id has the shape `<body-slug>-<type>-<YYYY-MM-DD>-<h8>`, where `h8` is
//! the first eight hex digits of SHA-256 over
//! `body|type|date|normalized title`. The source URL is not part of the id,
//! so a document re-uploaded under a new link keeps its archive record.

use crate::schema::DocumentType;
use sha2::{Digest, Sha256};

pub fn document_id(body: &str, doc_type: DocumentType, date: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(body).as_bytes());
    hasher.update(b"|");
    hasher.update(doc_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(date.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(normalize(title).as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    format!(
        "{}-{}-{}-{}",
        slugify(body),
        doc_type.as_str(),
        date.trim(),
        &digest[..8]
    )
}

/// Lowercase, whitespace-collapsed form used for hashing and matching.
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `"Parks & Recreation Commission"` -> `"parks-and-recreation-commission"`.
pub fn slugify(value: &str) -> String {
    let replaced = value.replace('&', " and ");
    let mut slug = String::with_capacity(replaced.len());
    let mut pending_dash = false;
    for ch in replaced.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("unnamed");
    }
    slug
}
