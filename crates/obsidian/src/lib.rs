//! Obsidian vault rendering of the civic summaries archive.

pub mod vault;

pub use vault::{VaultPaths, VaultSummary, build_vault};
