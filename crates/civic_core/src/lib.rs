//! Meeting-document ingestion for the La Cañada Flintridge civic summaries
//! service: fetch agendas and minutes, summarize them, keep an append-only
//! archive and publish the read model and weekly report.

pub mod alert;
pub mod archive;
pub mod config;
pub mod dates;
pub mod error;
pub mod extract;
pub mod fetch;
mod fsutil;
pub mod identity;
pub mod notify;
pub mod pipeline;
pub mod publish;
pub mod schedule;
pub mod schema;
pub mod summarize;
