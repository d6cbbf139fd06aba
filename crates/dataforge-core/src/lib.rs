//! # DataForge Core
//!
//! Domain model and pure algorithms for the DataForge data-integration
//! engine. This crate has no I/O: it defines the record value model and its
//! canonical JSON form, schema inference, the version diff algorithm, the
//! data-lineage graph, the shared domain types (projects, data sources,
//! versions, pipelines, jobs, rollback points, webhooks) and the structured
//! error taxonomy used by every other crate.
//!
//! Persistence lives in `dataforge-store`; execution lives in
//! `dataforge-engine`.

pub mod diff;
pub mod error;
pub mod lineage;
pub mod models;
pub mod record;

pub use error::{DataForgeError, ErrorReport};
pub use record::Record;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, DataForgeError>;
