//! # DataForge Store
//!
//! Embedded relational persistence. Two store kinds share the same SQLite
//! format (diesel on the `sqlite` backend, WAL mode, foreign keys on):
//!
//! - [`CoreStore`]: the single per-process metadata store
//!   (`<root>/core.store`): projects, data-source configs, pipelines, jobs
//!   and executions, rollback points, webhook configs and deliveries.
//! - [`VersionedStore`]: one per data source
//!   (`<root>/data_sources/<project>/<ds>.store`): append-only record
//!   versions with stored diffs, schema history, import logs and quality
//!   metrics.
//!
//! [`StoreRouter`] owns the open-handle cache for versioned stores and is
//! the sole authority for their file lifetime.
//!
//! All mutations are single-writer and synchronous behind a per-store
//! mutex; any failure inside a transaction aborts without partial state.

pub mod core_store;
pub mod router;
mod rows;
mod schema;
mod source_schema;
pub mod versioned;

pub use core_store::{CoreStore, DataSourcePatch, ProjectPatch};
pub use router::StoreRouter;
pub use versioned::VersionedStore;
