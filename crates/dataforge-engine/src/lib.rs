//! # DataForge Engine
//!
//! Execution layer of DataForge:
//!
//! - [`ingest`]: provider-driven ingestion (files, HTTP APIs, sandboxed
//!   scripts, mocks) with validation, transforms, dedup and delta modes,
//!   writing atomically into the versioned store.
//! - [`pipeline`]: DAG execution of typed nodes (source → transform →
//!   merge/diff → output) with per-node status and pre-pipeline rollback.
//! - [`scheduler`]: cron, event and manual triggering with a capped worker
//!   pool, per-source serialization, retry/backoff and cancellation.
//! - [`rollback`]: non-destructive restore of captured version manifests.
//! - [`bulk`]: bounded-concurrency batched operations with dry-run.
//! - [`webhook`]: durable, retrying delivery of engine events.
//! - [`app`]: the `DataForge` application root wiring everything together
//!   and exposing the public operation surface.

pub mod app;
pub mod bulk;
pub mod events;
pub mod ingest;
pub mod pipeline;
pub mod rollback;
pub mod scheduler;
pub mod script;
pub mod transform;
pub mod webhook;

pub use app::{AppSettings, DataForge};
