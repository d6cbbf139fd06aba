//! Shared domain types: projects, data sources, versions, pipelines, jobs,
//! rollback points, webhooks and engine events.
//!
//! These are the types persisted by `dataforge-store` and manipulated by
//! `dataforge-engine`; they carry no behavior beyond construction helpers
//! and serde round-tripping.

mod event;
mod ids;
mod job;
mod pipeline;
mod rollback;
mod source;
mod transform;
mod version;
mod webhook;

pub use event::{EngineEvent, EventType};
pub use ids::entity_id;
pub use job::{Execution, ExecutionStats, ExecutionStatus, Job, JobKind, Schedule};
pub use pipeline::{NodeKind, NodeStatus, Pipeline, PipelineEdge, PipelineNode, PipelineRunStatus};
pub use rollback::{RollbackPoint, RollbackPointStatus, RollbackPointType, SnapshotRef};
pub use source::{
    DataSourceConfig, DeltaConfig, DeltaMode, Project, ProviderType, RetentionPolicy,
    RetentionStrategy, SourceStatus,
};
pub use transform::{AggFunc, AggregateSpec, CompareOp, TransformSpec};
pub use version::{DataVersion, VersionStats};
pub use webhook::{DeliveryStatus, WebhookConfig, WebhookDelivery, WebhookType};
