//! # Ingestion Engine
//!
//! Runs one ingestion for a `(project, data source)` pair:
//!
//! 1. resolve the provider from the source config and fetch records,
//! 2. validate the batch (objects with a consistent key set; warn or, in
//!    strict mode, reject),
//! 3. apply declared transforms in order, then dedup,
//! 4. apply delta selection when configured,
//! 5. append atomically into the versioned store,
//! 6. apply auto-cleanup retention,
//! 7. record lineage, events and an import-log row.
//!
//! Cancellation is honored at the provider boundary and immediately before
//! the append: a cancelled ingestion leaves the store unchanged.

use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dataforge_core::error::classify;
use dataforge_core::lineage::{LineageEdgeMeta, LineageEdgeType, LineageNode, LineageNodeType};
use dataforge_core::models::{
    DataSourceConfig, DataVersion, EngineEvent, EventType, SourceStatus,
};
use dataforge_core::record::{count_inconsistent, Record};
use dataforge_core::{DataForgeError, Result};

pub mod api;
pub mod delta;
pub mod file;
pub mod mock;
pub mod provider;
pub mod script;

use crate::events::EngineContext;
use crate::transform;

pub use provider::{resolve, RecordProvider};

/// Outcome of a successful ingestion run.
#[derive(Debug, Clone)]
pub struct IngestionOutcome {
    pub version: DataVersion,
    pub records_processed: usize,
    /// Records whose key set differed from the first record's.
    pub inconsistent_records: usize,
    pub retention_deleted: usize,
    pub duration_ms: i64,
}

pub struct IngestionEngine {
    ctx: EngineContext,
    http: reqwest::Client,
}

impl IngestionEngine {
    pub fn new(ctx: EngineContext) -> Self {
        IngestionEngine {
            ctx,
            http: reqwest::Client::new(),
        }
    }

    /// Run a full ingestion for a data source.
    pub async fn ingest(
        &self,
        project_id: &str,
        data_source_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestionOutcome> {
        let source = self.ctx.core.get_data_source(data_source_id)?;
        if source.project_id != project_id {
            return Err(DataForgeError::NotFound {
                entity: "data source",
                id: format!("{}/{}", project_id, data_source_id),
            });
        }
        if !source.enabled {
            return Err(DataForgeError::ValidationError {
                message: format!("data source {} is disabled", data_source_id),
            });
        }

        self.ctx.emit(
            EngineEvent::new(EventType::IngestStart)
                .with_project(project_id)
                .with_data_source(data_source_id)
                .with_payload(json!({"name": source.name})),
        );
        self.ctx
            .core
            .set_source_status(data_source_id, SourceStatus::Syncing)?;

        let started = Instant::now();
        let result = self.run_inner(&source, cancel).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(mut outcome) => {
                outcome.duration_ms = duration_ms;
                self.ctx
                    .core
                    .set_source_status(data_source_id, SourceStatus::Idle)?;
                self.ctx.core.set_last_sync(data_source_id)?;
                self.record_lineage(&source, &outcome);
                self.log_import(&source, Ok(&outcome), duration_ms);
                self.ctx.emit(
                    EngineEvent::new(EventType::IngestSuccess)
                        .with_project(project_id)
                        .with_data_source(data_source_id)
                        .with_payload(json!({
                            "version": outcome.version.version,
                            "records": outcome.records_processed,
                            "duration_ms": duration_ms,
                        })),
                );
                info!(
                    project_id,
                    data_source_id,
                    version = outcome.version.version,
                    records = outcome.records_processed,
                    duration_ms,
                    "ingestion completed"
                );
                Ok(outcome)
            }
            Err(error) => {
                // Cancellation is a clean stop, not a source failure.
                let status = if matches!(error, DataForgeError::Cancelled) {
                    SourceStatus::Idle
                } else {
                    SourceStatus::Error
                };
                self.ctx.core.set_source_status(data_source_id, status)?;
                self.log_import(&source, Err(&error), duration_ms);
                let report = classify(&error);
                self.ctx.emit(
                    EngineEvent::new(EventType::IngestFailure)
                        .with_project(project_id)
                        .with_data_source(data_source_id)
                        .with_payload(json!({
                            "code": report.code,
                            "error": report.message,
                            "duration_ms": duration_ms,
                        })),
                );
                warn!(project_id, data_source_id, error = %error, "ingestion failed");
                Err(error)
            }
        }
    }

    /// Append a batch directly, bypassing the provider stages. Used by the
    /// public `import` operation and by pipeline output nodes.
    pub fn append_records(
        &self,
        source: &DataSourceConfig,
        records: Vec<Record>,
        metadata: Option<Value>,
    ) -> Result<DataVersion> {
        let store = self
            .ctx
            .router
            .open(&source.project_id, &source.id)?;
        let version = store.append_version(&records, &source.identity, None, metadata)?;
        if let Some(retention) = &source.retention {
            if retention.auto_cleanup {
                store.apply_retention(retention)?;
            }
        }
        Ok(version)
    }

    async fn run_inner(
        &self,
        source: &DataSourceConfig,
        cancel: &CancellationToken,
    ) -> Result<IngestionOutcome> {
        let driver = provider::resolve(source, &self.http)?;
        let records = driver.fetch(cancel).await?;
        if cancel.is_cancelled() {
            return Err(DataForgeError::Cancelled);
        }

        // Validation: providers guarantee objects; key-set consistency is
        // checked here.
        let inconsistent = count_inconsistent(&records);
        if inconsistent > 0 {
            if source.strict_validation {
                return Err(DataForgeError::ValidationError {
                    message: format!(
                        "{} records have inconsistent key sets (strict validation)",
                        inconsistent
                    ),
                });
            }
            warn!(
                data_source_id = %source.id,
                inconsistent, "accepting batch with inconsistent records"
            );
        }

        let mut records = transform::apply_chain(records, &source.transforms, cancel)?;
        if let Some(key) = &source.dedup_key {
            records = transform::dedup_by_key(records, key);
        }

        let mut metadata = json!({
            "origin": "ingestion",
            "provider": source.provider_type,
            "fetched_at": Utc::now(),
        });
        if let Some(delta_config) = &source.delta {
            let prior = self.ctx.core.sync_state(&source.id)?;
            let outcome = delta::select(
                delta_config,
                &source.identity,
                records,
                prior,
                driver.supports_cdc(),
            )?;
            records = outcome.records;
            merge_metadata(&mut metadata, &outcome.summary);
            // State is persisted only after the append succeeds.
            if cancel.is_cancelled() {
                return Err(DataForgeError::Cancelled);
            }
            let (version, retention_deleted) =
                self.append_with_retention(source, &records, metadata)?;
            self.ctx.core.set_sync_state(&source.id, &outcome.state)?;
            return Ok(IngestionOutcome {
                records_processed: records.len(),
                inconsistent_records: inconsistent,
                retention_deleted,
                duration_ms: 0,
                version,
            });
        }

        if cancel.is_cancelled() {
            return Err(DataForgeError::Cancelled);
        }
        let (version, retention_deleted) = self.append_with_retention(source, &records, metadata)?;
        Ok(IngestionOutcome {
            records_processed: records.len(),
            inconsistent_records: inconsistent,
            retention_deleted,
            duration_ms: 0,
            version,
        })
    }

    fn append_with_retention(
        &self,
        source: &DataSourceConfig,
        records: &[Record],
        metadata: Value,
    ) -> Result<(DataVersion, usize)> {
        let store = self
            .ctx
            .router
            .open(&source.project_id, &source.id)?;
        let version = store.append_version(records, &source.identity, None, Some(metadata))?;
        let mut deleted = 0;
        if let Some(retention) = &source.retention {
            if retention.auto_cleanup {
                deleted = store.apply_retention(retention)?;
                if deleted > 0 {
                    info!(data_source_id = %source.id, deleted, "auto retention applied");
                }
            }
        }
        Ok((version, deleted))
    }

    fn record_lineage(&self, source: &DataSourceConfig, outcome: &IngestionOutcome) {
        self.ctx.with_lineage(|graph| {
            let provider_node = format!("provider:{}", source.id);
            graph.register_node(LineageNode {
                id: provider_node.clone(),
                node_type: LineageNodeType::Stream,
                name: format!("{:?} feed for {}", source.provider_type, source.name),
                metadata: None,
            });
            graph.register_node(LineageNode {
                id: format!("ds:{}", source.id),
                node_type: LineageNodeType::DataSource,
                name: source.name.clone(),
                metadata: Some(json!({"project_id": source.project_id})),
            });
            graph.create_edge(
                provider_node,
                format!("ds:{}", source.id),
                LineageEdgeType::DataFlow,
                LineageEdgeMeta {
                    record_count: Some(outcome.records_processed as i64),
                    transformation_type: Some("ingestion".to_string()),
                    executed_at: Some(Utc::now()),
                },
            );
        });
    }

    fn log_import(
        &self,
        source: &DataSourceConfig,
        result: std::result::Result<&IngestionOutcome, &DataForgeError>,
        duration_ms: i64,
    ) {
        let logged = self
            .ctx
            .router
            .open(&source.project_id, &source.id)
            .and_then(|store| match result {
                Ok(outcome) => store.record_import(
                    Some(&outcome.version.id),
                    "completed",
                    Some(&format!(
                        "version {} with {} records",
                        outcome.version.version, outcome.records_processed
                    )),
                    None,
                    duration_ms,
                    outcome.records_processed as i64,
                ),
                Err(error) => {
                    let report = classify(error);
                    store.record_import(
                        None,
                        "failed",
                        Some(&report.code),
                        Some(&report.message),
                        duration_ms,
                        0,
                    )
                }
            });
        if let Err(error) = logged {
            warn!(data_source_id = %source.id, %error, "failed to write import log");
        }
    }
}

fn merge_metadata(metadata: &mut Value, extra: &Value) {
    if let (Value::Object(target), Value::Object(source)) = (metadata, extra) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
}
