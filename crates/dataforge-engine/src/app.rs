//! # Application Root
//!
//! [`DataForge`] owns the process-wide singletons (CoreStore, StoreRouter,
//! lineage graph, event channel) and wires them into the engines by
//! explicit construction. It exposes the transport-agnostic operation
//! surface: projects, data sources, versions, pipelines, jobs, rollback,
//! lineage, webhooks, bulk operations and maintenance (backup, orphan
//! sweep, shutdown).

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use dataforge_core::diff::VersionDiff;
use dataforge_core::lineage::{
    Direction, ImpactAnalysis, LineageGraph, LineageNode, LineageQuery, LineageSubgraph,
};
use dataforge_core::models::{
    entity_id, DataSourceConfig, DataVersion, DeltaConfig, EngineEvent, EventType, Execution, Job,
    JobKind, Pipeline, PipelineEdge, PipelineNode, Project, ProviderType, RetentionPolicy,
    RollbackPoint, RollbackPointType, Schedule, SourceStatus, TransformSpec, VersionStats,
    WebhookConfig, WebhookDelivery, WebhookType,
};
use dataforge_core::record::{Record, RecordIdentity, Schema};
use dataforge_core::{DataForgeError, Result};
use dataforge_store::{CoreStore, DataSourcePatch, ProjectPatch, StoreRouter};

use crate::bulk::{BulkAction, BulkEntityType, BulkExecutor, BulkOperation, BulkOps, BulkRequest};
use crate::events::{event_channel, EngineContext, EventReceiver};
use crate::ingest::IngestionEngine;
use crate::pipeline::{PipelineEngine, PipelineRunReport};
use crate::rollback::{RestoreReport, RollbackManager};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::webhook::{WebhookDispatcher, WebhookDispatcherConfig};

/// Interval of the rollback-point expiry sweep.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AppSettings {
    /// Per-user data directory holding `core.store`, `data_sources/`,
    /// `exports/` and `backups/`.
    pub data_root: PathBuf,
    pub timezone: Tz,
    pub max_concurrent: usize,
    pub webhooks: WebhookDispatcherConfig,
}

impl AppSettings {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        AppSettings {
            data_root: data_root.into(),
            timezone: chrono_tz::UTC,
            max_concurrent: 4,
            webhooks: WebhookDispatcherConfig::default(),
        }
    }
}

/// Parameters for creating a data source.
#[derive(Debug, Clone)]
pub struct CreateDataSource {
    pub name: String,
    pub provider_type: ProviderType,
    pub config: Value,
    pub sync_interval_secs: Option<i64>,
    pub identity: RecordIdentity,
    pub dedup_key: Option<String>,
    pub strict_validation: bool,
    pub transforms: Vec<TransformSpec>,
    pub retention: Option<RetentionPolicy>,
    pub delta: Option<DeltaConfig>,
}

impl CreateDataSource {
    pub fn new(name: impl Into<String>, provider_type: ProviderType, config: Value) -> Self {
        CreateDataSource {
            name: name.into(),
            provider_type,
            config,
            sync_interval_secs: None,
            identity: RecordIdentity::default(),
            dedup_key: None,
            strict_validation: false,
            transforms: Vec::new(),
            retention: None,
            delta: None,
        }
    }
}

pub struct DataForge {
    settings: AppSettings,
    core: Arc<CoreStore>,
    router: Arc<StoreRouter>,
    ctx: EngineContext,
    ingestion: Arc<IngestionEngine>,
    rollback: Arc<RollbackManager>,
    pipelines: Arc<PipelineEngine>,
    bulk: Arc<BulkOps>,
    scheduler: Scheduler,
    dispatcher: Arc<WebhookDispatcher>,
    events_rx: Mutex<Option<EventReceiver>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DataForge {
    /// Build the application root. Opens (creating if needed) the core
    /// store under the data root and wires every engine; nothing runs
    /// until [`DataForge::start`].
    pub fn open(settings: AppSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.data_root)?;
        let core = Arc::new(CoreStore::open(&settings.data_root.join("core.store"))?);
        let router = Arc::new(StoreRouter::new(&settings.data_root));
        let lineage = Arc::new(RwLock::new(LineageGraph::new()));
        let (events_tx, events_rx) = event_channel();

        let ctx = EngineContext::new(core.clone(), router.clone(), lineage, events_tx);
        let ingestion = Arc::new(IngestionEngine::new(ctx.clone()));
        let rollback = Arc::new(RollbackManager::new(ctx.clone()));
        let pipelines = Arc::new(PipelineEngine::new(
            ctx.clone(),
            rollback.clone(),
            ingestion.clone(),
        ));
        let bulk = Arc::new(BulkOps::new(Arc::new(DefaultBulkExecutor {
            core: core.clone(),
            router: router.clone(),
            ingestion: ingestion.clone(),
            pipelines: pipelines.clone(),
        })));
        let scheduler = Scheduler::new(
            ctx.clone(),
            ingestion.clone(),
            pipelines.clone(),
            bulk.clone(),
            SchedulerConfig {
                max_concurrent: settings.max_concurrent,
                default_timezone: settings.timezone,
                ..Default::default()
            },
        );
        let dispatcher = Arc::new(WebhookDispatcher::new(
            core.clone(),
            settings.webhooks.clone(),
        )?);

        info!(data_root = %settings.data_root.display(), "dataforge opened");
        Ok(DataForge {
            settings,
            core,
            router,
            ctx,
            ingestion,
            rollback,
            pipelines,
            bulk,
            scheduler,
            dispatcher,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start background work: the event pump (webhooks + event triggers),
    /// the cron scheduler and the rollback expiry sweep; re-queue any
    /// undelivered webhooks from a previous run.
    pub async fn start(&self) -> Result<()> {
        let mut rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(DataForgeError::Conflict {
                message: "dataforge already started".to_string(),
            })?;

        self.dispatcher.clone().recover().await?;

        let dispatcher = self.dispatcher.clone();
        let scheduler_events = self.scheduler_handle();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                scheduler_events.handle_event(&event);
                dispatcher.clone().handle_event(&event).await;
            }
        });

        let cron = self.scheduler.start();

        let rollback = self.rollback.clone();
        let sweep = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                match rollback.sweep(Utc::now()) {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "rollback points expired"),
                    Err(error) => warn!(%error, "rollback sweep failed"),
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(pump);
        tasks.push(cron);
        tasks.push(sweep);
        Ok(())
    }

    /// Flush and stop everything. Safe to call once at process exit.
    pub fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown();
        self.dispatcher.shutdown();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.router.close_all()?;
        self.core.flush()?;
        info!("dataforge shut down");
        Ok(())
    }

    fn scheduler_handle(&self) -> Scheduler {
        self.scheduler.clone()
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    // ---- projects ------------------------------------------------------

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.core.list_projects()
    }

    pub fn get_project(&self, id: &str) -> Result<Project> {
        self.core.get_project(id)
    }

    pub fn create_project(&self, name: &str, description: Option<&str>) -> Result<Project> {
        self.core
            .create_project(name, description, &self.settings.data_root)
    }

    pub fn update_project(&self, id: &str, patch: ProjectPatch) -> Result<Project> {
        self.core.update_project(id, patch)
    }

    /// Delete a project and every dependent: store files first, then the
    /// cascading row delete.
    pub fn delete_project(&self, id: &str) -> Result<()> {
        let sources = self.core.list_data_sources(id).unwrap_or_default();
        for source in sources {
            if let Err(error) = self.router.delete_store(id, &source.id) {
                warn!(project_id = id, data_source_id = %source.id, %error,
                      "store deletion failed; file left for the orphan sweep");
            }
        }
        self.core.delete_project(id)
    }

    // ---- data sources --------------------------------------------------

    pub fn list_data_sources(&self, project_id: &str) -> Result<Vec<DataSourceConfig>> {
        self.core.list_data_sources(project_id)
    }

    pub fn get_data_source(&self, id: &str) -> Result<DataSourceConfig> {
        self.core.get_data_source(id)
    }

    pub fn create_data_source(
        &self,
        project_id: &str,
        spec: CreateDataSource,
    ) -> Result<DataSourceConfig> {
        // The project must exist before we allocate files for it.
        self.core.get_project(project_id)?;
        let id = entity_id("ds");
        let now = Utc::now();
        let config = DataSourceConfig {
            data_path: self
                .router
                .store_path(project_id, &id)
                .to_string_lossy()
                .to_string(),
            id,
            project_id: project_id.to_string(),
            name: spec.name,
            provider_type: spec.provider_type,
            config: spec.config,
            enabled: true,
            sync_interval_secs: spec.sync_interval_secs,
            last_sync_at: None,
            status: SourceStatus::Idle,
            identity: spec.identity,
            dedup_key: spec.dedup_key,
            strict_validation: spec.strict_validation,
            transforms: spec.transforms,
            retention: spec.retention,
            delta: spec.delta,
            created_at: now,
            updated_at: now,
        };
        let router = self.router.clone();
        self.core.create_data_source(&config, |config| {
            router.open(&config.project_id, &config.id).map(|_| ())
        })?;
        Ok(config)
    }

    pub fn update_data_source(&self, id: &str, patch: DataSourcePatch) -> Result<DataSourceConfig> {
        self.core.update_data_source(id, patch)
    }

    /// Delete a data source: close + remove the store file, then the
    /// config row. A failing file deletion is logged and the row still
    /// removed; the orphan sweep reports the leftover. Idempotent.
    pub fn delete_data_source(&self, id: &str) -> Result<()> {
        match self.core.get_data_source(id) {
            Ok(source) => {
                if let Err(error) = self.router.delete_store(&source.project_id, &source.id) {
                    warn!(data_source_id = id, %error,
                          "store deletion failed; file left for the orphan sweep");
                }
                self.core.delete_data_source(id)
            }
            Err(DataForgeError::NotFound { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Run an ingestion outside the scheduler (ad-hoc sync).
    pub async fn ingest_now(
        &self,
        project_id: &str,
        data_source_id: &str,
    ) -> Result<crate::ingest::IngestionOutcome> {
        self.ingestion
            .ingest(project_id, data_source_id, &CancellationToken::new())
            .await
    }

    // ---- versions ------------------------------------------------------

    /// Direct import of a record batch, bypassing the provider stages.
    pub fn import(
        &self,
        project_id: &str,
        data_source_id: &str,
        records: Vec<Record>,
        schema: Option<Schema>,
        metadata: Option<Value>,
    ) -> Result<DataVersion> {
        let source = self.core.get_data_source(data_source_id)?;
        if source.project_id != project_id {
            return Err(DataForgeError::NotFound {
                entity: "data source",
                id: format!("{}/{}", project_id, data_source_id),
            });
        }
        let store = self.router.open(project_id, data_source_id)?;
        let version = store.append_version(&records, &source.identity, schema, metadata)?;
        if let Some(retention) = &source.retention {
            if retention.auto_cleanup {
                store.apply_retention(retention)?;
            }
        }
        self.ctx.emit(
            EngineEvent::new(EventType::IngestSuccess)
                .with_project(project_id)
                .with_data_source(data_source_id)
                .with_payload(json!({"version": version.version, "records": version.record_count})),
        );
        Ok(version)
    }

    pub fn list_versions(
        &self,
        project_id: &str,
        data_source_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<DataVersion>> {
        self.router.open(project_id, data_source_id)?.list_versions(limit)
    }

    pub fn get_version(
        &self,
        project_id: &str,
        data_source_id: &str,
        version: i64,
    ) -> Result<Option<DataVersion>> {
        self.router
            .open(project_id, data_source_id)?
            .get_by_version(version)
    }

    pub fn version_records(
        &self,
        project_id: &str,
        data_source_id: &str,
        version: i64,
    ) -> Result<Vec<Record>> {
        self.router
            .open(project_id, data_source_id)?
            .records_of_version(version)
    }

    pub fn get_diff(
        &self,
        project_id: &str,
        data_source_id: &str,
        from: i64,
        to: i64,
    ) -> Result<VersionDiff> {
        let source = self.core.get_data_source(data_source_id)?;
        self.router
            .open(project_id, data_source_id)?
            .get_diff(from, to, &source.identity)
    }

    pub fn stats(&self, project_id: &str, data_source_id: &str) -> Result<VersionStats> {
        self.router.open(project_id, data_source_id)?.stats()
    }

    pub fn set_retention(
        &self,
        data_source_id: &str,
        policy: Option<RetentionPolicy>,
    ) -> Result<DataSourceConfig> {
        self.core.update_data_source(
            data_source_id,
            DataSourcePatch {
                retention: Some(policy),
                ..Default::default()
            },
        )
    }

    pub fn get_retention(&self, data_source_id: &str) -> Result<Option<RetentionPolicy>> {
        Ok(self.core.get_data_source(data_source_id)?.retention)
    }

    /// Apply a policy now; defaults to the stored one.
    pub fn apply_retention(
        &self,
        project_id: &str,
        data_source_id: &str,
        policy: Option<&RetentionPolicy>,
    ) -> Result<usize> {
        let stored;
        let policy = match policy {
            Some(policy) => policy,
            None => {
                stored = self
                    .core
                    .get_data_source(data_source_id)?
                    .retention
                    .ok_or_else(|| DataForgeError::ValidationError {
                        message: format!("data source {} has no retention policy", data_source_id),
                    })?;
                &stored
            }
        };
        self.router
            .open(project_id, data_source_id)?
            .apply_retention(policy)
    }

    pub fn backup_data_source(&self, project_id: &str, data_source_id: &str) -> Result<PathBuf> {
        self.router.backup(project_id, data_source_id)
    }

    /// `.store` files no config row references.
    pub fn orphan_stores(&self) -> Result<Vec<PathBuf>> {
        let known: Vec<(String, String)> = self
            .core
            .list_all_data_sources()?
            .into_iter()
            .map(|source| (source.project_id, source.id))
            .collect();
        self.router.orphan_stores(&known)
    }

    // ---- pipelines -----------------------------------------------------

    pub fn list_pipelines(&self, project_id: &str) -> Result<Vec<Pipeline>> {
        self.core.list_pipelines(project_id)
    }

    pub fn get_pipeline(&self, id: &str) -> Result<Pipeline> {
        self.core.get_pipeline(id)
    }

    pub fn create_pipeline(
        &self,
        project_id: &str,
        name: &str,
        nodes: Vec<PipelineNode>,
        edges: Vec<PipelineEdge>,
        continue_on_error: bool,
    ) -> Result<Pipeline> {
        self.core.get_project(project_id)?;
        let now = Utc::now();
        let pipeline = Pipeline {
            id: entity_id("pl"),
            project_id: project_id.to_string(),
            name: name.to_string(),
            description: None,
            nodes,
            edges,
            continue_on_error,
            created_at: now,
            updated_at: now,
        };
        // Reject cycles at creation time, not first execution.
        crate::pipeline::topo_sort(&pipeline)?;
        self.core.insert_pipeline(&pipeline)?;
        Ok(pipeline)
    }

    pub fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        crate::pipeline::topo_sort(pipeline)?;
        self.core.update_pipeline(pipeline)
    }

    pub fn delete_pipeline(&self, id: &str) -> Result<()> {
        self.core.delete_pipeline(id)
    }

    /// Queue a pipeline execution; returns the execution id. History and
    /// cancellation go through the jobs surface.
    pub fn execute_pipeline(&self, pipeline_id: &str) -> Result<Uuid> {
        let pipeline = self.core.get_pipeline(pipeline_id)?;
        let job = self.ensure_pipeline_job(&pipeline)?;
        self.scheduler.run_now(&job.id)
    }

    /// Run a pipeline inline (blocking the caller, no scheduler queue).
    pub async fn execute_pipeline_inline(
        &self,
        pipeline_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineRunReport> {
        self.pipelines.execute(pipeline_id, None, cancel).await
    }

    pub fn pipeline_history(&self, pipeline_id: &str) -> Result<Vec<Execution>> {
        let pipeline = self.core.get_pipeline(pipeline_id)?;
        match self.find_pipeline_job(&pipeline)? {
            Some(job) => self.core.executions_for_job(&job.id, None),
            None => Ok(Vec::new()),
        }
    }

    fn find_pipeline_job(&self, pipeline: &Pipeline) -> Result<Option<Job>> {
        Ok(self
            .core
            .list_jobs()?
            .into_iter()
            .find(|job| job.kind == JobKind::Pipeline && job.target_id == pipeline.id))
    }

    /// Implicit job backing direct pipeline executions. Disabled so the
    /// cron loop and event triggers never pick it up.
    fn ensure_pipeline_job(&self, pipeline: &Pipeline) -> Result<Job> {
        if let Some(job) = self.find_pipeline_job(pipeline)? {
            return Ok(job);
        }
        let now = Utc::now();
        let job = Job {
            id: entity_id("job"),
            project_id: pipeline.project_id.clone(),
            name: format!("run {}", pipeline.name),
            kind: JobKind::Pipeline,
            target_id: pipeline.id.clone(),
            schedule: None,
            trigger_on_source: None,
            enabled: false,
            webhook_enabled: false,
            webhook_events: Vec::new(),
            retry_attempts: 0,
            retry_delay_ms: 1_000,
            created_at: now,
            updated_at: now,
        };
        self.core.insert_job(&job)?;
        Ok(job)
    }

    pub fn rollback_failed_pipeline(&self, execution_id: &str) -> Result<RestoreReport> {
        self.rollback.rollback_failed_pipeline(execution_id)
    }

    // ---- jobs ----------------------------------------------------------

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.core.list_jobs()
    }

    pub fn create_job(
        &self,
        project_id: &str,
        name: &str,
        kind: JobKind,
        target_id: &str,
        schedule: Option<Schedule>,
    ) -> Result<Job> {
        self.core.get_project(project_id)?;
        let now = Utc::now();
        let job = Job {
            id: entity_id("job"),
            project_id: project_id.to_string(),
            name: name.to_string(),
            kind,
            target_id: target_id.to_string(),
            schedule,
            trigger_on_source: None,
            enabled: true,
            webhook_enabled: false,
            webhook_events: Vec::new(),
            retry_attempts: 0,
            retry_delay_ms: 1_000,
            created_at: now,
            updated_at: now,
        };
        self.core.insert_job(&job)?;
        Ok(job)
    }

    pub fn update_job(&self, job: &Job) -> Result<()> {
        self.core.update_job(job)
    }

    pub fn set_job_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.core.set_job_enabled(id, enabled)
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        self.core.delete_job(id)
    }

    pub fn run_job_now(&self, id: &str) -> Result<Uuid> {
        self.scheduler.run_now(id)
    }

    pub fn cancel_execution(&self, execution_id: Uuid) -> bool {
        self.scheduler.cancel(execution_id)
    }

    pub fn job_executions(&self, job_id: &str, limit: Option<i64>) -> Result<Vec<Execution>> {
        self.core.executions_for_job(job_id, limit)
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<Execution> {
        self.core.get_execution(&execution_id.to_string())
    }

    // ---- rollback ------------------------------------------------------

    /// Manual rollback point over the given sources (all of the project's
    /// sources when empty).
    pub fn create_rollback_point(
        &self,
        project_id: &str,
        data_source_ids: Vec<String>,
        expires_in_days: Option<i64>,
        metadata: Value,
    ) -> Result<RollbackPoint> {
        let scope = if data_source_ids.is_empty() {
            self.core
                .list_data_sources(project_id)?
                .into_iter()
                .map(|source| source.id)
                .collect()
        } else {
            data_source_ids
        };
        self.rollback.create_point(
            project_id,
            &scope,
            RollbackPointType::Manual,
            expires_in_days.map(Duration::days),
            metadata,
        )
    }

    pub fn list_rollback_points(
        &self,
        project_id: Option<&str>,
        point_type: Option<RollbackPointType>,
    ) -> Result<Vec<RollbackPoint>> {
        self.core.list_rollback_points(project_id, point_type)
    }

    pub fn restore_rollback_point(&self, point_id: &str, dry_run: bool) -> Result<RestoreReport> {
        self.rollback.restore(point_id, dry_run)
    }

    pub fn delete_rollback_point(&self, point_id: &str) -> Result<()> {
        self.core.delete_rollback_point(point_id)
    }

    // ---- lineage -------------------------------------------------------

    pub fn register_lineage_node(&self, node: LineageNode) {
        self.ctx.with_lineage(|graph| graph.register_node(node));
    }

    pub fn lineage_query(
        &self,
        node_id: &str,
        direction: Direction,
        depth: usize,
    ) -> LineageSubgraph {
        self.ctx.read_lineage(|graph| {
            graph.lineage_of(&LineageQuery {
                node_id: node_id.to_string(),
                direction,
                depth,
            })
        })
    }

    pub fn lineage_impact(&self, node_id: &str) -> ImpactAnalysis {
        self.ctx.read_lineage(|graph| graph.analyze_impact(node_id))
    }

    pub fn track_field_lineage(&self, record: dataforge_core::lineage::FieldLineage) {
        self.ctx
            .with_lineage(|graph| graph.track_field_lineage(record));
    }

    pub fn field_lineage_between(
        &self,
        source_node: &str,
        target_node: &str,
    ) -> Vec<dataforge_core::lineage::FieldLineage> {
        self.ctx.read_lineage(|graph| {
            graph
                .field_lineage_between(source_node, target_node)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    /// Export the whole graph as `json` or `dot`.
    pub fn lineage_export(&self, format: &str) -> Result<String> {
        match format {
            "json" => Ok(self
                .ctx
                .read_lineage(|graph| graph.export_json())
                .to_string()),
            "dot" => Ok(self.ctx.read_lineage(|graph| graph.export_dot())),
            other => Err(DataForgeError::ValidationError {
                message: format!("unknown lineage export format {:?}", other),
            }),
        }
    }

    // ---- webhooks ------------------------------------------------------

    pub fn list_webhook_configs(&self) -> Result<Vec<WebhookConfig>> {
        self.core.list_webhook_configs()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_webhook_config(
        &self,
        name: &str,
        kind: WebhookType,
        url: &str,
        events: Vec<EventType>,
        project_id: Option<String>,
        pipeline_id: Option<String>,
        secret: Option<String>,
    ) -> Result<WebhookConfig> {
        let config = WebhookConfig {
            id: entity_id("wh"),
            project_id,
            pipeline_id,
            name: name.to_string(),
            kind,
            url: url.to_string(),
            secret,
            headers: Default::default(),
            events,
            enabled: true,
            created_at: Utc::now(),
        };
        self.core.insert_webhook_config(&config)?;
        Ok(config)
    }

    pub fn update_webhook_config(&self, config: &WebhookConfig) -> Result<()> {
        self.core.update_webhook_config(config)
    }

    pub fn delete_webhook_config(&self, id: &str) -> Result<()> {
        self.core.delete_webhook_config(id)
    }

    pub fn webhook_deliveries(&self, config_id: &str) -> Result<Vec<WebhookDelivery>> {
        self.core.deliveries_for_config(config_id)
    }

    // ---- bulk ----------------------------------------------------------

    pub async fn execute_bulk(
        &self,
        request: BulkRequest,
        cancel: &CancellationToken,
    ) -> Result<BulkOperation> {
        self.bulk.execute(request, cancel).await
    }

    pub fn bulk_operations(&self) -> Vec<BulkOperation> {
        self.bulk.list()
    }

    pub fn clear_completed_bulk(&self) -> usize {
        self.bulk.clear_completed()
    }
}

struct DefaultBulkExecutor {
    core: Arc<CoreStore>,
    router: Arc<StoreRouter>,
    ingestion: Arc<IngestionEngine>,
    pipelines: Arc<PipelineEngine>,
}

#[async_trait]
impl BulkExecutor for DefaultBulkExecutor {
    async fn apply(
        &self,
        entity_type: BulkEntityType,
        action: BulkAction,
        entity_id: &str,
        dry_run: bool,
    ) -> Result<String> {
        if dry_run {
            // Existence check only.
            match entity_type {
                BulkEntityType::DataSource => {
                    self.core.get_data_source(entity_id)?;
                }
                BulkEntityType::Pipeline => {
                    self.core.get_pipeline(entity_id)?;
                }
                BulkEntityType::Job => {
                    self.core.get_job(entity_id)?;
                }
            }
            return Ok(format!("would {:?} {}", action, entity_id));
        }

        match (entity_type, action) {
            (BulkEntityType::DataSource, BulkAction::Delete) => {
                let source = self.core.get_data_source(entity_id)?;
                if let Err(error) = self.router.delete_store(&source.project_id, &source.id) {
                    warn!(data_source_id = entity_id, %error, "bulk store deletion failed");
                }
                self.core.delete_data_source(entity_id)?;
                Ok("deleted".to_string())
            }
            (BulkEntityType::DataSource, BulkAction::Enable | BulkAction::Disable) => {
                self.core.update_data_source(
                    entity_id,
                    DataSourcePatch {
                        enabled: Some(action == BulkAction::Enable),
                        ..Default::default()
                    },
                )?;
                Ok(format!("{:?}d", action).to_lowercase())
            }
            (BulkEntityType::DataSource, BulkAction::Run) => {
                let source = self.core.get_data_source(entity_id)?;
                let outcome = self
                    .ingestion
                    .ingest(&source.project_id, entity_id, &CancellationToken::new())
                    .await?;
                Ok(format!("ingested version {}", outcome.version.version))
            }
            (BulkEntityType::Pipeline, BulkAction::Delete) => {
                self.core.delete_pipeline(entity_id)?;
                Ok("deleted".to_string())
            }
            (BulkEntityType::Pipeline, BulkAction::Run) => {
                let report = self
                    .pipelines
                    .execute(entity_id, None, &CancellationToken::new())
                    .await?;
                Ok(format!("pipeline finished: {:?}", report.status))
            }
            (BulkEntityType::Job, BulkAction::Delete) => {
                self.core.delete_job(entity_id)?;
                Ok("deleted".to_string())
            }
            (BulkEntityType::Job, BulkAction::Enable | BulkAction::Disable) => {
                self.core
                    .set_job_enabled(entity_id, action == BulkAction::Enable)?;
                Ok(format!("{:?}d", action).to_lowercase())
            }
            (entity_type, action) => Err(DataForgeError::ValidationError {
                message: format!("bulk {:?} is not supported for {:?}", action, entity_type),
            }),
        }
    }
}
