//! # CoreStore
//!
//! The single per-process metadata store (`<root>/core.store`): projects,
//! data-source configurations, pipelines, jobs and their executions,
//! rollback points and webhook configuration/deliveries.
//!
//! Mutations are single-writer, synchronous and transactional; listing
//! operations read committed state and are safe to call concurrently with
//! writes. Deleting a missing entity is idempotent; `NotFound` is returned
//! only by explicit `get_*` queries.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use serde_json::Value;
use tracing::warn;

use dataforge_core::models::{
    entity_id, DataSourceConfig, DeltaConfig, Execution, ExecutionStatus, Job, Pipeline, Project,
    RetentionPolicy, RollbackPoint, RollbackPointStatus, RollbackPointType, SourceStatus,
    WebhookConfig, WebhookDelivery,
};
use dataforge_core::models::DeliveryStatus;
use dataforge_core::{DataForgeError, Result};

use crate::rows::{
    from_json, naive, to_json, to_token, DataSourceRow, ExecutionRow, JobRow, PipelineRow,
    ProjectRow, RollbackPointRow, WebhookConfigRow, WebhookDeliveryRow,
};
use crate::schema::{
    data_sources, job_executions, jobs, pipelines, projects, rollback_points, webhook_configs,
    webhook_deliveries,
};

/// Partial update for a project.
#[derive(Debug, Default, Clone)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

/// Partial update for a data source. `None` leaves the field untouched.
#[derive(Debug, Default, Clone)]
pub struct DataSourcePatch {
    pub name: Option<String>,
    pub config: Option<Value>,
    pub enabled: Option<bool>,
    pub sync_interval_secs: Option<Option<i64>>,
    pub dedup_key: Option<Option<String>>,
    pub strict_validation: Option<bool>,
    pub transforms: Option<Vec<dataforge_core::models::TransformSpec>>,
    pub identity: Option<dataforge_core::record::RecordIdentity>,
    pub retention: Option<Option<RetentionPolicy>>,
    pub delta: Option<Option<DeltaConfig>>,
}

pub struct CoreStore {
    path: PathBuf,
    conn: Mutex<SqliteConnection>,
}

impl CoreStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let database_url = path.to_string_lossy().to_string();
        let mut conn = SqliteConnection::establish(&database_url).map_err(|e| {
            DataForgeError::DatabaseError {
                message: format!("failed to open core store {}: {}", database_url, e),
            }
        })?;
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;",
        )
        .map_err(DataForgeError::from)?;
        conn.batch_execute(crate::schema::CORE_DDL)
            .map_err(DataForgeError::from)?;
        Ok(CoreStore {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| DataForgeError::DatabaseError {
            message: "core store mutex poisoned".to_string(),
        })?;
        f(&mut guard)
    }

    // ---- projects ------------------------------------------------------

    pub fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        data_root: &Path,
    ) -> Result<Project> {
        let id = entity_id("proj");
        let now = Utc::now();
        let project = Project {
            id: id.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            data_path: data_root
                .join("data_sources")
                .join(&id)
                .to_string_lossy()
                .to_string(),
            created_at: now,
            updated_at: now,
        };
        self.with_conn(|conn| {
            diesel::insert_into(projects::table)
                .values(&ProjectRow::from_domain(&project))
                .execute(conn)?;
            Ok(())
        })?;
        Ok(project)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.with_conn(|conn| {
            let rows: Vec<ProjectRow> = projects::table
                .order(projects::created_at.asc())
                .load(conn)?;
            Ok(rows.into_iter().map(ProjectRow::into_domain).collect())
        })
    }

    pub fn get_project(&self, id: &str) -> Result<Project> {
        self.with_conn(|conn| {
            let row: Option<ProjectRow> = projects::table.find(id).first(conn).optional()?;
            row.map(ProjectRow::into_domain)
                .ok_or(DataForgeError::NotFound {
                    entity: "project",
                    id: id.to_string(),
                })
        })
    }

    pub fn update_project(&self, id: &str, patch: ProjectPatch) -> Result<Project> {
        let mut project = self.get_project(id)?;
        if let Some(name) = patch.name {
            project.name = name;
        }
        if let Some(description) = patch.description {
            project.description = description;
        }
        project.updated_at = Utc::now();
        self.with_conn(|conn| {
            diesel::update(projects::table.find(id))
                .set(&ProjectRow::from_domain(&project))
                .execute(conn)?;
            Ok(())
        })?;
        Ok(project)
    }

    /// Delete a project; foreign keys cascade into every dependent row.
    /// Idempotent. Store files are the router's concern.
    pub fn delete_project(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            diesel::delete(projects::table.find(id)).execute(conn)?;
            Ok(())
        })
    }

    // ---- data sources --------------------------------------------------

    /// Persist a data-source config, then run `init_store` (store-file
    /// creation). If initialization fails, the config row is rolled back
    /// and the error surfaced.
    pub fn create_data_source(
        &self,
        config: &DataSourceConfig,
        init_store: impl FnOnce(&DataSourceConfig) -> Result<()>,
    ) -> Result<()> {
        let row = DataSourceRow::from_domain(config)?;
        self.with_conn(|conn| {
            diesel::insert_into(data_sources::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })?;
        if let Err(error) = init_store(config) {
            if let Err(cleanup) = self.with_conn(|conn| {
                diesel::delete(data_sources::table.find(&config.id)).execute(conn)?;
                Ok(())
            }) {
                warn!(data_source_id = %config.id, error = %cleanup,
                      "failed to roll back data-source row after store creation failure");
            }
            return Err(error);
        }
        Ok(())
    }

    pub fn list_data_sources(&self, project_id: &str) -> Result<Vec<DataSourceConfig>> {
        self.with_conn(|conn| {
            let rows: Vec<DataSourceRow> = data_sources::table
                .filter(data_sources::project_id.eq(project_id))
                .order(data_sources::created_at.asc())
                .load(conn)?;
            rows.into_iter().map(DataSourceRow::into_domain).collect()
        })
    }

    pub fn list_all_data_sources(&self) -> Result<Vec<DataSourceConfig>> {
        self.with_conn(|conn| {
            let rows: Vec<DataSourceRow> = data_sources::table.load(conn)?;
            rows.into_iter().map(DataSourceRow::into_domain).collect()
        })
    }

    pub fn get_data_source(&self, id: &str) -> Result<DataSourceConfig> {
        self.with_conn(|conn| {
            let row: Option<DataSourceRow> =
                data_sources::table.find(id).first(conn).optional()?;
            row.ok_or(DataForgeError::NotFound {
                entity: "data source",
                id: id.to_string(),
            })?
            .into_domain()
        })
    }

    pub fn update_data_source(&self, id: &str, patch: DataSourcePatch) -> Result<DataSourceConfig> {
        let mut source = self.get_data_source(id)?;
        if let Some(name) = patch.name {
            source.name = name;
        }
        if let Some(config) = patch.config {
            source.config = config;
        }
        if let Some(enabled) = patch.enabled {
            source.enabled = enabled;
        }
        if let Some(interval) = patch.sync_interval_secs {
            source.sync_interval_secs = interval;
        }
        if let Some(dedup_key) = patch.dedup_key {
            source.dedup_key = dedup_key;
        }
        if let Some(strict) = patch.strict_validation {
            source.strict_validation = strict;
        }
        if let Some(transforms) = patch.transforms {
            source.transforms = transforms;
        }
        if let Some(identity) = patch.identity {
            source.identity = identity;
        }
        if let Some(retention) = patch.retention {
            source.retention = retention;
        }
        if let Some(delta) = patch.delta {
            source.delta = delta;
        }
        source.updated_at = Utc::now();

        let mut row = DataSourceRow::from_domain(&source)?;
        self.with_conn(|conn| {
            // A full-row update must not clobber the delta sync state.
            let existing: Option<String> = data_sources::table
                .find(id)
                .select(data_sources::sync_state)
                .first(conn)
                .optional()?
                .flatten();
            row.sync_state = existing;
            diesel::update(data_sources::table.find(id))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })?;
        Ok(source)
    }

    /// Remove the config row. Idempotent; the caller (router/facade)
    /// removes the store file.
    pub fn delete_data_source(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            diesel::delete(data_sources::table.find(id)).execute(conn)?;
            Ok(())
        })
    }

    pub fn set_source_status(&self, id: &str, status: SourceStatus) -> Result<()> {
        let token = to_token(&status)?;
        self.with_conn(|conn| {
            diesel::update(data_sources::table.find(id))
                .set((
                    data_sources::status.eq(token),
                    data_sources::updated_at.eq(naive(Utc::now())),
                ))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn set_last_sync(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            diesel::update(data_sources::table.find(id))
                .set(data_sources::last_sync_at.eq(Some(naive(Utc::now()))))
                .execute(conn)?;
            Ok(())
        })
    }

    /// Delta-tracking state (watermark / per-key hash map) as opaque JSON.
    pub fn sync_state(&self, id: &str) -> Result<Option<Value>> {
        self.with_conn(|conn| {
            let state: Option<Option<String>> = data_sources::table
                .find(id)
                .select(data_sources::sync_state)
                .first(conn)
                .optional()?;
            match state.flatten() {
                Some(text) => Ok(Some(from_json(&text)?)),
                None => Ok(None),
            }
        })
    }

    pub fn set_sync_state(&self, id: &str, state: &Value) -> Result<()> {
        let text = to_json(state)?;
        self.with_conn(|conn| {
            diesel::update(data_sources::table.find(id))
                .set(data_sources::sync_state.eq(Some(text)))
                .execute(conn)?;
            Ok(())
        })
    }

    // ---- pipelines -----------------------------------------------------

    pub fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let row = PipelineRow::from_domain(pipeline)?;
        self.with_conn(|conn| {
            diesel::insert_into(pipelines::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn get_pipeline(&self, id: &str) -> Result<Pipeline> {
        self.with_conn(|conn| {
            let row: Option<PipelineRow> = pipelines::table.find(id).first(conn).optional()?;
            row.ok_or(DataForgeError::NotFound {
                entity: "pipeline",
                id: id.to_string(),
            })?
            .into_domain()
        })
    }

    pub fn list_pipelines(&self, project_id: &str) -> Result<Vec<Pipeline>> {
        self.with_conn(|conn| {
            let rows: Vec<PipelineRow> = pipelines::table
                .filter(pipelines::project_id.eq(project_id))
                .order(pipelines::created_at.asc())
                .load(conn)?;
            rows.into_iter().map(PipelineRow::into_domain).collect()
        })
    }

    /// Full-row update, used for both config edits and node-status
    /// write-back after execution.
    pub fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let row = PipelineRow::from_domain(pipeline)?;
        self.with_conn(|conn| {
            diesel::update(pipelines::table.find(&pipeline.id))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn delete_pipeline(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            diesel::delete(pipelines::table.find(id)).execute(conn)?;
            Ok(())
        })
    }

    // ---- jobs ----------------------------------------------------------

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let row = JobRow::from_domain(job)?;
        self.with_conn(|conn| {
            diesel::insert_into(jobs::table).values(&row).execute(conn)?;
            Ok(())
        })
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.with_conn(|conn| {
            let row: Option<JobRow> = jobs::table.find(id).first(conn).optional()?;
            row.ok_or(DataForgeError::NotFound {
                entity: "job",
                id: id.to_string(),
            })?
            .into_domain()
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            let rows: Vec<JobRow> = jobs::table.order(jobs::created_at.asc()).load(conn)?;
            rows.into_iter().map(JobRow::into_domain).collect()
        })
    }

    pub fn list_enabled_jobs(&self) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            let rows: Vec<JobRow> = jobs::table
                .filter(jobs::enabled.eq(true))
                .order(jobs::created_at.asc())
                .load(conn)?;
            rows.into_iter().map(JobRow::into_domain).collect()
        })
    }

    pub fn update_job(&self, job: &Job) -> Result<()> {
        let row = JobRow::from_domain(job)?;
        self.with_conn(|conn| {
            diesel::update(jobs::table.find(&job.id))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn set_job_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.with_conn(|conn| {
            diesel::update(jobs::table.find(id))
                .set((
                    jobs::enabled.eq(enabled),
                    jobs::updated_at.eq(naive(Utc::now())),
                ))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            diesel::delete(jobs::table.find(id)).execute(conn)?;
            Ok(())
        })
    }

    // ---- executions ----------------------------------------------------

    pub fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let row = ExecutionRow::from_domain(execution)?;
        self.with_conn(|conn| {
            diesel::insert_into(job_executions::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn update_execution(&self, execution: &Execution) -> Result<()> {
        let row = ExecutionRow::from_domain(execution)?;
        self.with_conn(|conn| {
            diesel::update(job_executions::table.find(execution.id.to_string()))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn get_execution(&self, id: &str) -> Result<Execution> {
        self.with_conn(|conn| {
            let row: Option<ExecutionRow> =
                job_executions::table.find(id).first(conn).optional()?;
            row.ok_or(DataForgeError::NotFound {
                entity: "execution",
                id: id.to_string(),
            })?
            .into_domain()
        })
    }

    pub fn executions_for_job(&self, job_id: &str, limit: Option<i64>) -> Result<Vec<Execution>> {
        self.with_conn(|conn| {
            let mut query = job_executions::table
                .filter(job_executions::job_id.eq(job_id))
                .order(job_executions::created_at.desc())
                .into_boxed();
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            let rows: Vec<ExecutionRow> = query.load(conn)?;
            rows.into_iter().map(ExecutionRow::into_domain).collect()
        })
    }

    pub fn executions_by_status(&self, status: ExecutionStatus) -> Result<Vec<Execution>> {
        let token = to_token(&status)?;
        self.with_conn(|conn| {
            let rows: Vec<ExecutionRow> = job_executions::table
                .filter(job_executions::status.eq(token))
                .order(job_executions::created_at.asc())
                .load(conn)?;
            rows.into_iter().map(ExecutionRow::into_domain).collect()
        })
    }

    // ---- rollback points ----------------------------------------------

    pub fn insert_rollback_point(&self, point: &RollbackPoint) -> Result<()> {
        let row = RollbackPointRow::from_domain(point)?;
        self.with_conn(|conn| {
            diesel::insert_into(rollback_points::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn get_rollback_point(&self, id: &str) -> Result<RollbackPoint> {
        self.with_conn(|conn| {
            let row: Option<RollbackPointRow> =
                rollback_points::table.find(id).first(conn).optional()?;
            row.ok_or(DataForgeError::NotFound {
                entity: "rollback point",
                id: id.to_string(),
            })?
            .into_domain()
        })
    }

    pub fn list_rollback_points(
        &self,
        project_id: Option<&str>,
        point_type: Option<RollbackPointType>,
    ) -> Result<Vec<RollbackPoint>> {
        let type_token = point_type.map(|t| to_token(&t)).transpose()?;
        self.with_conn(|conn| {
            let mut query = rollback_points::table
                .order(rollback_points::captured_at.desc())
                .into_boxed();
            if let Some(project_id) = project_id {
                query = query.filter(rollback_points::project_id.eq(project_id.to_string()));
            }
            if let Some(token) = type_token {
                query = query.filter(rollback_points::point_type.eq(token));
            }
            let rows: Vec<RollbackPointRow> = query.load(conn)?;
            rows.into_iter().map(RollbackPointRow::into_domain).collect()
        })
    }

    pub fn set_rollback_point_status(&self, id: &str, status: RollbackPointStatus) -> Result<()> {
        let token = to_token(&status)?;
        self.with_conn(|conn| {
            diesel::update(rollback_points::table.find(id))
                .set(rollback_points::status.eq(token))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn delete_rollback_point(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            diesel::delete(rollback_points::table.find(id)).execute(conn)?;
            Ok(())
        })
    }

    // ---- webhooks ------------------------------------------------------

    pub fn insert_webhook_config(&self, config: &WebhookConfig) -> Result<()> {
        let row = WebhookConfigRow::from_domain(config)?;
        self.with_conn(|conn| {
            diesel::insert_into(webhook_configs::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn get_webhook_config(&self, id: &str) -> Result<WebhookConfig> {
        self.with_conn(|conn| {
            let row: Option<WebhookConfigRow> =
                webhook_configs::table.find(id).first(conn).optional()?;
            row.ok_or(DataForgeError::NotFound {
                entity: "webhook config",
                id: id.to_string(),
            })?
            .into_domain()
        })
    }

    pub fn list_webhook_configs(&self) -> Result<Vec<WebhookConfig>> {
        self.with_conn(|conn| {
            let rows: Vec<WebhookConfigRow> = webhook_configs::table
                .order(webhook_configs::created_at.asc())
                .load(conn)?;
            rows.into_iter().map(WebhookConfigRow::into_domain).collect()
        })
    }

    pub fn update_webhook_config(&self, config: &WebhookConfig) -> Result<()> {
        let row = WebhookConfigRow::from_domain(config)?;
        self.with_conn(|conn| {
            diesel::update(webhook_configs::table.find(&config.id))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn delete_webhook_config(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            diesel::delete(webhook_configs::table.find(id)).execute(conn)?;
            Ok(())
        })
    }

    pub fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let row = WebhookDeliveryRow::from_domain(delivery)?;
        self.with_conn(|conn| {
            diesel::insert_into(webhook_deliveries::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let row = WebhookDeliveryRow::from_domain(delivery)?;
        self.with_conn(|conn| {
            diesel::update(webhook_deliveries::table.find(delivery.id.to_string()))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn deliveries_for_config(&self, config_id: &str) -> Result<Vec<WebhookDelivery>> {
        self.with_conn(|conn| {
            let rows: Vec<WebhookDeliveryRow> = webhook_deliveries::table
                .filter(webhook_deliveries::config_id.eq(config_id))
                .order(webhook_deliveries::created_at.desc())
                .load(conn)?;
            rows.into_iter()
                .map(WebhookDeliveryRow::into_domain)
                .collect()
        })
    }

    /// Deliveries to re-queue on startup: anything still `pending` or
    /// `retry`.
    pub fn undelivered(&self) -> Result<Vec<WebhookDelivery>> {
        let pending = to_token(&DeliveryStatus::Pending)?;
        let retry = to_token(&DeliveryStatus::Retry)?;
        self.with_conn(|conn| {
            let rows: Vec<WebhookDeliveryRow> = webhook_deliveries::table
                .filter(
                    webhook_deliveries::status
                        .eq(pending)
                        .or(webhook_deliveries::status.eq(retry)),
                )
                .order(webhook_deliveries::created_at.asc())
                .load(conn)?;
            rows.into_iter()
                .map(WebhookDeliveryRow::into_domain)
                .collect()
        })
    }

    /// Flush the WAL (shutdown path).
    pub fn flush(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.batch_execute("PRAGMA wal_checkpoint(TRUNCATE);")
                .map_err(DataForgeError::from)
        })
    }
}
