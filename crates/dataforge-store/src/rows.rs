//! Diesel row structs and their conversions to/from the domain types.
//!
//! JSON-shaped columns hold serde_json text; enum columns hold the bare
//! serde token of the enum (e.g. `keep-last`, `pre-pipeline`). Timestamps
//! are stored as naive UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use dataforge_core::models::{
    DataSourceConfig, Execution, ExecutionStats, ExecutionStatus, Job, JobKind, Pipeline, Project,
    RollbackPoint, Schedule, WebhookConfig, WebhookDelivery,
};
use dataforge_core::DataForgeError;

/// Serialize an enum to its bare serde token.
pub fn to_token<T: Serialize>(value: &T) -> Result<String, DataForgeError> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(DataForgeError::SerializationError {
            message: format!("expected string token, got {}", other),
        }),
    }
}

/// Parse an enum from its bare serde token.
pub fn from_token<T: DeserializeOwned>(token: &str) -> Result<T, DataForgeError> {
    serde_json::from_value(Value::String(token.to_string())).map_err(|e| {
        DataForgeError::DeserializationError {
            message: format!("invalid token {:?}: {}", token, e),
        }
    })
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, DataForgeError> {
    Ok(serde_json::to_string(value)?)
}

pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, DataForgeError> {
    serde_json::from_str(text).map_err(|e| DataForgeError::DeserializationError {
        message: format!("invalid stored JSON: {}", e),
    })
}

pub fn naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

pub fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

pub fn opt_naive(dt: Option<DateTime<Utc>>) -> Option<NaiveDateTime> {
    dt.map(naive)
}

pub fn opt_utc(naive: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    naive.map(utc)
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::projects, treat_none_as_null = true)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub data_path: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ProjectRow {
    pub fn from_domain(project: &Project) -> Self {
        ProjectRow {
            id: project.id.clone(),
            name: project.name.clone(),
            description: project.description.clone(),
            data_path: project.data_path.clone(),
            created_at: naive(project.created_at),
            updated_at: naive(project.updated_at),
        }
    }

    pub fn into_domain(self) -> Project {
        Project {
            id: self.id,
            name: self.name,
            description: self.description,
            data_path: self.data_path,
            created_at: utc(self.created_at),
            updated_at: utc(self.updated_at),
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::data_sources, treat_none_as_null = true)]
pub struct DataSourceRow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub provider_type: String,
    pub config: String,
    pub enabled: bool,
    pub sync_interval_secs: Option<i64>,
    pub last_sync_at: Option<NaiveDateTime>,
    pub status: String,
    pub data_path: String,
    pub identity: String,
    pub dedup_key: Option<String>,
    pub strict_validation: bool,
    pub transforms: String,
    pub retention: Option<String>,
    pub delta: Option<String>,
    pub sync_state: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DataSourceRow {
    pub fn from_domain(source: &DataSourceConfig) -> Result<Self, DataForgeError> {
        Ok(DataSourceRow {
            id: source.id.clone(),
            project_id: source.project_id.clone(),
            name: source.name.clone(),
            provider_type: to_token(&source.provider_type)?,
            config: to_json(&source.config)?,
            enabled: source.enabled,
            sync_interval_secs: source.sync_interval_secs,
            last_sync_at: opt_naive(source.last_sync_at),
            status: to_token(&source.status)?,
            data_path: source.data_path.clone(),
            identity: to_json(&source.identity)?,
            dedup_key: source.dedup_key.clone(),
            strict_validation: source.strict_validation,
            transforms: to_json(&source.transforms)?,
            retention: source.retention.as_ref().map(to_json).transpose()?,
            delta: source.delta.as_ref().map(to_json).transpose()?,
            sync_state: None,
            created_at: naive(source.created_at),
            updated_at: naive(source.updated_at),
        })
    }

    pub fn into_domain(self) -> Result<DataSourceConfig, DataForgeError> {
        Ok(DataSourceConfig {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            provider_type: from_token(&self.provider_type)?,
            config: from_json(&self.config)?,
            enabled: self.enabled,
            sync_interval_secs: self.sync_interval_secs,
            last_sync_at: opt_utc(self.last_sync_at),
            status: from_token(&self.status)?,
            data_path: self.data_path,
            identity: from_json(&self.identity)?,
            dedup_key: self.dedup_key,
            strict_validation: self.strict_validation,
            transforms: from_json(&self.transforms)?,
            retention: self.retention.as_deref().map(from_json).transpose()?,
            delta: self.delta.as_deref().map(from_json).transpose()?,
            created_at: utc(self.created_at),
            updated_at: utc(self.updated_at),
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::pipelines, treat_none_as_null = true)]
pub struct PipelineRow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    pub nodes: String,
    pub edges: String,
    pub continue_on_error: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PipelineRow {
    pub fn from_domain(pipeline: &Pipeline) -> Result<Self, DataForgeError> {
        Ok(PipelineRow {
            id: pipeline.id.clone(),
            project_id: pipeline.project_id.clone(),
            name: pipeline.name.clone(),
            description: pipeline.description.clone(),
            nodes: to_json(&pipeline.nodes)?,
            edges: to_json(&pipeline.edges)?,
            continue_on_error: pipeline.continue_on_error,
            created_at: naive(pipeline.created_at),
            updated_at: naive(pipeline.updated_at),
        })
    }

    pub fn into_domain(self) -> Result<Pipeline, DataForgeError> {
        Ok(Pipeline {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            description: self.description,
            nodes: from_json(&self.nodes)?,
            edges: from_json(&self.edges)?,
            continue_on_error: self.continue_on_error,
            created_at: utc(self.created_at),
            updated_at: utc(self.updated_at),
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::jobs, treat_none_as_null = true)]
pub struct JobRow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub kind: String,
    pub target_id: String,
    pub schedule_cron: Option<String>,
    pub schedule_timezone: Option<String>,
    pub trigger_on_source: Option<String>,
    pub enabled: bool,
    pub webhook_enabled: bool,
    pub webhook_events: String,
    pub retry_attempts: i32,
    pub retry_delay_ms: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl JobRow {
    pub fn from_domain(job: &Job) -> Result<Self, DataForgeError> {
        Ok(JobRow {
            id: job.id.clone(),
            project_id: job.project_id.clone(),
            name: job.name.clone(),
            kind: to_token(&job.kind)?,
            target_id: job.target_id.clone(),
            schedule_cron: job.schedule.as_ref().map(|s| s.cron.clone()),
            schedule_timezone: job.schedule.as_ref().and_then(|s| s.timezone.clone()),
            trigger_on_source: job.trigger_on_source.clone(),
            enabled: job.enabled,
            webhook_enabled: job.webhook_enabled,
            webhook_events: to_json(&job.webhook_events)?,
            retry_attempts: job.retry_attempts as i32,
            retry_delay_ms: job.retry_delay_ms as i64,
            created_at: naive(job.created_at),
            updated_at: naive(job.updated_at),
        })
    }

    pub fn into_domain(self) -> Result<Job, DataForgeError> {
        let kind: JobKind = from_token(&self.kind)?;
        Ok(Job {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            kind,
            target_id: self.target_id,
            schedule: self.schedule_cron.map(|cron| Schedule {
                cron,
                timezone: self.schedule_timezone,
            }),
            trigger_on_source: self.trigger_on_source,
            enabled: self.enabled,
            webhook_enabled: self.webhook_enabled,
            webhook_events: from_json(&self.webhook_events)?,
            retry_attempts: self.retry_attempts.max(0) as u32,
            retry_delay_ms: self.retry_delay_ms.max(0) as u64,
            created_at: utc(self.created_at),
            updated_at: utc(self.updated_at),
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::job_executions, treat_none_as_null = true)]
pub struct ExecutionRow {
    pub id: String,
    pub job_id: String,
    pub status: String,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub error: Option<String>,
    pub stats: Option<String>,
    pub created_at: NaiveDateTime,
}

impl ExecutionRow {
    pub fn from_domain(execution: &Execution) -> Result<Self, DataForgeError> {
        Ok(ExecutionRow {
            id: execution.id.to_string(),
            job_id: execution.job_id.clone(),
            status: to_token(&execution.status)?,
            started_at: opt_naive(execution.started_at),
            completed_at: opt_naive(execution.completed_at),
            error: execution.error.clone(),
            stats: execution.stats.as_ref().map(to_json).transpose()?,
            created_at: naive(execution.created_at),
        })
    }

    pub fn into_domain(self) -> Result<Execution, DataForgeError> {
        let id = Uuid::parse_str(&self.id).map_err(|e| DataForgeError::DeserializationError {
            message: format!("invalid execution id {:?}: {}", self.id, e),
        })?;
        let status: ExecutionStatus = from_token(&self.status)?;
        let stats: Option<ExecutionStats> = self.stats.as_deref().map(from_json).transpose()?;
        Ok(Execution {
            id,
            job_id: self.job_id,
            status,
            started_at: opt_utc(self.started_at),
            completed_at: opt_utc(self.completed_at),
            error: self.error,
            stats,
            created_at: utc(self.created_at),
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::rollback_points, treat_none_as_null = true)]
pub struct RollbackPointRow {
    pub id: String,
    pub project_id: String,
    pub point_type: String,
    pub status: String,
    pub snapshots: String,
    pub captured_at: NaiveDateTime,
    pub expires_at: Option<NaiveDateTime>,
    pub metadata: String,
}

impl RollbackPointRow {
    pub fn from_domain(point: &RollbackPoint) -> Result<Self, DataForgeError> {
        Ok(RollbackPointRow {
            id: point.id.clone(),
            project_id: point.project_id.clone(),
            point_type: to_token(&point.point_type)?,
            status: to_token(&point.status)?,
            snapshots: to_json(&point.snapshots)?,
            captured_at: naive(point.captured_at),
            expires_at: opt_naive(point.expires_at),
            metadata: to_json(&point.metadata)?,
        })
    }

    pub fn into_domain(self) -> Result<RollbackPoint, DataForgeError> {
        Ok(RollbackPoint {
            id: self.id,
            project_id: self.project_id,
            point_type: from_token(&self.point_type)?,
            status: from_token(&self.status)?,
            snapshots: from_json(&self.snapshots)?,
            captured_at: utc(self.captured_at),
            expires_at: opt_utc(self.expires_at),
            metadata: from_json(&self.metadata)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::webhook_configs, treat_none_as_null = true)]
pub struct WebhookConfigRow {
    pub id: String,
    pub project_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub name: String,
    pub kind: String,
    pub url: String,
    pub secret: Option<String>,
    pub headers: String,
    pub events: String,
    pub enabled: bool,
    pub created_at: NaiveDateTime,
}

impl WebhookConfigRow {
    pub fn from_domain(config: &WebhookConfig) -> Result<Self, DataForgeError> {
        Ok(WebhookConfigRow {
            id: config.id.clone(),
            project_id: config.project_id.clone(),
            pipeline_id: config.pipeline_id.clone(),
            name: config.name.clone(),
            kind: to_token(&config.kind)?,
            url: config.url.clone(),
            secret: config.secret.clone(),
            headers: to_json(&config.headers)?,
            events: to_json(&config.events)?,
            enabled: config.enabled,
            created_at: naive(config.created_at),
        })
    }

    pub fn into_domain(self) -> Result<WebhookConfig, DataForgeError> {
        Ok(WebhookConfig {
            id: self.id,
            project_id: self.project_id,
            pipeline_id: self.pipeline_id,
            name: self.name,
            kind: from_token(&self.kind)?,
            url: self.url,
            secret: self.secret,
            headers: from_json(&self.headers)?,
            events: from_json(&self.events)?,
            enabled: self.enabled,
            created_at: utc(self.created_at),
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::webhook_deliveries, treat_none_as_null = true)]
pub struct WebhookDeliveryRow {
    pub id: String,
    pub config_id: String,
    pub event_type: String,
    pub payload: String,
    pub status: String,
    pub http_status: Option<i32>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub delivered_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl WebhookDeliveryRow {
    pub fn from_domain(delivery: &WebhookDelivery) -> Result<Self, DataForgeError> {
        Ok(WebhookDeliveryRow {
            id: delivery.id.to_string(),
            config_id: delivery.config_id.clone(),
            event_type: to_token(&delivery.event_type)?,
            payload: to_json(&delivery.payload)?,
            status: to_token(&delivery.status)?,
            http_status: delivery.http_status.map(|s| s as i32),
            attempts: delivery.attempts as i32,
            last_error: delivery.last_error.clone(),
            delivered_at: opt_naive(delivery.delivered_at),
            created_at: naive(delivery.created_at),
        })
    }

    pub fn into_domain(self) -> Result<WebhookDelivery, DataForgeError> {
        let id = Uuid::parse_str(&self.id).map_err(|e| DataForgeError::DeserializationError {
            message: format!("invalid delivery id {:?}: {}", self.id, e),
        })?;
        Ok(WebhookDelivery {
            id,
            config_id: self.config_id,
            event_type: from_token(&self.event_type)?,
            payload: from_json(&self.payload)?,
            status: from_token(&self.status)?,
            http_status: self.http_status.map(|s| s.max(0) as u16),
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error,
            delivered_at: opt_utc(self.delivered_at),
            created_at: utc(self.created_at),
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::source_schema::data_versions)]
pub struct VersionRow {
    pub id: String,
    pub version: i64,
    pub data: String,
    pub schema: Option<String>,
    pub metadata: Option<String>,
    pub record_count: i64,
    pub previous_version_id: Option<String>,
    pub diff_data: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::source_schema::schema_versions)]
pub struct SchemaVersionRow {
    pub id: String,
    pub version: i64,
    pub schema: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::source_schema::import_logs)]
pub struct ImportLogRow {
    pub id: String,
    pub version_id: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub error_details: Option<String>,
    pub duration_ms: Option<i64>,
    pub records_processed: Option<i64>,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::source_schema::quality_metrics)]
pub struct QualityMetricRow {
    pub id: String,
    pub version_id: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub threshold: Option<f64>,
    pub status: String,
    pub details: Option<String>,
    pub created_at: NaiveDateTime,
}
