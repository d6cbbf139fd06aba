//! Jobs and their executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Ingest,
    Pipeline,
    Bulk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Five-field cron expression (seconds optional as a sixth leading
    /// field).
    pub cron: String,
    /// IANA timezone name; the scheduler default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub kind: JobKind,
    /// Data-source id for `ingest`, pipeline id for `pipeline`, bulk
    /// operation id for `bulk`.
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    /// Enqueue this job when the named source receives a new version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_on_source: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub webhook_enabled: bool,
    /// Events forwarded to webhooks for this job; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhook_events: Vec<EventType>,
    /// Retries for retryable failures; 0 disables.
    #[serde(default)]
    pub retry_attempts: u32,
    /// Initial backoff; doubles per retry up to the scheduler cap.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    #[serde(default)]
    pub records_processed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_created: Option<i64>,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub retries: u32,
}

/// A single run of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ExecutionStats>,
    pub created_at: DateTime<Utc>,
}
