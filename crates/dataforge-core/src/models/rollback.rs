//! Rollback points: manifests of version references captured before
//! mutations. Snapshots reference already-immutable versions; they never
//! copy record payloads, which is why retention can invalidate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackPointType {
    Manual,
    PrePipeline,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPointStatus {
    Active,
    Used,
    Expired,
}

/// One `(data source, version)` reference inside a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub data_source_id: String,
    pub version_id: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: String,
    pub project_id: String,
    #[serde(rename = "type")]
    pub point_type: RollbackPointType,
    pub status: RollbackPointStatus,
    pub snapshots: Vec<SnapshotRef>,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form context; pre-pipeline points carry `execution_id` and
    /// `pipeline_id` here.
    #[serde(default)]
    pub metadata: Value,
}

impl RollbackPoint {
    pub fn execution_id(&self) -> Option<&str> {
        self.metadata.get("execution_id").and_then(Value::as_str)
    }
}
