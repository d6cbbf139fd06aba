//! Projects, data-source configurations, retention and delta settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::RecordIdentity;

use super::transform::TransformSpec;

/// Top-level grouping; every other entity belongs to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Root directory for this project's data-source stores.
    pub data_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Csv,
    Json,
    Api,
    Script,
    Cloud,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Idle,
    Syncing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionStrategy {
    KeepLast,
    KeepDays,
    KeepAll,
}

/// Which past versions of a source are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub strategy: RetentionStrategy,
    /// `keep-last`: number of versions (default 10 when 0/absent);
    /// `keep-days`: age cutoff in days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u32>,
    /// Apply automatically after every successful write.
    #[serde(default)]
    pub auto_cleanup: bool,
}

impl RetentionPolicy {
    pub fn keep_last(value: u32) -> Self {
        RetentionPolicy {
            strategy: RetentionStrategy::KeepLast,
            value: Some(value),
            auto_cleanup: false,
        }
    }

    pub fn keep_all() -> Self {
        RetentionPolicy {
            strategy: RetentionStrategy::KeepAll,
            value: None,
            auto_cleanup: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaMode {
    Timestamp,
    Version,
    Hash,
    Cdc,
}

/// Incremental-ingestion settings for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaConfig {
    pub mode: DeltaMode,
    /// Column compared against the watermark in `timestamp`/`version` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_column: Option<String>,
    /// Columns hashed in `hash` mode; absent means the whole record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_columns: Option<Vec<String>>,
}

/// Configuration of one data source. `data_path` is the filesystem path of
/// the source's versioned store; exactly one store file exists per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub provider_type: ProviderType,
    /// Provider-specific settings (file path, URL + auth, script source,
    /// mock shape, ...), interpreted by the ingestion engine.
    pub config: Value,
    pub enabled: bool,
    /// Seconds between scheduled syncs, when the source is sync-scheduled
    /// directly rather than through a job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    pub status: SourceStatus,
    pub data_path: String,
    /// Record identity used for diffing, dedup and delta tracking.
    #[serde(default)]
    pub identity: RecordIdentity,
    /// Collapse records sharing this key to the last occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    /// Reject batches with inconsistent key sets instead of warning.
    #[serde(default)]
    pub strict_validation: bool,
    /// Applied in declared order before dedup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_strategy_serializes_kebab_case() {
        let p = RetentionPolicy::keep_last(5);
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["strategy"], "keep-last");
    }

    #[test]
    fn provider_type_round_trips() {
        let t: ProviderType = serde_json::from_str("\"script\"").unwrap();
        assert_eq!(t, ProviderType::Script);
    }
}
