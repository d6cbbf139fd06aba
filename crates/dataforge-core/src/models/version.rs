//! Version metadata surfaced by the versioned store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::VersionDiff;
use crate::record::Schema;

/// One immutable snapshot of a source's record set.
///
/// Versions form a linked list through `previous_version_id`; `version`
/// numbers are strictly increasing from 1 with no gaps. The record payload
/// is fetched separately (`VersionedStore::records_of`) to keep listings
/// cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataVersion {
    pub id: String,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub record_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Diff against the immediately preceding version; absent for version 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<VersionDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionStats {
    pub total_versions: i64,
    /// Sum of record counts over all retained versions.
    pub total_records: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_version: Option<i64>,
    pub data_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_import_at: Option<DateTime<Utc>>,
}
