//! Delta selection: limit a fetched batch to what changed since the last
//! sync.
//!
//! - `timestamp` / `version` keep records whose tracking column exceeds the
//!   persisted watermark, then advance the watermark to the maximum seen.
//! - `hash` computes a stable per-record hash over selected columns and
//!   compares it against the persisted per-key hash map, classifying rows
//!   as added / changed / unchanged. Deletions are inferred from absent
//!   keys, and only because every fetch is a full enumeration; a partial
//!   scan must never infer deletes.
//! - `cdc` delegates to the provider when it supports capture, otherwise
//!   fails with `UnsupportedFeature`.
//!
//! Tracking state is opaque JSON persisted on the data-source row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use dataforge_core::models::{DeltaConfig, DeltaMode};
use dataforge_core::record::canonical::canonical_json;
use dataforge_core::record::{Record, RecordIdentity};
use dataforge_core::{DataForgeError, Result};

use crate::transform::compare_values;

/// Result of delta selection: the records to append, the new tracking
/// state, and summary fields merged into the version metadata.
#[derive(Debug)]
pub struct DeltaOutcome {
    pub records: Vec<Record>,
    pub state: Value,
    pub summary: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WatermarkState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_sync_value: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HashState {
    #[serde(default)]
    hashes: BTreeMap<String, String>,
}

/// Select the delta subset of `records` under `config`.
pub fn select(
    config: &DeltaConfig,
    identity: &RecordIdentity,
    records: Vec<Record>,
    prior_state: Option<Value>,
    provider_supports_cdc: bool,
) -> Result<DeltaOutcome> {
    match config.mode {
        DeltaMode::Timestamp | DeltaMode::Version => {
            watermark_select(config, records, prior_state)
        }
        DeltaMode::Hash => hash_select(config, identity, records, prior_state),
        DeltaMode::Cdc => {
            if provider_supports_cdc {
                // Capture-capable providers already return only changes.
                Ok(DeltaOutcome {
                    summary: json!({"delta_mode": "cdc", "rows": records.len()}),
                    records,
                    state: prior_state.unwrap_or(Value::Null),
                })
            } else {
                Err(DataForgeError::UnsupportedFeature {
                    feature: "cdc delta mode for this provider".to_string(),
                })
            }
        }
    }
}

fn watermark_select(
    config: &DeltaConfig,
    records: Vec<Record>,
    prior_state: Option<Value>,
) -> Result<DeltaOutcome> {
    let column = config.tracking_column.as_deref().ok_or_else(|| {
        DataForgeError::ValidationError {
            message: "timestamp/version delta mode requires a tracking column".to_string(),
        }
    })?;
    let state: WatermarkState = match prior_state {
        Some(state) => serde_json::from_value(state)?,
        None => WatermarkState::default(),
    };

    let mut selected = Vec::new();
    let mut max_seen = state.last_sync_value.clone();
    for record in records {
        let value = record.get(column).cloned().unwrap_or(Value::Null);
        if value.is_null() {
            continue;
        }
        let beyond_watermark = match &state.last_sync_value {
            Some(watermark) => {
                compare_values(&value, watermark) == std::cmp::Ordering::Greater
            }
            None => true,
        };
        if beyond_watermark {
            match &max_seen {
                Some(current)
                    if compare_values(&value, current) != std::cmp::Ordering::Greater => {}
                _ => max_seen = Some(value.clone()),
            }
            selected.push(record);
        }
    }

    let selected_count = selected.len();
    Ok(DeltaOutcome {
        records: selected,
        state: serde_json::to_value(WatermarkState {
            last_sync_value: max_seen.clone(),
        })?,
        summary: json!({
            "delta_mode": "watermark",
            "tracking_column": column,
            "selected": selected_count,
            "last_sync_value": max_seen,
        }),
    })
}

fn hash_select(
    config: &DeltaConfig,
    identity: &RecordIdentity,
    records: Vec<Record>,
    prior_state: Option<Value>,
) -> Result<DeltaOutcome> {
    let state: HashState = match prior_state {
        Some(state) => serde_json::from_value(state)?,
        None => HashState::default(),
    };

    let mut next_hashes = BTreeMap::new();
    let mut selected = Vec::new();
    let mut added = 0usize;
    let mut changed = 0usize;
    let mut unchanged = 0usize;

    for record in records {
        let key = identity.key_of(&record);
        let hash = record_hash(&record, config.hash_columns.as_deref());
        match state.hashes.get(&key) {
            None => {
                added += 1;
                selected.push(record);
            }
            Some(previous) if previous != &hash => {
                changed += 1;
                selected.push(record);
            }
            Some(_) => unchanged += 1,
        }
        next_hashes.insert(key, hash);
    }

    // The fetch enumerated the full source, so keys that vanished were
    // deleted upstream.
    let deleted: Vec<String> = state
        .hashes
        .keys()
        .filter(|key| !next_hashes.contains_key(*key))
        .cloned()
        .collect();

    Ok(DeltaOutcome {
        records: selected,
        state: serde_json::to_value(HashState {
            hashes: next_hashes,
        })?,
        summary: json!({
            "delta_mode": "hash",
            "added": added,
            "changed": changed,
            "unchanged": unchanged,
            "deleted_keys": deleted,
        }),
    })
}

/// SHA-256 over the canonical JSON of the selected columns (whole record
/// when none are configured).
fn record_hash(record: &Record, columns: Option<&[String]>) -> String {
    let payload = match columns {
        Some(columns) if !columns.is_empty() => {
            let mut selected = serde_json::Map::new();
            for column in columns {
                selected.insert(
                    column.clone(),
                    record.get(column).cloned().unwrap_or(Value::Null),
                );
            }
            canonical_json(&Value::Object(selected))
        }
        _ => canonical_json(&Value::Object(record.clone())),
    };
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataforge_core::record::records_from_value;

    fn batch(v: Value) -> Vec<Record> {
        records_from_value(v).unwrap()
    }

    fn watermark_config(column: &str) -> DeltaConfig {
        DeltaConfig {
            mode: DeltaMode::Timestamp,
            tracking_column: Some(column.to_string()),
            hash_columns: None,
        }
    }

    fn hash_config() -> DeltaConfig {
        DeltaConfig {
            mode: DeltaMode::Hash,
            tracking_column: None,
            hash_columns: None,
        }
    }

    #[test]
    fn watermark_first_run_takes_everything() {
        let outcome = select(
            &watermark_config("updated_at"),
            &RecordIdentity::key("id"),
            batch(json!([
                {"id": 1, "updated_at": 100},
                {"id": 2, "updated_at": 200}
            ])),
            None,
            false,
        )
        .unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.state["last_sync_value"], json!(200));
    }

    #[test]
    fn watermark_filters_already_seen() {
        let outcome = select(
            &watermark_config("updated_at"),
            &RecordIdentity::key("id"),
            batch(json!([
                {"id": 1, "updated_at": 100},
                {"id": 2, "updated_at": 250},
                {"id": 3, "updated_at": 300}
            ])),
            Some(json!({"last_sync_value": 200})),
            false,
        )
        .unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.state["last_sync_value"], json!(300));
    }

    #[test]
    fn watermark_without_new_rows_keeps_state() {
        let outcome = select(
            &watermark_config("updated_at"),
            &RecordIdentity::key("id"),
            batch(json!([{"id": 1, "updated_at": 50}])),
            Some(json!({"last_sync_value": 200})),
            false,
        )
        .unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.state["last_sync_value"], json!(200));
    }

    #[test]
    fn hash_classifies_added_changed_unchanged_deleted() {
        let identity = RecordIdentity::key("id");
        let first = select(
            &hash_config(),
            &identity,
            batch(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b"}])),
            None,
            false,
        )
        .unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.summary["added"], json!(2));

        let second = select(
            &hash_config(),
            &identity,
            batch(json!([{"id": 2, "v": "B"}, {"id": 3, "v": "c"}])),
            Some(first.state),
            false,
        )
        .unwrap();
        assert_eq!(second.summary["added"], json!(1));
        assert_eq!(second.summary["changed"], json!(1));
        assert_eq!(second.summary["unchanged"], json!(0));
        assert_eq!(second.summary["deleted_keys"], json!(["1"]));
        assert_eq!(second.records.len(), 2);
    }

    #[test]
    fn hash_columns_restrict_the_digest() {
        let identity = RecordIdentity::key("id");
        let config = DeltaConfig {
            mode: DeltaMode::Hash,
            tracking_column: None,
            hash_columns: Some(vec!["v".to_string()]),
        };
        let first = select(
            &config,
            &identity,
            batch(json!([{"id": 1, "v": "a", "noise": 1}])),
            None,
            false,
        )
        .unwrap();
        // Changing a column outside the hash set is invisible.
        let second = select(
            &config,
            &identity,
            batch(json!([{"id": 1, "v": "a", "noise": 2}])),
            Some(first.state),
            false,
        )
        .unwrap();
        assert_eq!(second.summary["unchanged"], json!(1));
        assert!(second.records.is_empty());
    }

    #[test]
    fn cdc_without_support_is_unsupported() {
        let config = DeltaConfig {
            mode: DeltaMode::Cdc,
            tracking_column: None,
            hash_columns: None,
        };
        let err = select(
            &config,
            &RecordIdentity::key("id"),
            vec![],
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, DataForgeError::UnsupportedFeature { .. }));
    }
}
