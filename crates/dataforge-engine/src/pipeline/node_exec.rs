//! Node semantics: decode a node's config and run it over its resolved
//! inputs, producing the record set handed to downstream nodes.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use dataforge_core::diff::compute_diff;
use dataforge_core::record::canonical::canonical_json;
use dataforge_core::record::{Record, RecordIdentity};
use dataforge_core::models::TransformSpec;
use dataforge_core::{DataForgeError, Result};

use crate::transform;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceNodeConfig {
    pub data_source_id: String,
    /// Pin to a specific version; absent means latest.
    #[serde(default)]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformNodeConfig {
    #[serde(default)]
    pub transforms: Vec<TransformSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Outer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    PreferLeft,
    PreferRight,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeNodeConfig {
    pub join_keys: Vec<String>,
    #[serde(default = "default_join_type")]
    pub join_type: JoinType,
    #[serde(default = "default_conflict")]
    pub conflict: ConflictResolution,
}

fn default_join_type() -> JoinType {
    JoinType::Inner
}

fn default_conflict() -> ConflictResolution {
    ConflictResolution::PreferRight
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareMode {
    /// Compare whole records.
    Full,
    /// Compare only the fields listed in `fields`.
    Selected,
}

impl Default for CompareMode {
    fn default() -> Self {
        CompareMode::Full
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiffNodeConfig {
    pub compare_key: String,
    #[serde(default)]
    pub mode: CompareMode,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputDestination {
    /// Append the input as a new version of a data source.
    DataSource { data_source_id: String },
    /// Export to `<root>/exports/<exportId>.<ext>`.
    File {
        format: ExportFormat,
        #[serde(default)]
        name: Option<String>,
    },
    /// POST the input as JSON to a URL.
    Webhook { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputNodeConfig {
    pub destination: OutputDestination,
}

pub fn decode<T: serde::de::DeserializeOwned>(node_id: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|e| DataForgeError::ValidationError {
        message: format!("invalid config for node {}: {}", node_id, e),
    })
}

/// Transform node: apply the chain to the single input.
pub fn run_transform(
    config: &TransformNodeConfig,
    input: Vec<Record>,
    cancel: &CancellationToken,
) -> Result<Vec<Record>> {
    transform::apply_chain(input, &config.transforms, cancel)
}

/// Merge node: left-fold the inputs with a keyed join.
pub fn run_merge(config: &MergeNodeConfig, inputs: Vec<Vec<Record>>) -> Result<Vec<Record>> {
    if config.join_keys.is_empty() {
        return Err(DataForgeError::ValidationError {
            message: "merge node requires at least one join key".to_string(),
        });
    }
    let mut inputs = inputs.into_iter();
    let mut merged = inputs.next().ok_or_else(|| DataForgeError::ValidationError {
        message: "merge node requires at least one input".to_string(),
    })?;
    for right in inputs {
        merged = join_pair(merged, right, config);
    }
    Ok(merged)
}

fn join_key(record: &Record, keys: &[String]) -> String {
    keys.iter()
        .map(|key| canonical_json(record.get(key).unwrap_or(&Value::Null)))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

fn join_pair(left: Vec<Record>, right: Vec<Record>, config: &MergeNodeConfig) -> Vec<Record> {
    use std::collections::HashMap;
    let mut right_by_key: HashMap<String, Record> = HashMap::with_capacity(right.len());
    let mut right_order: Vec<String> = Vec::with_capacity(right.len());
    for record in right {
        let key = join_key(&record, &config.join_keys);
        if !right_by_key.contains_key(&key) {
            right_order.push(key.clone());
        }
        right_by_key.insert(key, record);
    }

    let mut out = Vec::new();
    let mut matched: std::collections::HashSet<String> = std::collections::HashSet::new();
    for record in left {
        let key = join_key(&record, &config.join_keys);
        match right_by_key.get(&key) {
            Some(right_record) => {
                matched.insert(key);
                out.push(combine(&record, right_record, config.conflict));
            }
            None => {
                if config.join_type != JoinType::Inner {
                    out.push(record);
                }
            }
        }
    }
    if config.join_type == JoinType::Outer {
        for key in right_order {
            if !matched.contains(&key) {
                if let Some(record) = right_by_key.remove(&key) {
                    out.push(record);
                }
            }
        }
    }
    out
}

fn combine(left: &Record, right: &Record, conflict: ConflictResolution) -> Record {
    let mut combined = left.clone();
    for (field, value) in right {
        match combined.get(field) {
            Some(_) if conflict == ConflictResolution::PreferLeft => {}
            _ => {
                combined.insert(field.clone(), value.clone());
            }
        }
    }
    combined
}

/// Diff node: three-way comparison of two inputs, emitting one record per
/// row tagged with a `_change` field (`added` / `removed` / `modified` /
/// `unchanged`).
pub fn run_diff(config: &DiffNodeConfig, left: Vec<Record>, right: Vec<Record>) -> Vec<Record> {
    let identity = RecordIdentity::key(config.compare_key.clone());
    let (left, right) = match config.mode {
        CompareMode::Full => (left, right),
        CompareMode::Selected => (
            project_fields(left, &config.compare_key, &config.fields),
            project_fields(right, &config.compare_key, &config.fields),
        ),
    };
    let diff = compute_diff(&left, &right, &identity);

    let changed_keys: std::collections::HashSet<&str> = diff
        .modified
        .iter()
        .map(|change| change.key.as_str())
        .collect();
    let added_keys: std::collections::HashSet<String> = diff
        .added
        .iter()
        .map(|record| identity.key_of(record))
        .collect();

    let mut out = Vec::new();
    for record in &right {
        let key = identity.key_of(record);
        let change = if added_keys.contains(&key) {
            "added"
        } else if changed_keys.contains(key.as_str()) {
            "modified"
        } else {
            "unchanged"
        };
        out.push(tag(record.clone(), change));
    }
    for record in diff.removed {
        out.push(tag(record, "removed"));
    }
    out
}

fn project_fields(records: Vec<Record>, key: &str, fields: &[String]) -> Vec<Record> {
    records
        .into_iter()
        .map(|record| {
            let mut projected = Map::new();
            if let Some(value) = record.get(key) {
                projected.insert(key.to_string(), value.clone());
            }
            for field in fields {
                if let Some(value) = record.get(field) {
                    projected.insert(field.clone(), value.clone());
                }
            }
            projected
        })
        .collect()
}

fn tag(mut record: Record, change: &str) -> Record {
    record.insert("_change".to_string(), json!(change));
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataforge_core::record::records_from_value;

    fn batch(v: Value) -> Vec<Record> {
        records_from_value(v).unwrap()
    }

    fn merge_config(join_type: JoinType, conflict: ConflictResolution) -> MergeNodeConfig {
        MergeNodeConfig {
            join_keys: vec!["id".to_string()],
            join_type,
            conflict,
        }
    }

    #[test]
    fn inner_join_keeps_matches_only() {
        let out = run_merge(
            &merge_config(JoinType::Inner, ConflictResolution::PreferRight),
            vec![
                batch(json!([{"id": 1, "a": 1}, {"id": 2, "a": 2}])),
                batch(json!([{"id": 2, "b": 20}, {"id": 3, "b": 30}])),
            ],
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], json!(2));
        assert_eq!(out[0]["a"], json!(2));
        assert_eq!(out[0]["b"], json!(20));
    }

    #[test]
    fn left_join_keeps_unmatched_left() {
        let out = run_merge(
            &merge_config(JoinType::Left, ConflictResolution::PreferRight),
            vec![
                batch(json!([{"id": 1, "a": 1}, {"id": 2, "a": 2}])),
                batch(json!([{"id": 2, "b": 20}])),
            ],
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].get("b").is_none());
    }

    #[test]
    fn outer_join_unions_both_sides() {
        let out = run_merge(
            &merge_config(JoinType::Outer, ConflictResolution::PreferRight),
            vec![
                batch(json!([{"id": 1, "a": 1}])),
                batch(json!([{"id": 2, "b": 20}])),
            ],
        )
        .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn conflict_resolution_picks_a_side() {
        let left = batch(json!([{"id": 1, "v": "left"}]));
        let right = batch(json!([{"id": 1, "v": "right"}]));

        let prefer_left = run_merge(
            &merge_config(JoinType::Inner, ConflictResolution::PreferLeft),
            vec![left.clone(), right.clone()],
        )
        .unwrap();
        assert_eq!(prefer_left[0]["v"], json!("left"));

        let prefer_right = run_merge(
            &merge_config(JoinType::Inner, ConflictResolution::PreferRight),
            vec![left, right],
        )
        .unwrap();
        assert_eq!(prefer_right[0]["v"], json!("right"));
    }

    #[test]
    fn diff_node_tags_every_row() {
        let config = DiffNodeConfig {
            compare_key: "id".to_string(),
            mode: CompareMode::Full,
            fields: Vec::new(),
        };
        let out = run_diff(
            &config,
            batch(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b"}])),
            batch(json!([{"id": 2, "v": "B"}, {"id": 3, "v": "c"}])),
        );
        let changes: Vec<(i64, String)> = out
            .iter()
            .map(|r| {
                (
                    r["id"].as_i64().unwrap(),
                    r["_change"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert!(changes.contains(&(2, "modified".to_string())));
        assert!(changes.contains(&(3, "added".to_string())));
        assert!(changes.contains(&(1, "removed".to_string())));
    }

    #[test]
    fn diff_node_selected_fields_ignore_noise() {
        let config = DiffNodeConfig {
            compare_key: "id".to_string(),
            mode: CompareMode::Selected,
            fields: vec!["v".to_string()],
        };
        let out = run_diff(
            &config,
            batch(json!([{"id": 1, "v": "a", "noise": 1}])),
            batch(json!([{"id": 1, "v": "a", "noise": 2}])),
        );
        assert_eq!(out[0]["_change"], json!("unchanged"));
    }
}
