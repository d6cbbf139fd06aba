//! Record identity.
//!
//! Diffing, deduplication and delta tracking all key records the same way:
//! by the configured primary-key column(s) when a source declares them,
//! otherwise by the canonical JSON of the whole record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::canonical::canonical_json;
use super::Record;

/// How records of a source are identified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIdentity {
    /// Primary-key columns, in significance order. Empty/absent means the
    /// whole record is its own identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
}

impl RecordIdentity {
    /// Identity over a single key column.
    pub fn key(column: impl Into<String>) -> Self {
        Self {
            primary_key: Some(vec![column.into()]),
        }
    }

    /// Identity over a composite key.
    pub fn composite(columns: Vec<String>) -> Self {
        Self {
            primary_key: Some(columns),
        }
    }

    /// Whole-record identity.
    pub fn content(&self) -> bool {
        self.primary_key.as_ref().map_or(true, |k| k.is_empty())
    }

    /// Compute the identity string of a record.
    ///
    /// Missing key columns contribute `null`, so records that omit a key
    /// field still get a stable identity.
    pub fn key_of(&self, record: &Record) -> String {
        match &self.primary_key {
            Some(columns) if !columns.is_empty() => {
                let mut key = String::new();
                for (i, column) in columns.iter().enumerate() {
                    if i > 0 {
                        // Unit separator keeps composite parts unambiguous.
                        key.push('\u{1f}');
                    }
                    key.push_str(&canonical_json(record.get(column).unwrap_or(&Value::Null)));
                }
                key
            }
            _ => canonical_json(&Value::Object(record.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn key_identity_ignores_other_fields() {
        let identity = RecordIdentity::key("id");
        let a = record(json!({"id": 1, "v": "a"}));
        let b = record(json!({"id": 1, "v": "b"}));
        assert_eq!(identity.key_of(&a), identity.key_of(&b));
    }

    #[test]
    fn content_identity_distinguishes_values() {
        let identity = RecordIdentity::default();
        let a = record(json!({"id": 1, "v": "a"}));
        let b = record(json!({"id": 1, "v": "b"}));
        assert_ne!(identity.key_of(&a), identity.key_of(&b));
    }

    #[test]
    fn composite_keys_do_not_collide_on_concatenation() {
        let identity = RecordIdentity::composite(vec!["a".into(), "b".into()]);
        let x = record(json!({"a": "1", "b": "23"}));
        let y = record(json!({"a": "12", "b": "3"}));
        assert_ne!(identity.key_of(&x), identity.key_of(&y));
    }

    #[test]
    fn missing_key_column_is_null() {
        let identity = RecordIdentity::key("id");
        let a = record(json!({"v": "a"}));
        assert_eq!(identity.key_of(&a), "null");
    }
}
