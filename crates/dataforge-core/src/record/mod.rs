//! # Record Model
//!
//! Tabular data in DataForge is a sequence of records. A [`Record`] is an
//! ordered map from field name to a JSON value (`null | bool | i64 | f64 |
//! string | list | map`), which keeps the engine agnostic to provider
//! shapes while staying losslessly serializable.
//!
//! The submodules provide the canonical JSON form used for record identity
//! and content comparison ([`canonical`]), the configured-key identity rule
//! ([`identity`]) and schema inference ([`schema`]).

use serde_json::{Map, Value};

use crate::error::DataForgeError;

pub mod canonical;
pub mod identity;
pub mod schema;

pub use canonical::canonical_json;
pub use identity::RecordIdentity;
pub use schema::{FieldDef, FieldType, Schema};

/// One tabular record: field name → value.
pub type Record = Map<String, Value>;

/// Normalize a provider result into a record batch.
///
/// Providers may return a single object or an array of objects; anything
/// else (scalars, arrays of scalars, null) is rejected.
pub fn records_from_value(value: Value) -> Result<Vec<Record>, DataForgeError> {
    match value {
        Value::Object(map) => Ok(vec![map]),
        Value::Array(items) => {
            let mut records = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(map) => records.push(map),
                    other => {
                        return Err(DataForgeError::ValidationError {
                            message: format!(
                                "record {} is not an object (got {})",
                                index,
                                type_name(&other)
                            ),
                        })
                    }
                }
            }
            Ok(records)
        }
        other => Err(DataForgeError::ValidationError {
            message: format!(
                "provider must return an object or an array of objects (got {})",
                type_name(&other)
            ),
        }),
    }
}

/// Count records whose key set differs from the first record's.
///
/// Inconsistent records are reported as a warning by the ingestion engine;
/// in strict mode the batch is rejected instead.
pub fn count_inconsistent(records: &[Record]) -> usize {
    let Some(first) = records.first() else {
        return 0;
    };
    let reference: std::collections::BTreeSet<&str> = first.keys().map(|k| k.as_str()).collect();
    records
        .iter()
        .skip(1)
        .filter(|record| {
            let keys: std::collections::BTreeSet<&str> = record.keys().map(|k| k.as_str()).collect();
            keys != reference
        })
        .count()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_object_becomes_one_record() {
        let records = records_from_value(json!({"id": 1})).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], json!(1));
    }

    #[test]
    fn scalar_batch_entries_are_rejected() {
        let err = records_from_value(json!([1, 2, 3])).unwrap_err();
        assert!(err.to_string().contains("not an object"));
    }

    #[test]
    fn scalar_result_is_rejected() {
        assert!(records_from_value(json!("nope")).is_err());
        assert!(records_from_value(Value::Null).is_err());
    }

    #[test]
    fn inconsistent_key_sets_are_counted() {
        let records = records_from_value(json!([
            {"id": 1, "v": "a"},
            {"id": 2, "v": "b"},
            {"id": 3},
            {"v": "d", "id": 4}
        ]))
        .unwrap();
        // Key order does not matter, only the key set does.
        assert_eq!(count_inconsistent(&records), 1);
    }
}
