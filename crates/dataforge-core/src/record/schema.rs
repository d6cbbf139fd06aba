//! Schema model and inference.
//!
//! A schema maps field names to a type plus a nullable flag and optional
//! default. Schemas are inferred from record batches when a source does not
//! declare one; the versioned store records a new schema-history row only
//! when the inferred/declared schema differs from the last by deep
//! equality.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Null,
    Bool,
    Integer,
    Float,
    String,
    List,
    Map,
}

impl FieldType {
    pub fn of(value: &Value) -> FieldType {
        match value {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => FieldType::Integer,
            Value::Number(_) => FieldType::Float,
            Value::String(_) => FieldType::String,
            Value::Array(_) => FieldType::List,
            Value::Object(_) => FieldType::Map,
        }
    }

    /// Widen two observed types into one. Integer and Float widen to Float;
    /// any other disagreement falls back to String.
    fn widen(self, other: FieldType) -> FieldType {
        use FieldType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, b) => b,
            (a, Null) => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Field name → definition, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: BTreeMap<String, FieldDef>,
}

impl Schema {
    /// Infer a schema from a record batch.
    ///
    /// A field is nullable when any record holds `null` for it or omits it
    /// entirely. Conflicting non-null types widen per [`FieldType::widen`].
    pub fn infer(records: &[Record]) -> Schema {
        let mut fields: BTreeMap<String, (FieldType, bool, usize)> = BTreeMap::new();

        for record in records {
            for (name, value) in record {
                let observed = FieldType::of(value);
                let entry = fields
                    .entry(name.clone())
                    .or_insert((FieldType::Null, false, 0));
                if observed == FieldType::Null {
                    entry.1 = true;
                } else {
                    entry.0 = entry.0.widen(observed);
                }
                entry.2 += 1;
            }
        }

        let total = records.len();
        Schema {
            fields: fields
                .into_iter()
                .map(|(name, (field_type, saw_null, seen))| {
                    (
                        name,
                        FieldDef {
                            field_type,
                            nullable: saw_null || seen < total,
                            default: None,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
