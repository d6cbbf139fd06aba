//! Record-set transformations.
//!
//! The same transform vocabulary serves per-source ingestion transforms and
//! pipeline `transform` nodes; execution lives in `dataforge-engine`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::FieldType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    /// Regular-expression match over the string form of the field.
    Matches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Source field; ignored for `count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub func: AggFunc,
    /// Output field name.
    pub output: String,
}

/// One step of a transform chain, applied in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Keep records where `field op value` holds.
    Filter {
        field: String,
        #[serde(rename = "compare")]
        op: CompareOp,
        value: Value,
    },
    /// Rename a field, dropping the old name.
    Rename { from: String, to: String },
    /// Set (or overwrite) a field to a constant.
    Set { field: String, value: Value },
    /// Drop a field from every record.
    Drop { field: String },
    /// Best-effort cast of a field to the target type; failures null the
    /// field.
    Cast { field: String, to: FieldType },
    /// Stable sort by a field.
    Sort {
        field: String,
        #[serde(default)]
        descending: bool,
    },
    /// Group records and reduce each group to one output record.
    Aggregate {
        group_by: Vec<String>,
        aggregates: Vec<AggregateSpec>,
    },
    /// Run a sandboxed script over the full record set.
    Script { source: String },
}
