//! Record-set transformations shared by per-source ingestion and pipeline
//! `transform` nodes. Steps apply in declared order; each consumes and
//! produces a full record batch.

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::Regex;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use dataforge_core::models::{AggFunc, CompareOp, TransformSpec};
use dataforge_core::record::canonical::canonical_json;
use dataforge_core::record::{FieldType, Record};
use dataforge_core::{DataForgeError, Result};

use crate::script::{self, ScriptOptions};

/// Apply a transform chain in declared order.
pub fn apply_chain(
    records: Vec<Record>,
    specs: &[TransformSpec],
    cancel: &CancellationToken,
) -> Result<Vec<Record>> {
    let mut records = records;
    for spec in specs {
        if cancel.is_cancelled() {
            return Err(DataForgeError::Cancelled);
        }
        records = apply_one(records, spec, cancel)?;
    }
    Ok(records)
}

fn apply_one(
    records: Vec<Record>,
    spec: &TransformSpec,
    cancel: &CancellationToken,
) -> Result<Vec<Record>> {
    match spec {
        TransformSpec::Filter { field, op, value } => filter(records, field, *op, value),
        TransformSpec::Rename { from, to } => Ok(records
            .into_iter()
            .map(|mut record| {
                if let Some(value) = record.remove(from) {
                    record.insert(to.clone(), value);
                }
                record
            })
            .collect()),
        TransformSpec::Set { field, value } => Ok(records
            .into_iter()
            .map(|mut record| {
                record.insert(field.clone(), value.clone());
                record
            })
            .collect()),
        TransformSpec::Drop { field } => Ok(records
            .into_iter()
            .map(|mut record| {
                record.remove(field);
                record
            })
            .collect()),
        TransformSpec::Cast { field, to } => Ok(records
            .into_iter()
            .map(|mut record| {
                if let Some(value) = record.get(field).cloned() {
                    record.insert(field.clone(), cast(value, *to));
                }
                record
            })
            .collect()),
        TransformSpec::Sort { field, descending } => {
            let mut records = records;
            records.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                );
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            Ok(records)
        }
        TransformSpec::Aggregate {
            group_by,
            aggregates,
        } => aggregate(records, group_by, aggregates),
        TransformSpec::Script { source } => {
            let options = ScriptOptions {
                variables: vec![("records".to_string(), Value::Array(
                    records.into_iter().map(Value::Object).collect(),
                ))],
                ..Default::default()
            };
            script::eval_records(source, &options, cancel)
        }
    }
}

/// Collapse records sharing the dedup key to the last occurrence, keeping
/// the position of that last occurrence.
pub fn dedup_by_key(records: Vec<Record>, key: &str) -> Vec<Record> {
    let mut last_index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let value = canonical_json(record.get(key).unwrap_or(&Value::Null));
        last_index.insert(value, index);
    }
    records
        .into_iter()
        .enumerate()
        .filter(|(index, record)| {
            let value = canonical_json(record.get(key).unwrap_or(&Value::Null));
            last_index[&value] == *index
        })
        .map(|(_, record)| record)
        .collect()
}

fn filter(
    records: Vec<Record>,
    field: &str,
    op: CompareOp,
    value: &Value,
) -> Result<Vec<Record>> {
    // Compile once per chain step.
    let matcher = if op == CompareOp::Matches {
        let pattern = value.as_str().ok_or_else(|| DataForgeError::ValidationError {
            message: "matches filter requires a string pattern".to_string(),
        })?;
        Some(Regex::new(pattern).map_err(|e| DataForgeError::ValidationError {
            message: format!("invalid filter pattern: {}", e),
        })?)
    } else {
        None
    };

    Ok(records
        .into_iter()
        .filter(|record| {
            let actual = record.get(field).unwrap_or(&Value::Null);
            match op {
                CompareOp::Eq => values_equal(actual, value),
                CompareOp::Ne => !values_equal(actual, value),
                CompareOp::Gt => compare_values(actual, value) == Ordering::Greater,
                CompareOp::Gte => compare_values(actual, value) != Ordering::Less,
                CompareOp::Lt => compare_values(actual, value) == Ordering::Less,
                CompareOp::Lte => compare_values(actual, value) != Ordering::Greater,
                CompareOp::Contains => match (actual, value) {
                    (Value::String(haystack), Value::String(needle)) => {
                        haystack.contains(needle.as_str())
                    }
                    (Value::Array(items), needle) => {
                        items.iter().any(|item| values_equal(item, needle))
                    }
                    _ => false,
                },
                CompareOp::Matches => matcher.as_ref().is_some_and(|matcher| match actual {
                    Value::String(s) => matcher.is_match(s),
                    other => matcher.is_match(&canonical_json(other)),
                }),
            }
        })
        .collect())
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    canonical_json(a) == canonical_json(b)
}

/// Total order over JSON values: null < bool < number < string < composite.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        _ => canonical_json(a).cmp(&canonical_json(b)),
    }
}

fn cast(value: Value, to: FieldType) -> Value {
    match to {
        FieldType::Integer => match &value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(|i| json!(i))
                .unwrap_or(Value::Null),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| json!(i))
                .unwrap_or(Value::Null),
            Value::Bool(b) => json!(*b as i64),
            _ => Value::Null,
        },
        FieldType::Float => match &value {
            Value::Number(n) => n.as_f64().map(|f| json!(f)).unwrap_or(Value::Null),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| json!(f))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldType::String => match &value {
            Value::String(_) => value,
            Value::Null => Value::Null,
            other => json!(canonical_json(other)),
        },
        FieldType::Bool => match &value {
            Value::Bool(_) => value,
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" => json!(true),
                "false" | "0" | "no" => json!(false),
                _ => Value::Null,
            },
            Value::Number(n) => json!(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            _ => Value::Null,
        },
        FieldType::Null | FieldType::List | FieldType::Map => value,
    }
}

fn aggregate(
    records: Vec<Record>,
    group_by: &[String],
    aggregates: &[dataforge_core::models::AggregateSpec],
) -> Result<Vec<Record>> {
    // Group keyed by the canonical tuple of the group fields, preserving
    // first-seen group order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Record>> = HashMap::new();
    for record in records {
        let key = group_by
            .iter()
            .map(|field| canonical_json(record.get(field).unwrap_or(&Value::Null)))
            .collect::<Vec<_>>()
            .join("\u{1f}");
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(record);
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let members = &groups[&key];
        let mut result = Map::new();
        for field in group_by {
            result.insert(
                field.clone(),
                members[0].get(field).cloned().unwrap_or(Value::Null),
            );
        }
        for spec in aggregates {
            let value = reduce(members, spec.field.as_deref(), spec.func)?;
            result.insert(spec.output.clone(), value);
        }
        out.push(result);
    }
    Ok(out)
}

fn reduce(members: &[Record], field: Option<&str>, func: AggFunc) -> Result<Value> {
    if func == AggFunc::Count {
        return Ok(json!(members.len()));
    }
    let field = field.ok_or_else(|| DataForgeError::ValidationError {
        message: format!("aggregate {:?} requires a field", func),
    })?;
    let values: Vec<&Value> = members
        .iter()
        .filter_map(|record| record.get(field))
        .filter(|value| !value.is_null())
        .collect();
    if values.is_empty() {
        return Ok(Value::Null);
    }
    Ok(match func {
        AggFunc::Count => json!(members.len()),
        AggFunc::First => values[0].clone(),
        AggFunc::Last => values[values.len() - 1].clone(),
        AggFunc::Min => values
            .iter()
            .min_by(|a, b| compare_values(a, b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggFunc::Max => values
            .iter()
            .max_by(|a, b| compare_values(a, b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggFunc::Sum | AggFunc::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                let sum: f64 = numbers.iter().sum();
                if func == AggFunc::Sum {
                    number(sum)
                } else {
                    number(sum / numbers.len() as f64)
                }
            }
        }
    })
}

/// Render integral results as integers.
fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        json!(f as i64)
    } else {
        json!(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataforge_core::models::AggregateSpec;
    use dataforge_core::record::records_from_value;

    fn batch(v: Value) -> Vec<Record> {
        records_from_value(v).unwrap()
    }

    fn apply(records: Vec<Record>, spec: TransformSpec) -> Vec<Record> {
        apply_chain(records, &[spec], &CancellationToken::new()).unwrap()
    }

    #[test]
    fn filter_numeric_threshold() {
        let out = apply(
            batch(json!([{"age": 20}, {"age": 30}, {"age": 40}])),
            TransformSpec::Filter {
                field: "age".into(),
                op: CompareOp::Gte,
                value: json!(30),
            },
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn filter_regex() {
        let out = apply(
            batch(json!([{"email": "a@ok.io"}, {"email": "b@spam.biz"}])),
            TransformSpec::Filter {
                field: "email".into(),
                op: CompareOp::Matches,
                value: json!(r"@ok\.io$"),
            },
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn rename_and_drop() {
        let out = apply_chain(
            batch(json!([{"old": 1, "junk": true}])),
            &[
                TransformSpec::Rename {
                    from: "old".into(),
                    to: "new".into(),
                },
                TransformSpec::Drop {
                    field: "junk".into(),
                },
            ],
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(out[0].get("new"), Some(&json!(1)));
        assert!(out[0].get("old").is_none());
        assert!(out[0].get("junk").is_none());
    }

    #[test]
    fn cast_failures_null_the_field() {
        let out = apply(
            batch(json!([{"n": "12"}, {"n": "not a number"}])),
            TransformSpec::Cast {
                field: "n".into(),
                to: FieldType::Integer,
            },
        );
        assert_eq!(out[0]["n"], json!(12));
        assert_eq!(out[1]["n"], Value::Null);
    }

    #[test]
    fn sort_descending() {
        let out = apply(
            batch(json!([{"v": 1}, {"v": 3}, {"v": 2}])),
            TransformSpec::Sort {
                field: "v".into(),
                descending: true,
            },
        );
        let values: Vec<i64> = out.iter().map(|r| r["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![3, 2, 1]);
    }

    #[test]
    fn aggregate_count_and_sum() {
        let out = apply(
            batch(json!([
                {"country": "de", "amount": 10},
                {"country": "fr", "amount": 5},
                {"country": "de", "amount": 7}
            ])),
            TransformSpec::Aggregate {
                group_by: vec!["country".into()],
                aggregates: vec![
                    AggregateSpec {
                        field: None,
                        func: AggFunc::Count,
                        output: "n".into(),
                    },
                    AggregateSpec {
                        field: Some("amount".into()),
                        func: AggFunc::Sum,
                        output: "total".into(),
                    },
                ],
            },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["country"], json!("de"));
        assert_eq!(out[0]["n"], json!(2));
        assert_eq!(out[0]["total"], json!(17));
    }

    #[test]
    fn script_transform_sees_records() {
        let out = apply(
            batch(json!([{"v": 1}, {"v": 2}])),
            TransformSpec::Script {
                source: r#"records.map(|r| #{"v": r.v * 10})"#.into(),
            },
        );
        assert_eq!(out[0]["v"], json!(10));
        assert_eq!(out[1]["v"], json!(20));
    }

    #[test]
    fn dedup_keeps_last_occurrence() {
        let out = dedup_by_key(
            batch(json!([
                {"k": 1, "v": "first"},
                {"k": 2, "v": "only"},
                {"k": 1, "v": "last"}
            ])),
            "k",
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["v"], json!("only"));
        assert_eq!(out[1]["v"], json!("last"));
    }
}
