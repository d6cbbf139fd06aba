//! # Version Diffing
//!
//! The structural difference between two record sets, keyed by record
//! identity (configured primary key, else canonical JSON). A diff has three
//! parts:
//!
//! - `added`: records whose identity appears only in the new set
//! - `removed`: records whose identity appears only in the old set
//! - `modified`: records present in both whose canonical content differs,
//!   with per-field `{old, new}` changes; field additions and removals are
//!   first-class (the absent side is `None`)
//!
//! `apply_diff(old, diff) == new` holds as bag equality under the identity,
//! which is the round-trip property the store relies on when recomputing
//! diffs across non-adjacent versions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::canonical::canonical_json;
use crate::record::{Record, RecordIdentity};

/// A single field's before/after values. `None` means the field was absent
/// on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

/// All field-level changes for one modified record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    /// Identity key of the record.
    pub key: String,
    pub fields: BTreeMap<String, FieldChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub added: Vec<Record>,
    pub removed: Vec<Record>,
    pub modified: Vec<RecordChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            added: self.added.len(),
            removed: self.removed.len(),
            modified: self.modified.len(),
        }
    }
}

/// Compute the diff from `old` to `new` under the given identity.
///
/// Later duplicates of an identity within one set shadow earlier ones,
/// mirroring dedup-on-ingest semantics. Output order follows the input
/// order of the respective set.
pub fn compute_diff(old: &[Record], new: &[Record], identity: &RecordIdentity) -> VersionDiff {
    let old_by_key = index_by_key(old, identity);
    let new_by_key = index_by_key(new, identity);

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut seen_new = std::collections::HashSet::new();

    for record in new {
        let key = identity.key_of(record);
        if !seen_new.insert(key.clone()) {
            continue;
        }
        match old_by_key.get(&key) {
            None => added.push(new_by_key[&key].clone()),
            Some(old_record) => {
                let new_record = &new_by_key[&key];
                if canonical_json(&Value::Object((*old_record).clone()))
                    != canonical_json(&Value::Object((*new_record).clone()))
                {
                    modified.push(RecordChange {
                        key,
                        fields: field_changes(old_record, new_record),
                    });
                }
            }
        }
    }

    let mut removed = Vec::new();
    let mut seen_old = std::collections::HashSet::new();
    for record in old {
        let key = identity.key_of(record);
        if !seen_old.insert(key.clone()) {
            continue;
        }
        if !new_by_key.contains_key(&key) {
            removed.push(old_by_key[&key].clone());
        }
    }

    VersionDiff {
        added,
        removed,
        modified,
    }
}

/// Apply a diff to an old record set, producing the new set.
///
/// Surviving records keep their old order; added records are appended in
/// diff order. Equality with the original new set is bag equality under the
/// identity.
pub fn apply_diff(old: &[Record], diff: &VersionDiff, identity: &RecordIdentity) -> Vec<Record> {
    let removed_keys: std::collections::HashSet<String> = diff
        .removed
        .iter()
        .map(|record| identity.key_of(record))
        .collect();
    let changes: BTreeMap<&str, &RecordChange> = diff
        .modified
        .iter()
        .map(|change| (change.key.as_str(), change))
        .collect();

    // Duplicate identities collapse to the last occurrence, mirroring
    // compute_diff's indexing.
    let mut last_index: std::collections::HashMap<String, usize> =
        std::collections::HashMap::with_capacity(old.len());
    for (index, record) in old.iter().enumerate() {
        last_index.insert(identity.key_of(record), index);
    }

    let mut result = Vec::with_capacity(old.len() + diff.added.len());
    for (index, record) in old.iter().enumerate() {
        let key = identity.key_of(record);
        if last_index[&key] != index {
            continue;
        }
        if removed_keys.contains(&key) {
            continue;
        }
        let mut record = record.clone();
        if let Some(change) = changes.get(key.as_str()) {
            for (field, field_change) in &change.fields {
                match &field_change.new {
                    Some(value) => {
                        record.insert(field.clone(), value.clone());
                    }
                    None => {
                        record.remove(field);
                    }
                }
            }
        }
        result.push(record);
    }
    result.extend(diff.added.iter().cloned());
    result
}

fn index_by_key<'a>(
    records: &'a [Record],
    identity: &RecordIdentity,
) -> std::collections::HashMap<String, &'a Record> {
    let mut map = std::collections::HashMap::with_capacity(records.len());
    for record in records {
        // Last occurrence wins.
        map.insert(identity.key_of(record), record);
    }
    map
}

fn field_changes(old: &Record, new: &Record) -> BTreeMap<String, FieldChange> {
    let mut changes = BTreeMap::new();
    for (field, old_value) in old {
        match new.get(field) {
            None => {
                changes.insert(
                    field.clone(),
                    FieldChange {
                        old: Some(old_value.clone()),
                        new: None,
                    },
                );
            }
            Some(new_value) if canonical_json(old_value) != canonical_json(new_value) => {
                changes.insert(
                    field.clone(),
                    FieldChange {
                        old: Some(old_value.clone()),
                        new: Some(new_value.clone()),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (field, new_value) in new {
        if !old.contains_key(field) {
            changes.insert(
                field.clone(),
                FieldChange {
                    old: None,
                    new: Some(new_value.clone()),
                },
            );
        }
    }
    changes
}
