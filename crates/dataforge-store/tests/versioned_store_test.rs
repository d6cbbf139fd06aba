//! Scenario tests for the versioned store: monotone version numbering,
//! stored and recomputed diffs, retention semantics and stats.

use serde_json::json;
use tempfile::TempDir;

use dataforge_core::models::{RetentionPolicy, RetentionStrategy};
use dataforge_core::record::{records_from_value, Record, RecordIdentity};
use dataforge_store::VersionedStore;

fn batch(v: serde_json::Value) -> Vec<Record> {
    records_from_value(v).unwrap()
}

fn open_store(dir: &TempDir) -> VersionedStore {
    VersionedStore::open(&dir.path().join("d1.store")).unwrap()
}

#[test]
fn versions_are_monotone_and_linked() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("id");

    let mut previous_id: Option<String> = None;
    for n in 1..=6i64 {
        let version = store
            .append_version(&batch(json!([{"id": n}])), &identity, None, None)
            .unwrap();
        assert_eq!(version.version, n);
        assert_eq!(version.previous_version_id, previous_id);
        previous_id = Some(version.id);
    }

    let listed = store.list_versions(None).unwrap();
    let numbers: Vec<i64> = listed.iter().map(|v| v.version).collect();
    assert_eq!(numbers, vec![6, 5, 4, 3, 2, 1]);
}

#[test]
fn insert_and_diff_adjacent_versions() {
    // S1: two imports, stored diff between versions 1 and 2.
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("id");

    let v1 = store
        .append_version(
            &batch(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b"}])),
            &identity,
            None,
            None,
        )
        .unwrap();
    assert_eq!(v1.version, 1);
    assert_eq!(v1.record_count, 2);
    assert!(v1.previous_version_id.is_none());
    assert!(v1.diff.is_none());

    let v2 = store
        .append_version(
            &batch(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "B"}, {"id": 3, "v": "c"}])),
            &identity,
            None,
            None,
        )
        .unwrap();
    assert_eq!(v2.version, 2);

    let diff = store.get_diff(1, 2, &identity).unwrap();
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0]["id"], json!(3));
    assert!(diff.removed.is_empty());
    assert_eq!(diff.modified.len(), 1);
    let change = &diff.modified[0].fields["v"];
    assert_eq!(change.old, Some(json!("b")));
    assert_eq!(change.new, Some(json!("B")));
}

#[test]
fn non_adjacent_diff_is_recomputed() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("id");

    store
        .append_version(&batch(json!([{"id": 1, "v": "a"}])), &identity, None, None)
        .unwrap();
    store
        .append_version(&batch(json!([{"id": 1, "v": "b"}])), &identity, None, None)
        .unwrap();
    store
        .append_version(
            &batch(json!([{"id": 1, "v": "c"}, {"id": 2, "v": "x"}])),
            &identity,
            None,
            None,
        )
        .unwrap();

    let diff = store.get_diff(1, 3, &identity).unwrap();
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].fields["v"].new, Some(json!("c")));
}

#[test]
fn schema_history_only_grows_on_change() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("id");

    let v1 = store
        .append_version(&batch(json!([{"id": 1}])), &identity, None, None)
        .unwrap();
    let v2 = store
        .append_version(&batch(json!([{"id": 2}])), &identity, None, None)
        .unwrap();
    // Same shape: schema identical across both versions.
    assert_eq!(v1.schema, v2.schema);

    let v3 = store
        .append_version(&batch(json!([{"id": 3, "name": "x"}])), &identity, None, None)
        .unwrap();
    assert_ne!(v2.schema, v3.schema);
}

#[test]
fn retention_keep_last_keeps_top_k() {
    // S2: ten versions, keep-last 5 leaves versions 6..=10.
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("i");

    for i in 1..=10i64 {
        store
            .append_version(&batch(json!([{"i": i}])), &identity, None, None)
            .unwrap();
    }

    let deleted = store
        .apply_retention(&RetentionPolicy::keep_last(5))
        .unwrap();
    assert_eq!(deleted, 5);

    let versions: Vec<i64> = store
        .list_versions(None)
        .unwrap()
        .iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(versions, vec![10, 9, 8, 7, 6]);
    assert_eq!(store.get_latest().unwrap().unwrap().version, 10);
}

#[test]
fn retention_never_deletes_latest() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("i");

    for i in 1..=3i64 {
        store
            .append_version(&batch(json!([{"i": i}])), &identity, None, None)
            .unwrap();
    }
    let latest_before = store.get_latest().unwrap().unwrap();

    // keep-days 0 puts the cutoff at "now": every version qualifies by age,
    // but the latest must survive.
    let deleted = store
        .apply_retention(&RetentionPolicy {
            strategy: RetentionStrategy::KeepDays,
            value: Some(0),
            auto_cleanup: false,
        })
        .unwrap();
    assert_eq!(deleted, 2);

    let latest_after = store.get_latest().unwrap().unwrap();
    assert_eq!(latest_before.id, latest_after.id);

    // keep-all never deletes anything.
    assert_eq!(
        store.apply_retention(&RetentionPolicy::keep_all()).unwrap(),
        0
    );
}

#[test]
fn keep_last_zero_defaults_to_ten() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("i");

    for i in 1..=12i64 {
        store
            .append_version(&batch(json!([{"i": i}])), &identity, None, None)
            .unwrap();
    }
    let deleted = store
        .apply_retention(&RetentionPolicy::keep_last(0))
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.list_versions(None).unwrap().len(), 10);
}

#[test]
fn stats_reflect_contents() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("id");

    store
        .append_version(
            &batch(json!([{"id": 1}, {"id": 2}])),
            &identity,
            None,
            None,
        )
        .unwrap();
    store
        .append_version(&batch(json!([{"id": 1}])), &identity, None, None)
        .unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.total_versions, 2);
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.latest_version, Some(2));
    assert_eq!(stats.oldest_version, Some(1));
    assert!(stats.data_size_bytes > 0);
    assert!(stats.last_import_at.is_some());
}

#[test]
fn records_preserve_insertion_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("id");

    store
        .append_version(
            &batch(json!([{"id": 3}, {"id": 1}, {"id": 2}])),
            &identity,
            None,
            None,
        )
        .unwrap();

    let records = store.records_of_version(1).unwrap();
    let ids: Vec<i64> = records.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![3, 1, 2]);
}

#[test]
fn metadata_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let identity = RecordIdentity::key("id");

    let version = store
        .append_version(
            &batch(json!([{"id": 1}])),
            &identity,
            None,
            Some(json!({"origin": "unit-test"})),
        )
        .unwrap();
    let loaded = store.get_by_id(&version.id).unwrap().unwrap();
    assert_eq!(loaded.metadata, Some(json!({"origin": "unit-test"})));
    assert!(store.version_exists(&version.id).unwrap());
    assert!(!store.version_exists("ver_missing").unwrap());
}
