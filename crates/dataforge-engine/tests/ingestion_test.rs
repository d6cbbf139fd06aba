//! End-to-end ingestion through the application root: mock provider,
//! transforms, dedup, strict validation and delta tracking.

use serde_json::json;
use tempfile::TempDir;

use dataforge_core::models::{
    CompareOp, DeltaConfig, DeltaMode, ProviderType, RetentionPolicy, RetentionStrategy,
    TransformSpec,
};
use dataforge_core::record::RecordIdentity;
use dataforge_core::DataForgeError;
use dataforge_engine::app::CreateDataSource;
use dataforge_engine::{AppSettings, DataForge};

fn forge(dir: &TempDir) -> DataForge {
    DataForge::open(AppSettings::new(dir.path())).unwrap()
}

#[tokio::test]
async fn mock_ingestion_creates_versions() {
    let dir = TempDir::new().unwrap();
    let forge = forge(&dir);
    let project = forge.create_project("p", None).unwrap();
    let source = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new(
                "users",
                ProviderType::Mock,
                json!({"records": [{"id": 1, "name": "ada"}, {"id": 2, "name": "grace"}]}),
            ),
        )
        .unwrap();

    let outcome = forge.ingest_now(&project.id, &source.id).await.unwrap();
    assert_eq!(outcome.version.version, 1);
    assert_eq!(outcome.records_processed, 2);

    let outcome = forge.ingest_now(&project.id, &source.id).await.unwrap();
    assert_eq!(outcome.version.version, 2);
    // Unchanged batch: the stored diff is empty.
    let diff = forge.get_diff(&project.id, &source.id, 1, 2).unwrap();
    assert!(diff.is_empty());

    let loaded = forge.get_data_source(&source.id).unwrap();
    assert!(loaded.last_sync_at.is_some());
}

#[tokio::test]
async fn transforms_and_dedup_apply_in_order() {
    let dir = TempDir::new().unwrap();
    let forge = forge(&dir);
    let project = forge.create_project("p", None).unwrap();

    let mut spec = CreateDataSource::new(
        "events",
        ProviderType::Mock,
        json!({"records": [
            {"id": 1, "kind": "keep", "v": 1},
            {"id": 2, "kind": "drop", "v": 2},
            {"id": 1, "kind": "keep", "v": 3}
        ]}),
    );
    spec.identity = RecordIdentity::key("id");
    spec.dedup_key = Some("id".to_string());
    spec.transforms = vec![TransformSpec::Filter {
        field: "kind".to_string(),
        op: CompareOp::Eq,
        value: json!("keep"),
    }];
    let source = forge.create_data_source(&project.id, spec).unwrap();

    let outcome = forge.ingest_now(&project.id, &source.id).await.unwrap();
    // Filter drops id 2; dedup collapses id 1 to the last occurrence.
    assert_eq!(outcome.records_processed, 1);
    let records = forge.version_records(&project.id, &source.id, 1).unwrap();
    assert_eq!(records[0]["v"], json!(3));
}

#[tokio::test]
async fn strict_validation_rejects_inconsistent_batches() {
    let dir = TempDir::new().unwrap();
    let forge = forge(&dir);
    let project = forge.create_project("p", None).unwrap();

    let mut spec = CreateDataSource::new(
        "ragged",
        ProviderType::Mock,
        json!({"records": [{"id": 1, "a": 1}, {"id": 2}]}),
    );
    spec.strict_validation = true;
    let source = forge.create_data_source(&project.id, spec).unwrap();

    let err = forge.ingest_now(&project.id, &source.id).await.unwrap_err();
    assert!(matches!(err, DataForgeError::ValidationError { .. }));
    // Nothing was written.
    assert!(forge.list_versions(&project.id, &source.id, None).unwrap().is_empty());
}

#[tokio::test]
async fn hash_delta_skips_unchanged_batches() {
    let dir = TempDir::new().unwrap();
    let forge = forge(&dir);
    let project = forge.create_project("p", None).unwrap();

    let mut spec = CreateDataSource::new(
        "inventory",
        ProviderType::Mock,
        json!({"records": [{"id": 1, "v": "a"}, {"id": 2, "v": "b"}]}),
    );
    spec.identity = RecordIdentity::key("id");
    spec.delta = Some(DeltaConfig {
        mode: DeltaMode::Hash,
        tracking_column: None,
        hash_columns: None,
    });
    let source = forge.create_data_source(&project.id, spec).unwrap();

    let first = forge.ingest_now(&project.id, &source.id).await.unwrap();
    assert_eq!(first.records_processed, 2);

    // Same content again: everything is unchanged.
    let second = forge.ingest_now(&project.id, &source.id).await.unwrap();
    assert_eq!(second.records_processed, 0);
    let version = forge
        .get_version(&project.id, &source.id, 2)
        .unwrap()
        .unwrap();
    let metadata = version.metadata.unwrap();
    assert_eq!(metadata["unchanged"], json!(2));
}

#[tokio::test]
async fn auto_retention_runs_after_ingest() {
    let dir = TempDir::new().unwrap();
    let forge = forge(&dir);
    let project = forge.create_project("p", None).unwrap();

    let mut spec = CreateDataSource::new(
        "rolling",
        ProviderType::Mock,
        json!({"records": [{"id": 1}]}),
    );
    spec.retention = Some(RetentionPolicy {
        strategy: RetentionStrategy::KeepLast,
        value: Some(2),
        auto_cleanup: true,
    });
    let source = forge.create_data_source(&project.id, spec).unwrap();

    for _ in 0..4 {
        forge.ingest_now(&project.id, &source.id).await.unwrap();
    }
    let versions = forge.list_versions(&project.id, &source.id, None).unwrap();
    let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
    assert_eq!(numbers, vec![4, 3]);
}

#[tokio::test]
async fn cloud_provider_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let forge = forge(&dir);
    let project = forge.create_project("p", None).unwrap();
    let source = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new("cloudy", ProviderType::Cloud, json!({})),
        )
        .unwrap();

    let err = forge.ingest_now(&project.id, &source.id).await.unwrap_err();
    assert!(matches!(err, DataForgeError::UnsupportedFeature { .. }));
}

#[tokio::test]
async fn deleting_a_source_removes_its_store() {
    let dir = TempDir::new().unwrap();
    let forge = forge(&dir);
    let project = forge.create_project("p", None).unwrap();
    let source = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new("gone", ProviderType::Mock, json!({"rows": 1})),
        )
        .unwrap();
    forge.ingest_now(&project.id, &source.id).await.unwrap();

    let store_path = std::path::PathBuf::from(&source.data_path);
    assert!(store_path.exists());
    forge.delete_data_source(&source.id).unwrap();
    assert!(!store_path.exists());
    assert!(forge.orphan_stores().unwrap().is_empty());
    // Idempotent.
    forge.delete_data_source(&source.id).unwrap();
}
