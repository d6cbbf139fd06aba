//! CoreStore behavior: CRUD, cascade deletes, the create-data-source
//! rollback contract and delivery recovery queries.

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use dataforge_core::models::{
    entity_id, DataSourceConfig, DeliveryStatus, EventType, Execution, ExecutionStatus, Job,
    JobKind, ProviderType, SourceStatus, WebhookConfig, WebhookDelivery, WebhookType,
};
use dataforge_core::DataForgeError;
use dataforge_store::{CoreStore, DataSourcePatch, ProjectPatch};

fn open_store(dir: &TempDir) -> CoreStore {
    CoreStore::open(&dir.path().join("core.store")).unwrap()
}

fn sample_source(project_id: &str, dir: &TempDir) -> DataSourceConfig {
    let id = entity_id("ds");
    let now = Utc::now();
    DataSourceConfig {
        data_path: dir
            .path()
            .join("data_sources")
            .join(project_id)
            .join(format!("{}.store", id))
            .to_string_lossy()
            .to_string(),
        id,
        project_id: project_id.to_string(),
        name: "users".to_string(),
        provider_type: ProviderType::Mock,
        config: json!({"rows": 3}),
        enabled: true,
        sync_interval_secs: None,
        last_sync_at: None,
        status: SourceStatus::Idle,
        identity: dataforge_core::record::RecordIdentity::key("id"),
        dedup_key: None,
        strict_validation: false,
        transforms: vec![],
        retention: None,
        delta: None,
        created_at: now,
        updated_at: now,
    }
}

#[test]
fn project_crud_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let project = store
        .create_project("analytics", Some("main project"), dir.path())
        .unwrap();
    assert!(project.id.starts_with("proj_"));

    let loaded = store.get_project(&project.id).unwrap();
    assert_eq!(loaded.name, "analytics");
    assert_eq!(loaded.description.as_deref(), Some("main project"));

    let updated = store
        .update_project(
            &project.id,
            ProjectPatch {
                name: Some("analytics-v2".to_string()),
                description: Some(None),
            },
        )
        .unwrap();
    assert_eq!(updated.name, "analytics-v2");
    assert!(updated.description.is_none());

    store.delete_project(&project.id).unwrap();
    assert!(matches!(
        store.get_project(&project.id),
        Err(DataForgeError::NotFound { .. })
    ));
    // Idempotent delete.
    store.delete_project(&project.id).unwrap();
}

#[test]
fn create_data_source_rolls_back_on_init_failure() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let project = store.create_project("p", None, dir.path()).unwrap();
    let source = sample_source(&project.id, &dir);

    let result = store.create_data_source(&source, |_| {
        Err(DataForgeError::IoError {
            message: "disk full".to_string(),
        })
    });
    assert!(result.is_err());
    assert!(matches!(
        store.get_data_source(&source.id),
        Err(DataForgeError::NotFound { .. })
    ));

    // A successful init persists the row.
    store.create_data_source(&source, |_| Ok(())).unwrap();
    let loaded = store.get_data_source(&source.id).unwrap();
    assert_eq!(loaded.provider_type, ProviderType::Mock);
}

#[test]
fn deleting_a_project_cascades() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let project = store.create_project("p", None, dir.path()).unwrap();
    let source = sample_source(&project.id, &dir);
    store.create_data_source(&source, |_| Ok(())).unwrap();

    store.delete_project(&project.id).unwrap();
    assert!(matches!(
        store.get_data_source(&source.id),
        Err(DataForgeError::NotFound { .. })
    ));
}

#[test]
fn data_source_patch_and_sync_state() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let project = store.create_project("p", None, dir.path()).unwrap();
    let source = sample_source(&project.id, &dir);
    store.create_data_source(&source, |_| Ok(())).unwrap();

    store
        .set_sync_state(&source.id, &json!({"last_sync_value": 42}))
        .unwrap();

    // A config update must not clobber delta-tracking state.
    let updated = store
        .update_data_source(
            &source.id,
            DataSourcePatch {
                name: Some("users-renamed".to_string()),
                enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.name, "users-renamed");
    assert!(!updated.enabled);
    assert_eq!(
        store.sync_state(&source.id).unwrap(),
        Some(json!({"last_sync_value": 42}))
    );

    store.set_source_status(&source.id, SourceStatus::Error).unwrap();
    assert_eq!(
        store.get_data_source(&source.id).unwrap().status,
        SourceStatus::Error
    );
}

#[test]
fn job_and_execution_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let project = store.create_project("p", None, dir.path()).unwrap();

    let now = Utc::now();
    let job = Job {
        id: entity_id("job"),
        project_id: project.id.clone(),
        name: "nightly".to_string(),
        kind: JobKind::Ingest,
        target_id: "ds_x".to_string(),
        schedule: Some(dataforge_core::models::Schedule {
            cron: "0 3 * * *".to_string(),
            timezone: None,
        }),
        trigger_on_source: None,
        enabled: true,
        webhook_enabled: true,
        webhook_events: vec![EventType::IngestFailure],
        retry_attempts: 2,
        retry_delay_ms: 500,
        created_at: now,
        updated_at: now,
    };
    store.insert_job(&job).unwrap();
    assert_eq!(store.list_enabled_jobs().unwrap().len(), 1);

    store.set_job_enabled(&job.id, false).unwrap();
    assert!(store.list_enabled_jobs().unwrap().is_empty());

    let execution = Execution {
        id: Uuid::new_v4(),
        job_id: job.id.clone(),
        status: ExecutionStatus::Queued,
        started_at: None,
        completed_at: None,
        error: None,
        stats: None,
        created_at: now,
    };
    store.insert_execution(&execution).unwrap();

    let mut running = execution.clone();
    running.status = ExecutionStatus::Running;
    running.started_at = Some(Utc::now());
    store.update_execution(&running).unwrap();

    let loaded = store.get_execution(&execution.id.to_string()).unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Running);
    assert_eq!(store.executions_for_job(&job.id, None).unwrap().len(), 1);
    assert_eq!(
        store
            .executions_by_status(ExecutionStatus::Running)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn undelivered_returns_pending_and_retry() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let now = Utc::now();
    let config = WebhookConfig {
        id: entity_id("wh"),
        project_id: None,
        pipeline_id: None,
        name: "ops".to_string(),
        kind: WebhookType::Generic,
        url: "http://localhost:9/hook".to_string(),
        secret: None,
        headers: Default::default(),
        events: vec![EventType::IngestSuccess],
        enabled: true,
        created_at: now,
    };
    store.insert_webhook_config(&config).unwrap();

    for status in [
        DeliveryStatus::Pending,
        DeliveryStatus::Retry,
        DeliveryStatus::Success,
        DeliveryStatus::Failed,
    ] {
        store
            .insert_delivery(&WebhookDelivery {
                id: Uuid::new_v4(),
                config_id: config.id.clone(),
                event_type: EventType::IngestSuccess,
                payload: json!({"n": 1}),
                status,
                http_status: None,
                attempts: 0,
                last_error: None,
                delivered_at: None,
                created_at: now,
            })
            .unwrap();
    }

    let undelivered = store.undelivered().unwrap();
    assert_eq!(undelivered.len(), 2);
    assert_eq!(store.deliveries_for_config(&config.id).unwrap().len(), 4);
}
