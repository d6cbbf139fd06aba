//! Diesel table definitions for the CoreStore. JSON-shaped columns are
//! `Text` holding serde_json output; enum columns hold the serde token of
//! the enum.

diesel::table! {
    projects (id) {
        id -> Text,
        name -> Text,
        description -> Nullable<Text>,
        data_path -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    data_sources (id) {
        id -> Text,
        project_id -> Text,
        name -> Text,
        provider_type -> Text,
        config -> Text,
        enabled -> Bool,
        sync_interval_secs -> Nullable<BigInt>,
        last_sync_at -> Nullable<Timestamp>,
        status -> Text,
        data_path -> Text,
        identity -> Text,
        dedup_key -> Nullable<Text>,
        strict_validation -> Bool,
        transforms -> Text,
        retention -> Nullable<Text>,
        delta -> Nullable<Text>,
        sync_state -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    pipelines (id) {
        id -> Text,
        project_id -> Text,
        name -> Text,
        description -> Nullable<Text>,
        nodes -> Text,
        edges -> Text,
        continue_on_error -> Bool,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    jobs (id) {
        id -> Text,
        project_id -> Text,
        name -> Text,
        kind -> Text,
        target_id -> Text,
        schedule_cron -> Nullable<Text>,
        schedule_timezone -> Nullable<Text>,
        trigger_on_source -> Nullable<Text>,
        enabled -> Bool,
        webhook_enabled -> Bool,
        webhook_events -> Text,
        retry_attempts -> Integer,
        retry_delay_ms -> BigInt,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    job_executions (id) {
        id -> Text,
        job_id -> Text,
        status -> Text,
        started_at -> Nullable<Timestamp>,
        completed_at -> Nullable<Timestamp>,
        error -> Nullable<Text>,
        stats -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    rollback_points (id) {
        id -> Text,
        project_id -> Text,
        point_type -> Text,
        status -> Text,
        snapshots -> Text,
        captured_at -> Timestamp,
        expires_at -> Nullable<Timestamp>,
        metadata -> Text,
    }
}

diesel::table! {
    webhook_configs (id) {
        id -> Text,
        project_id -> Nullable<Text>,
        pipeline_id -> Nullable<Text>,
        name -> Text,
        kind -> Text,
        url -> Text,
        secret -> Nullable<Text>,
        headers -> Text,
        events -> Text,
        enabled -> Bool,
        created_at -> Timestamp,
    }
}

diesel::table! {
    webhook_deliveries (id) {
        id -> Text,
        config_id -> Text,
        event_type -> Text,
        payload -> Text,
        status -> Text,
        http_status -> Nullable<Integer>,
        attempts -> Integer,
        last_error -> Nullable<Text>,
        delivered_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    projects,
    data_sources,
    pipelines,
    jobs,
    job_executions,
    rollback_points,
    webhook_configs,
    webhook_deliveries,
);

/// Idempotent DDL executed on every open.
pub const CORE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    data_path TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS data_sources (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    provider_type TEXT NOT NULL,
    config TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT 1,
    sync_interval_secs BIGINT,
    last_sync_at TIMESTAMP,
    status TEXT NOT NULL,
    data_path TEXT NOT NULL,
    identity TEXT NOT NULL,
    dedup_key TEXT,
    strict_validation BOOLEAN NOT NULL DEFAULT 0,
    transforms TEXT NOT NULL,
    retention TEXT,
    delta TEXT,
    sync_state TEXT,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_data_sources_project ON data_sources(project_id);

CREATE TABLE IF NOT EXISTS pipelines (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    nodes TEXT NOT NULL,
    edges TEXT NOT NULL,
    continue_on_error BOOLEAN NOT NULL DEFAULT 0,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pipelines_project ON pipelines(project_id);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    schedule_cron TEXT,
    schedule_timezone TEXT,
    trigger_on_source TEXT,
    enabled BOOLEAN NOT NULL DEFAULT 1,
    webhook_enabled BOOLEAN NOT NULL DEFAULT 0,
    webhook_events TEXT NOT NULL,
    retry_attempts INTEGER NOT NULL DEFAULT 0,
    retry_delay_ms BIGINT NOT NULL DEFAULT 1000,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);

CREATE TABLE IF NOT EXISTS job_executions (
    id TEXT PRIMARY KEY NOT NULL,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    started_at TIMESTAMP,
    completed_at TIMESTAMP,
    error TEXT,
    stats TEXT,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_executions_job ON job_executions(job_id);

CREATE TABLE IF NOT EXISTS rollback_points (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    point_type TEXT NOT NULL,
    status TEXT NOT NULL,
    snapshots TEXT NOT NULL,
    captured_at TIMESTAMP NOT NULL,
    expires_at TIMESTAMP,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rollback_points_project ON rollback_points(project_id);

CREATE TABLE IF NOT EXISTS webhook_configs (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT REFERENCES projects(id) ON DELETE CASCADE,
    pipeline_id TEXT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    url TEXT NOT NULL,
    secret TEXT,
    headers TEXT NOT NULL,
    events TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT 1,
    created_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id TEXT PRIMARY KEY NOT NULL,
    config_id TEXT NOT NULL REFERENCES webhook_configs(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    http_status INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    delivered_at TIMESTAMP,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_config ON webhook_deliveries(config_id);
CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_status ON webhook_deliveries(status);
"#;
