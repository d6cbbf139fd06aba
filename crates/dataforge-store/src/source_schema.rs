//! Diesel table definitions for a per-data-source versioned store.

diesel::table! {
    data_versions (id) {
        id -> Text,
        version -> BigInt,
        data -> Text,
        schema -> Nullable<Text>,
        metadata -> Nullable<Text>,
        record_count -> BigInt,
        previous_version_id -> Nullable<Text>,
        diff_data -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    schema_versions (id) {
        id -> Text,
        version -> BigInt,
        schema -> Text,
        description -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    import_logs (id) {
        id -> Text,
        version_id -> Nullable<Text>,
        status -> Text,
        message -> Nullable<Text>,
        error_details -> Nullable<Text>,
        duration_ms -> Nullable<BigInt>,
        records_processed -> Nullable<BigInt>,
        created_at -> Timestamp,
        completed_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    quality_metrics (id) {
        id -> Text,
        version_id -> Text,
        metric_name -> Text,
        metric_value -> Double,
        threshold -> Nullable<Double>,
        status -> Text,
        details -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    data_versions,
    schema_versions,
    import_logs,
    quality_metrics,
);

/// Idempotent DDL executed on every open of a source store.
pub const SOURCE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS data_versions (
    id TEXT PRIMARY KEY NOT NULL,
    version BIGINT NOT NULL UNIQUE,
    data TEXT NOT NULL,
    schema TEXT,
    metadata TEXT,
    record_count BIGINT NOT NULL,
    previous_version_id TEXT,
    diff_data TEXT,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_data_versions_version ON data_versions(version);
CREATE INDEX IF NOT EXISTS idx_data_versions_created_at ON data_versions(created_at);

CREATE TABLE IF NOT EXISTS schema_versions (
    id TEXT PRIMARY KEY NOT NULL,
    version BIGINT NOT NULL,
    schema TEXT NOT NULL,
    description TEXT,
    created_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS import_logs (
    id TEXT PRIMARY KEY NOT NULL,
    version_id TEXT REFERENCES data_versions(id) ON DELETE SET NULL,
    status TEXT NOT NULL,
    message TEXT,
    error_details TEXT,
    duration_ms BIGINT,
    records_processed BIGINT,
    created_at TIMESTAMP NOT NULL,
    completed_at TIMESTAMP
);

CREATE TABLE IF NOT EXISTS quality_metrics (
    id TEXT PRIMARY KEY NOT NULL,
    version_id TEXT NOT NULL REFERENCES data_versions(id) ON DELETE CASCADE,
    metric_name TEXT NOT NULL,
    metric_value DOUBLE NOT NULL,
    threshold DOUBLE,
    status TEXT NOT NULL,
    details TEXT,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quality_metrics_version ON quality_metrics(version_id);
"#;
