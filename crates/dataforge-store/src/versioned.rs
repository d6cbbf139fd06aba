//! # Per-Data-Source Versioned Store
//!
//! A self-contained SQLite file holding the append-only version history of
//! one data source: record payloads, stored diffs against the previous
//! version, schema history, import logs and quality metrics.
//!
//! ## Guarantees
//!
//! - Version numbers are strictly increasing from 1 with no gaps; each
//!   version links to its predecessor through `previous_version_id`.
//! - `append_version` is atomic: the version row, diff blob, schema-history
//!   row and quality metrics commit together or not at all. A half-written
//!   version is never observable.
//! - Retention never deletes the latest version, regardless of policy.
//! - Single writer, many readers: a mutex guards the connection; all
//!   mutations run inside a transaction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Duration, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;

use dataforge_core::diff::{compute_diff, VersionDiff};
use dataforge_core::models::{entity_id, DataVersion, RetentionPolicy, RetentionStrategy, VersionStats};
use dataforge_core::record::{Record, RecordIdentity, Schema};
use dataforge_core::{DataForgeError, Result};

use crate::rows::{
    from_json, naive, to_json, utc, ImportLogRow, QualityMetricRow, SchemaVersionRow, VersionRow,
};
use crate::source_schema::{data_versions, import_logs, quality_metrics, schema_versions};

/// Completeness threshold below which a quality metric is flagged.
const COMPLETENESS_THRESHOLD: f64 = 0.95;

pub struct VersionedStore {
    path: PathBuf,
    conn: Mutex<SqliteConnection>,
}

impl VersionedStore {
    /// Open (creating if missing) the store at `path`. Parent directories
    /// are created; the schema is installed idempotently; WAL and foreign
    /// keys are enabled.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let database_url = path.to_string_lossy().to_string();
        let mut conn = SqliteConnection::establish(&database_url).map_err(|e| {
            DataForgeError::DatabaseError {
                message: format!("failed to open store {}: {}", database_url, e),
            }
        })?;
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;",
        )
        .map_err(DataForgeError::from)?;
        conn.batch_execute(crate::source_schema::SOURCE_DDL)
            .map_err(DataForgeError::from)?;
        Ok(VersionedStore {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| DataForgeError::DatabaseError {
            message: "store mutex poisoned".to_string(),
        })?;
        f(&mut guard)
    }

    /// Append a new version containing `records`.
    ///
    /// Computes the diff against the current latest (if any), infers the
    /// schema when none is declared, records a schema-history row when the
    /// schema changed, and writes quality metrics. All of it commits
    /// atomically.
    pub fn append_version(
        &self,
        records: &[Record],
        identity: &RecordIdentity,
        schema: Option<Schema>,
        metadata: Option<serde_json::Value>,
    ) -> Result<DataVersion> {
        self.with_conn(|conn| {
            conn.transaction::<DataVersion, DataForgeError, _>(|conn| {
                let latest: Option<VersionRow> = data_versions::table
                    .order(data_versions::version.desc())
                    .first(conn)
                    .optional()?;

                let (next_version, previous_id, diff) = match &latest {
                    Some(prev) => {
                        let previous_records: Vec<Record> = from_json(&prev.data)?;
                        let diff = compute_diff(&previous_records, records, identity);
                        (prev.version + 1, Some(prev.id.clone()), Some(diff))
                    }
                    None => (1, None, None),
                };

                let schema = match schema {
                    Some(declared) => declared,
                    None => Schema::infer(records),
                };

                let now = Utc::now();
                let row = VersionRow {
                    id: entity_id("ver"),
                    version: next_version,
                    data: to_json(&records)?,
                    schema: Some(to_json(&schema)?),
                    metadata: metadata.as_ref().map(to_json).transpose()?,
                    record_count: records.len() as i64,
                    previous_version_id: previous_id,
                    diff_data: diff.as_ref().map(to_json).transpose()?,
                    created_at: naive(now),
                };
                diesel::insert_into(data_versions::table)
                    .values(&row)
                    .execute(conn)?;

                // Schema history only grows when the schema actually changed.
                let last_schema: Option<SchemaVersionRow> = schema_versions::table
                    .order(schema_versions::version.desc())
                    .first(conn)
                    .optional()?;
                let schema_changed = match &last_schema {
                    Some(last) => from_json::<Schema>(&last.schema)? != schema,
                    None => true,
                };
                if schema_changed {
                    diesel::insert_into(schema_versions::table)
                        .values(&SchemaVersionRow {
                            id: entity_id("sch"),
                            version: next_version,
                            schema: to_json(&schema)?,
                            description: None,
                            created_at: naive(now),
                        })
                        .execute(conn)?;
                }

                write_quality_metrics(conn, &row.id, records, identity)?;

                Ok(DataVersion {
                    id: row.id,
                    version: row.version,
                    previous_version_id: row.previous_version_id,
                    created_at: now,
                    record_count: row.record_count,
                    schema: Some(schema),
                    metadata,
                    diff,
                })
            })
        })
    }

    pub fn get_latest(&self) -> Result<Option<DataVersion>> {
        self.with_conn(|conn| {
            let row: Option<VersionRow> = data_versions::table
                .order(data_versions::version.desc())
                .first(conn)
                .optional()?;
            row.map(row_to_version).transpose()
        })
    }

    pub fn get_by_version(&self, version: i64) -> Result<Option<DataVersion>> {
        self.with_conn(|conn| {
            let row: Option<VersionRow> = data_versions::table
                .filter(data_versions::version.eq(version))
                .first(conn)
                .optional()?;
            row.map(row_to_version).transpose()
        })
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<DataVersion>> {
        self.with_conn(|conn| {
            let row: Option<VersionRow> = data_versions::table
                .filter(data_versions::id.eq(id))
                .first(conn)
                .optional()?;
            row.map(row_to_version).transpose()
        })
    }

    /// Versions ordered by `version` descending, optionally limited.
    pub fn list_versions(&self, limit: Option<i64>) -> Result<Vec<DataVersion>> {
        self.with_conn(|conn| {
            let mut query = data_versions::table
                .order(data_versions::version.desc())
                .into_boxed();
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            let rows: Vec<VersionRow> = query.load(conn)?;
            rows.into_iter().map(row_to_version).collect()
        })
    }

    /// The record payload of a version, in insertion order.
    pub fn records_of_version(&self, version: i64) -> Result<Vec<Record>> {
        self.with_conn(|conn| {
            let row: Option<VersionRow> = data_versions::table
                .filter(data_versions::version.eq(version))
                .first(conn)
                .optional()?;
            match row {
                Some(row) => from_json(&row.data),
                None => Err(DataForgeError::NotFound {
                    entity: "version",
                    id: version.to_string(),
                }),
            }
        })
    }

    pub fn records_of_id(&self, id: &str) -> Result<Vec<Record>> {
        self.with_conn(|conn| {
            let row: Option<VersionRow> = data_versions::table
                .filter(data_versions::id.eq(id))
                .first(conn)
                .optional()?;
            match row {
                Some(row) => from_json(&row.data),
                None => Err(DataForgeError::NotFound {
                    entity: "version",
                    id: id.to_string(),
                }),
            }
        })
    }

    /// Diff between two versions. Adjacent pairs return the stored diff;
    /// anything else is recomputed from both record sets.
    pub fn get_diff(&self, from: i64, to: i64, identity: &RecordIdentity) -> Result<VersionDiff> {
        if to == from + 1 {
            self.with_conn(|conn| {
                let row: Option<VersionRow> = data_versions::table
                    .filter(data_versions::version.eq(to))
                    .first(conn)
                    .optional()?;
                let row = row.ok_or(DataForgeError::NotFound {
                    entity: "version",
                    id: to.to_string(),
                })?;
                match row.diff_data {
                    Some(stored) => from_json(&stored),
                    // Version 1 has no stored diff; recompute against the
                    // (necessarily missing) predecessor set.
                    None => {
                        let records: Vec<Record> = from_json(&row.data)?;
                        Ok(compute_diff(&[], &records, identity))
                    }
                }
            })
        } else {
            let old = self.records_of_version(from)?;
            let new = self.records_of_version(to)?;
            Ok(compute_diff(&old, &new, identity))
        }
    }

    /// Apply a retention policy; returns the number of deleted versions.
    /// The latest version always survives.
    pub fn apply_retention(&self, policy: &RetentionPolicy) -> Result<usize> {
        self.with_conn(|conn| {
            conn.transaction::<usize, DataForgeError, _>(|conn| {
                let latest: Option<i64> = data_versions::table
                    .select(diesel::dsl::max(data_versions::version))
                    .get_result(conn)?;
                let Some(latest) = latest else {
                    return Ok(0);
                };

                let deleted = match policy.strategy {
                    RetentionStrategy::KeepAll => 0,
                    RetentionStrategy::KeepLast => {
                        let keep = match policy.value {
                            Some(0) | None => 10,
                            Some(k) => k as i64,
                        };
                        // Highest version that falls outside the keep window.
                        let cutoff: Option<i64> = data_versions::table
                            .select(data_versions::version)
                            .order(data_versions::version.desc())
                            .offset(keep)
                            .first(conn)
                            .optional()?;
                        match cutoff {
                            Some(cutoff) => diesel::delete(
                                data_versions::table
                                    .filter(data_versions::version.le(cutoff))
                                    .filter(data_versions::version.ne(latest)),
                            )
                            .execute(conn)?,
                            None => 0,
                        }
                    }
                    RetentionStrategy::KeepDays => {
                        let days = policy.value.unwrap_or(0) as i64;
                        let cutoff = naive(Utc::now() - Duration::days(days));
                        diesel::delete(
                            data_versions::table
                                .filter(data_versions::created_at.lt(cutoff))
                                .filter(data_versions::version.ne(latest)),
                        )
                        .execute(conn)?
                    }
                };
                Ok(deleted)
            })
        })
    }

    /// `apply_retention` with a keep-last policy.
    pub fn cleanup_old_versions(&self, keep: u32) -> Result<usize> {
        self.apply_retention(&RetentionPolicy::keep_last(keep))
    }

    /// True when a version id still exists (rollback-point validation).
    pub fn version_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = data_versions::table
                .filter(data_versions::id.eq(id))
                .count()
                .get_result(conn)?;
            Ok(count > 0)
        })
    }

    /// Write one row into the import log.
    pub fn record_import(
        &self,
        version_id: Option<&str>,
        status: &str,
        message: Option<&str>,
        error_details: Option<&str>,
        duration_ms: i64,
        records_processed: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let now = naive(Utc::now());
            diesel::insert_into(import_logs::table)
                .values(&ImportLogRow {
                    id: entity_id("imp"),
                    version_id: version_id.map(str::to_string),
                    status: status.to_string(),
                    message: message.map(str::to_string),
                    error_details: error_details.map(str::to_string),
                    duration_ms: Some(duration_ms),
                    records_processed: Some(records_processed),
                    created_at: now,
                    completed_at: Some(now),
                })
                .execute(conn)?;
            Ok(())
        })
    }

    /// Aggregate statistics for this store.
    pub fn stats(&self) -> Result<VersionStats> {
        let data_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        self.with_conn(|conn| {
            let total_versions: i64 = data_versions::table.count().get_result(conn)?;
            // Summed in Rust: diesel's sum() over BigInt needs the
            // bigdecimal-backed Numeric type.
            let counts: Vec<i64> = data_versions::table
                .select(data_versions::record_count)
                .load(conn)?;
            let total_records: i64 = counts.iter().sum();
            let latest_version: Option<i64> = data_versions::table
                .select(diesel::dsl::max(data_versions::version))
                .get_result(conn)?;
            let oldest_version: Option<i64> = data_versions::table
                .select(diesel::dsl::min(data_versions::version))
                .get_result(conn)?;
            let last_import_at: Option<chrono::NaiveDateTime> = import_logs::table
                .select(diesel::dsl::max(import_logs::created_at))
                .get_result(conn)?;
            let last_import_at = match last_import_at {
                Some(at) => Some(at),
                None => data_versions::table
                    .select(diesel::dsl::max(data_versions::created_at))
                    .get_result(conn)?,
            };

            Ok(VersionStats {
                total_versions,
                total_records,
                latest_version,
                oldest_version,
                data_size_bytes,
                last_import_at: last_import_at.map(utc),
            })
        })
    }

    /// Flush the WAL into the main file (shutdown and backup path).
    pub fn flush(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.batch_execute("PRAGMA wal_checkpoint(TRUNCATE);")
                .map_err(DataForgeError::from)
        })
    }
}

fn row_to_version(row: VersionRow) -> Result<DataVersion> {
    Ok(DataVersion {
        id: row.id,
        version: row.version,
        previous_version_id: row.previous_version_id,
        created_at: utc(row.created_at),
        record_count: row.record_count,
        schema: row.schema.as_deref().map(from_json).transpose()?,
        metadata: row.metadata.as_deref().map(from_json).transpose()?,
        diff: row.diff_data.as_deref().map(from_json).transpose()?,
    })
}

/// Field completeness and duplicate-identity metrics for one version.
fn write_quality_metrics(
    conn: &mut SqliteConnection,
    version_id: &str,
    records: &[Record],
    identity: &RecordIdentity,
) -> Result<()> {
    let now = naive(Utc::now());

    let total_cells: usize = records.iter().map(|r| r.len()).sum();
    let non_null_cells: usize = records
        .iter()
        .map(|r| r.values().filter(|v| !v.is_null()).count())
        .sum();
    let completeness = if total_cells == 0 {
        1.0
    } else {
        non_null_cells as f64 / total_cells as f64
    };

    let mut keys: HashSet<String> = HashSet::with_capacity(records.len());
    let mut duplicates = 0usize;
    for record in records {
        if !keys.insert(identity.key_of(record)) {
            duplicates += 1;
        }
    }

    let rows = vec![
        QualityMetricRow {
            id: entity_id("qm"),
            version_id: version_id.to_string(),
            metric_name: "completeness".to_string(),
            metric_value: completeness,
            threshold: Some(COMPLETENESS_THRESHOLD),
            status: if completeness >= COMPLETENESS_THRESHOLD {
                "ok".to_string()
            } else {
                "warning".to_string()
            },
            details: None,
            created_at: now,
        },
        QualityMetricRow {
            id: entity_id("qm"),
            version_id: version_id.to_string(),
            metric_name: "duplicate_identities".to_string(),
            metric_value: duplicates as f64,
            threshold: Some(0.0),
            status: if duplicates == 0 {
                "ok".to_string()
            } else {
                "warning".to_string()
            },
            details: None,
            created_at: now,
        },
    ];
    diesel::insert_into(quality_metrics::table)
        .values(&rows)
        .execute(conn)?;
    Ok(())
}
