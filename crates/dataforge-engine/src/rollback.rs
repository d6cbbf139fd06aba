//! # Rollback Manager
//!
//! Captures pre-change snapshots as manifests of `(data source, version)`
//! references and restores them non-destructively: a restore appends a new
//! forward version whose content equals the referenced snapshot, so the
//! full history survives. Because snapshots reference versions instead of
//! copying bytes, retention can invalidate them; the expiry sweep flips
//! such points to `expired` and restore rejects them.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use dataforge_core::models::{
    entity_id, RollbackPoint, RollbackPointStatus, RollbackPointType, SnapshotRef,
};
use dataforge_core::{DataForgeError, Result};

use crate::events::EngineContext;

/// Per-source outcome of a restore (or dry run).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RestoreAction {
    pub data_source_id: String,
    pub restored_version: i64,
    /// Version created by the restore; `None` on dry runs and no-ops.
    pub new_version: Option<i64>,
    /// The source was already at the referenced version.
    pub noop: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RestoreReport {
    pub point_id: String,
    pub dry_run: bool,
    pub actions: Vec<RestoreAction>,
}

pub struct RollbackManager {
    ctx: EngineContext,
}

impl RollbackManager {
    pub fn new(ctx: EngineContext) -> Self {
        RollbackManager { ctx }
    }

    /// Capture the current latest version of every source in scope.
    /// Sources with no versions yet contribute no snapshot; restoring the
    /// point simply skips them.
    pub fn create_point(
        &self,
        project_id: &str,
        data_source_ids: &[String],
        point_type: RollbackPointType,
        expires_in: Option<Duration>,
        metadata: Value,
    ) -> Result<RollbackPoint> {
        let mut snapshots = Vec::new();
        for ds_id in data_source_ids {
            let store = self.ctx.router.open(project_id, ds_id)?;
            if let Some(latest) = store.get_latest()? {
                snapshots.push(SnapshotRef {
                    data_source_id: ds_id.clone(),
                    version_id: latest.id,
                    version: latest.version,
                });
            }
        }

        let point = RollbackPoint {
            id: entity_id("rp"),
            project_id: project_id.to_string(),
            point_type,
            status: RollbackPointStatus::Active,
            snapshots,
            captured_at: Utc::now(),
            expires_at: expires_in.map(|ttl| Utc::now() + ttl),
            metadata,
        };
        self.ctx.core.insert_rollback_point(&point)?;
        info!(
            point_id = %point.id,
            project_id,
            sources = point.snapshots.len(),
            "rollback point captured"
        );
        Ok(point)
    }

    /// Restore a point. With `dry_run`, walks the manifest and verifies
    /// every referenced version still exists without appending anything.
    pub fn restore(&self, point_id: &str, dry_run: bool) -> Result<RestoreReport> {
        let point = self.ctx.core.get_rollback_point(point_id)?;
        match point.status {
            RollbackPointStatus::Active => {}
            RollbackPointStatus::Expired => {
                return Err(DataForgeError::ExpiredRollbackPoint {
                    point_id: point_id.to_string(),
                })
            }
            RollbackPointStatus::Used => {
                return Err(DataForgeError::Conflict {
                    message: format!("rollback point {} was already used", point_id),
                })
            }
        }

        // Verify the whole manifest before touching anything.
        for snapshot in &point.snapshots {
            let store = self
                .ctx
                .router
                .open(&point.project_id, &snapshot.data_source_id)?;
            if !store.version_exists(&snapshot.version_id)? {
                self.ctx
                    .core
                    .set_rollback_point_status(point_id, RollbackPointStatus::Expired)?;
                return Err(DataForgeError::ExpiredRollbackPoint {
                    point_id: point_id.to_string(),
                });
            }
        }

        let mut actions = Vec::new();
        for snapshot in &point.snapshots {
            let source = self.ctx.core.get_data_source(&snapshot.data_source_id)?;
            let store = self
                .ctx
                .router
                .open(&point.project_id, &snapshot.data_source_id)?;
            let latest = store.get_latest()?;
            let already_current = latest
                .as_ref()
                .is_some_and(|latest| latest.id == snapshot.version_id);

            if dry_run || already_current {
                actions.push(RestoreAction {
                    data_source_id: snapshot.data_source_id.clone(),
                    restored_version: snapshot.version,
                    new_version: None,
                    noop: already_current,
                });
                continue;
            }

            let records = store.records_of_id(&snapshot.version_id)?;
            let new_version = store.append_version(
                &records,
                &source.identity,
                None,
                Some(json!({
                    "rollback_from": latest.as_ref().map(|v| v.id.clone()),
                    "rollback_to": snapshot.version_id,
                    "rollback_point": point.id,
                })),
            )?;
            actions.push(RestoreAction {
                data_source_id: snapshot.data_source_id.clone(),
                restored_version: snapshot.version,
                new_version: Some(new_version.version),
                noop: false,
            });
        }

        if !dry_run {
            self.ctx
                .core
                .set_rollback_point_status(point_id, RollbackPointStatus::Used)?;
            info!(point_id, restored = actions.len(), "rollback point restored");
        }
        Ok(RestoreReport {
            point_id: point_id.to_string(),
            dry_run,
            actions,
        })
    }

    /// Find and restore the pre-pipeline point of a failed execution.
    /// Sources the pipeline never wrote restore as no-ops.
    pub fn rollback_failed_pipeline(&self, execution_id: &str) -> Result<RestoreReport> {
        let points =
            self.ctx
                .core
                .list_rollback_points(None, Some(RollbackPointType::PrePipeline))?;
        let point = points
            .into_iter()
            .find(|point| point.execution_id() == Some(execution_id))
            .ok_or(DataForgeError::NotFound {
                entity: "rollback point",
                id: format!("execution {}", execution_id),
            })?;
        self.restore(&point.id, false)
    }

    /// Periodic sweep: expire points whose referenced versions are gone and
    /// points past their TTL.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for point in self.ctx.core.list_rollback_points(None, None)? {
            if point.status != RollbackPointStatus::Active {
                continue;
            }
            let past_ttl = point.expires_at.is_some_and(|at| at <= now);
            let mut missing_version = false;
            if !past_ttl {
                for snapshot in &point.snapshots {
                    let store = self
                        .ctx
                        .router
                        .open(&point.project_id, &snapshot.data_source_id);
                    match store.and_then(|s| s.version_exists(&snapshot.version_id)) {
                        Ok(true) => {}
                        Ok(false) => {
                            missing_version = true;
                            break;
                        }
                        Err(error) => {
                            warn!(point_id = %point.id, %error, "sweep could not check a snapshot");
                            missing_version = true;
                            break;
                        }
                    }
                }
            }
            if past_ttl || missing_version {
                self.ctx
                    .core
                    .set_rollback_point_status(&point.id, RollbackPointStatus::Expired)?;
                expired += 1;
            }
        }
        Ok(expired)
    }
}
