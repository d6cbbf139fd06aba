//! # Bulk Operation Engine
//!
//! Bounded-concurrency execution of one operation over a batch of entity
//! ids: entities run in chunks of `max_concurrent`, progress updates
//! after every chunk, per-entity failures either stop the run (after the
//! in-flight chunk drains) or are recorded and skipped under
//! `continue_on_error`. `dry_run` records would-do results without
//! mutating anything. A running operation cannot be re-executed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dataforge_core::models::entity_id;
use dataforge_core::{DataForgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkEntityType {
    DataSource,
    Pipeline,
    Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Delete,
    Enable,
    Disable,
    Run,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOptions {
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_continue_on_error() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    5
}

impl Default for BulkOptions {
    fn default() -> Self {
        BulkOptions {
            continue_on_error: true,
            max_concurrent: 5,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRequest {
    pub name: String,
    pub entity_type: BulkEntityType,
    pub action: BulkAction,
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub options: BulkOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl BulkStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BulkStatus::Pending | BulkStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BulkProgress {
    pub total: usize,
    pub completed: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkEntityResult {
    pub entity_id: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOperation {
    pub id: String,
    pub request: BulkRequest,
    pub status: BulkStatus,
    pub progress: BulkProgress,
    pub results: Vec<BulkEntityResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Applies one action to one entity. Implemented by the application root,
/// which owns the stores and engines.
#[async_trait]
pub trait BulkExecutor: Send + Sync {
    async fn apply(
        &self,
        entity_type: BulkEntityType,
        action: BulkAction,
        entity_id: &str,
        dry_run: bool,
    ) -> Result<String>;
}

pub struct BulkOps {
    executor: Arc<dyn BulkExecutor>,
    operations: Mutex<HashMap<String, BulkOperation>>,
}

impl BulkOps {
    pub fn new(executor: Arc<dyn BulkExecutor>) -> Self {
        BulkOps {
            executor,
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Register an operation without running it (scheduled bulk jobs
    /// reference it by id).
    pub fn register(&self, request: BulkRequest) -> BulkOperation {
        let operation = BulkOperation {
            id: entity_id("bulk"),
            progress: BulkProgress {
                total: request.entity_ids.len(),
                completed: 0,
                percentage: 0.0,
            },
            request,
            status: BulkStatus::Pending,
            results: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.lock().insert(operation.id.clone(), operation.clone());
        operation
    }

    pub fn get(&self, operation_id: &str) -> Option<BulkOperation> {
        self.lock().get(operation_id).cloned()
    }

    pub fn list(&self) -> Vec<BulkOperation> {
        let mut operations: Vec<BulkOperation> = self.lock().values().cloned().collect();
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        operations
    }

    /// Drop operations in terminal states.
    pub fn clear_completed(&self) -> usize {
        let mut operations = self.lock();
        let before = operations.len();
        operations.retain(|_, op| !op.status.is_terminal());
        before - operations.len()
    }

    /// Register and immediately run.
    pub async fn execute(
        &self,
        request: BulkRequest,
        cancel: &CancellationToken,
    ) -> Result<BulkOperation> {
        let operation = self.register(request);
        self.run_registered(&operation.id, cancel).await
    }

    /// Run a registered operation. Re-execution while `running` is a
    /// conflict; terminal operations can be re-run (e.g. scheduled bulk
    /// jobs), restarting from scratch.
    pub async fn run_registered(
        &self,
        operation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BulkOperation> {
        let request = {
            let mut operations = self.lock();
            let operation =
                operations
                    .get_mut(operation_id)
                    .ok_or(DataForgeError::NotFound {
                        entity: "bulk operation",
                        id: operation_id.to_string(),
                    })?;
            if operation.status == BulkStatus::Running {
                return Err(DataForgeError::Conflict {
                    message: format!("bulk operation {} is already running", operation_id),
                });
            }
            operation.status = BulkStatus::Running;
            operation.results.clear();
            operation.progress.completed = 0;
            operation.progress.percentage = 0.0;
            operation.completed_at = None;
            operation.request.clone()
        };

        info!(
            operation_id,
            entities = request.entity_ids.len(),
            dry_run = request.options.dry_run,
            "bulk operation started"
        );

        let chunk_size = request.options.max_concurrent.max(1);
        let mut failed = false;
        let mut cancelled = false;

        'chunks: for chunk in request.entity_ids.chunks(chunk_size) {
            if cancel.is_cancelled() {
                cancelled = true;
                break 'chunks;
            }
            let futures = chunk.iter().map(|id| {
                let executor = self.executor.clone();
                let request = &request;
                async move {
                    let outcome = executor
                        .apply(
                            request.entity_type,
                            request.action,
                            id,
                            request.options.dry_run,
                        )
                        .await;
                    (id.clone(), outcome)
                }
            });
            let outcomes = join_all(futures).await;

            let mut chunk_failed = false;
            {
                let mut operations = self.lock();
                if let Some(operation) = operations.get_mut(operation_id) {
                    for (entity_id, outcome) in outcomes {
                        let result = match outcome {
                            Ok(message) => BulkEntityResult {
                                entity_id,
                                success: true,
                                message,
                            },
                            Err(error) => {
                                chunk_failed = true;
                                BulkEntityResult {
                                    entity_id,
                                    success: false,
                                    message: error.to_string(),
                                }
                            }
                        };
                        operation.results.push(result);
                        operation.progress.completed += 1;
                    }
                    operation.progress.percentage = if operation.progress.total == 0 {
                        100.0
                    } else {
                        operation.progress.completed as f64 * 100.0
                            / operation.progress.total as f64
                    };
                }
            }
            if chunk_failed && !request.options.continue_on_error {
                failed = true;
                break 'chunks;
            }
        }

        let mut operations = self.lock();
        let operation = operations
            .get_mut(operation_id)
            .ok_or(DataForgeError::NotFound {
                entity: "bulk operation",
                id: operation_id.to_string(),
            })?;
        let any_failure = operation.results.iter().any(|r| !r.success);
        operation.status = if cancelled {
            BulkStatus::Cancelled
        } else if failed {
            BulkStatus::Failed
        } else if any_failure {
            BulkStatus::Partial
        } else {
            BulkStatus::Completed
        };
        operation.completed_at = Some(Utc::now());
        if any_failure {
            warn!(
                operation_id,
                failures = operation.results.iter().filter(|r| !r.success).count(),
                "bulk operation finished with failures"
            );
        }
        Ok(operation.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BulkOperation>> {
        self.operations.lock().unwrap_or_else(|p| p.into_inner())
    }
}
