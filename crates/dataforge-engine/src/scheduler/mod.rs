//! # Scheduler
//!
//! Time-, event- and manually-triggered invocation of ingestions,
//! pipelines and bulk operations.
//!
//! - A worker pool capped by `max_concurrent` (semaphore); each worker
//!   runs one execution at a time.
//! - Jobs targeting the same data source serialize through fair per-key
//!   async locks, so their executions are never observably concurrent;
//!   disjoint targets run in parallel up to the cap.
//! - Cron triggers are timezone-aware (croner + chrono-tz). A tick that
//!   finds the job's previous execution still active emits `job.missed`
//!   and skips; otherwise the job is enqueued and `job.scheduled` fires.
//! - Failures with a retryable code (timeouts, rate limits, transient
//!   connection errors) requeue with exponential backoff starting at the
//!   job's `retry_delay_ms`, doubling per attempt and capped at
//!   `max_retry_delay_ms`, up to `retry_attempts` times.
//! - Cancellation is cooperative: `cancel(execution_id)` fires the
//!   execution's token, which the engines check at their boundaries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::parser::{CronParser, Seconds};
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dataforge_core::models::{
    EngineEvent, EventType, Execution, ExecutionStats, ExecutionStatus, Job, JobKind,
    PipelineRunStatus,
};
use dataforge_core::{DataForgeError, Result};

use crate::bulk::BulkOps;
use crate::events::EngineContext;
use crate::ingest::IngestionEngine;
use crate::pipeline::PipelineEngine;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_retry_delay_ms: u64,
    pub default_timezone: Tz,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent: 4,
            max_retry_delay_ms: 60_000,
            default_timezone: chrono_tz::UTC,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: EngineContext,
    ingestion: Arc<IngestionEngine>,
    pipelines: Arc<PipelineEngine>,
    bulk: Arc<BulkOps>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    source_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    running: StdMutex<HashMap<Uuid, CancellationToken>>,
    last_fire: StdMutex<HashMap<String, DateTime<Utc>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        ctx: EngineContext,
        ingestion: Arc<IngestionEngine>,
        pipelines: Arc<PipelineEngine>,
        bulk: Arc<BulkOps>,
        config: SchedulerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Scheduler {
            inner: Arc::new(Inner {
                ctx,
                ingestion,
                pipelines,
                bulk,
                config,
                semaphore,
                source_locks: StdMutex::new(HashMap::new()),
                running: StdMutex::new(HashMap::new()),
                last_fire: StdMutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Enqueue a job immediately. Returns the execution id.
    pub fn run_now(&self, job_id: &str) -> Result<Uuid> {
        self.inner.clone().enqueue(job_id)
    }

    /// Cooperatively cancel an execution. Returns false when it is not
    /// queued or running.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match running.get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Count of executions currently holding a worker slot.
    pub fn active_executions(&self) -> usize {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// React to engine events: jobs subscribed to a source are enqueued
    /// when that source receives a new version.
    pub fn handle_event(&self, event: &EngineEvent) {
        if event.event_type != EventType::IngestSuccess {
            return;
        }
        let Some(source_id) = &event.data_source_id else {
            return;
        };
        let jobs = match self.inner.ctx.core.list_enabled_jobs() {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(%error, "could not list jobs for event trigger");
                return;
            }
        };
        for job in jobs {
            if job.trigger_on_source.as_deref() != Some(source_id.as_str()) {
                continue;
            }
            // A job must not retrigger itself through its own writes.
            if job.kind == JobKind::Ingest && job.target_id == *source_id {
                continue;
            }
            match self.run_now(&job.id) {
                Ok(execution_id) => {
                    self.inner.emit_job_event(EventType::JobScheduled, &job, Some(execution_id));
                    info!(job_id = %job.id, source_id, "event-triggered job enqueued");
                }
                Err(error) => warn!(job_id = %job.id, %error, "event trigger failed"),
            }
        }
    }

    /// Start the cron loop. Returns the task handle; the loop stops on
    /// [`Scheduler::shutdown`].
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!(
                max_concurrent = inner.config.max_concurrent,
                poll_ms = inner.config.poll_interval.as_millis() as u64,
                "scheduler started"
            );
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(inner.config.poll_interval) => {}
                }
                inner.clone().tick(Utc::now());
            }
            info!("scheduler stopped");
        })
    }

    /// Stop the cron loop and cancel every active execution.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        for token in running.values() {
            token.cancel();
        }
    }
}

impl Inner {
    fn enqueue(self: Arc<Self>, job_id: &str) -> Result<Uuid> {
        let job = self.ctx.core.get_job(job_id)?;
        let execution = Execution {
            id: Uuid::new_v4(),
            job_id: job.id.clone(),
            status: ExecutionStatus::Queued,
            started_at: None,
            completed_at: None,
            error: None,
            stats: None,
            created_at: Utc::now(),
        };
        self.ctx.core.insert_execution(&execution)?;

        let token = self.shutdown.child_token();
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(execution.id, token.clone());

        let inner = self.clone();
        let execution_id = execution.id;
        tokio::spawn(async move {
            inner.execute(job, execution_id, token).await;
        });
        debug!(job_id, execution_id = %execution_id, "execution queued");
        Ok(execution_id)
    }

    fn tick(self: Arc<Self>, now: DateTime<Utc>) {
        let jobs = match self.ctx.core.list_enabled_jobs() {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(%error, "scheduler tick could not list jobs");
                return;
            }
        };
        for job in jobs {
            let Some(schedule) = job.schedule.clone() else {
                continue;
            };
            let timezone: Tz = schedule
                .timezone
                .as_deref()
                .and_then(|name| name.parse().ok())
                .unwrap_or(self.config.default_timezone);
            let cron = match CronParser::builder()
                .seconds(Seconds::Optional)
                .build()
                .parse(&schedule.cron)
            {
                Ok(cron) => cron,
                Err(error) => {
                    warn!(job_id = %job.id, %error, "invalid cron expression");
                    continue;
                }
            };

            // First sighting: anchor at now so past occurrences never fire.
            let anchor = {
                let mut last_fire = self.last_fire.lock().unwrap_or_else(|p| p.into_inner());
                *last_fire.entry(job.id.clone()).or_insert(now)
            };

            let next = match cron.find_next_occurrence(&anchor.with_timezone(&timezone), false) {
                Ok(next) => next,
                Err(error) => {
                    debug!(job_id = %job.id, %error, "no next cron occurrence");
                    continue;
                }
            };
            if next > now.with_timezone(&timezone) {
                continue;
            }

            {
                let mut last_fire = self.last_fire.lock().unwrap_or_else(|p| p.into_inner());
                last_fire.insert(job.id.clone(), next.with_timezone(&Utc));
            }

            if self.job_is_active(&job.id) {
                self.emit_job_event(EventType::JobMissed, &job, None);
                info!(job_id = %job.id, "cron tick skipped: previous execution still active");
                continue;
            }

            match self.clone().enqueue(&job.id) {
                Ok(execution_id) => {
                    self.emit_job_event(EventType::JobScheduled, &job, Some(execution_id));
                }
                Err(error) => error!(job_id = %job.id, %error, "cron enqueue failed"),
            }
        }
    }

    fn job_is_active(&self, job_id: &str) -> bool {
        for status in [ExecutionStatus::Queued, ExecutionStatus::Running] {
            if let Ok(executions) = self.ctx.core.executions_by_status(status) {
                if executions.iter().any(|e| e.job_id == job_id) {
                    return true;
                }
            }
        }
        false
    }

    fn emit_job_event(&self, event_type: EventType, job: &Job, execution_id: Option<Uuid>) {
        let mut event = EngineEvent::new(event_type)
            .with_project(job.project_id.clone())
            .with_job(job.id.clone())
            .with_payload(json!({"name": job.name, "kind": job.kind}));
        if let Some(execution_id) = execution_id {
            event = event.with_execution(execution_id.to_string());
        }
        if job.kind == JobKind::Ingest {
            event = event.with_data_source(job.target_id.clone());
        }
        self.ctx.emit(event);
    }

    fn source_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.source_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn execute(self: Arc<Self>, job: Job, execution_id: Uuid, token: CancellationToken) {
        // Worker slot first, then the per-target lock; both queues are
        // fair, so per-source FIFO ordering follows spawn order.
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let lock = self.source_lock(&serialization_key(&job));
        let _guard = lock.lock_owned().await;

        if token.is_cancelled() {
            self.finalize(execution_id, ExecutionStatus::Cancelled, None, None)
                .await;
            drop(permit);
            return;
        }

        self.mark_running(execution_id).await;

        let mut attempt: u32 = 0;
        let outcome = loop {
            let result = self.dispatch(&job, execution_id, &token).await;
            match result {
                Ok(stats) => break Ok(stats),
                Err(DataForgeError::Cancelled) => break Err(DataForgeError::Cancelled),
                Err(error) if error.is_retryable() && attempt < job.retry_attempts => {
                    attempt += 1;
                    let delay = backoff_delay(
                        job.retry_delay_ms,
                        attempt,
                        self.config.max_retry_delay_ms,
                    );
                    warn!(
                        job_id = %job.id,
                        execution_id = %execution_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying after retryable failure"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break Err(DataForgeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => break Err(error),
            }
        };

        match outcome {
            Ok(mut stats) => {
                stats.retries = attempt;
                self.finalize(execution_id, ExecutionStatus::Completed, None, Some(stats))
                    .await;
            }
            Err(DataForgeError::Cancelled) => {
                self.finalize(execution_id, ExecutionStatus::Cancelled, None, None)
                    .await;
            }
            Err(error) => {
                self.finalize(
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(error.to_string()),
                    Some(ExecutionStats {
                        retries: attempt,
                        ..Default::default()
                    }),
                )
                .await;
            }
        }

        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&execution_id);
        drop(permit);
    }

    async fn dispatch(
        &self,
        job: &Job,
        execution_id: Uuid,
        token: &CancellationToken,
    ) -> Result<ExecutionStats> {
        match job.kind {
            JobKind::Ingest => {
                let outcome = self
                    .ingestion
                    .ingest(&job.project_id, &job.target_id, token)
                    .await?;
                Ok(ExecutionStats {
                    records_processed: outcome.records_processed as i64,
                    version_created: Some(outcome.version.version),
                    duration_ms: outcome.duration_ms,
                    retries: 0,
                })
            }
            JobKind::Pipeline => {
                let report = self
                    .pipelines
                    .execute(&job.target_id, Some(&execution_id.to_string()), token)
                    .await?;
                match report.status {
                    PipelineRunStatus::Failed => Err(DataForgeError::ProcessingError {
                        message: format!("pipeline {} failed", job.target_id),
                    }),
                    PipelineRunStatus::Cancelled => Err(DataForgeError::Cancelled),
                    PipelineRunStatus::Success | PipelineRunStatus::Partial => {
                        let rows: i64 =
                            report.node_results.iter().map(|r| r.rows_processed).sum();
                        Ok(ExecutionStats {
                            records_processed: rows,
                            version_created: None,
                            duration_ms: report.duration_ms,
                            retries: 0,
                        })
                    }
                }
            }
            JobKind::Bulk => {
                let operation = self.bulk.run_registered(&job.target_id, token).await?;
                Ok(ExecutionStats {
                    records_processed: operation.progress.completed as i64,
                    version_created: None,
                    duration_ms: 0,
                    retries: 0,
                })
            }
        }
    }

    async fn mark_running(&self, execution_id: Uuid) {
        if let Err(error) = self.update_execution(execution_id, |execution| {
            execution.status = ExecutionStatus::Running;
            execution.started_at = Some(Utc::now());
        }) {
            warn!(execution_id = %execution_id, %error, "could not mark execution running");
        }
    }

    async fn finalize(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
        stats: Option<ExecutionStats>,
    ) {
        if let Err(update_error) = self.update_execution(execution_id, |execution| {
            execution.status = status;
            execution.completed_at = Some(Utc::now());
            execution.error = error.clone();
            if stats.is_some() {
                execution.stats = stats.clone();
            }
        }) {
            warn!(execution_id = %execution_id, %update_error, "could not finalize execution");
        }
    }

    fn update_execution(
        &self,
        execution_id: Uuid,
        mutate: impl FnOnce(&mut Execution),
    ) -> Result<()> {
        let mut execution = self.ctx.core.get_execution(&execution_id.to_string())?;
        mutate(&mut execution);
        self.ctx.core.update_execution(&execution)
    }
}

fn serialization_key(job: &Job) -> String {
    match job.kind {
        JobKind::Ingest => format!("ds:{}", job.target_id),
        JobKind::Pipeline => format!("pl:{}", job.target_id),
        JobKind::Bulk => format!("bulk:{}", job.target_id),
    }
}

fn backoff_delay(base_ms: u64, attempt: u32, cap_ms: u64) -> Duration {
    let factor = 1u64 << attempt.min(16).saturating_sub(1);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}
