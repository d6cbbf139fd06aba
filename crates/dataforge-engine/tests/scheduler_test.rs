//! Scheduler behavior: the worker-pool cap, per-source serialization,
//! retry on retryable failures and cooperative cancellation.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use dataforge_core::models::{ExecutionStatus, JobKind, ProviderType};
use dataforge_engine::app::CreateDataSource;
use dataforge_engine::{AppSettings, DataForge};

fn slow_script_source(ms: u64) -> CreateDataSource {
    CreateDataSource::new(
        "slow",
        ProviderType::Script,
        json!({"source": format!("sleep_ms({}); [#{{\"id\": 1}}]", ms)}),
    )
}

async fn wait_for_terminal(forge: &DataForge, job_ids: &[String]) {
    for _ in 0..300 {
        let mut all_done = true;
        for job_id in job_ids {
            let executions = forge.job_executions(job_id, None).unwrap();
            if executions.is_empty() || executions.iter().any(|e| !e.status.is_terminal()) {
                all_done = false;
                break;
            }
        }
        if all_done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("executions did not finish in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_bounds_running_executions() {
    let dir = TempDir::new().unwrap();
    let mut settings = AppSettings::new(dir.path());
    settings.max_concurrent = 2;
    let forge = DataForge::open(settings).unwrap();
    let project = forge.create_project("p", None).unwrap();

    // Five jobs over five distinct sources: parallelism is limited only by
    // the cap.
    let mut job_ids = Vec::new();
    for i in 0..5 {
        let source = forge
            .create_data_source(&project.id, slow_script_source(300))
            .unwrap();
        let job = forge
            .create_job(
                &project.id,
                &format!("ingest-{}", i),
                JobKind::Ingest,
                &source.id,
                None,
            )
            .unwrap();
        job_ids.push(job.id);
    }
    for job_id in &job_ids {
        forge.run_job_now(job_id).unwrap();
    }

    // While work is in flight, never more than two executions are running.
    let mut saw_running = 0usize;
    for _ in 0..100 {
        let running = forge
            .list_jobs()
            .unwrap()
            .iter()
            .flat_map(|job| forge.job_executions(&job.id, None).unwrap())
            .filter(|e| e.status == ExecutionStatus::Running)
            .count();
        saw_running = saw_running.max(running);
        assert!(running <= 2, "cap violated: {} running", running);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    wait_for_terminal(&forge, &job_ids).await;
    assert!(saw_running >= 1);

    for job_id in &job_ids {
        let executions = forge.job_executions(job_id, None).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
    }
    forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_source_executions_serialize() {
    let dir = TempDir::new().unwrap();
    let mut settings = AppSettings::new(dir.path());
    settings.max_concurrent = 4;
    let forge = DataForge::open(settings).unwrap();
    let project = forge.create_project("p", None).unwrap();

    let source = forge
        .create_data_source(&project.id, slow_script_source(200))
        .unwrap();
    let job_a = forge
        .create_job(&project.id, "a", JobKind::Ingest, &source.id, None)
        .unwrap();
    let job_b = forge
        .create_job(&project.id, "b", JobKind::Ingest, &source.id, None)
        .unwrap();

    forge.run_job_now(&job_a.id).unwrap();
    forge.run_job_now(&job_b.id).unwrap();
    wait_for_terminal(&forge, &[job_a.id.clone(), job_b.id.clone()]).await;

    let a = &forge.job_executions(&job_a.id, None).unwrap()[0];
    let b = &forge.job_executions(&job_b.id, None).unwrap()[0];
    assert_eq!(a.status, ExecutionStatus::Completed);
    assert_eq!(b.status, ExecutionStatus::Completed);

    // Intervals must not overlap: one finished before the other started.
    let (first, second) = if a.started_at <= b.started_at {
        (a, b)
    } else {
        (b, a)
    };
    assert!(
        first.completed_at.unwrap() <= second.started_at.unwrap(),
        "same-source executions overlapped"
    );

    // Two sequential ingestions produced versions 1 and 2.
    let versions = forge.list_versions(&project.id, &source.id, None).unwrap();
    assert_eq!(versions.len(), 2);
    forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_failures_retry_then_fail() {
    let dir = TempDir::new().unwrap();
    let forge = DataForge::open(AppSettings::new(dir.path())).unwrap();
    let project = forge.create_project("p", None).unwrap();

    // Nothing listens on this port: connection refused, which is
    // classified retryable.
    let source = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new(
                "dead",
                ProviderType::Api,
                json!({"url": "http://127.0.0.1:1/never", "timeout_secs": 2}),
            ),
        )
        .unwrap();
    let mut job = forge
        .create_job(&project.id, "retrying", JobKind::Ingest, &source.id, None)
        .unwrap();
    job.retry_attempts = 2;
    job.retry_delay_ms = 20;
    forge.update_job(&job).unwrap();

    forge.run_job_now(&job.id).unwrap();
    wait_for_terminal(&forge, &[job.id.clone()]).await;

    let execution = &forge.job_executions(&job.id, None).unwrap()[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.stats.as_ref().unwrap().retries, 2);
    assert!(execution.error.is_some());
    forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cron_schedule_fires() {
    let dir = TempDir::new().unwrap();
    let forge = DataForge::open(AppSettings::new(dir.path())).unwrap();
    forge.start().await.unwrap();
    let project = forge.create_project("p", None).unwrap();
    let source = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new("ticker", ProviderType::Mock, json!({"rows": 1})),
        )
        .unwrap();
    let job = forge
        .create_job(
            &project.id,
            "every-second",
            JobKind::Ingest,
            &source.id,
            Some(dataforge_core::models::Schedule {
                // Six fields: fire every second.
                cron: "* * * * * *".to_string(),
                timezone: None,
            }),
        )
        .unwrap();

    let mut fired = false;
    for _ in 0..80 {
        if !forge.job_executions(&job.id, None).unwrap().is_empty() {
            fired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(fired, "cron never fired");
    forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_event_triggers_subscribed_job() {
    let dir = TempDir::new().unwrap();
    let forge = DataForge::open(AppSettings::new(dir.path())).unwrap();
    forge.start().await.unwrap();
    let project = forge.create_project("p", None).unwrap();

    let upstream = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new("upstream", ProviderType::Mock, json!({"rows": 1})),
        )
        .unwrap();
    let downstream = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new("downstream", ProviderType::Mock, json!({"rows": 2})),
        )
        .unwrap();

    let mut job = forge
        .create_job(&project.id, "follow", JobKind::Ingest, &downstream.id, None)
        .unwrap();
    job.trigger_on_source = Some(upstream.id.clone());
    forge.update_job(&job).unwrap();

    // A new version on the upstream source enqueues the follower job.
    forge.ingest_now(&project.id, &upstream.id).await.unwrap();

    let mut fired = false;
    for _ in 0..80 {
        if !forge.job_executions(&job.id, None).unwrap().is_empty() {
            fired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(fired, "event trigger never fired");
    wait_for_terminal(&forge, &[job.id.clone()]).await;
    assert_eq!(
        forge
            .list_versions(&project.id, &downstream.id, None)
            .unwrap()
            .len(),
        1
    );
    forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_is_cooperative() {
    let dir = TempDir::new().unwrap();
    let forge = DataForge::open(AppSettings::new(dir.path())).unwrap();
    let project = forge.create_project("p", None).unwrap();

    let source = forge
        .create_data_source(&project.id, slow_script_source(4_000))
        .unwrap();
    let job = forge
        .create_job(&project.id, "long", JobKind::Ingest, &source.id, None)
        .unwrap();
    let execution_id = forge.run_job_now(&job.id).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(forge.cancel_execution(execution_id));
    wait_for_terminal(&forge, &[job.id.clone()]).await;

    let execution = forge.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    // The store was left untouched.
    assert!(forge
        .list_versions(&project.id, &source.id, None)
        .unwrap()
        .is_empty());
    forge.shutdown().unwrap();
}
