//! Scheduler behaviour across the registry, trigger engine and dispatcher.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use runforge_core::config::EnvironmentsConfig;
use runforge_core::db::Database;
use runforge_core::environments::EnvironmentStore;
use runforge_core::jobs::{
    DispatchConfig, DispatchContext, Dispatcher, ExecutionStatus, ExecutionTrigger, FnHandler, HandlerRegistry,
    JobRegistry, JobScheduler, JobState, JobUpdate, LocalEngineProvider, NewJob, RunOutcome, ScheduleType,
    ScheduledJob, StopReport, TriggerKey,
};
use runforge_core::process::SystemRunner;
use runforge_core::ForgeError;
use serde_json::json;
use tokio::sync::Notify;

// ============================================================================
// Test Utilities
// ============================================================================

async fn scheduler(handlers: HandlerRegistry, dir: &Path) -> JobScheduler {
    let db = Database::connect_in_memory().await.unwrap();
    let runner = Arc::new(SystemRunner);
    let envs = Arc::new(EnvironmentStore::new(
        dir.join("providers"),
        EnvironmentsConfig::default(),
        runner.clone(),
    ));
    let dispatcher = Dispatcher::new(
        Arc::new(handlers),
        runner,
        envs,
        DispatchConfig {
            base_url: "http://127.0.0.1:1".into(),
            http_timeout: Duration::from_secs(2),
            default_python: "python3".into(),
            script_timeout: Duration::from_secs(10),
            scripts_dir: dir.to_path_buf(),
        },
    )
    .unwrap();
    let provider = Arc::new(LocalEngineProvider::new(true, dir, Duration::from_millis(50)));
    let scheduler = JobScheduler::new(JobRegistry::new(db), dispatcher, provider);
    scheduler.start().await.unwrap();
    scheduler
}

fn function_job(name: &str, function: &str) -> NewJob {
    let mut new = NewJob::named(name);
    new.function_name = Some(function.into());
    new
}

/// Poll until the job has no execution in flight.
async fn wait_until_idle(s: &JobScheduler, job_id: i64) -> ScheduledJob {
    for _ in 0..200 {
        let job = s.get_job(job_id).await.unwrap();
        if !job.is_running && job.last_status.is_some() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} never finished", job_id);
}

// ============================================================================
// Manual Runs
// ============================================================================

#[tokio::test]
async fn test_manual_run_records_success() {
    let dir = tempfile::tempdir().unwrap();
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "echo",
        Arc::new(FnHandler(|ctx: DispatchContext| async move {
            Ok(json!({ "greeting": ctx.param::<String>("who").unwrap_or_default() }))
        })),
    );
    let s = scheduler(handlers, dir.path()).await;

    let mut new = function_job("echo", "echo");
    new.parameters = json!({ "who": "world" });
    let job = s.create_job(new).await.unwrap();
    assert!(job.next_run_at.is_none());

    let RunOutcome::Started { execution_id } = s.run_job_now(job.id).await.unwrap() else {
        panic!("expected the run to start");
    };

    let stored = wait_until_idle(&s, job.id).await;
    assert_eq!(stored.run_count, 1);
    assert_eq!(stored.success_count, 1);
    assert_eq!(stored.last_status, Some(ExecutionStatus::Success));
    assert_eq!(stored.last_result, Some(json!({ "greeting": "world" })));

    let exec = s.get_execution(execution_id).await.unwrap();
    assert_eq!(exec.trigger, ExecutionTrigger::Manual);
    assert_eq!(exec.job_name, "echo");
    assert!(exec.completed_at.is_some());
}

#[tokio::test]
async fn test_second_run_conflicts_while_first_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let release = Arc::new(Notify::new());
    let mut handlers = HandlerRegistry::new();
    let gate = release.clone();
    handlers.register(
        "blocking",
        Arc::new(FnHandler(move |_ctx: DispatchContext| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(json!(null))
            }
        })),
    );
    let s = scheduler(handlers, dir.path()).await;
    let job = s.create_job(function_job("slow", "blocking")).await.unwrap();

    let first = s.run_job_now(job.id).await.unwrap();
    let RunOutcome::Started { execution_id } = first else {
        panic!("expected the first run to start");
    };

    let second = s.run_job_now(job.id).await.unwrap();
    assert_eq!(
        second,
        RunOutcome::Conflict {
            execution_id: Some(execution_id)
        }
    );

    let status = s.get_job_status(job.id).await.unwrap();
    assert_eq!(status.state, JobState::Running);
    assert_eq!(status.current_execution.map(|e| e.id), Some(execution_id));

    release.notify_one();
    let stored = wait_until_idle(&s, job.id).await;
    assert_eq!(stored.run_count, 1);
    assert_eq!(s.list_executions(job.id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let s = scheduler(HandlerRegistry::new(), dir.path()).await;

    let err = s.run_job_now(4242).await.unwrap_err();
    assert_eq!(err.code(), runforge_core::ErrorCode::JobNotFound);
}

// ============================================================================
// Schedule Changes
// ============================================================================

#[tokio::test]
async fn test_interval_to_manual_and_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut handlers = HandlerRegistry::new();
    handlers.register("noop", Arc::new(FnHandler(|_ctx: DispatchContext| async { Ok(json!(null)) })));
    let s = scheduler(handlers, dir.path()).await;

    let mut new = function_job("ticker", "noop");
    new.schedule_type = ScheduleType::Interval;
    new.schedule_config = json!({ "interval_seconds": 3600 });
    let job = s.create_job(new).await.unwrap();
    assert!(job.next_run_at.is_some());
    assert!(s.registered_triggers().iter().any(|t| t.key == TriggerKey::Job(job.id)));

    let manual = s
        .update_job(
            job.id,
            JobUpdate {
                schedule_type: Some(ScheduleType::Manual),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(manual.next_run_at.is_none());
    assert!(s.registered_triggers().is_empty());
    assert_eq!(s.get_job_status(job.id).await.unwrap().state, JobState::Unscheduled);

    let back = s
        .update_job(
            job.id,
            JobUpdate {
                schedule_type: Some(ScheduleType::Interval),
                schedule_config: Some(json!({ "interval_seconds": 120 })),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let next = back.next_run_at.unwrap();
    assert!(next > Utc::now());
    assert!(next <= Utc::now() + chrono::Duration::seconds(121));
    assert_eq!(s.get_job_status(job.id).await.unwrap().state, JobState::Scheduled);
}

#[tokio::test]
async fn test_cron_job_next_run_matches_expression() {
    let dir = tempfile::tempdir().unwrap();
    let mut handlers = HandlerRegistry::new();
    handlers.register("noop", Arc::new(FnHandler(|_ctx: DispatchContext| async { Ok(json!(null)) })));
    let s = scheduler(handlers, dir.path()).await;

    let mut new = function_job("every-five", "noop");
    new.schedule_type = ScheduleType::Cron;
    new.schedule_config = json!({ "cron_expression": "*/5 * * * *" });
    let job = s.create_job(new).await.unwrap();

    let next = job.next_run_at.unwrap();
    assert_eq!(next.minute() % 5, 0);
    assert_eq!(next.second(), 0);
    assert!(next > Utc::now());
}

#[tokio::test]
async fn test_invalid_schedule_is_rejected_before_registration() {
    let dir = tempfile::tempdir().unwrap();
    let s = scheduler(HandlerRegistry::new(), dir.path()).await;

    let mut new = NewJob::named("bad");
    new.api_endpoint = Some("/api/health".into());
    new.schedule_type = ScheduleType::Cron;
    new.schedule_config = json!({ "cron_expression": "61 * * * *" });
    assert!(s.create_job(new).await.is_err());

    assert!(s.list_jobs(&Default::default()).await.unwrap().is_empty());
    assert!(s.registered_triggers().is_empty());
}

#[tokio::test]
async fn test_pausing_a_job_unregisters_it() {
    let dir = tempfile::tempdir().unwrap();
    let s = scheduler(HandlerRegistry::new(), dir.path()).await;

    let mut new = NewJob::named("poller");
    new.api_endpoint = Some("/api/health".into());
    new.schedule_type = ScheduleType::Interval;
    new.schedule_config = json!({ "interval_seconds": 60 });
    let job = s.create_job(new).await.unwrap();

    let paused = s
        .update_job(
            job.id,
            JobUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!paused.is_active);
    assert!(paused.next_run_at.is_none());
    assert!(s.registered_triggers().is_empty());
}

// ============================================================================
// Stop
// ============================================================================

#[tokio::test]
async fn test_stop_cancels_running_execution() {
    let dir = tempfile::tempdir().unwrap();
    let observed = Arc::new(AtomicBool::new(false));
    let seen = observed.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "wait_for_stop",
        Arc::new(FnHandler(move |mut ctx: DispatchContext| {
            let seen = seen.clone();
            async move {
                ctx.cancelled().await;
                seen.store(true, Ordering::SeqCst);
                Ok(json!("late result"))
            }
        })),
    );
    let s = scheduler(handlers, dir.path()).await;
    let job = s.create_job(function_job("stoppable", "wait_for_stop")).await.unwrap();

    let RunOutcome::Started { execution_id } = s.run_job_now(job.id).await.unwrap() else {
        panic!("expected the run to start");
    };

    let report = s.stop_job(job.id).await.unwrap();
    assert_eq!(report, StopReport::Stopped { execution_id });

    for _ in 0..100 {
        if observed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(observed.load(Ordering::SeqCst));

    // Give the late result a chance to be (not) recorded.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let exec = s.get_execution(execution_id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert!(exec.result.is_none());

    let stored = s.get_job(job.id).await.unwrap();
    assert!(!stored.is_running);
    assert_eq!(stored.success_count, 0);

    assert_eq!(s.stop_job(job.id).await.unwrap(), StopReport::NotRunning);
}

#[tokio::test]
async fn test_stopped_run_finishing_late_keeps_next_run_stoppable() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let second_cancelled = Arc::new(AtomicBool::new(false));
    let (counter, seen) = (calls.clone(), second_cancelled.clone());
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "stubborn_then_polite",
        Arc::new(FnHandler(move |mut ctx: DispatchContext| {
            let (counter, seen) = (counter.clone(), seen.clone());
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    // ignores cancellation
                    tokio::time::sleep(Duration::from_millis(300)).await;
                } else {
                    ctx.cancelled().await;
                    seen.store(true, Ordering::SeqCst);
                }
                Ok(json!("done"))
            }
        })),
    );
    let s = scheduler(handlers, dir.path()).await;
    let job = s.create_job(function_job("rerun", "stubborn_then_polite")).await.unwrap();

    let RunOutcome::Started { execution_id: first } = s.run_job_now(job.id).await.unwrap() else {
        panic!("expected the first run to start");
    };
    assert_eq!(s.stop_job(job.id).await.unwrap(), StopReport::Stopped { execution_id: first });

    let RunOutcome::Started { execution_id: second } = s.run_job_now(job.id).await.unwrap() else {
        panic!("expected the second run to start");
    };
    assert_ne!(first, second);

    // The first handler returns while the second run is still in flight.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!second_cancelled.load(Ordering::SeqCst));

    assert_eq!(s.stop_job(job.id).await.unwrap(), StopReport::Stopped { execution_id: second });
    for _ in 0..100 {
        if second_cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(second_cancelled.load(Ordering::SeqCst));
    assert_eq!(s.get_execution(first).await.unwrap().status, ExecutionStatus::Cancelled);
    assert_eq!(s.get_execution(second).await.unwrap().status, ExecutionStatus::Cancelled);
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn test_failed_run_is_retried_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "flaky",
        Arc::new(FnHandler(move |_ctx: DispatchContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ForgeError::dispatch_failed("first attempt fails"))
                } else {
                    Ok(json!("recovered"))
                }
            }
        })),
    );
    let s = scheduler(handlers, dir.path()).await;

    let mut new = function_job("flaky", "flaky");
    new.retry_enabled = true;
    new.max_retries = 3;
    new.retry_delay_seconds = 1;
    let job = s.create_job(new).await.unwrap();

    let first = s.execute_job(job.id, ExecutionTrigger::Manual).await.unwrap().unwrap();
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert!(s.registered_triggers().iter().any(|t| t.key == TriggerKey::Retry(job.id)));

    let mut stored = s.get_job(job.id).await.unwrap();
    for _ in 0..100 {
        if stored.success_count == 1 && !stored.is_running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        stored = s.get_job(job.id).await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(stored.failure_count, 1);
    assert_eq!(stored.success_count, 1);
    assert_eq!(stored.retry_attempt, 0);
    assert!(stored.retry_at.is_none());

    let executions = s.list_executions(job.id, None).await.unwrap();
    assert_eq!(executions.len(), 2);
    let retry = executions.iter().find(|e| e.trigger == ExecutionTrigger::Retry).unwrap();
    assert_eq!(retry.attempt, 1);
    assert_eq!(retry.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_delete_keep_history_preserves_executions() {
    let dir = tempfile::tempdir().unwrap();
    let mut handlers = HandlerRegistry::new();
    handlers.register("noop", Arc::new(FnHandler(|_ctx: DispatchContext| async { Ok(json!(null)) })));
    let s = scheduler(handlers, dir.path()).await;

    let job = s.create_job(function_job("once-off", "noop")).await.unwrap();
    let exec = s.execute_job(job.id, ExecutionTrigger::Manual).await.unwrap().unwrap();

    s.delete_job(job.id, true).await.unwrap();
    assert!(s.get_job(job.id).await.is_err());
    assert_eq!(s.get_execution(exec.id).await.unwrap().job_name, "once-off");
}
