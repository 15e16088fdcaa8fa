//! Job scheduler: binds registry entries to the trigger engine, runs
//! executions and applies retry policy.
//!
//! Per job the state is `unscheduled` (manual, inactive, or no engine),
//! `scheduled` (armed with a next fire time) or `running`. A fire or manual
//! run first claims the job in the database; only the claimant executes.
//! Cancellation is cooperative: `stop_job` records the stop and signals
//! the handler, but never kills in-flight work.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatch::{DispatchContext, Dispatcher};
use super::model::{
    ExecutionId, ExecutionTrigger, JobExecution, JobFilter, JobId, JobUpdate, NewJob, ScheduledJob,
};
use super::registry::JobRegistry;
use super::retry::{RetryDecision, RetryPolicy};
use super::schedule::ScheduleSpec;
use super::trigger::{RegisteredTrigger, TriggerEngine, TriggerEngineProvider, TriggerFired, TriggerKey};
use crate::db::{BeginOutcome, CompletedRun, StopOutcome};
use crate::error::{ForgeError, Result};
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Observable scheduler availability.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// A trigger engine is connected
    pub available: bool,
    /// The connected engine is running
    pub running: bool,
    pub job_count: i64,
    pub scheduled_count: usize,
    pub engine: String,
    /// Why the engine is unavailable, in registry-only mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Unscheduled,
    Scheduled,
    Running,
}

/// Result of `get_job_status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    pub job: ScheduledJob,
    pub state: JobState,
    pub scheduled: bool,
    pub next_run_time: Option<DateTime<Utc>>,
    pub pending_retry_at: Option<DateTime<Utc>>,
    pub current_execution: Option<JobExecution>,
}

/// Result of asking for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Started { execution_id: ExecutionId },
    /// A run is already in flight
    Conflict { execution_id: Option<ExecutionId> },
}

/// Result of `stop_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopReport {
    Stopped { execution_id: ExecutionId },
    NotRunning,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

struct EngineState {
    engine: Arc<dyn TriggerEngine>,
    listener: JoinHandle<()>,
}

struct SchedulerInner {
    registry: JobRegistry,
    dispatcher: Dispatcher,
    provider: Arc<dyn TriggerEngineProvider>,
    engine: RwLock<Option<EngineState>>,
    unavailable_reason: RwLock<Option<String>>,
    /// Cancel signal of the execution currently running for each job.
    cancels: DashMap<JobId, (ExecutionId, watch::Sender<bool>)>,
}

/// The job scheduler. Cheap to clone.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("available", &self.engine().is_some())
            .finish()
    }
}

impl JobScheduler {
    pub fn new(registry: JobRegistry, dispatcher: Dispatcher, provider: Arc<dyn TriggerEngineProvider>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                dispatcher,
                provider,
                engine: RwLock::new(None),
                unavailable_reason: RwLock::new(None),
                cancels: DashMap::new(),
            }),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    fn engine(&self) -> Option<Arc<dyn TriggerEngine>> {
        self.inner.engine.read().as_ref().map(|s| s.engine.clone())
    }

    fn has_kind_handler(&self, job: &ScheduledJob) -> bool {
        self.inner.dispatcher.handlers().for_job(job).is_some()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Release runs interrupted by a previous process, then connect the
    /// trigger engine and register every active job.
    pub async fn start(&self) -> Result<SchedulerStatus> {
        let stale = self.inner.registry.reset_stale_running().await?;
        if stale > 0 {
            warn!(count = stale, "Cancelled executions left running by a previous process");
        }
        self.connect_engine().await?;
        self.get_scheduler_status().await
    }

    /// Re-probe for the trigger engine. If it is (now) available, every
    /// active job is registered again from the registry.
    pub async fn reinitialize(&self) -> Result<SchedulerStatus> {
        if let Some(engine) = self.engine() {
            if engine.is_running() {
                info!("Re-registering all jobs with the running trigger engine");
                for trigger in engine.registered() {
                    engine.disarm(trigger.key);
                }
                self.register_all(&engine).await?;
                return self.get_scheduler_status().await;
            }
            self.detach_engine();
        }
        self.connect_engine().await?;
        self.get_scheduler_status().await
    }

    pub fn shutdown(&self) {
        self.detach_engine();
        for entry in self.inner.cancels.iter() {
            let _ = entry.value().1.send(true);
        }
        info!("Job scheduler stopped");
    }

    async fn connect_engine(&self) -> Result<()> {
        match self.inner.provider.connect() {
            Ok(conn) => {
                let listener = tokio::spawn(listen(Arc::downgrade(&self.inner), conn.fired));
                let engine = conn.engine;
                *self.inner.engine.write() = Some(EngineState {
                    engine: engine.clone(),
                    listener,
                });
                *self.inner.unavailable_reason.write() = None;
                info!(engine = engine.name(), "Trigger engine connected");
                self.register_all(&engine).await
            }
            Err(reason) => {
                warn!(
                    engine = self.inner.provider.name(),
                    %reason,
                    "Trigger engine unavailable; scheduler running in registry-only mode"
                );
                *self.inner.unavailable_reason.write() = Some(reason);
                Ok(())
            }
        }
    }

    fn detach_engine(&self) {
        if let Some(state) = self.inner.engine.write().take() {
            state.engine.shutdown();
            state.listener.abort();
        }
    }

    async fn register_all(&self, engine: &Arc<dyn TriggerEngine>) -> Result<()> {
        let jobs = self
            .inner
            .registry
            .list(&JobFilter { is_active: Some(true), ..Default::default() })
            .await?;

        let mut armed = 0usize;
        for job in &jobs {
            match self.register(engine, job).await {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = job.id, error = %e, "Skipping job with invalid schedule"),
            }
            if let Some(at) = job.retry_at {
                engine.arm(TriggerKey::Retry(job.id), ScheduleSpec::Once(at), at);
                debug!(job_id = job.id, %at, "Re-armed pending retry");
            }
        }
        info!(jobs = jobs.len(), armed, "Jobs registered with trigger engine");
        Ok(())
    }

    /// Arm the job's regular trigger if it wants one and persist the next
    /// fire time. Returns whether it was armed.
    async fn register(&self, engine: &Arc<dyn TriggerEngine>, job: &ScheduledJob) -> Result<bool> {
        engine.disarm(TriggerKey::Job(job.id));
        if !job.wants_trigger() {
            self.inner.registry.set_next_run(job.id, None).await?;
            return Ok(false);
        }

        let spec = JobRegistry::schedule_of(job)?;
        let next = spec.first_fire_after(Utc::now());
        if let Some(at) = next {
            engine.arm(TriggerKey::Job(job.id), spec, at);
            info!(job_id = job.id, next_run = %at, "Job scheduled");
        } else {
            debug!(job_id = job.id, "Schedule has no future fire time");
        }
        self.inner.registry.set_next_run(job.id, next).await?;
        Ok(next.is_some())
    }

    /// Drop every trigger the job holds.
    fn unregister(&self, job_id: JobId) {
        if let Some(engine) = self.engine() {
            engine.disarm(TriggerKey::Job(job_id));
            engine.disarm(TriggerKey::Retry(job_id));
        }
    }

    pub async fn get_scheduler_status(&self) -> Result<SchedulerStatus> {
        let job_count = self.inner.registry.count().await?;
        let engine = self.engine();
        Ok(SchedulerStatus {
            available: engine.is_some(),
            running: engine.as_ref().map(|e| e.is_running()).unwrap_or(false),
            job_count,
            scheduled_count: engine.as_ref().map(|e| e.registered().len()).unwrap_or(0),
            engine: engine
                .as_ref()
                .map(|e| e.name().to_string())
                .unwrap_or_else(|| self.inner.provider.name().to_string()),
            reason: self.inner.unavailable_reason.read().clone(),
        })
    }

    /// Triggers currently armed in the engine.
    pub fn registered_triggers(&self) -> Vec<RegisteredTrigger> {
        self.engine().map(|e| e.registered()).unwrap_or_default()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Job Definitions
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn create_job(&self, new: NewJob) -> Result<ScheduledJob> {
        let has_kind = {
            let probe = new.clone().into_job(Utc::now());
            self.has_kind_handler(&probe)
        };
        let (job, _spec) = self.inner.registry.create(new, has_kind).await?;
        if let Some(engine) = self.engine() {
            self.register(&engine, &job).await?;
        }
        self.inner.registry.get(job.id).await
    }

    /// Update a job. The old trigger is always removed first; the job is
    /// re-registered only if it is still active and not manual.
    pub async fn update_job(&self, job_id: JobId, update: JobUpdate) -> Result<ScheduledJob> {
        let (job, _spec) = self
            .inner
            .registry
            .update(job_id, update, |job| self.has_kind_handler(job))
            .await?;

        match self.engine() {
            Some(engine) => {
                engine.disarm(TriggerKey::Job(job_id));
                if !job.is_active {
                    engine.disarm(TriggerKey::Retry(job_id));
                }
                self.register(&engine, &job).await?;
            }
            None => self.inner.registry.set_next_run(job_id, None).await?,
        }
        if !job.is_active && job.retry_at.is_some() {
            self.inner.registry.set_retry_state(job_id, 0, None).await?;
        }
        self.inner.registry.get(job_id).await
    }

    pub async fn delete_job(&self, job_id: JobId, keep_history: bool) -> Result<()> {
        self.unregister(job_id);
        if let Some((_, (_, cancel))) = self.inner.cancels.remove(&job_id) {
            let _ = cancel.send(true);
        }
        self.inner.registry.delete(job_id, keep_history).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<ScheduledJob> {
        self.inner.registry.get(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        self.inner.registry.list(filter).await
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatusReport> {
        let job = self.inner.registry.get(job_id).await?;
        let engine = self.engine();
        let next_run_time = engine.as_ref().and_then(|e| e.next_fire(TriggerKey::Job(job_id)));
        let pending_retry_at = engine
            .as_ref()
            .and_then(|e| e.next_fire(TriggerKey::Retry(job_id)))
            .or(job.retry_at);

        let current_execution = match job.current_execution_id {
            Some(id) if job.is_running => self.inner.registry.database().get_execution(id).await?,
            _ => None,
        };

        let scheduled = next_run_time.is_some();
        let state = if job.is_running {
            JobState::Running
        } else if scheduled {
            JobState::Scheduled
        } else {
            JobState::Unscheduled
        };

        Ok(JobStatusReport {
            job,
            state,
            scheduled,
            next_run_time,
            pending_retry_at,
            current_execution,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Executions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start a manual run in the background and return at once.
    pub async fn run_job_now(&self, job_id: JobId) -> Result<RunOutcome> {
        let job = self.inner.registry.get(job_id).await?;
        match self.inner.registry.begin_execution(job_id, ExecutionTrigger::Manual, 0).await? {
            BeginOutcome::Started(execution_id) => {
                let inner = self.inner.clone();
                let attempt = 0;
                let cancel = register_cancel(&inner, job_id, execution_id);
                tokio::spawn(async move {
                    run_execution(&inner, job, execution_id, ExecutionTrigger::Manual, attempt, cancel).await;
                });
                Ok(RunOutcome::Started { execution_id })
            }
            BeginOutcome::Conflict(execution_id) => {
                info!(job_id, ?execution_id, "Run refused: job already running");
                Ok(RunOutcome::Conflict { execution_id })
            }
            BeginOutcome::NotFound => Err(ForgeError::job_not_found(job_id)),
        }
    }

    /// Run the job and wait for the outcome. A conflict returns `Ok(None)`.
    pub async fn execute_job(&self, job_id: JobId, trigger: ExecutionTrigger) -> Result<Option<JobExecution>> {
        execute(&self.inner, job_id, trigger).await
    }

    pub async fn stop_job(&self, job_id: JobId) -> Result<StopReport> {
        match self.inner.registry.stop_execution(job_id).await? {
            StopOutcome::Stopped(execution_id) => {
                if let Some((_, (_, cancel))) = release_cancel(&self.inner, job_id, execution_id) {
                    let _ = cancel.send(true);
                }
                info!(job_id, execution_id, "Execution stopped by user");
                Ok(StopReport::Stopped { execution_id })
            }
            StopOutcome::NotRunning => Ok(StopReport::NotRunning),
        }
    }

    pub async fn list_executions(&self, job_id: JobId, limit: Option<i64>) -> Result<Vec<JobExecution>> {
        self.inner.registry.get(job_id).await?;
        self.inner.registry.list_executions(job_id, limit).await
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<JobExecution> {
        self.inner.registry.get_execution(execution_id).await
    }
}

fn register_cancel(inner: &SchedulerInner, job_id: JobId, execution_id: ExecutionId) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    inner.cancels.insert(job_id, (execution_id, tx));
    rx
}

/// Drop the cancel signal only if it still belongs to `execution_id`. A stopped
/// run that finishes late must not take the signal of the run that replaced it.
fn release_cancel(
    inner: &SchedulerInner,
    job_id: JobId,
    execution_id: ExecutionId,
) -> Option<(JobId, (ExecutionId, watch::Sender<bool>))> {
    inner.cancels.remove_if(&job_id, |_, (owner, _)| *owner == execution_id)
}

/// Claim and run the job, returning the final execution record.
async fn execute(inner: &Arc<SchedulerInner>, job_id: JobId, trigger: ExecutionTrigger) -> Result<Option<JobExecution>> {
    let job = inner.registry.get(job_id).await?;
    let attempt = match trigger {
        ExecutionTrigger::Retry => job.retry_attempt,
        _ => 0,
    };
    match inner.registry.begin_execution(job_id, trigger, attempt).await? {
        BeginOutcome::Started(execution_id) => {
            let cancel = register_cancel(inner, job_id, execution_id);
            run_execution(inner, job, execution_id, trigger, attempt, cancel).await;
            inner.registry.get_execution(execution_id).await.map(Some)
        }
        BeginOutcome::Conflict(execution_id) => {
            debug!(job_id, ?execution_id, trigger = trigger.as_str(), "Job already running");
            Ok(None)
        }
        BeginOutcome::NotFound => Err(ForgeError::job_not_found(job_id)),
    }
}

/// Body of one execution. Never returns an error: every failure is
/// recorded on the execution instead.
async fn run_execution(
    inner: &Arc<SchedulerInner>,
    job: ScheduledJob,
    execution_id: ExecutionId,
    trigger: ExecutionTrigger,
    attempt: u32,
    cancel: watch::Receiver<bool>,
) {
    let job_id = job.id;
    let recurring = job.schedule_type.is_recurring();
    let policy = RetryPolicy::from_job(&job);
    info!(job_id, execution_id, trigger = trigger.as_str(), attempt, "Execution started");

    let start = Instant::now();
    let ctx = DispatchContext::new(job, execution_id, attempt, cancel);
    let dispatcher = inner.dispatcher.clone();
    // A panicking handler only takes down its own task.
    let outcome = match tokio::spawn(async move { dispatcher.dispatch(&ctx).await }).await {
        Ok(result) => result,
        Err(join) => Err(ForgeError::from(join)),
    };
    let elapsed = start.elapsed().as_secs_f64();

    let run = match &outcome {
        Ok(value) => CompletedRun::success(Some(value.clone())),
        Err(e) => CompletedRun::failed(e.user_message().to_string()),
    };

    release_cancel(inner, job_id, execution_id);

    let applied = match inner.registry.complete_execution(job_id, execution_id, &run).await {
        Ok(applied) => applied,
        Err(e) => {
            error!(job_id, execution_id, error = %e, "Failed to record execution result");
            return;
        }
    };
    if !applied {
        info!(job_id, execution_id, "Execution was stopped; discarding its result");
        return;
    }

    JobMetrics::record_execution(run.status.as_str(), trigger.as_str(), elapsed);
    match &outcome {
        Ok(_) => info!(job_id, execution_id, duration_s = elapsed, "Execution succeeded"),
        Err(e) => warn!(job_id, execution_id, duration_s = elapsed, error = %e, "Execution failed"),
    }

    let decision = match outcome {
        Ok(_) => RetryDecision::Reset,
        Err(_) => policy.on_failure(attempt, recurring, Utc::now()),
    };
    if let Err(e) = apply_retry_decision(inner, job_id, decision).await {
        error!(job_id, error = %e, "Failed to apply retry decision");
    }

    let engine = inner.engine.read().as_ref().map(|s| s.engine.clone());
    if let Some(engine) = engine {
        let next = engine.next_fire(TriggerKey::Job(job_id));
        if let Err(e) = inner.registry.set_next_run(job_id, next).await {
            warn!(job_id, error = %e, "Failed to refresh next run time");
        }
    }
}

async fn apply_retry_decision(inner: &Arc<SchedulerInner>, job_id: JobId, decision: RetryDecision) -> Result<()> {
    let engine = inner.engine.read().as_ref().map(|s| s.engine.clone());
    match decision {
        RetryDecision::Reset => {
            if let Some(engine) = &engine {
                engine.disarm(TriggerKey::Retry(job_id));
            }
            inner.registry.set_retry_state(job_id, 0, None).await
        }
        RetryDecision::Retry { attempt, at } => {
            inner.registry.set_retry_state(job_id, attempt, Some(at)).await?;
            if let Some(engine) = &engine {
                engine.arm(TriggerKey::Retry(job_id), ScheduleSpec::Once(at), at);
            }
            JobMetrics::record_retry_armed();
            info!(job_id, attempt, retry_at = %at, "Retry armed");
            Ok(())
        }
        RetryDecision::Exhausted { pause } => {
            inner.registry.set_retry_state(job_id, 0, None).await?;
            if pause {
                if let Some(engine) = &engine {
                    engine.disarm(TriggerKey::Job(job_id));
                }
                inner.registry.set_active(job_id, false).await?;
                inner.registry.set_next_run(job_id, None).await?;
                warn!(job_id, "Retries exhausted; job paused");
            } else {
                info!(job_id, "Retries exhausted; keeping regular schedule");
            }
            Ok(())
        }
    }
}

/// Listen for fires until the engine goes away.
async fn listen(inner: Weak<SchedulerInner>, mut fired: mpsc::UnboundedReceiver<TriggerFired>) {
    while let Some(event) = fired.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        tokio::spawn(async move {
            if let Err(e) = handle_fire(&inner, event).await {
                error!(key = ?event.key, error = %e, "Trigger handling failed");
            }
        });
    }
    debug!("Trigger listener stopped");
}

async fn handle_fire(inner: &Arc<SchedulerInner>, event: TriggerFired) -> Result<()> {
    let job_id = event.key.job_id();
    let Some(job) = inner.registry.find(job_id).await? else {
        debug!(job_id, "Fired trigger for a deleted job");
        return Ok(());
    };
    if !job.is_active {
        debug!(job_id, "Fired trigger for an inactive job");
        return Ok(());
    }

    let trigger = match event.key {
        TriggerKey::Job(_) => {
            let engine = inner.engine.read().as_ref().map(|s| s.engine.clone());
            let next = engine.and_then(|e| e.next_fire(event.key));
            inner.registry.set_next_run(job_id, next).await?;
            ExecutionTrigger::Scheduled
        }
        TriggerKey::Retry(_) => ExecutionTrigger::Retry,
    };

    if job.is_running {
        JobMetrics::record_fire_skipped();
        info!(job_id, trigger = trigger.as_str(), "Skipping fire: job already running");
        return Ok(());
    }

    if execute(inner, job_id, trigger).await?.is_none() {
        JobMetrics::record_fire_skipped();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentsConfig;
    use crate::db::Database;
    use crate::environments::EnvironmentStore;
    use crate::jobs::dispatch::{DispatchConfig, FnHandler, HandlerRegistry};
    use crate::jobs::model::ScheduleType;
    use crate::jobs::trigger::LocalEngineProvider;
    use crate::process::SystemRunner;
    use serde_json::json;
    use std::time::Duration;

    async fn scheduler(handlers: HandlerRegistry, dir: &std::path::Path) -> JobScheduler {
        let db = Database::connect_in_memory().await.unwrap();
        let runner = Arc::new(SystemRunner);
        let envs = Arc::new(EnvironmentStore::new(dir.join("providers"), EnvironmentsConfig::default(), runner.clone()));
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
        JobScheduler::new(JobRegistry::new(db), dispatcher, provider)
    }

    fn failing_handlers() -> HandlerRegistry {
        let mut h = HandlerRegistry::new();
        h.register(
            "always.fail",
            Arc::new(FnHandler(|_ctx: DispatchContext| async {
                Err(ForgeError::dispatch_failed("boom"))
            })),
        );
        h
    }

    #[tokio::test]
    async fn test_failure_arms_retry_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler(failing_handlers(), dir.path()).await;
        s.start().await.unwrap();

        let mut new = NewJob::named("flaky");
        new.function_name = Some("always.fail".into());
        new.retry_enabled = true;
        new.max_retries = 2;
        new.retry_delay_seconds = 600;
        let job = s.create_job(new).await.unwrap();

        let before = Utc::now();
        let exec = s.execute_job(job.id, ExecutionTrigger::Manual).await.unwrap().unwrap();
        assert_eq!(exec.status, crate::jobs::model::ExecutionStatus::Failed);

        let stored = s.get_job(job.id).await.unwrap();
        assert_eq!(stored.retry_attempt, 1);
        let retry_at = stored.retry_at.unwrap();
        assert!(retry_at >= before + chrono::Duration::seconds(599));

        let status = s.get_job_status(job.id).await.unwrap();
        assert_eq!(status.pending_retry_at, Some(retry_at));
        assert!(s
            .registered_triggers()
            .iter()
            .any(|t| t.key == TriggerKey::Retry(job.id)));
    }

    #[tokio::test]
    async fn test_exhausted_recurring_job_is_paused() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler(failing_handlers(), dir.path()).await;
        s.start().await.unwrap();

        let mut new = NewJob::named("hourly");
        new.function_name = Some("always.fail".into());
        new.schedule_type = ScheduleType::Interval;
        new.schedule_config = json!({ "interval_seconds": 3600 });
        new.retry_enabled = true;
        new.max_retries = 0;
        let job = s.create_job(new).await.unwrap();
        assert!(job.next_run_at.is_some());

        s.execute_job(job.id, ExecutionTrigger::Scheduled).await.unwrap();
        let stored = s.get_job(job.id).await.unwrap();
        assert!(!stored.is_active);
        assert!(stored.next_run_at.is_none());
        assert!(s.registered_triggers().is_empty());
    }

    #[tokio::test]
    async fn test_registry_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LocalEngineProvider::DISABLED_MARKER), b"").unwrap();
        let s = scheduler(HandlerRegistry::new(), dir.path()).await;

        let status = s.start().await.unwrap();
        assert!(!status.available);
        assert!(status.reason.is_some());

        let mut new = NewJob::named("later");
        new.api_endpoint = Some("/x".into());
        new.schedule_type = ScheduleType::Interval;
        new.schedule_config = json!({ "interval_seconds": 60 });
        let job = s.create_job(new).await.unwrap();
        assert!(job.next_run_at.is_none());

        std::fs::remove_file(dir.path().join(LocalEngineProvider::DISABLED_MARKER)).unwrap();
        let status = s.reinitialize().await.unwrap();
        assert!(status.available);
        assert!(status.running);
        assert_eq!(status.scheduled_count, 1);
        assert!(s.get_job(job.id).await.unwrap().next_run_at.is_some());
    }
}
