//! Scheduled job registry: validated CRUD over job definitions plus the
//! runtime bookkeeping the scheduler drives.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::model::{
    ExecutionId, ExecutionTrigger, JobExecution, JobFilter, JobId, JobUpdate, NewJob, ScheduledJob,
};
use super::schedule::{validate_schedule_config, ScheduleSpec};
use crate::db::{BeginOutcome, CompletedRun, Database, StopOutcome};
use crate::error::{ErrorCode, ForgeError, Result};

const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Default page size for execution history.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Persisted job definitions.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    db: Database,
}

impl JobRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Check a definition and build its trigger.
    ///
    /// `has_kind_handler` tells whether a handler is registered for the job's
    /// `(module, job_type)`, which stands in for an explicit target.
    pub fn validate(job: &ScheduledJob, has_kind_handler: bool) -> Result<ScheduleSpec> {
        if job.name.trim().is_empty() {
            return Err(ForgeError::new(ErrorCode::MissingRequiredField, "Job name is required")
                .with_context("field", "name"));
        }
        if job.dispatch_target().is_none() && !has_kind_handler {
            return Err(ForgeError::missing_dispatch_target(&job.name));
        }
        if !HTTP_METHODS.contains(&job.http_method.as_str()) {
            return Err(ForgeError::validation(format!(
                "Unsupported http_method '{}'",
                job.http_method
            ))
            .with_context("allowed", HTTP_METHODS));
        }
        validate_schedule_config(job.schedule_type, &job.schedule_config)
    }

    /// Build the trigger of an already-stored job.
    pub fn schedule_of(job: &ScheduledJob) -> Result<ScheduleSpec> {
        validate_schedule_config(job.schedule_type, &job.schedule_config)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CRUD
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn create(&self, new: NewJob, has_kind_handler: bool) -> Result<(ScheduledJob, ScheduleSpec)> {
        let mut job = new.into_job(Utc::now());
        let spec = Self::validate(&job, has_kind_handler)?;
        job.id = self.db.insert_job(&job).await?;
        info!(job_id = job.id, name = %job.name, schedule = %job.schedule_type, "Job created");
        Ok((job, spec))
    }

    pub async fn get(&self, job_id: JobId) -> Result<ScheduledJob> {
        self.db
            .get_job(job_id)
            .await?
            .ok_or_else(|| ForgeError::job_not_found(job_id))
    }

    pub async fn find(&self, job_id: JobId) -> Result<Option<ScheduledJob>> {
        self.db.get_job(job_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        self.db.list_jobs(filter).await
    }

    pub async fn count(&self) -> Result<i64> {
        self.db.count_jobs().await
    }

    /// Apply `update` and persist it. Nothing is written if the result does
    /// not validate.
    pub async fn update<F>(
        &self,
        job_id: JobId,
        update: JobUpdate,
        has_kind_handler: F,
    ) -> Result<(ScheduledJob, ScheduleSpec)>
    where
        F: Fn(&ScheduledJob) -> bool,
    {
        let mut job = self.get(job_id).await?;
        update.apply(&mut job);
        let spec = Self::validate(&job, has_kind_handler(&job))?;
        job.updated_at = Utc::now();
        self.db.update_job_definition(&job).await?;
        debug!(job_id, "Job definition updated");
        Ok((job, spec))
    }

    pub async fn delete(&self, job_id: JobId, keep_history: bool) -> Result<()> {
        if !self.db.delete_job(job_id, keep_history).await? {
            return Err(ForgeError::job_not_found(job_id));
        }
        info!(job_id, keep_history, "Job deleted");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Runtime Bookkeeping
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn begin_execution(
        &self,
        job_id: JobId,
        trigger: ExecutionTrigger,
        attempt: u32,
    ) -> Result<BeginOutcome> {
        self.db.begin_execution(job_id, trigger, attempt, Utc::now()).await
    }

    pub async fn complete_execution(
        &self,
        job_id: JobId,
        execution_id: ExecutionId,
        run: &CompletedRun,
    ) -> Result<bool> {
        self.db.complete_execution(job_id, execution_id, run).await
    }

    pub async fn stop_execution(&self, job_id: JobId) -> Result<StopOutcome> {
        self.db.stop_execution(job_id, Utc::now()).await
    }

    pub async fn reset_stale_running(&self) -> Result<u64> {
        self.db.reset_stale_running(Utc::now()).await
    }

    pub async fn set_next_run(&self, job_id: JobId, at: Option<DateTime<Utc>>) -> Result<()> {
        self.db.set_next_run(job_id, at).await
    }

    pub async fn set_retry_state(&self, job_id: JobId, attempt: u32, at: Option<DateTime<Utc>>) -> Result<()> {
        self.db.set_retry_state(job_id, attempt, at).await
    }

    pub async fn set_active(&self, job_id: JobId, is_active: bool) -> Result<()> {
        self.db.set_job_active(job_id, is_active).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // History
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn list_executions(&self, job_id: JobId, limit: Option<i64>) -> Result<Vec<JobExecution>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1000);
        self.db.list_executions(job_id, limit).await
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<JobExecution> {
        self.db
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ForgeError::execution_not_found(execution_id))
    }

    pub async fn purge_executions_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.db.purge_executions_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::ScheduleType;
    use serde_json::json;

    async fn registry() -> JobRegistry {
        JobRegistry::new(Database::connect_in_memory().await.unwrap())
    }

    fn http_job(name: &str) -> NewJob {
        let mut new = NewJob::named(name);
        new.api_endpoint = Some("/api/health".into());
        new
    }

    #[tokio::test]
    async fn test_create_requires_target() {
        let reg = registry().await;
        let err = reg.create(NewJob::named("empty"), false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingDispatchTarget);

        // A (module, job_type) handler counts as a target.
        assert!(reg.create(NewJob::named("by-kind"), true).await.is_ok());
    }

    #[tokio::test]
    async fn test_short_cron_is_rejected_and_not_stored() {
        let reg = registry().await;
        let mut new = http_job("bad-cron");
        new.schedule_type = ScheduleType::Cron;
        new.schedule_config = json!({ "cron_expression": "0 2 * *" });

        let err = reg.create(new, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSchedule);
        assert_eq!(reg.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_unknown_method() {
        let reg = registry().await;
        let mut new = http_job("m");
        new.http_method = "fetch".into();
        let err = reg.create(new, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_invalid_update_is_not_persisted() {
        let reg = registry().await;
        let (job, _) = reg.create(http_job("keep"), false).await.unwrap();

        let update: JobUpdate = serde_json::from_value(json!({
            "schedule_type": "interval",
            "schedule_config": {}
        }))
        .unwrap();
        assert!(reg.update(job.id, update, |_| false).await.is_err());

        let stored = reg.get(job.id).await.unwrap();
        assert_eq!(stored.schedule_type, ScheduleType::Manual);
    }

    #[tokio::test]
    async fn test_missing_records_are_errors() {
        let reg = registry().await;
        assert_eq!(reg.get(9).await.unwrap_err().code(), ErrorCode::JobNotFound);
        assert_eq!(reg.delete(9, false).await.unwrap_err().code(), ErrorCode::JobNotFound);
        assert_eq!(reg.get_execution(9).await.unwrap_err().code(), ErrorCode::ExecutionNotFound);
    }
}
