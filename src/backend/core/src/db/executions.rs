//! `job_executions` queries and the execution state transitions.
//!
//! Every transition that touches both tables runs in one transaction, and
//! each is conditional on the state it expects, so concurrent callers cannot
//! start a second run or overwrite a cancelled one.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::jobs::parse_optional_json;
use super::Database;
use crate::error::{ForgeError, Result};
use crate::jobs::model::{ExecutionId, ExecutionStatus, ExecutionTrigger, JobExecution, JobId};

/// Message recorded on executions cancelled through `stop_job`.
pub const STOPPED_BY_USER: &str = "Stopped by user";

/// Message recorded on executions found running at startup.
pub const INTERRUPTED_BY_RESTART: &str = "Interrupted by service restart";

/// Result of trying to start an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    Started(ExecutionId),
    /// The job already has a run in flight
    Conflict(Option<ExecutionId>),
    NotFound,
}

/// Result of stopping a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(ExecutionId),
    NotRunning,
}

/// Terminal state of a finished run.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CompletedRun {
    pub fn success(result: Option<Value>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }
}

impl Database {
    // ═══════════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Mark the job running and create its `running` execution, atomically.
    pub async fn begin_execution(
        &self,
        job_id: JobId,
        trigger: ExecutionTrigger,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<BeginOutcome> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE scheduled_jobs SET is_running = 1, last_run_at = ? WHERE id = ? AND is_running = 0",
        )
        .bind(started_at)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            let current: Option<(Option<i64>,)> =
                sqlx::query_as("SELECT current_execution_id FROM scheduled_jobs WHERE id = ?")
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match current {
                Some((execution_id,)) => BeginOutcome::Conflict(execution_id),
                None => BeginOutcome::NotFound,
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_executions (job_id, job_name, status, trigger_source, attempt, started_at)
            SELECT id, name, 'running', ?, ?, ? FROM scheduled_jobs WHERE id = ?
            "#,
        )
        .bind(trigger.as_str())
        .bind(attempt as i64)
        .bind(started_at)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        let execution_id = inserted.last_insert_rowid();

        sqlx::query("UPDATE scheduled_jobs SET current_execution_id = ? WHERE id = ?")
            .bind(execution_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(BeginOutcome::Started(execution_id))
    }

    /// Record the end of a run and roll it into the job's counters.
    ///
    /// Returns false, changing nothing, when the execution is no longer
    /// `running` (it was stopped while the work was in flight).
    pub async fn complete_execution(
        &self,
        job_id: JobId,
        execution_id: ExecutionId,
        run: &CompletedRun,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let started: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT started_at FROM job_executions WHERE id = ? AND status = 'running'",
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((started_at,)) = started else {
            tx.rollback().await?;
            return Ok(false);
        };

        let duration = seconds_between(started_at, run.completed_at);
        let result_json = run.result.as_ref().map(Value::to_string);

        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = ?, completed_at = ?, duration_seconds = ?, result_json = ?, error_message = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(duration)
        .bind(&result_json)
        .bind(&run.error)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        let succeeded = run.status == ExecutionStatus::Success;
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET is_running = 0,
                current_execution_id = NULL,
                last_status = ?,
                last_result = CASE WHEN ? THEN ? ELSE last_result END,
                last_error = ?,
                run_count = run_count + 1,
                success_count = success_count + ?,
                failure_count = failure_count + ?,
                updated_at = ?
            WHERE id = ? AND current_execution_id = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(succeeded)
        .bind(&result_json)
        .bind(&run.error)
        .bind(succeeded as i64)
        .bind(!succeeded as i64)
        .bind(run.completed_at)
        .bind(job_id)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Cancel the job's in-flight execution and release the job.
    pub async fn stop_execution(&self, job_id: JobId, now: DateTime<Utc>) -> Result<StopOutcome> {
        let mut tx = self.pool.begin().await?;

        let job: Option<(bool, Option<i64>)> =
            sqlx::query_as("SELECT is_running, current_execution_id FROM scheduled_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;

        let (is_running, current) = job.ok_or_else(|| ForgeError::job_not_found(job_id))?;
        let execution_id = match (is_running, current) {
            (true, Some(id)) => id,
            _ => {
                tx.rollback().await?;
                return Ok(StopOutcome::NotRunning);
            }
        };

        let started: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT started_at FROM job_executions WHERE id = ?")
                .bind(execution_id)
                .fetch_optional(&mut *tx)
                .await?;
        let duration = started.map(|(s,)| seconds_between(s, now));

        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = 'cancelled', completed_at = ?, duration_seconds = ?, error_message = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(duration)
        .bind(STOPPED_BY_USER)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET is_running = 0, current_execution_id = NULL,
                last_status = 'cancelled', last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(STOPPED_BY_USER)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(StopOutcome::Stopped(execution_id))
    }

    /// Cancel executions left `running` by a previous process and release
    /// their jobs. Returns how many executions were cancelled.
    pub async fn reset_stale_running(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = 'cancelled', completed_at = ?, error_message = ?
            WHERE status = 'running'
            "#,
        )
        .bind(now)
        .bind(INTERRUPTED_BY_RESTART)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE scheduled_jobs SET is_running = 0, current_execution_id = NULL WHERE is_running = 1",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(cancelled.rows_affected())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // History
    // ═══════════════════════════════════════════════════════════════════════════

    /// Most recent executions of a job, newest first.
    pub async fn list_executions(&self, job_id: JobId, limit: i64) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, job_id, job_name, status, trigger_source, attempt,
                   started_at, completed_at, duration_seconds, result_json, error_message
            FROM job_executions
            WHERE job_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobExecution::try_from).collect()
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<JobExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, job_id, job_name, status, trigger_source, attempt,
                   started_at, completed_at, duration_seconds, result_json, error_message
            FROM job_executions
            WHERE id = ?
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobExecution::try_from).transpose()
    }

    pub async fn count_running_executions(&self, job_id: JobId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_executions WHERE job_id = ? AND status = 'running'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete finished executions that started before `cutoff`.
    pub async fn purge_executions_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_executions WHERE started_at < ? AND status <> 'running'")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    ((end - start).num_milliseconds().max(0) as f64) / 1000.0
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    job_id: i64,
    job_name: String,
    status: String,
    trigger_source: String,
    attempt: i64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    result_json: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<ExecutionRow> for JobExecution {
    type Error = ForgeError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(JobExecution {
            id: row.id,
            job_id: row.job_id,
            job_name: row.job_name,
            status: row.status.parse()?,
            trigger: row.trigger_source.parse()?,
            attempt: row.attempt.max(0) as u32,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_seconds: row.duration_seconds,
            result: parse_optional_json(row.result_json)?,
            error_message: row.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::NewJob;
    use chrono::Duration;
    use serde_json::json;

    async fn db_with_job() -> (Database, JobId) {
        let db = Database::connect_in_memory().await.unwrap();
        let mut new = NewJob::named("probe");
        new.api_endpoint = Some("/api/health".into());
        let id = db.insert_job(&new.into_job(Utc::now())).await.unwrap();
        (db, id)
    }

    #[tokio::test]
    async fn test_second_begin_conflicts() {
        let (db, id) = db_with_job().await;
        let first = db.begin_execution(id, ExecutionTrigger::Manual, 0, Utc::now()).await.unwrap();
        let BeginOutcome::Started(exec_id) = first else {
            panic!("expected start, got {first:?}");
        };

        let second = db.begin_execution(id, ExecutionTrigger::Manual, 0, Utc::now()).await.unwrap();
        assert_eq!(second, BeginOutcome::Conflict(Some(exec_id)));
        assert_eq!(db.count_running_executions(id).await.unwrap(), 1);

        let job = db.get_job(id).await.unwrap().unwrap();
        assert!(job.is_running);
        assert_eq!(job.current_execution_id, Some(exec_id));
    }

    #[tokio::test]
    async fn test_begin_unknown_job() {
        let (db, id) = db_with_job().await;
        let outcome = db
            .begin_execution(id + 1, ExecutionTrigger::Scheduled, 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, BeginOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_complete_updates_counters() {
        let (db, id) = db_with_job().await;
        let started = Utc::now() - Duration::seconds(2);
        let BeginOutcome::Started(exec_id) =
            db.begin_execution(id, ExecutionTrigger::Manual, 0, started).await.unwrap()
        else {
            panic!("expected start");
        };

        let applied = db
            .complete_execution(id, exec_id, &CompletedRun::success(Some(json!({ "ok": true }))))
            .await
            .unwrap();
        assert!(applied);

        let exec = db.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert!(exec.duration_seconds.unwrap() >= 1.9);
        assert_eq!(exec.job_name, "probe");

        let job = db.get_job(id).await.unwrap().unwrap();
        assert!(!job.is_running);
        assert_eq!(job.run_count, 1);
        assert_eq!(job.success_count, 1);
        assert_eq!(job.last_result, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_stop_wins_over_late_completion() {
        let (db, id) = db_with_job().await;
        let BeginOutcome::Started(exec_id) =
            db.begin_execution(id, ExecutionTrigger::Manual, 0, Utc::now()).await.unwrap()
        else {
            panic!("expected start");
        };

        assert_eq!(db.stop_execution(id, Utc::now()).await.unwrap(), StopOutcome::Stopped(exec_id));
        assert!(!db
            .complete_execution(id, exec_id, &CompletedRun::failed("boom"))
            .await
            .unwrap());

        let exec = db.get_execution(exec_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert_eq!(exec.error_message.as_deref(), Some(STOPPED_BY_USER));

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.failure_count, 0);
        assert_eq!(db.stop_execution(id, Utc::now()).await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_reset_stale_running() {
        let (db, id) = db_with_job().await;
        db.begin_execution(id, ExecutionTrigger::Scheduled, 0, Utc::now()).await.unwrap();

        assert_eq!(db.reset_stale_running(Utc::now()).await.unwrap(), 1);
        let job = db.get_job(id).await.unwrap().unwrap();
        assert!(!job.is_running);
        assert!(job.current_execution_id.is_none());
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_and_running() {
        let (db, id) = db_with_job().await;
        let old = Utc::now() - Duration::days(40);
        let BeginOutcome::Started(old_id) =
            db.begin_execution(id, ExecutionTrigger::Scheduled, 0, old).await.unwrap()
        else {
            panic!("expected start");
        };
        db.complete_execution(id, old_id, &CompletedRun::success(None)).await.unwrap();
        db.begin_execution(id, ExecutionTrigger::Scheduled, 0, Utc::now()).await.unwrap();

        let purged = db.purge_executions_before(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(db.list_executions(id, 10).await.unwrap().len(), 1);
    }
}
