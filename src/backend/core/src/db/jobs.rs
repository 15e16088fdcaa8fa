//! `scheduled_jobs` queries.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use super::Database;
use crate::error::{ForgeError, Result};
use crate::jobs::model::{JobFilter, JobId, ScheduledJob};

const JOB_COLUMNS: &str = r#"
    id, name, description, module, job_type,
    function_name, api_endpoint, http_method, http_headers, http_body, script_path, parameters,
    schedule_type, schedule_config, is_active,
    retry_enabled, max_retries, retry_delay_seconds, retry_backoff, failover_enabled,
    is_running, current_execution_id, last_run_at, next_run_at, last_status, last_result, last_error,
    run_count, success_count, failure_count, retry_attempt, retry_at,
    created_at, updated_at
"#;

impl Database {
    // ═══════════════════════════════════════════════════════════════════════════
    // Definitions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert a new job and return its id.
    pub async fn insert_job(&self, job: &ScheduledJob) -> Result<JobId> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                name, description, module, job_type,
                function_name, api_endpoint, http_method, http_headers, http_body, script_path, parameters,
                schedule_type, schedule_config, is_active,
                retry_enabled, max_retries, retry_delay_seconds, retry_backoff, failover_enabled,
                next_run_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.module)
        .bind(&job.job_type)
        .bind(&job.function_name)
        .bind(&job.api_endpoint)
        .bind(&job.http_method)
        .bind(serde_json::to_string(&job.http_headers)?)
        .bind(job.http_body.as_ref().map(Value::to_string))
        .bind(&job.script_path)
        .bind(job.parameters.to_string())
        .bind(job.schedule_type.as_str())
        .bind(job.schedule_config.to_string())
        .bind(job.is_active)
        .bind(job.retry_enabled)
        .bind(job.max_retries as i64)
        .bind(job.retry_delay_seconds as i64)
        .bind(job.retry_backoff)
        .bind(job.failover_enabled)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Rewrite the definition columns of an existing job. Runtime state is
    /// owned by the scheduler and left alone.
    pub async fn update_job_definition(&self, job: &ScheduledJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET name = ?, description = ?, module = ?, job_type = ?,
                function_name = ?, api_endpoint = ?, http_method = ?, http_headers = ?,
                http_body = ?, script_path = ?, parameters = ?,
                schedule_type = ?, schedule_config = ?, is_active = ?,
                retry_enabled = ?, max_retries = ?, retry_delay_seconds = ?,
                retry_backoff = ?, failover_enabled = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.module)
        .bind(&job.job_type)
        .bind(&job.function_name)
        .bind(&job.api_endpoint)
        .bind(&job.http_method)
        .bind(serde_json::to_string(&job.http_headers)?)
        .bind(job.http_body.as_ref().map(Value::to_string))
        .bind(&job.script_path)
        .bind(job.parameters.to_string())
        .bind(job.schedule_type.as_str())
        .bind(job.schedule_config.to_string())
        .bind(job.is_active)
        .bind(job.retry_enabled)
        .bind(job.max_retries as i64)
        .bind(job.retry_delay_seconds as i64)
        .bind(job.retry_backoff)
        .bind(job.failover_enabled)
        .bind(job.updated_at)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ForgeError::job_not_found(job.id));
        }
        Ok(())
    }

    /// Get job by ID.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM scheduled_jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ScheduledJob::try_from).transpose()
    }

    /// List jobs matching `filter`, oldest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {} FROM scheduled_jobs
            WHERE (? IS NULL OR is_active = ?)
              AND (? IS NULL OR schedule_type = ?)
              AND (? IS NULL OR module = ?)
            ORDER BY id
            "#,
            JOB_COLUMNS
        ))
        .bind(filter.is_active)
        .bind(filter.is_active)
        .bind(filter.schedule_type.map(|t| t.as_str()))
        .bind(filter.schedule_type.map(|t| t.as_str()))
        .bind(&filter.module)
        .bind(&filter.module)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    pub async fn count_jobs(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete a job, and its history unless `keep_history`. Returns false if
    /// the job did not exist.
    pub async fn delete_job(&self, job_id: JobId, keep_history: bool) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !keep_history {
            sqlx::query("DELETE FROM job_executions WHERE job_id = ?")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Runtime Bookkeeping
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn set_next_run(&self, job_id: JobId, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE scheduled_jobs SET next_run_at = ? WHERE id = ?")
            .bind(next_run_at)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the pending retry, or clear it with `(0, None)`.
    pub async fn set_retry_state(
        &self,
        job_id: JobId,
        attempt: u32,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE scheduled_jobs SET retry_attempt = ?, retry_at = ? WHERE id = ?")
            .bind(attempt as i64)
            .bind(retry_at)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_active(&self, job_id: JobId, is_active: bool) -> Result<()> {
        sqlx::query("UPDATE scheduled_jobs SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    id: i64,
    name: String,
    description: Option<String>,
    module: Option<String>,
    job_type: Option<String>,
    function_name: Option<String>,
    api_endpoint: Option<String>,
    http_method: String,
    http_headers: String,
    http_body: Option<String>,
    script_path: Option<String>,
    parameters: String,
    schedule_type: String,
    schedule_config: String,
    is_active: bool,
    retry_enabled: bool,
    max_retries: i64,
    retry_delay_seconds: i64,
    retry_backoff: bool,
    failover_enabled: bool,
    is_running: bool,
    current_execution_id: Option<i64>,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    last_status: Option<String>,
    last_result: Option<String>,
    last_error: Option<String>,
    run_count: i64,
    success_count: i64,
    failure_count: i64,
    retry_attempt: i64,
    retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ScheduledJob {
    type Error = ForgeError;

    fn try_from(row: JobRow) -> Result<Self> {
        let http_headers: HashMap<String, String> = serde_json::from_str(&row.http_headers)?;
        Ok(ScheduledJob {
            id: row.id,
            name: row.name,
            description: row.description,
            module: row.module,
            job_type: row.job_type,
            function_name: row.function_name,
            api_endpoint: row.api_endpoint,
            http_method: row.http_method,
            http_headers,
            http_body: parse_optional_json(row.http_body)?,
            script_path: row.script_path,
            parameters: serde_json::from_str(&row.parameters)?,
            schedule_type: row.schedule_type.parse()?,
            schedule_config: serde_json::from_str(&row.schedule_config)?,
            is_active: row.is_active,
            retry_enabled: row.retry_enabled,
            max_retries: row.max_retries.max(0) as u32,
            retry_delay_seconds: row.retry_delay_seconds.max(0) as u64,
            retry_backoff: row.retry_backoff,
            failover_enabled: row.failover_enabled,
            is_running: row.is_running,
            current_execution_id: row.current_execution_id,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            last_status: row.last_status.as_deref().map(str::parse).transpose()?,
            last_result: parse_optional_json(row.last_result)?,
            last_error: row.last_error,
            run_count: row.run_count,
            success_count: row.success_count,
            failure_count: row.failure_count,
            retry_attempt: row.retry_attempt.max(0) as u32,
            retry_at: row.retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(super) fn parse_optional_json(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(ForgeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{NewJob, ScheduleType};
    use serde_json::json;

    fn sample(name: &str) -> ScheduledJob {
        let mut new = NewJob::named(name);
        new.module = Some("rag".into());
        new.api_endpoint = Some("/api/health".into());
        new.http_headers.insert("Authorization".into(), "Bearer x".into());
        new.parameters = json!({ "limit": 5 });
        new.into_job(Utc::now())
    }

    #[tokio::test]
    async fn test_insert_and_get_preserves_fields() {
        let db = Database::connect_in_memory().await.unwrap();
        let id = db.insert_job(&sample("sync")).await.unwrap();

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.name, "sync");
        assert_eq!(job.http_headers.get("Authorization").map(String::as_str), Some("Bearer x"));
        assert_eq!(job.parameters, json!({ "limit": 5 }));
        assert_eq!(job.schedule_type, ScheduleType::Manual);
        assert!(!job.is_running);
        assert!(db.get_job(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut a = sample("a");
        a.schedule_type = ScheduleType::Interval;
        let mut b = sample("b");
        b.is_active = false;
        b.module = Some("ocr".into());
        db.insert_job(&a).await.unwrap();
        db.insert_job(&b).await.unwrap();

        assert_eq!(db.list_jobs(&JobFilter::default()).await.unwrap().len(), 2);

        let active = db
            .list_jobs(&JobFilter { is_active: Some(true), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "a");

        let ocr = db
            .list_jobs(&JobFilter { module: Some("ocr".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(ocr[0].name, "b");

        let interval = db
            .list_jobs(&JobFilter { schedule_type: Some(ScheduleType::Interval), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(interval.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_job_is_not_found() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut job = sample("ghost");
        job.id = 42;
        let err = db.update_job_definition(&job).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_delete_reports_missing() {
        let db = Database::connect_in_memory().await.unwrap();
        let id = db.insert_job(&sample("x")).await.unwrap();
        assert!(db.delete_job(id, false).await.unwrap());
        assert!(!db.delete_job(id, false).await.unwrap());
    }
}
