//! Background operations that answer with an id right away.
//!
//! Installs take minutes; the HTTP handler spawns them here and returns the
//! task id, and clients poll the record for progress and the final result.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ForgeError, Result};

/// Finished tasks are kept this long.
const RETENTION_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub kind: String,
    pub target: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Handle given to a running task for reporting progress.
#[derive(Clone)]
pub struct ProgressReporter {
    id: Uuid,
    tasks: Arc<DashMap<Uuid, TaskRecord>>,
}

impl ProgressReporter {
    pub fn task_id(&self) -> Uuid {
        self.id
    }

    pub fn report(&self, percent: u8, message: &str) {
        if let Some(mut record) = self.tasks.get_mut(&self.id) {
            record.progress = percent.min(100);
            record.message = message.to_string();
            record.updated_at = Utc::now();
        }
    }
}

#[derive(Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<DashMap<Uuid, TaskRecord>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `work` on the runtime and return its id immediately.
    pub fn spawn<F, Fut>(&self, kind: &str, target: &str, work: F) -> Uuid
    where
        F: FnOnce(ProgressReporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.prune();

        let id = Uuid::new_v4();
        let now = Utc::now();
        self.tasks.insert(
            id,
            TaskRecord {
                id,
                kind: kind.to_string(),
                target: target.to_string(),
                status: TaskStatus::Pending,
                progress: 0,
                message: "Queued".to_string(),
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );

        let reporter = ProgressReporter {
            id,
            tasks: self.tasks.clone(),
        };
        let tasks = self.tasks.clone();
        let (kind, target) = (kind.to_string(), target.to_string());
        tokio::spawn(async move {
            if let Some(mut record) = tasks.get_mut(&id) {
                record.status = TaskStatus::Running;
                record.updated_at = Utc::now();
            }
            info!(task_id = %id, kind = %kind, target = %target, "Task started");

            // A panic inside the work becomes a failed task.
            let outcome = tokio::spawn(work(reporter)).await;
            let outcome = match outcome {
                Ok(result) => result,
                Err(join) => Err(ForgeError::internal(format!("task panicked: {}", join))),
            };

            if let Some(mut record) = tasks.get_mut(&id) {
                record.updated_at = Utc::now();
                match outcome {
                    Ok(value) => {
                        record.status = TaskStatus::Completed;
                        record.progress = 100;
                        record.message = "Completed".to_string();
                        record.result = Some(value);
                    }
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Task failed");
                        record.status = TaskStatus::Failed;
                        record.message = "Failed".to_string();
                        record.error = Some(e.user_message().to_string());
                    }
                }
            }
        });
        id
    }

    pub fn get(&self, id: Uuid) -> Result<TaskRecord> {
        self.tasks
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ForgeError::task_not_found(id))
    }

    /// Newest first.
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.tasks.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    fn prune(&self) {
        let cutoff = Utc::now() - ChronoDuration::minutes(RETENTION_MINUTES);
        self.tasks
            .retain(|_, record| !(record.status.is_finished() && record.updated_at < cutoff));
    }
}
