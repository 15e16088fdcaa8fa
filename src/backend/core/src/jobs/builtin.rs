//! Built-in job handlers, registered by function name at startup.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::dispatch::{DispatchContext, HandlerRegistry, JobHandler};
use super::registry::JobRegistry;
use crate::backends::BackendInstaller;
use crate::environments::EnvironmentStore;
use crate::error::Result;
use crate::toolkit::ToolkitDetector;

pub const PURGE_EXECUTION_HISTORY: &str = "system.purge_execution_history";
pub const REFRESH_TOOLKITS: &str = "toolkit.refresh";
pub const CHECK_BACKEND_UPDATES: &str = "backends.check_updates";
pub const SCAN_ENVIRONMENTS: &str = "environments.scan";

/// Handler: delete finished executions older than `retention_days`.
pub struct PurgeExecutionHistory {
    registry: JobRegistry,
    /// Used when the job does not set `retention_days`
    pub default_retention_days: u32,
}

impl PurgeExecutionHistory {
    pub fn new(registry: JobRegistry, default_retention_days: u32) -> Self {
        Self {
            registry,
            default_retention_days,
        }
    }
}

#[async_trait]
impl JobHandler for PurgeExecutionHistory {
    async fn run(&self, ctx: &DispatchContext) -> Result<Value> {
        let days: u32 = ctx.param("retention_days").unwrap_or(self.default_retention_days);
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let deleted = self.registry.purge_executions_before(cutoff).await?;
        info!(deleted, retention_days = days, "Purged execution history");
        Ok(json!({ "deleted": deleted, "cutoff": cutoff }))
    }
}

/// Handler: invalidate the toolkit cache and probe every toolkit again.
pub struct RefreshToolkits {
    detector: ToolkitDetector,
}

impl RefreshToolkits {
    pub fn new(detector: ToolkitDetector) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl JobHandler for RefreshToolkits {
    async fn run(&self, _ctx: &DispatchContext) -> Result<Value> {
        self.detector.clear_cache();
        let statuses = self.detector.detect_all(true).await;
        let available: Vec<&str> = statuses
            .iter()
            .filter(|(_, s)| s.available)
            .map(|(b, _)| b.as_str())
            .collect();
        Ok(json!({ "available": available, "toolkits": statuses }))
    }
}

/// Handler: report installed backends whose release tag is behind.
pub struct CheckBackendUpdates {
    installer: Arc<BackendInstaller>,
}

impl CheckBackendUpdates {
    pub fn new(installer: Arc<BackendInstaller>) -> Self {
        Self { installer }
    }
}

#[async_trait]
impl JobHandler for CheckBackendUpdates {
    async fn run(&self, _ctx: &DispatchContext) -> Result<Value> {
        let report = self.installer.check_for_updates().await?;
        if !report.updates_available.is_empty() {
            info!(
                latest = %report.latest_version,
                outdated = report.updates_available.len(),
                "Backend updates available"
            );
        }
        Ok(serde_json::to_value(report)?)
    }
}

/// Handler: list environments with their package counts.
pub struct ScanEnvironments {
    environments: Arc<EnvironmentStore>,
}

impl ScanEnvironments {
    pub fn new(environments: Arc<EnvironmentStore>) -> Self {
        Self { environments }
    }
}

#[async_trait]
impl JobHandler for ScanEnvironments {
    async fn run(&self, _ctx: &DispatchContext) -> Result<Value> {
        let environments = self.environments.list().await?;
        let summary: Vec<Value> = environments
            .iter()
            .map(|e| json!({ "name": e.name, "package_count": e.package_count, "size_bytes": e.size_bytes }))
            .collect();
        Ok(json!({ "count": environments.len(), "environments": summary }))
    }
}

/// Everything the built-in handlers need.
pub struct BuiltinDeps {
    pub registry: JobRegistry,
    pub detector: ToolkitDetector,
    pub installer: Arc<BackendInstaller>,
    pub environments: Arc<EnvironmentStore>,
    pub history_retention_days: u32,
}

pub fn register_builtin_handlers(handlers: &mut HandlerRegistry, deps: BuiltinDeps) {
    handlers
        .register(
            PURGE_EXECUTION_HISTORY,
            Arc::new(PurgeExecutionHistory::new(deps.registry, deps.history_retention_days)),
        )
        .register(REFRESH_TOOLKITS, Arc::new(RefreshToolkits::new(deps.detector)))
        .register(CHECK_BACKEND_UPDATES, Arc::new(CheckBackendUpdates::new(deps.installer)))
        .register(SCAN_ENVIRONMENTS, Arc::new(ScanEnvironments::new(deps.environments)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CompletedRun, Database};
    use crate::jobs::model::{ExecutionTrigger, NewJob};
    use tokio::sync::watch;

    #[tokio::test]
    async fn test_purge_respects_retention_parameter() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = JobRegistry::new(db);
        let mut new = NewJob::named("purger");
        new.function_name = Some(PURGE_EXECUTION_HISTORY.into());
        new.parameters = json!({ "retention_days": 0 });
        let (job, _) = registry.create(new, false).await.unwrap();

        let exec_id = match registry.begin_execution(job.id, ExecutionTrigger::Manual, 0).await.unwrap() {
            crate::db::BeginOutcome::Started(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        registry
            .complete_execution(job.id, exec_id, &CompletedRun::success(None))
            .await
            .unwrap();

        let handler = PurgeExecutionHistory::new(registry.clone(), 30);
        let (_tx, rx) = watch::channel(false);
        let ctx = DispatchContext::new(job.clone(), 0, 0, rx);
        // started_at must fall strictly before the cutoff.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let out = handler.run(&ctx).await.unwrap();
        assert_eq!(out["deleted"], 1);
        assert!(registry.list_executions(job.id, None).await.unwrap().is_empty());
    }
}
