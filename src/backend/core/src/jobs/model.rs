//! Job definitions, executions and the request shapes used to create and
//! update them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ForgeError;

/// Persisted job identifier.
pub type JobId = i64;

/// Persisted execution identifier.
pub type ExecutionId = i64;

// ═══════════════════════════════════════════════════════════════════════════════
// Enumerations
// ═══════════════════════════════════════════════════════════════════════════════

/// How a job is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// Only runs when invoked explicitly
    #[default]
    Manual,
    /// Fires once at `schedule_config.run_date`
    Once,
    /// Fires every `schedule_config.interval_seconds`
    Interval,
    /// Fires on a five-field cron expression
    Cron,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Once => "once",
            Self::Interval => "interval",
            Self::Cron => "cron",
        }
    }

    /// Interval and cron jobs keep firing after a run.
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Interval | Self::Cron)
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "once" => Ok(Self::Once),
            "interval" => Ok(Self::Interval),
            "cron" => Ok(Self::Cron),
            other => Err(ForgeError::invalid_schedule(format!(
                "Unknown schedule_type '{}' (expected manual, once, interval or cron)",
                other
            ))),
        }
    }
}

/// Status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ForgeError::internal(format!("unknown execution status '{}'", other))),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTrigger {
    Manual,
    Scheduled,
    Retry,
}

impl ExecutionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Retry => "retry",
        }
    }
}

impl FromStr for ExecutionTrigger {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "retry" => Ok(Self::Retry),
            other => Err(ForgeError::internal(format!("unknown execution trigger '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch Target
// ═══════════════════════════════════════════════════════════════════════════════

/// The single path an execution takes, resolved from a job definition.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchTarget {
    /// A registered handler, looked up by name
    Function { name: String },
    /// An HTTP call, absolute or relative to the service base URL
    Http {
        endpoint: String,
        method: String,
        headers: HashMap<String, String>,
        body: Option<Value>,
    },
    /// A script run under the module's environment interpreter
    Script { path: String },
}

impl DispatchTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Function { .. } => "function",
            Self::Http { .. } => "http",
            Self::Script { .. } => "script",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduled Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted definition of recurring or on-demand work plus its runtime
/// bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub module: Option<String>,
    pub job_type: Option<String>,

    pub function_name: Option<String>,
    pub api_endpoint: Option<String>,
    pub http_method: String,
    pub http_headers: HashMap<String, String>,
    pub http_body: Option<Value>,
    pub script_path: Option<String>,
    pub parameters: Value,

    pub schedule_type: ScheduleType,
    pub schedule_config: Value,
    pub is_active: bool,

    pub retry_enabled: bool,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub retry_backoff: bool,
    pub failover_enabled: bool,

    pub is_running: bool,
    pub current_execution_id: Option<ExecutionId>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
    pub last_result: Option<Value>,
    pub last_error: Option<String>,
    pub run_count: i64,
    pub success_count: i64,
    pub failure_count: i64,

    /// Failed attempts since the last success; drives retry backoff
    pub retry_attempt: u32,
    /// When the pending retry fires, if one is armed
    pub retry_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Resolve the dispatch target: function, then HTTP, then script.
    pub fn dispatch_target(&self) -> Option<DispatchTarget> {
        if let Some(name) = non_empty(&self.function_name) {
            return Some(DispatchTarget::Function { name: name.to_string() });
        }
        if let Some(endpoint) = non_empty(&self.api_endpoint) {
            return Some(DispatchTarget::Http {
                endpoint: endpoint.to_string(),
                method: self.http_method.clone(),
                headers: self.http_headers.clone(),
                body: self.http_body.clone(),
            });
        }
        non_empty(&self.script_path).map(|path| DispatchTarget::Script { path: path.to_string() })
    }

    /// Whether the job should hold a registration in the trigger engine.
    pub fn wants_trigger(&self) -> bool {
        self.is_active && self.schedule_type != ScheduleType::Manual
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Execution
// ═══════════════════════════════════════════════════════════════════════════════

/// One concrete run of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    /// Name of the job at the time it ran
    pub job_name: String,
    pub status: ExecutionStatus,
    pub trigger: ExecutionTrigger,
    /// 0 for the first attempt, n for the n-th retry
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════════

/// Payload for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,

    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    #[serde(default = "default_http_method")]
    pub http_method: String,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
    #[serde(default)]
    pub http_body: Option<Value>,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default = "empty_object")]
    pub parameters: Value,

    #[serde(default)]
    pub schedule_type: ScheduleType,
    #[serde(default = "empty_object")]
    pub schedule_config: Value,
    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub retry_enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_true")]
    pub retry_backoff: bool,
    #[serde(default)]
    pub failover_enabled: bool,
}

impl NewJob {
    /// A manual job with nothing but a name; targets are filled in by the caller.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            module: None,
            job_type: None,
            function_name: None,
            api_endpoint: None,
            http_method: default_http_method(),
            http_headers: HashMap::new(),
            http_body: None,
            script_path: None,
            parameters: empty_object(),
            schedule_type: ScheduleType::Manual,
            schedule_config: empty_object(),
            is_active: true,
            retry_enabled: false,
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            retry_backoff: true,
            failover_enabled: false,
        }
    }

    /// Materialize a job with fresh runtime state. The id is assigned on insert.
    pub fn into_job(self, now: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob {
            id: 0,
            name: self.name.trim().to_string(),
            description: self.description,
            module: self.module,
            job_type: self.job_type,
            function_name: self.function_name,
            api_endpoint: self.api_endpoint,
            http_method: self.http_method.to_uppercase(),
            http_headers: self.http_headers,
            http_body: self.http_body,
            script_path: self.script_path,
            parameters: self.parameters,
            schedule_type: self.schedule_type,
            schedule_config: self.schedule_config,
            is_active: self.is_active,
            retry_enabled: self.retry_enabled,
            max_retries: self.max_retries,
            retry_delay_seconds: self.retry_delay_seconds,
            retry_backoff: self.retry_backoff,
            failover_enabled: self.failover_enabled,
            is_running: false,
            current_execution_id: None,
            last_run_at: None,
            next_run_at: None,
            last_status: None,
            last_result: None,
            last_error: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            retry_attempt: 0,
            retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a job definition.
///
/// Absent fields are left alone. For nullable fields an explicit `null`
/// clears the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub module: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub job_type: Option<Option<String>>,

    #[serde(default, deserialize_with = "double_option")]
    pub function_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub api_endpoint: Option<Option<String>>,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub http_headers: Option<HashMap<String, String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub http_body: Option<Option<Value>>,
    #[serde(default, deserialize_with = "double_option")]
    pub script_path: Option<Option<String>>,
    #[serde(default)]
    pub parameters: Option<Value>,

    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default)]
    pub schedule_config: Option<Value>,
    #[serde(default)]
    pub is_active: Option<bool>,

    #[serde(default)]
    pub retry_enabled: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_seconds: Option<u64>,
    #[serde(default)]
    pub retry_backoff: Option<bool>,
    #[serde(default)]
    pub failover_enabled: Option<bool>,
}

impl JobUpdate {
    /// Apply the definition changes onto `job`. Runtime state is untouched.
    pub fn apply(self, job: &mut ScheduledJob) {
        if let Some(v) = self.name {
            job.name = v.trim().to_string();
        }
        if let Some(v) = self.description {
            job.description = v;
        }
        if let Some(v) = self.module {
            job.module = v;
        }
        if let Some(v) = self.job_type {
            job.job_type = v;
        }
        if let Some(v) = self.function_name {
            job.function_name = v;
        }
        if let Some(v) = self.api_endpoint {
            job.api_endpoint = v;
        }
        if let Some(v) = self.http_method {
            job.http_method = v.to_uppercase();
        }
        if let Some(v) = self.http_headers {
            job.http_headers = v;
        }
        if let Some(v) = self.http_body {
            job.http_body = v;
        }
        if let Some(v) = self.script_path {
            job.script_path = v;
        }
        if let Some(v) = self.parameters {
            job.parameters = v;
        }
        if let Some(v) = self.schedule_type {
            job.schedule_type = v;
        }
        if let Some(v) = self.schedule_config {
            job.schedule_config = v;
        }
        if let Some(v) = self.is_active {
            job.is_active = v;
        }
        if let Some(v) = self.retry_enabled {
            job.retry_enabled = v;
        }
        if let Some(v) = self.max_retries {
            job.max_retries = v;
        }
        if let Some(v) = self.retry_delay_seconds {
            job.retry_delay_seconds = v;
        }
        if let Some(v) = self.retry_backoff {
            job.retry_backoff = v;
        }
        if let Some(v) = self.failover_enabled {
            job.failover_enabled = v;
        }
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default)]
    pub module: Option<String>,
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_priority_function_first() {
        let mut new = NewJob::named("x");
        new.function_name = Some("system.purge_execution_history".into());
        new.api_endpoint = Some("/api/health".into());
        new.script_path = Some("run.py".into());
        let job = new.into_job(Utc::now());
        assert_eq!(job.dispatch_target().map(|t| t.kind()), Some("function"));
    }

    #[test]
    fn test_blank_targets_are_ignored() {
        let mut new = NewJob::named("x");
        new.function_name = Some("   ".into());
        new.script_path = Some("sync.py".into());
        let job = new.into_job(Utc::now());
        assert_eq!(
            job.dispatch_target(),
            Some(DispatchTarget::Script { path: "sync.py".into() })
        );

        let empty = NewJob::named("y").into_job(Utc::now());
        assert!(empty.dispatch_target().is_none());
    }

    #[test]
    fn test_new_job_defaults_from_json() {
        let new: NewJob = serde_json::from_value(json!({ "name": "nightly" })).unwrap();
        assert_eq!(new.schedule_type, ScheduleType::Manual);
        assert!(new.is_active);
        assert_eq!(new.http_method, "GET");
        assert_eq!(new.max_retries, 3);
    }

    #[test]
    fn test_update_distinguishes_null_from_absent() {
        let mut job = NewJob::named("x").into_job(Utc::now());
        job.description = Some("keep".into());
        job.api_endpoint = Some("/api/health".into());

        let update: JobUpdate =
            serde_json::from_value(json!({ "api_endpoint": null, "schedule_type": "interval" })).unwrap();
        update.apply(&mut job);

        assert_eq!(job.description.as_deref(), Some("keep"));
        assert!(job.api_endpoint.is_none());
        assert_eq!(job.schedule_type, ScheduleType::Interval);
    }

    #[test]
    fn test_wants_trigger() {
        let mut job = NewJob::named("x").into_job(Utc::now());
        assert!(!job.wants_trigger());
        job.schedule_type = ScheduleType::Cron;
        assert!(job.wants_trigger());
        job.is_active = false;
        assert!(!job.wants_trigger());
    }
}
