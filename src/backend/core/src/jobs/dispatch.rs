//! Execution dispatch: handler table, HTTP calls and scripts.
//!
//! Function targets resolve through a [`HandlerRegistry`] populated at
//! startup, keyed by function name or by `(module, job_type)`. There is no
//! lookup by reflection.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::model::{DispatchTarget, ExecutionId, ScheduledJob};
use crate::environments::EnvironmentStore;
use crate::error::{ErrorCode, ForgeError, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::telemetry::SensitiveFieldRedactor;

/// Most output kept in an error message from a failed script or request.
const MAX_ERROR_OUTPUT: usize = 4000;

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// What a running execution can see of itself.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub job: ScheduledJob,
    pub execution_id: ExecutionId,
    pub attempt: u32,
    cancel: watch::Receiver<bool>,
}

impl DispatchContext {
    pub fn new(job: ScheduledJob, execution_id: ExecutionId, attempt: u32, cancel: watch::Receiver<bool>) -> Self {
        Self {
            job,
            execution_id,
            attempt,
            cancel,
        }
    }

    /// The job's stored keyword parameters.
    pub fn parameters(&self) -> &Value {
        &self.job.parameters
    }

    /// Typed parameter lookup.
    pub fn param<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.job
            .parameters
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Whether the execution was stopped. Long-running handlers should check
    /// this between units of work.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the execution is stopped.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow() {
            if self.cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A statically registered job body.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &DispatchContext) -> Result<Value>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(DispatchContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    async fn run(&self, ctx: &DispatchContext) -> Result<Value> {
        (self.0)(ctx.clone()).await
    }
}

/// Capability table mapping names and `(module, job_type)` to handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    by_name: HashMap<String, Arc<dyn JobHandler>>,
    by_kind: HashMap<(String, String), Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.by_name.insert(name.into(), handler);
        self
    }

    pub fn register_for(
        &mut self,
        module: impl Into<String>,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        self.by_kind.insert((module.into(), job_type.into()), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.by_name.get(name).cloned()
    }

    pub fn get_for(&self, module: &str, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.by_kind
            .get(&(module.to_string(), job_type.to_string()))
            .cloned()
    }

    /// Handler registered for the job's `(module, job_type)`, if any.
    pub fn for_job(&self, job: &ScheduledJob) -> Option<Arc<dyn JobHandler>> {
        match (job.module.as_deref(), job.job_type.as_deref()) {
            (Some(module), Some(job_type)) => self.get_for(module, job_type),
            _ => None,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the HTTP and script paths.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Relative endpoints resolve against this
    pub base_url: String,
    pub http_timeout: Duration,
    pub default_python: String,
    pub script_timeout: Duration,
    /// Relative script paths resolve against this
    pub scripts_dir: PathBuf,
}

/// Runs one execution along its resolved path.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    http: reqwest::Client,
    runner: Arc<dyn CommandRunner>,
    environments: Arc<EnvironmentStore>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        runner: Arc<dyn CommandRunner>,
        environments: Arc<EnvironmentStore>,
        config: DispatchConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            handlers,
            http,
            runner,
            environments,
            config,
        })
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Run the job's target. Function, then HTTP, then script; a registered
    /// `(module, job_type)` handler is used when no target is set.
    pub async fn dispatch(&self, ctx: &DispatchContext) -> Result<Value> {
        let job = &ctx.job;
        match job.dispatch_target() {
            Some(DispatchTarget::Function { name }) => {
                let handler = self
                    .handlers
                    .get(&name)
                    .or_else(|| self.handlers.for_job(job))
                    .ok_or_else(|| {
                        ForgeError::new(
                            ErrorCode::HandlerNotFound,
                            format!("No handler registered for '{}'", name),
                        )
                        .with_context("registered", self.handlers.names())
                    })?;
                debug!(job_id = job.id, function = %name, "Dispatching to handler");
                handler.run(ctx).await
            }
            Some(DispatchTarget::Http { endpoint, method, headers, body }) => {
                self.dispatch_http(ctx, &endpoint, &method, &headers, body).await
            }
            Some(DispatchTarget::Script { path }) => self.dispatch_script(ctx, &path).await,
            None => match self.handlers.for_job(job) {
                Some(handler) => handler.run(ctx).await,
                None => Err(ForgeError::missing_dispatch_target(&job.name)),
            },
        }
    }

    /// Absolute URLs pass through; anything else is joined to the base URL.
    pub fn resolve_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    async fn dispatch_http(
        &self,
        ctx: &DispatchContext,
        endpoint: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = self.resolve_url(endpoint);
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ForgeError::validation(format!("Unsupported http_method '{}'", method)))?;

        info!(
            job_id = ctx.job.id,
            execution_id = ctx.execution_id,
            %method,
            %url,
            headers = ?SensitiveFieldRedactor::global().redact_map(headers),
            "Dispatching HTTP job"
        );

        let mut request = self.http.request(method.clone(), &url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(&body);
        } else if method != reqwest::Method::GET && has_parameters(&ctx.job.parameters) {
            request = request.json(&ctx.job.parameters);
        }

        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            ForgeError::dispatch_failed(format!("Request to {} failed: {}", url, e)).with_source(e)
        })?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));

        if !status.is_success() {
            return Err(ForgeError::dispatch_failed(format!(
                "HTTP {} from {}: {}",
                status.as_u16(),
                url,
                truncate(&text, MAX_ERROR_OUTPUT)
            ))
            .with_context("status_code", status.as_u16()));
        }

        Ok(json!({
            "status_code": status.as_u16(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "body": body,
        }))
    }

    async fn dispatch_script(&self, ctx: &DispatchContext, path: &str) -> Result<Value> {
        let job = &ctx.job;
        let script = self.resolve_script(path);
        if !script.is_file() {
            return Err(ForgeError::dispatch_failed(format!(
                "Script not found: {}",
                script.display()
            )));
        }

        let interpreter = job
            .module
            .as_deref()
            .and_then(|module| self.environments.python_for(module))
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| self.config.default_python.clone());

        let spec = CommandSpec::new(interpreter, self.config.script_timeout)
            .arg(script.display().to_string())
            .env("RUNFORGE_JOB_ID", job.id.to_string())
            .env("RUNFORGE_EXECUTION_ID", ctx.execution_id.to_string())
            .env("PYTHONUNBUFFERED", "1")
            .stdin(serde_json::to_vec(&job.parameters)?);
        let spec = match script.parent() {
            Some(dir) => spec.cwd(dir),
            None => spec,
        };

        info!(job_id = job.id, execution_id = ctx.execution_id, command = %spec.display(), "Running job script");
        let output = self.runner.run(spec).await?;

        if !output.success() {
            warn!(job_id = job.id, exit_code = output.exit_code, "Job script failed");
            return Err(ForgeError::dispatch_failed(format!(
                "Script exited with code {}\nstdout:\n{}\nstderr:\n{}",
                output.exit_code,
                truncate(&output.stdout, MAX_ERROR_OUTPUT),
                truncate(&output.stderr, MAX_ERROR_OUTPUT)
            ))
            .with_context("exit_code", output.exit_code));
        }

        let parsed = serde_json::from_str::<Value>(output.stdout.trim()).ok();
        Ok(json!({
            "exit_code": output.exit_code,
            "duration_ms": output.duration_ms,
            "output": parsed,
            "stdout": truncate(&output.stdout, MAX_ERROR_OUTPUT),
            "stderr": truncate(&output.stderr, MAX_ERROR_OUTPUT),
        }))
    }

    fn resolve_script(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.config.scripts_dir.join(p)
        }
    }
}

fn has_parameters(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

/// Keep the tail of `s`, which is where errors usually are.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentsConfig;
    use crate::jobs::model::NewJob;
    use crate::process::{ProcessError, ProcessOutput};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<CommandSpec>>,
        exit_code: i32,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: CommandSpec) -> std::result::Result<ProcessOutput, ProcessError> {
            self.calls.lock().push(spec);
            Ok(ProcessOutput {
                stdout: "{\"rows\": 3}".into(),
                stderr: "warn".into(),
                exit_code: self.exit_code,
                duration_ms: 5,
            })
        }
    }

    fn dispatcher(dir: &Path, runner: Arc<RecordingRunner>, handlers: HandlerRegistry) -> Dispatcher {
        let envs = Arc::new(EnvironmentStore::new(
            dir.join("providers"),
            EnvironmentsConfig::default(),
            runner.clone(),
        ));
        Dispatcher::new(
            Arc::new(handlers),
            runner,
            envs,
            DispatchConfig {
                base_url: "http://127.0.0.1:8089/".into(),
                http_timeout: Duration::from_secs(5),
                default_python: "python3".into(),
                script_timeout: Duration::from_secs(60),
                scripts_dir: dir.to_path_buf(),
            },
        )
        .unwrap()
    }

    fn ctx(job: ScheduledJob) -> DispatchContext {
        let (_tx, rx) = watch::channel(false);
        DispatchContext::new(job, 1, 0, rx)
    }

    #[test]
    fn test_resolve_url() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), Arc::default(), HandlerRegistry::new());
        assert_eq!(d.resolve_url("/api/health"), "http://127.0.0.1:8089/api/health");
        assert_eq!(d.resolve_url("api/health"), "http://127.0.0.1:8089/api/health");
        assert_eq!(d.resolve_url("https://example.com/x"), "https://example.com/x");
    }

    #[tokio::test]
    async fn test_function_dispatch_uses_handler_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "rag.sync",
            Arc::new(FnHandler(|ctx: DispatchContext| async move {
                Ok(json!({ "limit": ctx.param::<u32>("limit") }))
            })),
        );
        let d = dispatcher(dir.path(), Arc::default(), handlers);

        let mut new = NewJob::named("sync");
        new.function_name = Some("rag.sync".into());
        new.parameters = json!({ "limit": 5 });
        let out = d.dispatch(&ctx(new.into_job(Utc::now()))).await.unwrap();
        assert_eq!(out, json!({ "limit": 5 }));
    }

    #[tokio::test]
    async fn test_unknown_function_fails() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), Arc::default(), HandlerRegistry::new());
        let mut new = NewJob::named("x");
        new.function_name = Some("nope".into());
        let err = d.dispatch(&ctx(new.into_job(Utc::now()))).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerNotFound);
    }

    #[tokio::test]
    async fn test_kind_handler_when_no_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut handlers = HandlerRegistry::new();
        handlers.register_for(
            "rag",
            "rag_sync",
            Arc::new(FnHandler(|_ctx: DispatchContext| async { Ok(json!("synced")) })),
        );
        let d = dispatcher(dir.path(), Arc::default(), handlers);

        let mut new = NewJob::named("nightly-sync");
        new.module = Some("rag".into());
        new.job_type = Some("rag_sync".into());
        assert_eq!(d.dispatch(&ctx(new.into_job(Utc::now()))).await.unwrap(), json!("synced"));

        let bare = NewJob::named("bare").into_job(Utc::now());
        let err = d.dispatch(&ctx(bare)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingDispatchTarget);
    }

    #[tokio::test]
    async fn test_script_dispatch_passes_params_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sync.py"), "print('hi')").unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let d = dispatcher(dir.path(), runner.clone(), HandlerRegistry::new());

        let mut new = NewJob::named("script");
        new.script_path = Some("sync.py".into());
        new.parameters = json!({ "a": 1 });
        let mut job = new.into_job(Utc::now());
        job.id = 12;

        let out = d.dispatch(&ctx(job)).await.unwrap();
        assert_eq!(out["output"], json!({ "rows": 3 }));

        let calls = runner.calls.lock();
        assert_eq!(calls[0].program, "python3");
        assert_eq!(calls[0].env["RUNFORGE_JOB_ID"], "12");
        assert_eq!(calls[0].env["RUNFORGE_EXECUTION_ID"], "1");
        assert_eq!(calls[0].stdin.as_deref(), Some(&b"{\"a\":1}"[..]));
    }

    #[tokio::test]
    async fn test_script_nonzero_exit_fails_with_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fail.py"), "").unwrap();
        let runner = Arc::new(RecordingRunner { exit_code: 2, ..Default::default() });
        let d = dispatcher(dir.path(), runner, HandlerRegistry::new());

        let mut new = NewJob::named("script");
        new.script_path = Some("fail.py".into());
        let err = d.dispatch(&ctx(new.into_job(Utc::now()))).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DispatchFailed);
        assert!(err.user_message().contains("code 2"));
        assert!(err.user_message().contains("warn"));
    }

    #[test]
    fn test_truncate_keeps_tail() {
        assert_eq!(truncate("abcdef", 3), "...def");
        assert_eq!(truncate("ab", 3), "ab");
    }

    #[tokio::test]
    async fn test_cancel_signal_is_visible() {
        let (tx, rx) = watch::channel(false);
        let mut c = DispatchContext::new(NewJob::named("x").into_job(Utc::now()), 1, 0, rx);
        assert!(!c.is_cancelled());
        tx.send(true).unwrap();
        c.cancelled().await;
        assert!(c.is_cancelled());
    }
}
