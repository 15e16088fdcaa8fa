use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::packages::{dir_size, installed_distributions, is_file_lock_error, tail};
use super::{
    interpreter_path, is_valid_name, normalize_package_name, spec_package_name, validate_name,
    Environment, PackageInfo, PackageInstallReport, ScriptOutput,
};
use crate::config::EnvironmentsConfig;
use crate::error::{ErrorCode, ForgeError, Result};
use crate::process::{CommandRunner, CommandSpec, ProcessError, ProcessOutput};
use crate::telemetry::metrics::InstallMetrics;

const ERROR_TAIL: usize = 2000;

/// Environments rooted at the providers directory.
pub struct EnvironmentStore {
    root: PathBuf,
    config: EnvironmentsConfig,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for EnvironmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl EnvironmentStore {
    pub fn new(root: impl Into<PathBuf>, config: EnvironmentsConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.into(),
            config,
            runner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EnvironmentsConfig {
        &self.config
    }

    pub(super) fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn env_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Interpreter of `name`, if that environment exists and is usable.
    pub fn python_for(&self, name: &str) -> Option<PathBuf> {
        if !is_valid_name(name) {
            return None;
        }
        let python = interpreter_path(&self.env_dir(name));
        python.is_file().then_some(python)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    #[instrument(skip(self), fields(environment = %name))]
    pub async fn create(&self, name: &str) -> Result<Environment> {
        validate_name(name)?;
        let dir = self.env_dir(name);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(ForgeError::environment_exists(name));
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let spec = CommandSpec::new(&self.config.base_python, self.config.pip_timeout)
            .args(["-m", "venv"])
            .arg(dir.to_string_lossy());
        let result = self.runner.run(spec).await;

        let failure = match result {
            Ok(output) if output.success() => None,
            Ok(output) => Some(ForgeError::new(
                ErrorCode::SubprocessFailed,
                format!("Failed to create environment '{}': {}", name, tail(&output.stderr, ERROR_TAIL)),
            )),
            Err(e) if e.is_not_found() => Some(ForgeError::new(
                ErrorCode::InterpreterMissing,
                format!("Base interpreter '{}' not found", self.config.base_python),
            )),
            Err(e) => Some(e.into()),
        };
        let failure = failure.or_else(|| {
            (!interpreter_path(&dir).is_file()).then(|| {
                ForgeError::new(
                    ErrorCode::InterpreterMissing,
                    format!("Environment '{}' was created without an interpreter", name),
                )
            })
        });
        if let Some(error) = failure {
            // Leave nothing half-created behind.
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(error);
        }

        self.upgrade_pip(&dir).await;
        info!(path = %dir.display(), "Environment created");
        self.get(name).await
    }

    pub async fn list(&self) -> Result<Vec<Environment>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
            if is_valid_name(&name) && interpreter_path(&entry.path()).is_file() {
                names.push(name);
            }
        }
        names.sort();

        let mut environments = Vec::with_capacity(names.len());
        for name in names {
            environments.push(self.describe(&name).await?);
        }
        Ok(environments)
    }

    pub async fn get(&self, name: &str) -> Result<Environment> {
        validate_name(name)?;
        if self.python_for(name).is_none() {
            return Err(ForgeError::environment_not_found(name));
        }
        self.describe(name).await
    }

    #[instrument(skip(self), fields(environment = %name))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let env = self.get(name).await?;
        tokio::fs::remove_dir_all(&env.path).await?;
        info!("Environment deleted");
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<Environment> {
        let dir = self.env_dir(name);
        let scan_dir = dir.clone();
        let (package_count, size_bytes) = tokio::task::spawn_blocking(move || {
            (installed_distributions(&scan_dir).len(), dir_size(&scan_dir))
        })
        .await
        .map_err(|e| ForgeError::internal(format!("environment scan panicked: {}", e)))?;

        Ok(Environment {
            name: name.to_string(),
            python_path: interpreter_path(&dir),
            path: dir,
            package_count,
            size_bytes,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Packages
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn list_packages(&self, name: &str) -> Result<Vec<PackageInfo>> {
        let env = self.get(name).await?;
        let output = self
            .pip(&env.python_path, ["list", "--format=json"], Duration::from_secs(120))
            .await?;
        if !output.success() {
            return Err(ForgeError::new(
                ErrorCode::SubprocessFailed,
                format!("pip list failed: {}", tail(&output.stderr, ERROR_TAIL)),
            ));
        }
        Ok(serde_json::from_str(output.stdout.trim())?)
    }

    /// Checks `.dist-info` directories, without starting Python.
    pub async fn has_package(&self, name: &str, package: &str) -> Result<bool> {
        let wanted = normalize_package_name(spec_package_name(package));
        Ok(self.installed_distributions(name).await?.contains(&wanted))
    }

    /// Normalized names of every distribution installed in `name`.
    pub async fn installed_distributions(&self, name: &str) -> Result<BTreeSet<String>> {
        let env = self.get(name).await?;
        tokio::task::spawn_blocking(move || installed_distributions(&env.path))
            .await
            .map_err(|e| ForgeError::internal(format!("package scan panicked: {}", e)))
    }

    #[instrument(skip(self, specs), fields(environment = %name, count = specs.len()))]
    pub async fn install_packages(&self, name: &str, specs: &[String]) -> Result<PackageInstallReport> {
        let env = self.get(name).await?;
        self.upgrade_pip(&env.path).await;

        let mut report = PackageInstallReport::default();
        for spec in specs {
            let args = vec!["install".to_string(), spec.clone()];
            match self.pip_with_lock_retry(&env.python_path, &args, &[]).await {
                Ok(()) => {
                    debug!(package = %spec, "Package installed");
                    InstallMetrics::record_package(true);
                    report.installed.push(spec.clone());
                }
                Err(message) => {
                    warn!(package = %spec, error = %message, "Package install failed");
                    InstallMetrics::record_package(false);
                    report.failed.push(spec.clone());
                    report.errors.insert(spec.clone(), message);
                }
            }
        }
        report.success = report.failed.is_empty();
        info!(
            installed = report.installed.len(),
            failed = report.failed.len(),
            "Package install finished"
        );
        Ok(report)
    }

    pub async fn uninstall_packages(&self, name: &str, specs: &[String]) -> Result<PackageInstallReport> {
        let env = self.get(name).await?;
        let mut report = PackageInstallReport::default();
        for spec in specs {
            let output = self
                .pip(&env.python_path, ["uninstall", "-y", spec.as_str()], self.config.pip_timeout)
                .await;
            match output {
                Ok(output) if output.success() => report.installed.push(spec.clone()),
                Ok(output) => {
                    report.failed.push(spec.clone());
                    report.errors.insert(spec.clone(), tail(&output.stderr, ERROR_TAIL));
                }
                Err(e) => {
                    report.failed.push(spec.clone());
                    report.errors.insert(spec.clone(), e.to_string());
                }
            }
        }
        report.success = report.failed.is_empty();
        Ok(report)
    }

    /// Run `script` with the environment's interpreter. A non-zero exit is a
    /// value, not an error.
    pub async fn run_script(&self, name: &str, script: &Path, args: &[String]) -> Result<ScriptOutput> {
        let env = self.get(name).await?;
        let mut spec = CommandSpec::new(env.python_path.to_string_lossy(), self.config.script_timeout)
            .arg(script.to_string_lossy())
            .args(args.iter().cloned())
            .env("PYTHONUNBUFFERED", "1");
        if let Some(parent) = script.parent().filter(|p| !p.as_os_str().is_empty()) {
            spec = spec.cwd(parent);
        }
        let output = self.runner.run(spec).await?;
        Ok(ScriptOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            returncode: output.exit_code,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // pip plumbing
    // ═══════════════════════════════════════════════════════════════════════════

    async fn pip<'a>(
        &self,
        python: &Path,
        args: impl IntoIterator<Item = &'a str>,
        timeout: Duration,
    ) -> std::result::Result<ProcessOutput, ProcessError> {
        let spec = CommandSpec::new(python.to_string_lossy(), timeout)
            .args(["-m", "pip"])
            .args(args)
            .arg("--disable-pip-version-check");
        self.runner.run(spec).await
    }

    /// Best effort; an old pip still installs most wheels.
    async fn upgrade_pip(&self, env_dir: &Path) {
        let python = interpreter_path(env_dir);
        match self
            .pip(&python, ["install", "--upgrade", "pip"], self.config.pip_timeout)
            .await
        {
            Ok(output) if output.success() => debug!("pip upgraded"),
            Ok(output) => warn!(stderr = %tail(&output.stderr, 500), "pip upgrade failed"),
            Err(e) => warn!(error = %e, "pip upgrade failed"),
        }
    }

    /// One pip invocation, retried with linear backoff only while the
    /// failure looks like a Windows file lock. Returns the error text.
    pub(super) async fn pip_with_lock_retry(
        &self,
        python: &Path,
        args: &[String],
        env: &[(&str, String)],
    ) -> std::result::Result<(), String> {
        let attempts = self.config.install_retries.max(1);
        let mut attempt = 1;
        loop {
            let mut spec = CommandSpec::new(python.to_string_lossy(), self.config.pip_timeout)
                .args(["-m", "pip"])
                .args(args.iter().cloned())
                .arg("--disable-pip-version-check");
            for (key, value) in env {
                spec = spec.env(*key, value.clone());
            }

            let output = match self.runner.run(spec).await {
                Ok(output) => output,
                Err(e) => return Err(e.to_string()),
            };
            if output.success() {
                return Ok(());
            }
            if attempt < attempts && is_file_lock_error(&output.stderr) {
                let delay = self.config.retry_delay * attempt;
                warn!(attempt, delay_ms = delay.as_millis() as u64, "File locked during pip install, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            let stderr = if output.stderr.trim().is_empty() { &output.stdout } else { &output.stderr };
            return Err(tail(stderr, ERROR_TAIL));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Creates the interpreter on `-m venv`, replays queued pip results.
    #[derive(Default)]
    pub(crate) struct FakePython {
        pub calls: Mutex<Vec<CommandSpec>>,
        pub pip_results: Mutex<VecDeque<ProcessOutput>>,
    }

    impl FakePython {
        pub fn queue(&self, exit_code: i32, stdout: &str, stderr: &str) {
            self.pip_results.lock().push_back(ProcessOutput {
                stdout: stdout.into(),
                stderr: stderr.into(),
                exit_code,
                duration_ms: 1,
            });
        }

        pub fn install_calls(&self) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.args.get(2).map(String::as_str) == Some("install"))
                .filter(|c| c.args.get(3).map(String::as_str) != Some("--upgrade"))
                .map(|c| c.args.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for FakePython {
        async fn run(&self, spec: CommandSpec) -> std::result::Result<ProcessOutput, ProcessError> {
            self.calls.lock().push(spec.clone());
            if spec.args.first().map(String::as_str) == Some("-m") && spec.args.get(1).map(String::as_str) == Some("venv") {
                let dir = PathBuf::from(&spec.args[2]);
                let python = interpreter_path(&dir);
                std::fs::create_dir_all(python.parent().unwrap()).unwrap();
                std::fs::write(&python, b"").unwrap();
                return Ok(ProcessOutput::default());
            }
            let is_upgrade = spec.args.iter().any(|a| a == "--upgrade");
            if is_upgrade {
                return Ok(ProcessOutput::default());
            }
            Ok(self.pip_results.lock().pop_front().unwrap_or_default())
        }
    }

    pub(crate) fn store(root: &Path, runner: Arc<FakePython>) -> EnvironmentStore {
        let config = EnvironmentsConfig {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        EnvironmentStore::new(root.join("providers"), config, runner)
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let store = store(dir.path(), runner);

        let env = store.create("chat-model").await.unwrap();
        assert!(env.python_path.is_file());
        assert!(store.python_for("chat-model").is_some());

        // A directory without an interpreter is not an environment.
        std::fs::create_dir_all(store.root().join("stray")).unwrap();
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["chat-model"]);

        let err = store.create("chat-model").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EnvironmentExists);
    }

    #[tokio::test]
    async fn test_missing_environment() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), Arc::new(FakePython::default()));
        assert!(store.list().await.unwrap().is_empty());
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EnvironmentNotFound);
        let err = store.install_packages("nope", &["numpy".into()]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EnvironmentNotFound);
    }

    #[tokio::test]
    async fn test_partial_install_report() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let store = store(dir.path(), runner.clone());
        store.create("docs").await.unwrap();

        runner.queue(0, "", "");
        runner.queue(1, "", "ERROR: No matching distribution found for not-a-package");
        let report = store
            .install_packages("docs", &["pypdf".into(), "not-a-package".into()])
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.installed, vec!["pypdf"]);
        assert_eq!(report.failed, vec!["not-a-package"]);
        assert!(report.errors["not-a-package"].contains("No matching distribution"));
    }

    #[tokio::test]
    async fn test_file_lock_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let store = store(dir.path(), runner.clone());
        store.create("ocr").await.unwrap();

        runner.queue(1, "", "OSError: [WinError 32] being used by another process");
        runner.queue(0, "", "");
        let report = store.install_packages("ocr", &["pytesseract".into()]).await.unwrap();

        assert!(report.success);
        assert_eq!(runner.install_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_other_failures_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let store = store(dir.path(), runner.clone());
        store.create("ocr").await.unwrap();

        runner.queue(1, "", "ERROR: Could not build wheels");
        runner.queue(0, "", "");
        let report = store.install_packages("ocr", &["pytesseract".into()]).await.unwrap();

        assert!(!report.success);
        assert_eq!(runner.install_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_has_package_reads_dist_info() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), Arc::new(FakePython::default()));
        store.create("rag").await.unwrap();
        let site = store.env_dir("rag").join("lib").join("python3.12").join("site-packages");
        std::fs::create_dir_all(site.join("llama_cpp_python-0.3.1.dist-info")).unwrap();

        assert!(store.has_package("rag", "llama-cpp-python").await.unwrap());
        assert!(!store.has_package("rag", "torch").await.unwrap());
        assert_eq!(store.get("rag").await.unwrap().package_count, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), Arc::new(FakePython::default()));
        store.create("tmp").await.unwrap();
        store.delete("tmp").await.unwrap();
        assert!(!store.env_dir("tmp").exists());
        assert!(store.delete("tmp").await.is_err());
    }
}
