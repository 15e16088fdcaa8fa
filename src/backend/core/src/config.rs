//! Configuration management.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file
//! (`runforge.toml`, or the path in `RUNFORGE_CONFIG`), then `RUNFORGE__*`
//! environment variables with `__` separating nested keys
//! (`RUNFORGE__SCHEDULER__TICK_INTERVAL=500ms`).

use crate::telemetry::{LoggingConfig, MetricsConfig, TelemetryConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub installer: InstallerConfig,

    #[serde(default)]
    pub environments: EnvironmentsConfig,

    #[serde(default)]
    pub toolkit: ToolkitConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base address relative HTTP job endpoints resolve against.
    /// Defaults to `http://127.0.0.1:{port}`.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: None,
        }
    }
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.port))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL. Defaults to `{data_dir}/runforge.db`.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Filesystem layout. Unset directories are derived from `data_dir`.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root of the named virtual environments
    #[serde(default)]
    pub providers_dir: Option<PathBuf>,

    /// Root of extracted accelerator backends (`{backends_dir}/{id}/installed.json`)
    #[serde(default)]
    pub backends_dir: Option<PathBuf>,

    /// Download cache for release archives
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,

    /// Holds the toolkit detection cache and other small state files
    #[serde(default)]
    pub config_dir: Option<PathBuf>,

    /// Relative job `script_path`s resolve against this directory
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            providers_dir: None,
            backends_dir: None,
            downloads_dir: None,
            config_dir: None,
            scripts_dir: None,
        }
    }
}

impl PathsConfig {
    /// Every directory rooted at `data_dir`, with no overrides.
    pub fn under(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    fn or_data(&self, value: &Option<PathBuf>, name: &str) -> PathBuf {
        value.clone().unwrap_or_else(|| self.data_dir.join(name))
    }

    pub fn providers_dir(&self) -> PathBuf {
        self.or_data(&self.providers_dir, "providers")
    }

    pub fn backends_dir(&self) -> PathBuf {
        self.or_data(&self.backends_dir, "backends")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.or_data(&self.downloads_dir, "downloads")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.or_data(&self.config_dir, "config")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.or_data(&self.scripts_dir, "scripts")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// When false the scheduler starts in registry-only mode
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Upper bound on how long the trigger engine sleeps between checks
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Interpreter for script jobs whose module has no environment
    #[serde(default = "default_python")]
    pub default_python: String,

    #[serde(default = "default_script_timeout", with = "humantime_serde")]
    pub script_timeout: Duration,

    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub http_timeout: Duration,

    /// Retention used by the built-in history purge job when it has no parameter
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: default_tick_interval(),
            default_python: default_python(),
            script_timeout: default_script_timeout(),
            http_timeout: default_http_timeout(),
            history_retention_days: default_history_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallerConfig {
    /// Latest-release endpoint of the upstream release feed
    #[serde(default = "default_release_url")]
    pub release_url: String,

    #[serde(default = "default_release_cache_ttl", with = "humantime_serde")]
    pub release_cache_ttl: Duration,

    /// Progress is reported every this many downloaded bytes
    #[serde(default = "default_chunk_size")]
    pub download_chunk_size: u64,

    #[serde(default = "default_download_timeout", with = "humantime_serde")]
    pub download_timeout: Duration,

    /// Also fetch the CUDA runtime libraries on Windows CUDA installs
    #[serde(default = "default_true")]
    pub cuda_runtime: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            release_url: default_release_url(),
            release_cache_ttl: default_release_cache_ttl(),
            download_chunk_size: default_chunk_size(),
            download_timeout: default_download_timeout(),
            cuda_runtime: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentsConfig {
    /// Interpreter used to create new environments
    #[serde(default = "default_python")]
    pub base_python: String,

    #[serde(default = "default_pip_timeout", with = "humantime_serde")]
    pub pip_timeout: Duration,

    #[serde(default = "default_install_retries")]
    pub install_retries: u32,

    /// Base delay of the linear file-lock retry backoff
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    #[serde(default = "default_script_timeout", with = "humantime_serde")]
    pub script_timeout: Duration,
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        Self {
            base_python: default_python(),
            pip_timeout: default_pip_timeout(),
            install_retries: default_install_retries(),
            retry_delay: default_retry_delay(),
            script_timeout: default_script_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolkitConfig {
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Defaults to `{config_dir}/toolkit_cache.json`
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
            cache_file: None,
        }
    }
}

// Default value functions
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8089 }
fn default_max_connections() -> u32 { 5 }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_true() -> bool { true }
fn default_tick_interval() -> Duration { Duration::from_secs(1) }
fn default_python() -> String { if cfg!(windows) { "python" } else { "python3" }.to_string() }
fn default_script_timeout() -> Duration { Duration::from_secs(3600) }
fn default_http_timeout() -> Duration { Duration::from_secs(300) }
fn default_history_retention_days() -> u32 { 30 }
fn default_release_url() -> String {
    "https://api.github.com/repos/ggml-org/llama.cpp/releases/latest".to_string()
}
fn default_release_cache_ttl() -> Duration { Duration::from_secs(300) }
fn default_chunk_size() -> u64 { 1024 * 1024 }
fn default_download_timeout() -> Duration { Duration::from_secs(1800) }
fn default_pip_timeout() -> Duration { Duration::from_secs(1800) }
fn default_install_retries() -> u32 { 3 }
fn default_retry_delay() -> Duration { Duration::from_secs(2) }
fn default_probe_timeout() -> Duration { Duration::from_secs(5) }

impl Config {
    /// The logging and metrics sections, for [`crate::telemetry::init_telemetry`].
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Load configuration from the optional config file and environment.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("RUNFORGE_CONFIG").unwrap_or_else(|_| "runforge".to_string());
        let config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("RUNFORGE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("RUNFORGE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// A configuration rooted entirely under `data_dir`, used by tests and tools.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            paths: PathsConfig::under(data_dir.as_ref()),
            ..Self::default()
        }
    }

    pub fn database_url(&self) -> String {
        self.database.url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}",
                self.paths.data_dir.join("runforge.db").display()
            )
        })
    }

    pub fn toolkit_cache_file(&self) -> PathBuf {
        self.toolkit
            .cache_file
            .clone()
            .unwrap_or_else(|| self.paths.config_dir().join("toolkit_cache.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_data_dir() {
        let paths = PathsConfig::under("/srv/forge");
        assert_eq!(paths.backends_dir(), PathBuf::from("/srv/forge/backends"));
        assert_eq!(paths.providers_dir(), PathBuf::from("/srv/forge/providers"));
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::with_data_dir("/tmp/x");
        assert_eq!(cfg.installer.release_cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.environments.install_retries, 3);
        assert_eq!(cfg.server.base_url(), "http://127.0.0.1:8089");
        assert!(cfg.database_url().starts_with("sqlite://"));
        assert!(cfg
            .toolkit_cache_file()
            .ends_with("config/toolkit_cache.json"));
    }

    #[test]
    fn test_humantime_durations_deserialize() {
        let raw = serde_json::json!({ "tick_interval": "250ms", "script_timeout": "2m" });
        let cfg: SchedulerConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(cfg.tick_interval, Duration::from_millis(250));
        assert_eq!(cfg.script_timeout, Duration::from_secs(120));
        assert!(cfg.enabled);
    }
}
