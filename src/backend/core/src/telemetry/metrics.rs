//! Prometheus metrics for job executions, backend installs, package
//! installs and toolkit probes.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`init_metrics`] installs the Prometheus recorder, so library code and
//! tests can record freely.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for execution and install durations (seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every metric
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
}

/// Handle used by the `/metrics` endpoint to render the registry.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it; renders an empty body.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the global Prometheus recorder.
///
/// # Errors
///
/// Fails when the bucket list is empty or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!("Metrics initialized");
    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("runforge_errors_total", "Errors raised, by code and category");

    describe_counter!(
        "runforge_job_executions_total",
        "Job executions by terminal status and trigger source"
    );
    describe_histogram!(
        "runforge_job_execution_duration_seconds",
        "Wall-clock duration of job executions"
    );
    describe_counter!("runforge_job_retries_total", "Retry attempts armed for failed jobs");
    describe_counter!(
        "runforge_job_fires_skipped_total",
        "Trigger fires skipped because the job was still running"
    );

    describe_counter!("runforge_backend_installs_total", "Backend installs by outcome");
    describe_histogram!(
        "runforge_backend_install_duration_seconds",
        "Duration of backend installs"
    );
    describe_counter!("runforge_package_installs_total", "Package installs by outcome");
    describe_counter!("runforge_toolkit_probes_total", "Toolkit probes actually executed");
}

/// Job execution metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_execution(status: &str, trigger: &str, duration_seconds: f64) {
        counter!(
            "runforge_job_executions_total",
            "status" => status.to_string(),
            "trigger" => trigger.to_string(),
        )
        .increment(1);
        histogram!("runforge_job_execution_duration_seconds").record(duration_seconds);
    }

    pub fn record_retry_armed() {
        counter!("runforge_job_retries_total").increment(1);
    }

    pub fn record_fire_skipped() {
        counter!("runforge_job_fires_skipped_total").increment(1);
    }
}

/// Backend and package install metrics.
pub struct InstallMetrics;

impl InstallMetrics {
    pub fn record_backend(backend: &str, success: bool, duration_seconds: f64) {
        counter!(
            "runforge_backend_installs_total",
            "backend" => backend.to_string(),
            "outcome" => if success { "success" } else { "failure" },
        )
        .increment(1);
        histogram!(
            "runforge_backend_install_duration_seconds",
            "backend" => backend.to_string(),
        )
        .record(duration_seconds);
    }

    pub fn record_package(success: bool) {
        counter!(
            "runforge_package_installs_total",
            "outcome" => if success { "success" } else { "failure" },
        )
        .increment(1);
    }

    pub fn record_probe(backend: &str) {
        counter!("runforge_toolkit_probes_total", "backend" => backend.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_empty() {
        assert_eq!(MetricsRegistry::disabled().render(), "");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        JobMetrics::record_execution("success", "manual", 0.2);
        InstallMetrics::record_backend("cpu", true, 1.0);
        InstallMetrics::record_probe("cuda");
    }
}
