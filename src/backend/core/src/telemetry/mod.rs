//! Telemetry: structured logging and Prometheus metrics.
//!
//! ```rust,no_run
//! use runforge_core::config::Config;
//! use runforge_core::telemetry::init_telemetry;
//!
//! let config = Config::default();
//! let handle = init_telemetry(&config.telemetry()).expect("telemetry");
//! println!("{}", handle.metrics.render());
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, RedactionConfig, SensitiveFieldRedactor};
pub use metrics::{init_metrics, InstallMetrics, JobMetrics, MetricsConfig, MetricsRegistry};

/// Logging plus metrics, as carried by the application config.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Handle for the installed telemetry stack.
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

/// Install the global subscriber, then the metrics recorder. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    init_logging(&config.logging)?;
    let metrics = init_metrics(&config.metrics)?;
    Ok(TelemetryHandle { metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_init_telemetry_installs_once() {
        let mut config = Config::default().telemetry();
        config.metrics.enabled = false;

        let handle = init_telemetry(&config).unwrap();
        assert!(handle.metrics.render().is_empty());

        // The global subscriber is already set.
        assert!(init_telemetry(&config).is_err());
    }
}
