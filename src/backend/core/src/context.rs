//! Process-wide wiring.
//!
//! Every long-lived component is built once here and handed to the HTTP
//! layer and the scheduler explicitly. Nothing in the crate reaches for a
//! global instance.

use std::sync::Arc;
use tracing::info;

use crate::backends::BackendInstaller;
use crate::config::Config;
use crate::db::Database;
use crate::environments::EnvironmentStore;
use crate::error::Result;
use crate::extensions::ExtensionCatalog;
use crate::jobs::{
    register_builtin_handlers, BuiltinDeps, DispatchConfig, Dispatcher, HandlerRegistry, JobRegistry,
    JobScheduler, LocalEngineProvider, SchedulerStatus, TriggerEngineProvider,
};
use crate::process::{CommandRunner, SystemRunner};
use crate::tasks::TaskTracker;
use crate::telemetry::MetricsRegistry;
use crate::toolkit::{HostProbe, SystemProbe, ToolkitCache, ToolkitDetector};

/// Host-facing seams. Tests swap these for fakes.
pub struct HostServices {
    pub runner: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn HostProbe>,
    pub engine_provider: Arc<dyn TriggerEngineProvider>,
}

impl HostServices {
    pub fn system(config: &Config) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Self {
            probe: Arc::new(SystemProbe::new(runner.clone(), config.toolkit.probe_timeout)),
            engine_provider: Arc::new(LocalEngineProvider::new(
                config.scheduler.enabled,
                config.paths.data_dir.clone(),
                config.scheduler.tick_interval,
            )),
            runner,
        }
    }
}

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub db: Database,
    pub scheduler: JobScheduler,
    pub detector: ToolkitDetector,
    pub installer: Arc<BackendInstaller>,
    pub environments: Arc<EnvironmentStore>,
    pub extensions: Arc<ExtensionCatalog>,
    pub tasks: TaskTracker,
    pub metrics: MetricsRegistry,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("db", &self.db)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl AppContext {
    /// Open the configured database and build against the real host.
    pub async fn connect(config: Config, metrics: MetricsRegistry) -> Result<Self> {
        std::fs::create_dir_all(&config.paths.data_dir)?;
        let db = Database::connect(&config.database_url(), config.database.max_connections).await?;
        db.migrate().await?;
        let host = HostServices::system(&config);
        Self::build(config, db, host, metrics)
    }

    pub fn build(config: Config, db: Database, host: HostServices, metrics: MetricsRegistry) -> Result<Self> {
        let paths = &config.paths;
        for dir in [paths.providers_dir(), paths.backends_dir(), paths.downloads_dir(), paths.config_dir()] {
            std::fs::create_dir_all(dir)?;
        }

        let cache = Arc::new(ToolkitCache::load(config.toolkit_cache_file()));
        let detector = ToolkitDetector::new(cache, host.probe);

        let environments = Arc::new(EnvironmentStore::new(
            paths.providers_dir(),
            config.environments.clone(),
            host.runner.clone(),
        ));
        let installer = Arc::new(BackendInstaller::new(
            paths.backends_dir(),
            paths.downloads_dir(),
            config.installer.clone(),
            detector.clone(),
        )?);
        let extensions = Arc::new(ExtensionCatalog::new(environments.clone(), detector.clone()));

        let registry = JobRegistry::new(db.clone());
        let mut handlers = HandlerRegistry::new();
        register_builtin_handlers(
            &mut handlers,
            BuiltinDeps {
                registry: registry.clone(),
                detector: detector.clone(),
                installer: installer.clone(),
                environments: environments.clone(),
                history_retention_days: config.scheduler.history_retention_days,
            },
        );

        let dispatcher = Dispatcher::new(
            Arc::new(handlers),
            host.runner,
            environments.clone(),
            DispatchConfig {
                base_url: config.server.base_url(),
                http_timeout: config.scheduler.http_timeout,
                default_python: config.scheduler.default_python.clone(),
                script_timeout: config.scheduler.script_timeout,
                scripts_dir: paths.scripts_dir(),
            },
        )?;
        let scheduler = JobScheduler::new(registry, dispatcher, host.engine_provider);

        Ok(Self {
            config: Arc::new(config),
            db,
            scheduler,
            detector,
            installer,
            environments,
            extensions,
            tasks: TaskTracker::new(),
            metrics,
        })
    }

    /// Put installed backends on the library path and bring the scheduler up.
    pub async fn start(&self) -> Result<SchedulerStatus> {
        self.installer.register_installed();
        let status = self.scheduler.start().await?;
        info!(
            available = status.available,
            jobs = status.job_count,
            scheduled = status.scheduled_count,
            "Scheduler started"
        );
        Ok(status)
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.db.close().await;
    }
}
