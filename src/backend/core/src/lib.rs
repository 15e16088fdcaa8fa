#![allow(clippy::result_large_err)]
//! # Runforge Core
//!
//! Local job scheduling plus provisioning of inference backends and Python
//! environments.
//!
//! ## Architecture
//!
//! - **Toolkit**: host GPU/SDK detection with a persisted cache
//! - **Backends**: prebuilt llama.cpp release installs, marker files, library paths
//! - **Environments**: named virtual environments, package and runtime installs
//! - **Jobs**: SQLite job registry, trigger engine, dispatch, retries
//! - **Extensions**: catalog of engines and package sets per environment
//! - **Tasks**: background installs that answer with an id immediately
//! - **API**: axum HTTP surface over all of the above

pub mod api;
pub mod backends;
pub mod config;
pub mod context;
pub mod db;
pub mod environments;
pub mod error;
pub mod extensions;
pub mod jobs;
pub mod process;
pub mod tasks;
pub mod telemetry;
pub mod toolkit;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, ForgeError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backends::{BackendId, BackendInstaller, InstalledBackend, Platform};
    pub use crate::config::Config;
    pub use crate::context::{AppContext, HostServices};
    pub use crate::environments::{Environment, EnvironmentStore, PackageInstallReport};
    pub use crate::error::{ErrorCode, ForgeError, Result};
    pub use crate::extensions::{Extension, ExtensionCatalog, ExtensionFilter};
    pub use crate::jobs::{
        ExecutionStatus, ExecutionTrigger, JobExecution, JobScheduler, NewJob, ScheduleType, ScheduledJob,
    };
    pub use crate::tasks::{TaskRecord, TaskStatus, TaskTracker};
    pub use crate::toolkit::{ToolkitBackend, ToolkitDetector, ToolkitStatus};
}
