//! Scheduled jobs.
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐   ┌────────────┐
//! │  Registry  │──▶│  Scheduler   │──▶│  Dispatcher │──▶│  Handler / │
//! │  (SQLite)  │   │  + triggers  │   │             │   │  script /  │
//! └────────────┘   └──────────────┘   └─────────────┘   │  HTTP      │
//!                                                       └────────────┘
//! ```
//!
//! The registry is the source of truth. The trigger engine only holds
//! registrations derived from it, and the scheduler re-registers every
//! enabled job when it starts.

pub mod builtin;
pub mod dispatch;
pub mod model;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod trigger;

pub use builtin::{register_builtin_handlers, BuiltinDeps};
pub use dispatch::{DispatchConfig, DispatchContext, Dispatcher, FnHandler, HandlerRegistry, JobHandler};
pub use model::{
    DispatchTarget, ExecutionId, ExecutionStatus, ExecutionTrigger, JobExecution, JobFilter, JobId, JobUpdate,
    NewJob, ScheduleType, ScheduledJob,
};
pub use registry::{JobRegistry, DEFAULT_HISTORY_LIMIT};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use schedule::{validate_schedule_config, CronSchedule, ScheduleSpec};
pub use scheduler::{JobScheduler, JobState, JobStatusReport, RunOutcome, SchedulerStatus, StopReport};
pub use trigger::{
    EngineConnection, LocalEngineProvider, RegisteredTrigger, TokioTriggerEngine, TriggerEngine,
    TriggerEngineProvider, TriggerFired, TriggerKey,
};
