//! Retry policy for failed job executions.
//!
//! A failed execution never loops in-process. The scheduler asks the policy
//! for a [`RetryDecision`] and, for a retry, arms a one-shot trigger at the
//! computed time. The attempt counter and due time are persisted on the job
//! so a restart re-arms them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::model::ScheduledJob;

/// Upper bound on any single retry delay.
const MAX_RETRY_DELAY_SECS: u64 = 24 * 60 * 60;

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    Fixed { delay_secs: u64 },
    /// `delay * 2^attempt`, capped at one day
    Exponential { initial_delay_secs: u64 },
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Exponential { initial_delay_secs } => initial_delay_secs
                .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
                .min(MAX_RETRY_DELAY_SECS),
        };
        Duration::from_secs(secs)
    }
}

/// Retry configuration lifted from a job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    /// Keep the regular trigger once retries are exhausted
    pub failover_enabled: bool,
}

/// What the scheduler does after an execution ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Clear retry bookkeeping (success, or retries disabled)
    Reset,
    /// Arm retry number `attempt` at `at`
    Retry { attempt: u32, at: DateTime<Utc> },
    /// Retries are used up. `pause` is true when the job should stop firing.
    Exhausted { pause: bool },
}

impl RetryPolicy {
    pub fn from_job(job: &ScheduledJob) -> Self {
        let backoff = if job.retry_backoff {
            BackoffStrategy::Exponential {
                initial_delay_secs: job.retry_delay_seconds,
            }
        } else {
            BackoffStrategy::Fixed {
                delay_secs: job.retry_delay_seconds,
            }
        };
        Self {
            enabled: job.retry_enabled,
            max_retries: job.max_retries,
            backoff,
            failover_enabled: job.failover_enabled,
        }
    }

    /// Check if another retry should be attempted after `failed_attempts` failures.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        self.enabled && failed_attempts < self.max_retries
    }

    /// Decide what follows a failure. `attempt` is the attempt that just
    /// failed (0 for the original run).
    pub fn on_failure(&self, attempt: u32, recurring: bool, now: DateTime<Utc>) -> RetryDecision {
        if !self.enabled {
            return RetryDecision::Reset;
        }
        if self.should_retry(attempt) {
            let delay = self.backoff.delay_for_attempt(attempt);
            let at = now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::days(1));
            return RetryDecision::Retry {
                attempt: attempt + 1,
                at,
            };
        }
        RetryDecision::Exhausted {
            pause: recurring && !self.failover_enabled,
        }
    }
}
