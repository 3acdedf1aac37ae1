//! Run policy: concurrency, retry and timeout limits for one workflow run.

use std::time::Duration;

use crate::{Error, Result};

/// Default number of tasks allowed in flight at once.
pub const DEFAULT_MAX_PARALLEL: usize = 4;
/// Default retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Limits the driver applies while running a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    /// Upper bound on tasks in flight.
    pub max_parallel: usize,
    /// Retries allowed per task unless the task overrides it.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub backoff_base: Duration,
    /// Ceiling for any single retry delay.
    pub max_backoff: Duration,
    /// Per-attempt time limit. `None` lets attempts run indefinitely.
    pub task_timeout: Option<Duration>,
    /// How long in-flight tasks get to observe a cancel before they are
    /// detached.
    pub cancel_grace: Duration,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_backoff: DEFAULT_MAX_BACKOFF,
            task_timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

impl RunPolicy {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Delay before retry number `retry_count` (1-based):
    /// `backoff_base * 2^(retry_count - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Reject limits the driver cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(Error::Validation("max_parallel must be at least 1".to_string()));
        }
        if self.task_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Validation("task timeout must be positive".to_string()));
        }
        Ok(())
    }
}
