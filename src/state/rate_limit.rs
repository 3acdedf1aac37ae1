//! Fixed-window admission counter shared through the backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::util::blocking;
use crate::Result;

use super::KvBackend;

/// At most `limit` admissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u64,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX).max(1)
    }
}

/// Counts admissions in `ratelimit:{key}:{window index}`.
///
/// Windows are aligned to wall-clock time so that processes sharing a
/// backend agree on the current window.
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn KvBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Count one admission. Returns false once the window is full.
    pub async fn check(&self, key: &str, limit: RateLimit) -> Result<bool> {
        let window_ms = limit.window_ms();
        let index = Utc::now().timestamp_millis().div_euclid(window_ms);
        let counter = format!("ratelimit:{}:{}", key, index);
        let backend = Arc::clone(&self.backend);
        let ttl = limit.window;
        let count = blocking(move || backend.incr(&counter, Some(ttl))).await?;
        trace!(key, count, limit = limit.limit, "rate limit check");
        Ok(count <= limit.limit)
    }

    /// Time until the current window ends.
    pub fn retry_after(limit: RateLimit) -> Duration {
        let window_ms = limit.window_ms();
        let elapsed = Utc::now().timestamp_millis().rem_euclid(window_ms);
        Duration::from_millis((window_ms - elapsed).max(1) as u64)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}
