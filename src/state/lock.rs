//! Named mutual-exclusion locks held in the shared backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::util::blocking;
use crate::{Error, Result};

use super::KvBackend;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Proof of a held lock. Pass it back to `DistributedLock::release`.
///
/// Dropping a guard does not release the lock; the TTL reclaims it if the
/// holder never releases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    /// Backend key holding the lock, `lock:{name}`.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Lock client. Every lock it takes has a TTL so a crashed holder cannot
/// block others forever.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn KvBackend>,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Try once to take `name`.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let key = format!("lock:{}", name);
        let token = Uuid::new_v4().to_string();
        let backend = Arc::clone(&self.backend);
        let (k, t) = (key.clone(), token.clone());
        let acquired = blocking(move || backend.set_nx(&k, &t, Some(ttl))).await?;
        if acquired {
            debug!(lock = %key, "lock acquired");
            Ok(Some(LockGuard { key, token }))
        } else {
            Ok(None)
        }
    }

    /// Poll for `name` until `wait` elapses.
    pub async fn acquire_timeout(&self, name: &str, ttl: Duration, wait: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.acquire(name, ttl).await? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(Error::LockUnavailable(name.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Release a held lock. Returns false if it had already expired or was
    /// taken over by another holder; that holder's lock is left alone.
    pub async fn release(&self, guard: LockGuard) -> Result<bool> {
        let backend = Arc::clone(&self.backend);
        let key = guard.key.clone();
        let released =
            blocking(move || backend.compare_and_delete(&guard.key, &guard.token)).await?;
        if released {
            debug!(lock = %key, "lock released");
        } else {
            warn!(lock = %key, "lock expired before release");
        }
        Ok(released)
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock").finish_non_exhaustive()
    }
}
