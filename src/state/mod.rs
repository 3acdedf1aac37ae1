//! Shared state: persistence, event fan-out, locks and rate limiting.
//!
//! Everything here sits on a `KvBackend`. The in-memory backend serves a
//! single process; the file backend lets several orchestrator processes
//! share records, locks and counters through one directory.

mod backend;
mod bus;
mod lock;
mod rate_limit;
mod store;

pub use backend::{FileBackend, KvBackend, MemoryBackend};
pub use bus::{EventBus, EventStream};
pub use lock::{DistributedLock, LockGuard};
pub use rate_limit::{RateLimit, RateLimiter};
pub use store::{StateStore, DEFAULT_RETENTION, DEFAULT_WORKFLOW_TTL};
