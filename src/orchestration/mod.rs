//! Orchestration layer: run policy, the per-run driver loop, and the
//! workflow manager that starts and controls runs.

mod driver;
mod manager;
mod policy;

pub use driver::DISPATCH_RATE_KEY;
pub use manager::WorkflowManager;
pub use policy::{
    RunPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_CANCEL_GRACE, DEFAULT_MAX_BACKOFF,
    DEFAULT_MAX_PARALLEL, DEFAULT_MAX_RETRIES,
};
