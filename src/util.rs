//! Shared utility functions.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run a synchronous store operation on the blocking pool.
///
/// Backends do file or lock I/O that must not stall the driver's worker
/// thread. A panicked or cancelled closure surfaces as `Error::TaskJoin`.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Storage key for a workflow record.
pub fn workflow_key(workflow_id: &crate::workflow::WorkflowId) -> String {
    format!("workflow:{}", workflow_id)
}

/// Storage key for a task record.
pub fn task_key(workflow_id: &crate::workflow::WorkflowId, task_id: &crate::core::TaskId) -> String {
    format!("task:{}:{}", workflow_id, task_id)
}

/// Storage key for a shared context value.
pub fn shared_key(workflow_id: &crate::workflow::WorkflowId, key: &str) -> String {
    format!("shared:{}:{}", workflow_id, key)
}

/// Event bus channel for a workflow.
pub fn events_channel(workflow_id: &crate::workflow::WorkflowId) -> String {
    format!("workflow:{}:events", workflow_id)
}
