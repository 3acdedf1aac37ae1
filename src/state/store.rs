//! StateStore - async access to persisted workflow, task and shared records.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use crate::core::{Task, TaskId};
use crate::util::{blocking, shared_key, task_key, workflow_key};
use crate::workflow::{WorkflowId, WorkflowState};
use crate::Result;

use super::KvBackend;

/// Default lifetime of records for a workflow that is still live.
pub const DEFAULT_WORKFLOW_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Default lifetime of records once a workflow reaches a terminal status.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Async facade over a `KvBackend`.
///
/// Every record is JSON and carries a TTL, so abandoned workflows age out
/// of the backend on their own. Cloning is cheap and shares the backend.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KvBackend>,
    workflow_ttl: Duration,
    retention: Duration,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            workflow_ttl: DEFAULT_WORKFLOW_TTL,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Set the TTLs for live and finished workflow records.
    pub fn with_ttls(mut self, workflow_ttl: Duration, retention: Duration) -> Self {
        self.workflow_ttl = workflow_ttl;
        self.retention = retention;
        self
    }

    /// Shared handle to the underlying backend.
    pub fn backend(&self) -> Arc<dyn KvBackend> {
        Arc::clone(&self.backend)
    }

    async fn set_raw(&self, key: String, value: String, ttl: Duration) -> Result<()> {
        let backend = self.backend();
        blocking(move || backend.set(&key, &value, Some(ttl))).await
    }

    async fn get_raw(&self, key: String) -> Result<Option<String>> {
        let backend = self.backend();
        blocking(move || backend.get(&key)).await
    }

    /// Persist a workflow record and one record per task.
    ///
    /// Once the workflow is terminal, every record it owns (shared values
    /// included) is rewritten with the retention TTL.
    pub async fn save_workflow(&self, state: &WorkflowState) -> Result<()> {
        let ttl = if state.status.is_terminal() {
            self.retention
        } else {
            self.workflow_ttl
        };

        let terminal = state.status.is_terminal();
        let mut records = Vec::with_capacity(state.graph.task_count() + 1);
        records.push((workflow_key(&state.id), serde_json::to_string(state)?));
        for task in state.graph.tasks() {
            records.push((task_key(&state.id, &task.id), serde_json::to_string(task)?));
        }
        if terminal {
            for (key, value) in &state.context {
                records.push((shared_key(&state.id, key), serde_json::to_string(value)?));
            }
        }

        let backend = self.backend();
        let shared_prefix = shared_key(&state.id, "");
        let count = blocking(move || {
            for (key, value) in &records {
                backend.set(key, value, Some(ttl))?;
            }
            let mut count = records.len();
            if terminal {
                // Values executors wrote directly are not in the context mirror.
                for key in backend.keys(&shared_prefix)? {
                    if records.iter().any(|(k, _)| *k == key) {
                        continue;
                    }
                    if let Some(value) = backend.get(&key)? {
                        backend.set(&key, &value, Some(ttl))?;
                        count += 1;
                    }
                }
            }
            Ok(count)
        })
        .await?;

        trace!(workflow_id = %state.id, status = %state.status, records = count, "workflow saved");
        Ok(())
    }

    /// Load a workflow record.
    pub async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<WorkflowState>> {
        match self.get_raw(workflow_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist a single task record.
    pub async fn save_task(&self, workflow_id: &WorkflowId, task: &Task) -> Result<()> {
        let raw = serde_json::to_string(task)?;
        self.set_raw(task_key(workflow_id, &task.id), raw, self.workflow_ttl)
            .await
    }

    /// Load a single task record.
    pub async fn get_task(&self, workflow_id: &WorkflowId, task_id: &TaskId) -> Result<Option<Task>> {
        match self.get_raw(task_key(workflow_id, task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write a value into the workflow's shared context.
    pub async fn set_value(&self, workflow_id: &WorkflowId, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(shared_key(workflow_id, key), raw, self.workflow_ttl)
            .await
    }

    /// Read a value from the workflow's shared context.
    pub async fn get_value(&self, workflow_id: &WorkflowId, key: &str) -> Result<Option<Value>> {
        match self.get_raw(shared_key(workflow_id, key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Ids of every workflow with a live record.
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowId>> {
        let backend = self.backend();
        let keys = blocking(move || backend.keys("workflow:")).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix("workflow:"))
            .filter_map(|id| id.parse().ok())
            .collect())
    }

    /// Remove a workflow and everything it owns. Returns whether the
    /// workflow record existed.
    pub async fn delete_workflow(&self, id: &WorkflowId) -> Result<bool> {
        let backend = self.backend();
        let workflow = workflow_key(id);
        let task_prefix = format!("task:{}:", id);
        let shared_prefix = format!("shared:{}:", id);

        let existed = blocking(move || {
            for prefix in [&task_prefix, &shared_prefix] {
                for key in backend.keys(prefix)? {
                    backend.delete(&key)?;
                }
            }
            backend.delete(&workflow)
        })
        .await?;

        debug!(workflow_id = %id, existed, "workflow deleted");
        Ok(existed)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("workflow_ttl", &self.workflow_ttl)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
