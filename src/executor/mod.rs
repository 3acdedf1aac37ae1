//! Task executors.
//!
//! An `Executor` performs the work behind one task kind. The driver hands
//! it the task (with its bound input) and a `TaskContext` for reading
//! dependency outputs, sharing values, and observing cancellation.
//! Executors may be invoked more than once for the same task when a run is
//! retried or recovered.

mod builtin;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{Task, TaskId, TaskKind, TaskResult};
use crate::state::StateStore;
use crate::workflow::WorkflowId;
use crate::Result;

pub use builtin::{EchoExecutor, ShellExecutor};

/// Work behind one task kind.
///
/// The returned future is spawned onto the runtime, so it must own
/// everything it uses.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task, ctx: TaskContext) -> BoxFuture<'static, TaskResult>;
}

/// Adapts an async closure into an `Executor`.
///
/// # Example
///
/// ```ignore
/// let upper = FnExecutor::new(|task: Task, _ctx| async move {
///     let text = task.input["text"].as_str().unwrap_or_default().to_uppercase();
///     TaskResult::success(json!(text))
/// });
/// ```
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    fn execute(&self, task: Task, ctx: TaskContext) -> BoxFuture<'static, TaskResult> {
        (self.f)(task, ctx).boxed()
    }
}

/// What an executor can see of its workflow.
#[derive(Debug, Clone)]
pub struct TaskContext {
    workflow_id: WorkflowId,
    store: StateStore,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(workflow_id: WorkflowId, store: StateStore, cancel: CancellationToken) -> Self {
        Self {
            workflow_id,
            store,
            cancel,
        }
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// Output a completed dependency wrote to the shared context.
    pub async fn dependency_output(&self, task_id: &TaskId) -> Result<Option<Value>> {
        self.store.get_value(&self.workflow_id, task_id.as_str()).await
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        self.store.get_value(&self.workflow_id, key).await
    }

    pub async fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        self.store.set_value(&self.workflow_id, key, value).await
    }

    /// Token cancelled when the run is cancelled or aborted.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Typed map from task kind to executor.
///
/// Built by the caller and shared with the decomposer (to reject unknown
/// kinds up front) and the workflow manager (to dispatch).
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `echo` and `shell` executors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", EchoExecutor);
        registry.register("shell", ShellExecutor);
        registry
    }

    /// Register `executor` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<TaskKind>, executor: impl Executor + 'static) -> &mut Self {
        self.executors.insert(kind.into(), Arc::new(executor));
        self
    }

    /// Register an async closure for `kind`.
    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<TaskKind>, f: F) -> &mut Self
    where
        F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.register(kind, FnExecutor::new(f))
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn Executor>> {
        self.executors.get(kind).cloned()
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.executors.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.executors.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
