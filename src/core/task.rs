//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work handed to executors. Each task
//! tracks its status, dependencies, retry bookkeeping, and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Unique identifier for a task within a workflow.
///
/// Task ids are human-readable strings generated from template names
/// (`outline`, `section-2`) or supplied by the caller for custom tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of work a task performs.
///
/// Kinds select the executor that runs the task; the engine never looks
/// inside them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(pub String);

impl TaskKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, or waiting out a retry backoff.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a free slot.
    Ready,
    /// Handed to an executor.
    Running,
    /// Finished successfully; output is in the shared context.
    Completed,
    /// Exhausted its retries.
    Failed,
    /// Never ran because a dependency failed permanently.
    Skipped,
}

impl TaskStatus {
    /// Completed, Failed and Skipped are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Classification of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The executor reported a failure (or panicked).
    Execution,
    /// The executor did not finish within the task timeout.
    Timeout,
    /// A dependency failed permanently, so the task was skipped.
    DependencyFailed,
    /// The run was cancelled while the task was in flight.
    Cancelled,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskErrorKind::Execution => write!(f, "execution"),
            TaskErrorKind::Timeout => write!(f, "timeout"),
            TaskErrorKind::DependencyFailed => write!(f, "dependency_failed"),
            TaskErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error recorded on a task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Execution, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TaskErrorKind::Timeout,
            format!("task timed out after {:?}", after),
        )
    }

    pub fn dependency_failed(dependency: &TaskId) -> Self {
        Self::new(
            TaskErrorKind::DependencyFailed,
            format!("dependency {} failed", dependency),
        )
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome reported by an executor for one attempt.
///
/// Failures are ordinary values; retry decisions are made by the driver
/// from the run policy, not by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Success(Value),
    Failure(TaskError),
}

impl TaskResult {
    pub fn success(output: Value) -> Self {
        TaskResult::Success(output)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        TaskResult::Failure(TaskError::execution(message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success(_))
    }
}

impl<E: std::fmt::Display> From<std::result::Result<Value, E>> for TaskResult {
    fn from(result: std::result::Result<Value, E>) -> Self {
        match result {
            Ok(value) => TaskResult::Success(value),
            Err(e) => TaskResult::failure(e.to_string()),
        }
    }
}

fn default_critical() -> bool {
    true
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the owning graph.
    pub id: TaskId,
    /// Selects the executor.
    pub kind: TaskKind,
    /// Human-readable name, usually the template name.
    pub name: String,
    /// Label reported as the workflow's current stage while the task runs.
    pub stage: String,
    /// Current execution status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Tasks that must complete before this one starts, in declared order.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Higher runs first among ready tasks.
    #[serde(default)]
    pub priority: i32,
    /// A permanent failure of a critical task fails the whole workflow.
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Per-task override of the run's retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Parameters bound at decomposition time.
    #[serde(default)]
    pub input: Value,
    /// Output of the successful attempt.
    #[serde(default)]
    pub output: Option<Value>,
    /// Last recorded error.
    #[serde(default)]
    pub error: Option<TaskError>,
    /// Expected run time, used by critical path estimation.
    #[serde(default)]
    pub estimated_duration: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending, critical task with no dependencies.
    pub fn new(id: impl Into<TaskId>, kind: impl Into<TaskKind>) -> Self {
        let id = id.into();
        let name = id.to_string();
        Self {
            stage: name.clone(),
            name,
            id,
            kind: kind.into(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            priority: 0,
            critical: true,
            retry_count: 0,
            max_retries: None,
            input: Value::Null,
            output: None,
            error: None,
            estimated_duration: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    /// Start an attempt: status Running, start time recorded.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Record a successful attempt.
    pub fn complete(&mut self, output: Value) {
        self.status = TaskStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    /// Record a permanent failure.
    pub fn fail(&mut self, error: TaskError) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Park the task after a failed attempt that will be retried.
    ///
    /// The error stays visible until the next attempt succeeds.
    pub fn await_retry(&mut self, error: TaskError) {
        self.status = TaskStatus::Pending;
        self.error = Some(error);
    }

    /// Mark the task skipped because a dependency failed.
    pub fn skip(&mut self, error: TaskError) {
        self.status = TaskStatus::Skipped;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Transition from Pending to Ready when dependencies are satisfied.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Return an in-flight or ready task to Pending for re-dispatch.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
    }

    /// Retry budget for this task given the run default.
    pub fn retry_limit(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }
}
