//! Progress events published while a workflow runs.
//!
//! Events are for observers only. The persisted `WorkflowState` is the
//! source of truth; a dropped event never changes scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::TaskId;

use super::WorkflowId;

/// Kind of a workflow event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    /// A failed attempt will be retried after a backoff delay.
    TaskRetrying,
    /// A task was skipped because a dependency failed.
    TaskSkipped,
    ProgressUpdated,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskRetrying => "task_retrying",
            EventKind::TaskSkipped => "task_skipped",
            EventKind::ProgressUpdated => "progress_updated",
            EventKind::WorkflowPaused => "workflow_paused",
            EventKind::WorkflowResumed => "workflow_resumed",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowFailed => "workflow_failed",
            EventKind::WorkflowCancelled => "workflow_cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub workflow_id: WorkflowId,
    pub task_id: Option<TaskId>,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Event about the workflow as a whole.
    pub fn workflow(workflow_id: WorkflowId, kind: EventKind, payload: Value) -> Self {
        Self {
            workflow_id,
            task_id: None,
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Event about one task.
    pub fn task(workflow_id: WorkflowId, task_id: TaskId, kind: EventKind, payload: Value) -> Self {
        Self {
            workflow_id,
            task_id: Some(task_id),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Whether this event ends the run's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::WorkflowCompleted | EventKind::WorkflowFailed | EventKind::WorkflowCancelled
        )
    }
}
