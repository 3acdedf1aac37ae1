//! Workflow state with status transition validation.
//!
//! `WorkflowState` is the authoritative record of one workflow run: it owns
//! the task graph, a mirror of the shared context, progress, and errors.
//! Status changes go through `transition`, which rejects moves the
//! lifecycle does not allow.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{TaskGraph, TaskId, TaskStatus};
use crate::error::{Error, Result};

use super::{WorkflowId, WorkflowStatus};

/// Authoritative state of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub status: WorkflowStatus,
    pub graph: TaskGraph,
    /// Outputs and values written to the shared context, keyed like the store.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Share of tasks in a terminal status, 0.0 to 100.0.
    pub progress_percent: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure messages accumulated during the run.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl WorkflowState {
    /// Create a Pending state owning `graph`.
    pub fn new(id: WorkflowId, graph: TaskGraph) -> Self {
        let now = Utc::now();
        let mut state = Self {
            id,
            status: WorkflowStatus::Pending,
            graph,
            context: BTreeMap::new(),
            progress_percent: 0.0,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            errors: Vec::new(),
        };
        state.recompute_progress();
        state
    }

    /// Check if a transition to `target` is valid from the current status.
    ///
    /// - Pending -> Running | Cancelled
    /// - Running -> Paused | Completed | Failed | Cancelled
    /// - Paused -> Running | Completed | Failed | Cancelled
    ///
    /// Paused may finish directly: in-flight tasks still settle while
    /// dispatch is suspended.
    pub fn can_transition(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self.status, target),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }

    /// Move to `target`, stamping start and finish times.
    pub fn transition(&mut self, target: WorkflowStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        let now = Utc::now();
        if target == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if target.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Recompute progress from task statuses.
    ///
    /// Completed, Failed and Skipped tasks all count as settled. Progress
    /// never moves backwards within a run, and an empty graph is complete.
    pub fn recompute_progress(&mut self) -> f64 {
        let total = self.graph.task_count();
        let percent = if total == 0 {
            100.0
        } else {
            self.graph.finished_count() as f64 * 100.0 / total as f64
        };
        self.progress_percent = self.progress_percent.max(percent);
        self.updated_at = Utc::now();
        self.progress_percent
    }

    /// Record a failure message.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.updated_at = Utc::now();
    }

    /// Stage label of the highest-priority running task.
    pub fn current_stage(&self) -> Option<String> {
        self.graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Running)
            .fold(None, |best: Option<&crate::core::Task>, t| match best {
                Some(b) if b.priority >= t.priority => Some(b),
                _ => Some(t),
            })
            .map(|t| t.stage.clone())
    }

    fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.graph
            .tasks()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Summarize the state for status queries.
    pub fn report(&self) -> StatusReport {
        let failed_tasks = self
            .graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| FailedTask {
                task_id: t.id.clone(),
                message: t
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
                retry_count: t.retry_count,
            })
            .collect();

        StatusReport {
            workflow_id: self.id,
            status: self.status,
            progress_percent: self.progress_percent,
            current_stage: self.current_stage(),
            completed_task_ids: self.ids_with_status(TaskStatus::Completed),
            failed_tasks,
            skipped_task_ids: self.ids_with_status(TaskStatus::Skipped),
            updated_at: self.updated_at,
        }
    }
}

/// A permanently failed task as reported by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub message: String,
    pub retry_count: u32,
}

/// Externally visible progress view of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub progress_percent: f64,
    pub current_stage: Option<String>,
    pub completed_task_ids: Vec<TaskId>,
    pub failed_tasks: Vec<FailedTask>,
    pub skipped_task_ids: Vec<TaskId>,
    pub updated_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn failed_task_ids(&self) -> Vec<TaskId> {
        self.failed_tasks.iter().map(|f| f.task_id.clone()).collect()
    }
}
