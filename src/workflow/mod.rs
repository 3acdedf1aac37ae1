//! Workflow management types.
//!
//! This module provides the identifiers, lifecycle status, authoritative
//! run state, and progress events for workflow runs.

mod event;
mod state;
mod types;

pub use event::{Event, EventKind};
pub use state::{FailedTask, StatusReport, WorkflowState};
pub use types::{WorkflowId, WorkflowStatus};
