//! Core domain models for the orchestration engine.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: tasks and the dependency graph they form.

pub mod dag;
pub mod task;

pub use dag::TaskGraph;
pub use task::{Task, TaskError, TaskErrorKind, TaskId, TaskKind, TaskResult, TaskStatus};
