use thiserror::Error;

use crate::core::{TaskId, TaskKind};
use crate::workflow::WorkflowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("No executor registered for task kind: {0}")]
    UnknownExecutor(TaskKind),

    #[error("Cycle detected: {}", format_cycle(.path))]
    CyclicGraph { path: Vec<String> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Invalid workflow transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether the error means the store, lock or bus could not do its job.
    ///
    /// These are fatal to a workflow run and are never retried by the driver.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Infrastructure(_)
                | Error::Io(_)
                | Error::Json(_)
                | Error::TaskJoin(_)
                | Error::LockUnavailable(_)
        )
    }

    /// Whether the error was raised while validating a graph or template.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::TemplateNotFound(_)
                | Error::UnknownExecutor(_)
                | Error::CyclicGraph { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateTask(_)
        )
    }
}

fn format_cycle(path: &[String]) -> String {
    path.join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
