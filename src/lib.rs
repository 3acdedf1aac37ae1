pub mod config;
pub mod core;
pub mod decompose;
pub mod error;
pub mod executor;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;
pub mod workflow;

pub use core::{Task, TaskGraph, TaskId, TaskKind, TaskResult, TaskStatus};
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorRegistry, TaskContext};
pub use orchestration::{RunPolicy, WorkflowManager};
pub use state::{EventBus, KvBackend, StateStore};
pub use workflow::{Event, EventKind, StatusReport, WorkflowId, WorkflowState, WorkflowStatus};
