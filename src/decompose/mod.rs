//! Workflow decomposition: template catalogs and graph construction.

mod decomposer;
mod template;

pub use decomposer::{TaskDecomposer, WorkflowRequest};
pub use template::{TaskTemplate, TemplateCatalog, SAMPLE_CATALOG};
