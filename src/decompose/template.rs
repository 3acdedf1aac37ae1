//! Task templates and the catalog they are loaded from.
//!
//! A catalog is a TOML file with one `[[template]]` table per template.
//! Templates name their dependencies by template name; the decomposer turns
//! them into concrete tasks.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::TaskKind;
use crate::{Error, Result};

fn default_critical() -> bool {
    true
}

/// Blueprint for one task, or one task per element of an array param.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Names of templates whose tasks must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Name of an array param; one task is generated per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Default params. String values may contain `${name}` placeholders.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl TaskTemplate {
    pub fn new(name: impl Into<String>, kind: impl Into<TaskKind>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            priority: 0,
            critical: true,
            depends_on: Vec::new(),
            fan_out: None,
            estimate_secs: None,
            max_retries: None,
            stage: None,
            params: BTreeMap::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn with_fan_out(mut self, param: impl Into<String>) -> Self {
        self.fan_out = Some(param.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Stage label for generated tasks.
    pub fn stage_label(&self) -> &str {
        self.stage.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(rename = "template", default)]
    templates: Vec<TaskTemplate>,
}

/// Named templates in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: Vec<TaskTemplate>,
    index: HashMap<String, usize>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog, rejecting empty and duplicate names.
    pub fn from_templates(templates: Vec<TaskTemplate>) -> Result<Self> {
        let mut catalog = Self::new();
        for template in templates {
            catalog.insert(template)?;
        }
        Ok(catalog)
    }

    /// Parse a catalog from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(raw)?;
        Self::from_templates(file.templates)
    }

    /// Load a catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading template catalog");
        let catalog = Self::from_toml_str(&fs::read_to_string(path)?)?;
        debug!(templates = catalog.len(), "template catalog loaded");
        Ok(catalog)
    }

    /// Render the catalog back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        let file = CatalogFile {
            templates: self.templates.clone(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    /// Add a template.
    pub fn insert(&mut self, template: TaskTemplate) -> Result<()> {
        if template.name.trim().is_empty() {
            return Err(Error::Validation("template name cannot be empty".to_string()));
        }
        if self.index.contains_key(&template.name) {
            return Err(Error::Validation(format!(
                "duplicate template name: {}",
                template.name
            )));
        }
        self.index.insert(template.name.clone(), self.templates.len());
        self.templates.push(template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TaskTemplate> {
        self.index.get(name).map(|&i| &self.templates[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Template names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskTemplate> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Catalog written by `cadence init`.
pub const SAMPLE_CATALOG: &str = r#"# Each [[template]] becomes one task, or one task per element of the
# array param named by fan_out. ${name} in string params is replaced by the
# matching run param.

[[template]]
name = "prepare"
kind = "shell"
priority = 10
stage = "setup"
[template.params]
command = "echo preparing ${topic}"

[[template]]
name = "section"
kind = "shell"
depends_on = ["prepare"]
fan_out = "sections"
max_retries = 2
stage = "writing"
[template.params]
command = "echo writing section ${index}: ${item}"

[[template]]
name = "assemble"
kind = "echo"
depends_on = ["section"]
stage = "assembly"
[template.params]
topic = "${topic}"

[[template]]
name = "notify"
kind = "shell"
critical = false
depends_on = ["assemble"]
[template.params]
command = "echo done"
"#;
