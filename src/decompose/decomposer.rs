//! TaskDecomposer - turns a workflow request into a validated task graph.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::core::{Task, TaskGraph, TaskId};
use crate::executor::ExecutorRegistry;
use crate::{Error, Result};

use super::{TaskTemplate, TemplateCatalog};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// What to build: root templates plus runtime params.
///
/// An empty template list means every template in the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRequest {
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl WorkflowRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, name: impl Into<String>) -> Self {
        self.templates.push(name.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Builds task graphs from a template catalog.
///
/// Holds the executor registry so that a template whose kind cannot be
/// executed is rejected before any workflow state exists.
#[derive(Debug, Clone)]
pub struct TaskDecomposer {
    catalog: TemplateCatalog,
    registry: Arc<ExecutorRegistry>,
}

impl TaskDecomposer {
    pub fn new(catalog: TemplateCatalog, registry: Arc<ExecutorRegistry>) -> Self {
        Self { catalog, registry }
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Instantiate the requested templates and everything they depend on.
    ///
    /// # Errors
    ///
    /// - `TemplateNotFound` for an unknown root or dependency name
    /// - `CyclicGraph` if template dependencies form a cycle
    /// - `UnknownExecutor` if a template's kind has no executor
    /// - `Validation` if a `fan_out` param is not an array
    pub fn build(&self, request: &WorkflowRequest) -> Result<TaskGraph> {
        let roots: Vec<&str> = if request.templates.is_empty() {
            self.catalog.names()
        } else {
            request.templates.iter().map(String::as_str).collect()
        };

        let order = self.resolve(&roots)?;

        for template in &order {
            if !self.registry.contains(&template.kind) {
                return Err(Error::UnknownExecutor(template.kind.clone()));
            }
        }

        let mut generated: HashMap<&str, Vec<TaskId>> = HashMap::new();
        let mut tasks = Vec::new();
        for template in &order {
            let dependencies: Vec<TaskId> = template
                .depends_on
                .iter()
                .flat_map(|dep| generated.get(dep.as_str()).cloned().unwrap_or_default())
                .collect();

            let instances = self.instantiate(template, &request.params, &dependencies)?;
            debug!(
                template = %template.name,
                tasks = instances.len(),
                "template instantiated"
            );
            generated.insert(
                template.name.as_str(),
                instances.iter().map(|t| t.id.clone()).collect(),
            );
            tasks.extend(instances);
        }

        let graph = TaskGraph::from_tasks(tasks)?;
        info!(
            templates = order.len(),
            tasks = graph.task_count(),
            "workflow decomposed"
        );
        Ok(graph)
    }

    /// Add a runtime task to an existing graph after checking its executor.
    pub fn add_custom_task(&self, graph: &mut TaskGraph, task: Task, deps: &[TaskId]) -> Result<()> {
        if !self.registry.contains(&task.kind) {
            return Err(Error::UnknownExecutor(task.kind.clone()));
        }
        let mut task = task;
        for dep in deps {
            if !task.dependencies.contains(dep) {
                task.dependencies.push(dep.clone());
            }
        }
        debug!(task_id = %task.id, deps = task.dependencies.len(), "adding custom task");
        graph.add_task(task)?;
        Ok(())
    }

    fn template(&self, name: &str) -> Result<&TaskTemplate> {
        self.catalog
            .get(name)
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))
    }

    /// Templates reachable from `roots`, dependencies first.
    fn resolve(&self, roots: &[&str]) -> Result<Vec<&TaskTemplate>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut order = Vec::new();

        for root in roots {
            let root = self.template(root)?;
            if marks.contains_key(root.name.as_str()) {
                continue;
            }
            marks.insert(root.name.as_str(), Mark::Visiting);
            // Each frame is a template and the index of its next dependency.
            let mut stack: Vec<(&TaskTemplate, usize)> = vec![(root, 0)];

            while let Some((current, next_dep)) = stack.last_mut() {
                let current: &TaskTemplate = *current;
                let Some(dep) = current.depends_on.get(*next_dep) else {
                    marks.insert(current.name.as_str(), Mark::Done);
                    order.push(current);
                    stack.pop();
                    continue;
                };
                *next_dep += 1;

                let dep = self.template(dep)?;
                match marks.get(dep.name.as_str()) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        let start = stack
                            .iter()
                            .position(|(t, _)| t.name == dep.name)
                            .unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|(t, _)| t.name.clone()).collect();
                        path.push(dep.name.clone());
                        return Err(Error::CyclicGraph { path });
                    }
                    None => {
                        marks.insert(dep.name.as_str(), Mark::Visiting);
                        stack.push((dep, 0));
                    }
                }
            }
        }
        Ok(order)
    }

    fn instantiate(
        &self,
        template: &TaskTemplate,
        request_params: &BTreeMap<String, Value>,
        dependencies: &[TaskId],
    ) -> Result<Vec<Task>> {
        let mut bindings = template.params.clone();
        bindings.extend(request_params.iter().map(|(k, v)| (k.clone(), v.clone())));

        let Some(fan_out) = &template.fan_out else {
            let input = bind_params(&template.params, request_params, &bindings);
            return Ok(vec![self.task_from(template, TaskId::new(&template.name), input, dependencies)]);
        };

        let items = bindings
            .get(fan_out)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                Error::Validation(format!(
                    "template {} fans out over `{}`, which is not an array param",
                    template.name, fan_out
                ))
            })?;

        Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let mut bound = bindings.clone();
                bound.insert("item".to_string(), item);
                bound.insert("index".to_string(), Value::from(index));
                let input = bind_params(&template.params, request_params, &bound);
                let id = TaskId::new(format!("{}-{}", template.name, index));
                self.task_from(template, id, input, dependencies)
            })
            .collect())
    }

    fn task_from(&self, template: &TaskTemplate, id: TaskId, input: Value, dependencies: &[TaskId]) -> Task {
        let mut task = Task::new(id, template.kind.clone())
            .with_priority(template.priority)
            .with_critical(template.critical)
            .with_dependencies(dependencies.iter().cloned())
            .with_stage(template.stage_label())
            .with_input(input);
        task.name = template.name.clone();
        if let Some(max_retries) = template.max_retries {
            task = task.with_max_retries(max_retries);
        }
        if let Some(secs) = template.estimate_secs {
            task = task.with_estimate(Duration::from_secs(secs));
        }
        task
    }
}

/// Bind a template's params into a task input object.
///
/// A param the request supplies takes the request's value; the rest keep
/// their defaults with placeholders substituted.
fn bind_params(
    params: &BTreeMap<String, Value>,
    request_params: &BTreeMap<String, Value>,
    bindings: &BTreeMap<String, Value>,
) -> Value {
    let object: Map<String, Value> = params
        .iter()
        .map(|(k, v)| match request_params.get(k) {
            Some(given) => (k.clone(), given.clone()),
            None => (k.clone(), substitute(v, bindings)),
        })
        .collect();
    Value::Object(object)
}

/// Replace `${name}` placeholders in string values.
///
/// A string that is exactly one placeholder takes the bound value as is,
/// keeping its JSON type. Placeholders with no binding are left intact.
pub(crate) fn substitute(value: &Value, bindings: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = PLACEHOLDER_RE.captures(s) {
                if caps.get(0).is_some_and(|m| m.as_str() == s) {
                    if let Some(bound) = bindings.get(&caps[1]) {
                        return bound.clone();
                    }
                }
            }
            let replaced = PLACEHOLDER_RE.replace_all(s, |caps: &regex::Captures| {
                match bindings.get(&caps[1]) {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                }
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, bindings)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, bindings)))
                .collect(),
        ),
        other => other.clone(),
    }
}
