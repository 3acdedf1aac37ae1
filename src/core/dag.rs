//! Task graph (directed acyclic graph) for dependency management.
//!
//! `TaskGraph` stores tasks as petgraph nodes with an edge from every
//! dependency to its dependent. The graph is validated on construction and
//! on every mutation, so a `TaskGraph` value is always acyclic and every
//! declared dependency exists.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// The task dependency graph.
///
/// Node indices follow insertion order, which is the tie-breaker for
/// tasks of equal priority.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "GraphRecord", try_from = "GraphRecord")]
pub struct TaskGraph {
    /// The underlying directed graph. Edges point from dependency to dependent.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

/// Serialized form: tasks in insertion order, each carrying its dependency ids.
#[derive(Serialize, Deserialize)]
struct GraphRecord {
    tasks: Vec<Task>,
}

impl From<TaskGraph> for GraphRecord {
    fn from(graph: TaskGraph) -> Self {
        let (nodes, _) = graph.graph.into_nodes_edges();
        GraphRecord {
            tasks: nodes.into_iter().map(|n| n.weight).collect(),
        }
    }
}

impl TryFrom<GraphRecord> for TaskGraph {
    type Error = Error;

    fn try_from(record: GraphRecord) -> Result<Self> {
        TaskGraph::from_tasks(record.tasks)
    }
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from tasks whose dependencies may reference tasks that
    /// appear later in the list.
    ///
    /// # Errors
    /// - `DuplicateTask` if two tasks share an id
    /// - `UnknownDependency` if a dependency id is not in the list
    /// - `CyclicGraph` if the dependencies form a cycle
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = Self::new();

        for task in tasks {
            if dag.task_index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            let id = task.id.clone();
            let index = dag.graph.add_node(task);
            dag.task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in dag.graph.node_indices() {
            let task = &dag.graph[index];
            for dep in &task.dependencies {
                let dep_index = dag.task_index.get(dep).ok_or_else(|| {
                    Error::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                edges.push((*dep_index, index));
            }
        }
        for (from, to) in edges {
            dag.graph.update_edge(from, to, ());
        }

        if let Some(path) = dag.find_cycle() {
            return Err(Error::CyclicGraph {
                path: path.iter().map(ToString::to_string).collect(),
            });
        }

        Ok(dag)
    }

    /// Add a task whose dependencies are already in the graph.
    ///
    /// A new node only gains incoming edges, so the only cycle it can
    /// introduce is a dependency on itself.
    ///
    /// # Errors
    /// - `DuplicateTask` if the id is taken
    /// - `CyclicGraph` if the task depends on itself
    /// - `UnknownDependency` if a dependency is missing
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }

        let mut dep_indices = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(Error::CyclicGraph {
                    path: vec![task.id.to_string(), task.id.to_string()],
                });
            }
            let index = self
                .task_index
                .get(dep)
                .ok_or_else(|| Error::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
            dep_indices.push(*index);
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        for dep_index in dep_indices {
            self.graph.update_edge(dep_index, index, ());
        }
        Ok(index)
    }

    /// Declare that `to` depends on `from`.
    ///
    /// The edge is rolled back if it would close a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::TaskNotFound(from.clone()))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::TaskNotFound(to.clone()))?;

        if from_index == to_index {
            return Err(Error::CyclicGraph {
                path: vec![from.to_string(), to.to_string()],
            });
        }
        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if let Some(path) = self.find_cycle() {
            self.graph.remove_edge(edge);
            return Err(Error::CyclicGraph {
                path: path.iter().map(ToString::to_string).collect(),
            });
        }

        self.graph[to_index].dependencies.push(from.clone());
        Ok(())
    }

    /// Depth-first search for a cycle.
    ///
    /// Returns the ids along the cycle with the first id repeated at the end.
    /// The walk keeps its own stack, so long dependency chains are safe.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        if !is_cyclic_directed(&self.graph) {
            return None;
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            marks[root.index()] = Mark::OnStack;
            let mut stack = vec![(root, self.graph.neighbors_directed(root, Direction::Outgoing))];

            loop {
                let Some((node, neighbors)) = stack.last_mut() else {
                    break;
                };
                let node = *node;
                let Some(next) = neighbors.next() else {
                    marks[node.index()] = Mark::Done;
                    stack.pop();
                    continue;
                };

                match marks[next.index()] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut path: Vec<TaskId> = stack[start..]
                            .iter()
                            .map(|(n, _)| self.graph[*n].id.clone())
                            .collect();
                        path.push(self.graph[next].id.clone());
                        return Some(path);
                    }
                    Mark::Unvisited => {
                        marks[next.index()] = Mark::OnStack;
                        stack.push((next, self.graph.neighbors_directed(next, Direction::Outgoing)));
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    ///
    /// Callers must not edit `dependencies` through this reference; use
    /// `add_dependency` so the edge set stays in sync.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(from), self.task_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// All task ids in insertion order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks().map(|t| t.id.clone()).collect()
    }

    /// Get all tasks that the given task depends on (predecessors).
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that directly depend on the given task (successors).
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        nodes.sort();
        nodes.into_iter().map(|n| &self.graph[n]).collect()
    }

    /// Every task reachable from `id` through dependent edges, in insertion
    /// order. `id` itself is not included.
    pub fn descendants_of(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let mut nodes: Vec<NodeIndex> = seen.into_iter().collect();
        nodes.sort();
        nodes.into_iter().map(|n| self.graph[n].id.clone()).collect()
    }

    // ========== Scheduling Operations ==========

    /// Get all tasks ready to execute.
    ///
    /// A task is ready when it is Pending or Ready, is not in `completed`,
    /// and every dependency is in `completed`. Results are ordered by
    /// priority (highest first), then insertion order.
    pub fn ready_tasks(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut ready: Vec<(i32, NodeIndex)> = self
            .graph
            .node_indices()
            .filter(|&index| {
                let task = &self.graph[index];
                if !task.can_start() || completed.contains(&task.id) {
                    return false;
                }
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| completed.contains(&self.graph[dep].id))
            })
            .map(|index| (self.graph[index].priority, index))
            .collect();

        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ready
            .into_iter()
            .map(|(_, index)| self.graph[index].id.clone())
            .collect()
    }

    /// Check if every task in the graph is in `completed`.
    pub fn all_complete(&self, completed: &HashSet<TaskId>) -> bool {
        self.task_index.keys().all(|id| completed.contains(id))
    }

    /// Number of tasks currently in the given status.
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks().filter(|t| t.status == status).count()
    }

    /// Number of tasks in a terminal status.
    pub fn finished_count(&self) -> usize {
        self.tasks().filter(|t| t.is_finished()).count()
    }

    /// Get tasks in topological order (respecting dependencies).
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = self.sorted_indices()?;
        Ok(sorted.into_iter().map(|index| &self.graph[index]).collect())
    }

    fn sorted_indices(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| Error::CyclicGraph {
            path: vec![self.graph[cycle.node_id()].id.to_string()],
        })
    }

    /// Length of the longest dependency chain, weighted by duration.
    ///
    /// `finish[n] = max(finish[dep] for dep in deps(n)) + duration[n]`; the
    /// result is the largest finish time. Durations come from `estimates`,
    /// then the task's own estimate, then zero.
    pub fn critical_path(&self, estimates: &HashMap<TaskId, Duration>) -> Result<Duration> {
        let finish = self.finish_times(estimates)?;
        Ok(finish
            .values()
            .map(|(duration, _)| *duration)
            .max()
            .unwrap_or(Duration::ZERO))
    }

    /// Tasks on the critical path, from the first to start to the last to
    /// finish.
    pub fn critical_path_tasks(&self, estimates: &HashMap<TaskId, Duration>) -> Result<Vec<TaskId>> {
        let finish = self.finish_times(estimates)?;

        // Ties resolve to the earliest inserted task.
        let mut end: Option<(NodeIndex, Duration)> = None;
        for index in self.graph.node_indices() {
            let (duration, _) = finish[&index];
            if end.map_or(true, |(_, best)| duration > best) {
                end = Some((index, duration));
            }
        }

        let mut path = Vec::new();
        let mut cursor = end.map(|(index, _)| index);
        while let Some(index) = cursor {
            path.push(self.graph[index].id.clone());
            cursor = finish[&index].1;
        }
        path.reverse();
        Ok(path)
    }

    fn finish_times(
        &self,
        estimates: &HashMap<TaskId, Duration>,
    ) -> Result<HashMap<NodeIndex, (Duration, Option<NodeIndex>)>> {
        let mut finish: HashMap<NodeIndex, (Duration, Option<NodeIndex>)> =
            HashMap::with_capacity(self.graph.node_count());

        for index in self.sorted_indices()? {
            let task = &self.graph[index];
            let own = estimates
                .get(&task.id)
                .copied()
                .or(task.estimated_duration)
                .unwrap_or(Duration::ZERO);

            let mut deps: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .collect();
            deps.sort();

            let mut start = Duration::ZERO;
            let mut via = None;
            for dep in deps {
                let (dep_finish, _) = finish[&dep];
                if via.is_none() || dep_finish > start {
                    start = dep_finish;
                    via = Some(dep);
                }
            }

            finish.insert(index, (start + own, via));
        }

        Ok(finish)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
