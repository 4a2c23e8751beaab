//! Task DAG (Directed Acyclic Graph) for dependency analysis.
//!
//! The `TaskDAG` is an in-memory snapshot of one scope's tasks and
//! dependency edges. The graph manager builds one from the store whenever
//! it needs reachability, readiness, or path analysis.
//!
//! Edges point from the dependency to the dependent: an edge `a -> b`
//! means `a` must complete before `b` can start.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Type of dependency between tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyType {
    /// The dependent may start once the dependency has completed.
    #[default]
    Completion,
    /// The dependent consumes the dependency's results.
    Data,
    /// Caller-defined relationship.
    Custom {
        /// Label describing the relationship.
        label: String,
    },
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Completion => write!(f, "completion"),
            DependencyType::Data => write!(f, "data"),
            DependencyType::Custom { label } => write!(f, "custom: {}", label),
        }
    }
}

/// A stored dependency edge: `task_id` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub task_id: TaskId,
    pub depends_on: TaskId,
    #[serde(default)]
    pub dependency_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

impl DependencyEdge {
    pub fn new(task_id: TaskId, depends_on: TaskId, dependency_type: DependencyType) -> Self {
        Self {
            task_id,
            depends_on,
            dependency_type,
            created_at: Utc::now(),
        }
    }
}

/// Longest chain of work through a scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Tasks along the path, dependencies first.
    pub tasks: Vec<Task>,
    /// Sum of the estimates of unfinished tasks on the path.
    pub estimated_minutes: u32,
}

/// Ordering used for ready tasks: priority descending, then oldest first.
pub fn schedule_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// The task dependency graph.
///
/// Nodes are tasks, and edges represent dependencies with metadata
/// about the type of dependency.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, DependencyType>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a DAG from stored tasks and edges.
    ///
    /// Edges referencing tasks outside `tasks` are skipped.
    pub fn from_parts(tasks: Vec<Task>, edges: &[DependencyEdge]) -> Self {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task);
        }
        for edge in edges {
            if let (Some(&from), Some(&to)) = (
                dag.task_index.get(&edge.depends_on),
                dag.task_index.get(&edge.task_id),
            ) {
                dag.graph.add_edge(from, to, edge.dependency_type.clone());
            }
        }
        dag
    }

    /// Add a task to the DAG.
    ///
    /// If the task already exists (same TaskId), returns the existing NodeIndex.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Whether making `task` depend on `depends_on` would close a cycle.
    ///
    /// True for self-edges and whenever `task` already reaches
    /// `depends_on` through existing edges.
    pub fn would_create_cycle(&self, task: &TaskId, depends_on: &TaskId) -> bool {
        if task == depends_on {
            return true;
        }
        match (self.task_index.get(task), self.task_index.get(depends_on)) {
            (Some(&task_idx), Some(&dep_idx)) => {
                has_path_connecting(&self.graph, task_idx, dep_idx, None)
            }
            _ => false,
        }
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// # Errors
    /// Returns an error if either task is missing or the edge would close
    /// a cycle. The graph is unchanged on error.
    pub fn add_dependency(
        &mut self,
        task: &TaskId,
        depends_on: &TaskId,
        dep_type: DependencyType,
    ) -> Result<()> {
        let to = *self
            .task_index
            .get(task)
            .ok_or(Error::TaskNotFound(*task))?;
        let from = *self
            .task_index
            .get(depends_on)
            .ok_or(Error::TaskNotFound(*depends_on))?;

        if self.would_create_cycle(task, depends_on) {
            return Err(Error::Cycle {
                task: *task,
                depends_on: *depends_on,
            });
        }

        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, dep_type);
        }
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if `task` directly depends on `depends_on`.
    pub fn has_dependency(&self, task: &TaskId, depends_on: &TaskId) -> bool {
        match (self.task_index.get(depends_on), self.task_index.get(task)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    /// Get all tasks that the given task depends on.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that depend on the given task.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    // ========== Scheduling Operations ==========

    /// Whether every dependency of `id` is completed.
    pub fn dependencies_satisfied(&self, id: &TaskId) -> bool {
        self.get_dependencies(id)
            .iter()
            .all(|dep| dep.status == TaskStatus::Completed)
    }

    /// Get all tasks ready to execute.
    ///
    /// A task is ready if it is pending and every task it depends on is
    /// completed. The result is sorted with [`schedule_order`].
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| self.dependencies_satisfied(&task.id))
            .collect();
        ready.sort_by(|a, b| schedule_order(a, b));
        ready
    }

    /// Get tasks in topological order (dependencies first).
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let title = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.title.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", title))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Compute the longest estimated chain of unfinished work.
    ///
    /// Completed tasks weigh zero; every other task weighs its estimate.
    pub fn critical_path(&self) -> Result<CriticalPath> {
        let order = toposort(&self.graph, None).map_err(|_| {
            Error::Validation("Cannot compute critical path of a cyclic graph".into())
        })?;

        let weight = |idx: NodeIndex| -> u32 {
            match self.graph.node_weight(idx) {
                Some(t) if t.status == TaskStatus::Completed => 0,
                Some(t) => t.estimated_minutes(),
                None => 0,
            }
        };

        let mut best: HashMap<NodeIndex, (u32, Option<NodeIndex>)> = HashMap::new();
        for &idx in &order {
            let (base, prev) = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|p| best.get(&p).map(|(cost, _)| (*cost, Some(p))))
                .max_by_key(|(cost, _)| *cost)
                .unwrap_or((0, None));
            best.insert(idx, (base + weight(idx), prev));
        }

        let Some((&end, &(total, _))) = best.iter().max_by(|a, b| {
            a.1 .0.cmp(&b.1 .0).then_with(|| {
                // Stable tie-break: prefer the older task.
                let ta = self.graph.node_weight(*a.0).map(|t| t.created_at);
                let tb = self.graph.node_weight(*b.0).map(|t| t.created_at);
                tb.cmp(&ta)
            })
        }) else {
            return Ok(CriticalPath::default());
        };

        let mut chain = Vec::new();
        let mut cursor = Some(end);
        while let Some(idx) = cursor {
            if let Some(task) = self.graph.node_weight(idx) {
                chain.push(task.clone());
            }
            cursor = best.get(&idx).and_then(|(_, prev)| *prev);
        }
        chain.reverse();

        Ok(CriticalPath {
            tasks: chain,
            estimated_minutes: total,
        })
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
