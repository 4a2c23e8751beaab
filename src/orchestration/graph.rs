//! Task graph manager.
//!
//! Owns every mutation of tasks and dependency edges. Reads go straight to
//! the store; graph questions (readiness, cycles, critical path) are
//! answered on a [`TaskDAG`] snapshot of one scope.

use crate::core::agent::AgentId;
use crate::core::dag::{CriticalPath, DependencyEdge, DependencyType, TaskDAG};
use crate::core::task::{Task, TaskCounts, TaskId, TaskResults, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventPayload};
use crate::store::{retry_on_conflict, EntityStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One entry of a [`TaskGraphManager::breakdown`] batch.
#[derive(Debug, Clone)]
pub struct SubtaskSpec {
    pub spec: TaskSpec,
    /// Indices into the same batch that this subtask depends on.
    pub depends_on: Vec<usize>,
}

impl SubtaskSpec {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, index: usize) -> Self {
        self.depends_on.push(index);
        self
    }
}

/// A task and its descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTree {
    pub task: Task,
    /// Children in creation order.
    pub children: Vec<TaskTree>,
}

impl TaskTree {
    /// Number of tasks in the tree, including the root.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TaskTree::size).sum::<usize>()
    }
}

pub struct TaskGraphManager {
    store: Arc<dyn EntityStore>,
    bus: Arc<EventBus>,
    /// Serializes edge mutations so cycle checks see a stable graph.
    edge_lock: Mutex<()>,
}

impl TaskGraphManager {
    pub fn new(store: Arc<dyn EntityStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            edge_lock: Mutex::new(()),
        }
    }

    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        spec.validate()?;
        if let Some(parent_id) = spec.parent_id {
            let parent = self.get(parent_id).await?;
            if parent.scope != spec.scope {
                return Err(Error::Validation(format!(
                    "parent {} is in scope {}, not {}",
                    parent_id.short(),
                    parent.scope,
                    spec.scope
                )));
            }
        }

        let task = self.store.insert_task(Task::from_spec(spec)).await?;
        info!(task = %task.id.short(), title = %task.title, scope = %task.scope, "task created");
        self.publish_update(&task, None);
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or(Error::TaskNotFound(id))
    }

    pub async fn list(&self, scope: &str) -> Result<Vec<Task>> {
        self.store.list_tasks(Some(scope)).await
    }

    /// Record that `task_id` depends on `depends_on`.
    ///
    /// Duplicate edges are accepted without change. A new edge publishes a
    /// task update for `task_id` with its status unchanged, since its
    /// readiness may have changed.
    pub async fn add_dependency(
        &self,
        task_id: TaskId,
        depends_on: TaskId,
        dependency_type: DependencyType,
    ) -> Result<()> {
        let _guard = self.edge_lock.lock().await;

        let task = self.get(task_id).await?;
        let dependency = self.get(depends_on).await?;
        if task.scope != dependency.scope {
            return Err(Error::Validation(format!(
                "cannot link tasks across scopes ({} and {})",
                task.scope, dependency.scope
            )));
        }

        let dag = self.load_dag(&task.scope).await?;
        if dag.has_dependency(&task_id, &depends_on) {
            debug!(task = %task_id.short(), depends_on = %depends_on.short(), "dependency exists");
            return Ok(());
        }
        if dag.would_create_cycle(&task_id, &depends_on) {
            return Err(Error::Cycle {
                task: task_id,
                depends_on,
            });
        }

        self.store
            .insert_edge(DependencyEdge::new(task_id, depends_on, dependency_type))
            .await?;
        debug!(task = %task_id.short(), depends_on = %depends_on.short(), "dependency added");
        self.publish_update(&task, Some(task.status));
        Ok(())
    }

    /// Drop an edge. Publishes like [`add_dependency`](Self::add_dependency)
    /// when an edge was actually removed.
    pub async fn remove_dependency(&self, task_id: TaskId, depends_on: TaskId) -> Result<bool> {
        let _guard = self.edge_lock.lock().await;
        let removed = self.store.remove_edge(task_id, depends_on).await?;
        if removed {
            debug!(task = %task_id.short(), depends_on = %depends_on.short(), "dependency removed");
            let task = self.get(task_id).await?;
            self.publish_update(&task, Some(task.status));
        }
        Ok(removed)
    }

    /// Tasks that `task_id` depends on.
    pub async fn list_dependencies(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        self.get(task_id).await?;
        let edges = self.store.dependencies_of(task_id).await?;
        Ok(edges.into_iter().map(|e| e.depends_on).collect())
    }

    /// Tasks that depend on `task_id`.
    pub async fn list_dependents(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        self.get(task_id).await?;
        let edges = self.store.dependents_of(task_id).await?;
        Ok(edges.into_iter().map(|e| e.task_id).collect())
    }

    /// Move a task to `status`.
    ///
    /// Requesting the current status succeeds without publishing.
    pub async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        results: Option<TaskResults>,
    ) -> Result<Task> {
        let (task, previous) =
            retry_on_conflict(|| self.try_update_status(task_id, status, results.clone())).await?;
        if let Some(previous) = previous {
            info!(task = %task.id.short(), from = %previous, to = %status, "task status changed");
            self.publish_update(&task, Some(previous));
        }
        Ok(task)
    }

    async fn try_update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        results: Option<TaskResults>,
    ) -> Result<(Task, Option<TaskStatus>)> {
        let mut task = self.get(task_id).await?;
        let previous = task.status;
        if previous == status {
            return Ok((task, None));
        }
        task.transition(status, results)?;
        let saved = self.store.update_task(task).await?;
        Ok((saved, Some(previous)))
    }

    /// Give a task to an agent.
    ///
    /// A pending task whose dependencies are all complete starts
    /// immediately; otherwise it stays pending with the agent recorded.
    pub async fn assign(&self, task_id: TaskId, agent_id: AgentId) -> Result<Task> {
        let (task, previous) = retry_on_conflict(|| self.try_assign(task_id, agent_id)).await?;
        debug!(
            task = %task.id.short(),
            agent = %agent_id.short(),
            status = %task.status,
            "task assigned"
        );
        self.publish_update(&task, Some(previous));
        Ok(task)
    }

    async fn try_assign(&self, task_id: TaskId, agent_id: AgentId) -> Result<(Task, TaskStatus)> {
        let mut task = self.get(task_id).await?;
        if task.is_finished() {
            return Err(Error::Validation(format!(
                "task {} is already {}",
                task_id.short(),
                task.status
            )));
        }
        let previous = task.status;
        task.assigned_agent = Some(agent_id);
        if task.status == TaskStatus::Pending && self.dependencies_complete(task_id).await? {
            task.transition(TaskStatus::InProgress, None)?;
        }
        let saved = self.store.update_task(task).await?;
        Ok((saved, previous))
    }

    async fn dependencies_complete(&self, task_id: TaskId) -> Result<bool> {
        for edge in self.store.dependencies_of(task_id).await? {
            let dependency = self.get(edge.depends_on).await?;
            if dependency.status != TaskStatus::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Pending tasks whose dependencies are all complete, highest priority
    /// first, then oldest.
    pub async fn find_ready(&self, scope: &str) -> Result<Vec<Task>> {
        let dag = self.load_dag(scope).await?;
        Ok(dag.ready_tasks().into_iter().cloned().collect())
    }

    /// The task `root` and everything beneath it by parent link.
    pub async fn hierarchy(&self, root: TaskId) -> Result<TaskTree> {
        let root = self.get(root).await?;
        let mut children: HashMap<TaskId, Vec<Task>> = HashMap::new();
        for task in self.store.list_tasks(Some(&root.scope)).await? {
            if let Some(parent) = task.parent_id {
                children.entry(parent).or_default().push(task);
            }
        }
        Ok(build_tree(root, &mut children))
    }

    /// Create subtasks of `parent` and their edges in one write.
    ///
    /// Subtasks inherit the parent's scope when their own is empty. Index
    /// errors and cycles inside the batch are rejected before anything is
    /// written.
    pub async fn breakdown(&self, parent: TaskId, subtasks: Vec<SubtaskSpec>) -> Result<Vec<Task>> {
        let parent = self.get(parent).await?;
        let count = subtasks.len();

        let mut tasks = Vec::with_capacity(count);
        let mut links = Vec::with_capacity(count);
        for (index, subtask) in subtasks.into_iter().enumerate() {
            let mut spec = subtask.spec;
            if spec.scope.is_empty() {
                spec.scope = parent.scope.clone();
            }
            if spec.scope != parent.scope {
                return Err(Error::Validation(format!(
                    "subtask {} scope {} differs from parent scope {}",
                    index, spec.scope, parent.scope
                )));
            }
            spec.validate()?;
            for &dep in &subtask.depends_on {
                if dep >= count || dep == index {
                    return Err(Error::Validation(format!(
                        "subtask {} has invalid dependency index {}",
                        index, dep
                    )));
                }
            }
            tasks.push(Task::from_spec(spec.with_parent(parent.id)));
            links.push(subtask.depends_on);
        }

        let mut dag = TaskDAG::new();
        for task in &tasks {
            dag.add_task(task.clone());
        }
        let mut edges = Vec::new();
        for (index, deps) in links.iter().enumerate() {
            for &dep in deps {
                let (task_id, depends_on) = (tasks[index].id, tasks[dep].id);
                dag.add_dependency(&task_id, &depends_on, DependencyType::Completion)?;
                edges.push(DependencyEdge::new(task_id, depends_on, DependencyType::Completion));
            }
        }

        self.store.insert_batch(tasks.clone(), edges).await?;
        info!(parent = %parent.id.short(), subtasks = tasks.len(), "task broken down");

        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            let task = self.get(task.id).await?;
            self.publish_update(&task, None);
            created.push(task);
        }
        Ok(created)
    }

    pub async fn critical_path(&self, scope: &str) -> Result<CriticalPath> {
        self.load_dag(scope).await?.critical_path()
    }

    /// Status counts for a scope.
    pub async fn progress(&self, scope: &str) -> Result<TaskCounts> {
        let tasks = self.store.list_tasks(Some(scope)).await?;
        Ok(TaskCounts::from_tasks(&tasks))
    }

    /// Status counts for specific tasks.
    pub async fn progress_of(&self, ids: &[TaskId]) -> Result<TaskCounts> {
        let mut tasks = Vec::with_capacity(ids.len());
        for &id in ids {
            tasks.push(self.get(id).await?);
        }
        Ok(TaskCounts::from_tasks(&tasks))
    }

    async fn load_dag(&self, scope: &str) -> Result<TaskDAG> {
        let tasks = self.store.list_tasks(Some(scope)).await?;
        let edges = self.store.list_edges(scope).await?;
        Ok(TaskDAG::from_parts(tasks, &edges))
    }

    fn publish_update(&self, task: &Task, previous: Option<TaskStatus>) {
        self.bus.publish(Event::new(
            &task.scope,
            EventPayload::TaskUpdate {
                task_id: task.id,
                previous,
                status: task.status,
                agent_id: task.assigned_agent,
            },
        ));
    }
}

fn build_tree(task: Task, children: &mut HashMap<TaskId, Vec<Task>>) -> TaskTree {
    let kids = children.remove(&task.id).unwrap_or_default();
    TaskTree {
        task,
        children: kids
            .into_iter()
            .map(|child| build_tree(child, children))
            .collect(),
    }
}
