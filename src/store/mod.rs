//! Entity store ports.
//!
//! Managers talk to persistence only through these traits. Updates are
//! compare-and-swap on the entity `version`: a write carrying a stale
//! version fails with [`Error::Conflict`] and the caller re-reads and
//! retries via [`retry_on_conflict`].

mod memory;

pub use memory::{MemoryStore, StoreSnapshot};

use crate::core::agent::{Agent, AgentId, AgentStatus};
use crate::core::dag::DependencyEdge;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use tracing::debug;

/// Retries allowed for a read-modify-write that keeps losing the race.
pub const MAX_CONFLICT_RETRIES: usize = 8;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task. Fails with `Validation` if the id exists.
    async fn insert_task(&self, task: Task) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Replace a task if `task.version` matches the stored version.
    /// Returns the stored task with its bumped version.
    async fn update_task(&self, task: Task) -> Result<Task>;

    /// All tasks, optionally limited to one scope, in creation order.
    async fn list_tasks(&self, scope: Option<&str>) -> Result<Vec<Task>>;

    /// Insert tasks and edges together. Nothing is written on error.
    async fn insert_batch(&self, tasks: Vec<Task>, edges: Vec<DependencyEdge>) -> Result<()>;
}

#[async_trait]
pub trait DependencyRepository: Send + Sync {
    /// Insert an edge. Returns false if the same pair already exists.
    async fn insert_edge(&self, edge: DependencyEdge) -> Result<bool>;

    async fn remove_edge(&self, task_id: TaskId, depends_on: TaskId) -> Result<bool>;

    /// Edges where `task_id` is the dependent.
    async fn dependencies_of(&self, task_id: TaskId) -> Result<Vec<DependencyEdge>>;

    /// Edges where `task_id` is the dependency.
    async fn dependents_of(&self, task_id: TaskId) -> Result<Vec<DependencyEdge>>;

    /// Every edge whose dependent task belongs to `scope`.
    async fn list_edges(&self, scope: &str) -> Result<Vec<DependencyEdge>>;
}

/// Filter for agent listings.
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub scope: Option<String>,
    /// Empty matches every status.
    pub statuses: Vec<AgentStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AgentQuery {
    pub fn scope(scope: &str) -> Self {
        Self {
            scope: Some(scope.to_string()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[AgentStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.scope.as_deref().is_none_or(|s| s == agent.scope)
            && (self.statuses.is_empty() || self.statuses.contains(&agent.status))
    }
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn insert_agent(&self, agent: Agent) -> Result<Agent>;

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>>;

    /// Replace an agent if `agent.version` matches the stored version.
    async fn update_agent(&self, agent: Agent) -> Result<Agent>;

    /// Agents matching the query, oldest first, paginated.
    async fn list_agents(&self, query: &AgentQuery) -> Result<Vec<Agent>>;
}

/// Everything the orchestrator needs from persistence.
pub trait EntityStore: TaskRepository + AgentRepository + DependencyRepository {}

impl<T> EntityStore for T where T: TaskRepository + AgentRepository + DependencyRepository {}

/// Run `op` again while it fails with `Error::Conflict`.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(Error::Conflict { entity, id }) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!(entity, %id, attempt, "version conflict, retrying");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}
