//! In-memory entity store with JSON snapshot persistence.

use super::{AgentQuery, AgentRepository, DependencyRepository, TaskRepository};
use crate::core::agent::{Agent, AgentId};
use crate::core::dag::DependencyEdge;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub edges: Vec<DependencyEdge>,
}

#[derive(Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    agents: HashMap<AgentId, Agent>,
    edges: Vec<DependencyEdge>,
}

impl Tables {
    fn has_edge(&self, task_id: TaskId, depends_on: TaskId) -> bool {
        self.edges
            .iter()
            .any(|e| e.task_id == task_id && e.depends_on == depends_on)
    }
}

/// Process-local store backed by hash maps.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let tables = Tables {
            tasks: snapshot.tasks.into_iter().map(|t| (t.id, t)).collect(),
            agents: snapshot.agents.into_iter().map(|a| (a.id, a)).collect(),
            edges: snapshot.edges,
        };
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Copy current contents.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let mut agents: Vec<Agent> = tables.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            tasks,
            agents,
            edges: tables.edges.clone(),
        }
    }

    /// Load a snapshot from `path`. A missing file yields an empty store.
    pub async fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "MemoryStore::load");
        if !tokio::fs::try_exists(path).await? {
            debug!("snapshot not found, starting empty");
            return Ok(Self::new());
        }
        let contents = tokio::fs::read_to_string(path).await?;
        let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(Error::Validation(format!(
                "snapshot version {} is newer than supported {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        debug!(
            tasks = snapshot.tasks.len(),
            agents = snapshot.agents.len(),
            edges = snapshot.edges.len(),
            "snapshot loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Write a snapshot to `path`, keeping a `.bak` of the previous file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot().await;
        let contents = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(path).await? {
            tokio::fs::copy(path, path.with_extension("json.bak")).await?;
        }
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, path).await?;
        debug!(path = %path.display(), tasks = snapshot.tasks.len(), "snapshot saved");
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn insert_task(&self, mut task: Task) -> Result<Task> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(Error::Validation(format!("task {} already exists", task.id)));
        }
        task.version = 1;
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn update_task(&self, mut task: Task) -> Result<Task> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .tasks
            .get_mut(&task.id)
            .ok_or(Error::TaskNotFound(task.id))?;
        if stored.version != task.version {
            return Err(Error::Conflict {
                entity: "task",
                id: task.id.to_string(),
            });
        }
        task.version += 1;
        task.updated_at = Utc::now();
        *stored = task.clone();
        Ok(task)
    }

    async fn list_tasks(&self, scope: Option<&str>) -> Result<Vec<Task>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| scope.is_none_or(|s| s == t.scope))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn insert_batch(&self, tasks: Vec<Task>, edges: Vec<DependencyEdge>) -> Result<()> {
        let mut tables = self.tables.write().await;

        let mut new_ids = HashSet::new();
        for task in &tasks {
            if tables.tasks.contains_key(&task.id) || !new_ids.insert(task.id) {
                return Err(Error::Validation(format!("task {} already exists", task.id)));
            }
        }
        for edge in &edges {
            for id in [edge.task_id, edge.depends_on] {
                if !new_ids.contains(&id) && !tables.tasks.contains_key(&id) {
                    return Err(Error::TaskNotFound(id));
                }
            }
        }

        for mut task in tasks {
            task.version = 1;
            tables.tasks.insert(task.id, task);
        }
        for edge in edges {
            if !tables.has_edge(edge.task_id, edge.depends_on) {
                tables.edges.push(edge);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DependencyRepository for MemoryStore {
    async fn insert_edge(&self, edge: DependencyEdge) -> Result<bool> {
        let mut tables = self.tables.write().await;
        for id in [edge.task_id, edge.depends_on] {
            if !tables.tasks.contains_key(&id) {
                return Err(Error::TaskNotFound(id));
            }
        }
        if tables.has_edge(edge.task_id, edge.depends_on) {
            return Ok(false);
        }
        tables.edges.push(edge);
        Ok(true)
    }

    async fn remove_edge(&self, task_id: TaskId, depends_on: TaskId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.edges.len();
        tables
            .edges
            .retain(|e| !(e.task_id == task_id && e.depends_on == depends_on));
        Ok(tables.edges.len() != before)
    }

    async fn dependencies_of(&self, task_id: TaskId) -> Result<Vec<DependencyEdge>> {
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn dependents_of(&self, task_id: TaskId) -> Result<Vec<DependencyEdge>> {
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .filter(|e| e.depends_on == task_id)
            .cloned()
            .collect())
    }

    async fn list_edges(&self, scope: &str) -> Result<Vec<DependencyEdge>> {
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .filter(|e| {
                tables
                    .tasks
                    .get(&e.task_id)
                    .is_some_and(|t| t.scope == scope)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AgentRepository for MemoryStore {
    async fn insert_agent(&self, mut agent: Agent) -> Result<Agent> {
        let mut tables = self.tables.write().await;
        if tables.agents.contains_key(&agent.id) {
            return Err(Error::Validation(format!("agent {} already exists", agent.id)));
        }
        agent.version = 1;
        tables.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(self.tables.read().await.agents.get(&id).cloned())
    }

    async fn update_agent(&self, mut agent: Agent) -> Result<Agent> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .agents
            .get_mut(&agent.id)
            .ok_or(Error::AgentNotFound(agent.id))?;
        if stored.version != agent.version {
            return Err(Error::Conflict {
                entity: "agent",
                id: agent.id.to_string(),
            });
        }
        agent.version += 1;
        agent.updated_at = Utc::now();
        *stored = agent.clone();
        Ok(agent)
    }

    async fn list_agents(&self, query: &AgentQuery) -> Result<Vec<Agent>> {
        let tables = self.tables.read().await;
        let mut agents: Vec<Agent> = tables
            .agents
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let agents = agents.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => agents.take(limit).collect(),
            None => agents.collect(),
        })
    }
}
