//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work handed to agents. Each task tracks
//! its status, priority, hierarchy position, assignment, and results.

use crate::core::agent::AgentId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default estimate used when a task carries none.
pub const DEFAULT_ESTIMATE_MINUTES: u32 = 30;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for dependencies or assignment.
    #[default]
    Pending,
    /// Being worked on by an agent.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Cannot proceed (e.g. a dependency failed).
    Blocked,
}

impl TaskStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Progress must pass through in-progress: pending can only start or
    /// block, and only an in-progress task can finish.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }

    /// Check if the status is terminal (Completed or Failed).
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Kind of work a task represents.
///
/// The set is open: anything not in the known list is kept verbatim
/// as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    Analysis,
    #[default]
    Feature,
    Implementation,
    Testing,
    Research,
    Review,
    Custom(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Analysis => "analysis",
            TaskKind::Feature => "feature",
            TaskKind::Implementation => "implementation",
            TaskKind::Testing => "testing",
            TaskKind::Research => "research",
            TaskKind::Review => "review",
            TaskKind::Custom(s) => s,
        }
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "analysis" => TaskKind::Analysis,
            "feature" => TaskKind::Feature,
            "implementation" => TaskKind::Implementation,
            "testing" => TaskKind::Testing,
            "research" => TaskKind::Research,
            "review" => TaskKind::Review,
            _ => TaskKind::Custom(s),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        TaskKind::from(s.to_string())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured requirements attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    /// Conditions the result must satisfy.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Capabilities an agent needs to take this task.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Estimated duration, used by critical path analysis.
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    /// Free-form extras.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Structured results recorded when a task finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResults {
    /// Short human-readable outcome.
    pub summary: String,
    /// References to produced artifacts (paths, URLs, commit hashes).
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Free-form extras.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskResults {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub scope: String,
    pub kind: TaskKind,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub requirements: TaskRequirements,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
}

impl TaskSpec {
    pub fn new(scope: &str, kind: impl Into<TaskKind>, title: &str) -> Self {
        Self {
            scope: scope.to_string(),
            kind: kind.into(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Reject specs that cannot become a valid task.
    pub fn validate(&self) -> Result<()> {
        if self.scope.trim().is_empty() {
            return Err(Error::Validation("task scope must not be empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(Error::Validation("task title must not be empty".into()));
        }
        Ok(())
    }
}

/// A single task in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Repository or namespace this task belongs to.
    pub scope: String,
    pub kind: TaskKind,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Higher values are scheduled first.
    pub priority: i32,
    pub requirements: TaskRequirements,
    pub results: Option<TaskResults>,
    /// Parent task when this is a subtask.
    pub parent_id: Option<TaskId>,
    /// Agent currently responsible for this task.
    pub assigned_agent: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Write counter used by the store for compare-and-swap updates.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Build a pending task from a spec.
    pub fn from_spec(spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            scope: spec.scope,
            kind: spec.kind,
            title: spec.title,
            description: spec.description,
            status: TaskStatus::Pending,
            priority: spec.priority,
            requirements: spec.requirements,
            results: None,
            parent_id: spec.parent_id,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Move to `next`, validating the transition.
    ///
    /// Results are only recorded on finishing transitions.
    pub fn transition(&mut self, next: TaskStatus, results: Option<TaskResults>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: "task",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_finished() {
            if let Some(results) = results {
                self.results = Some(results);
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Estimated duration, falling back to the default.
    pub fn estimated_minutes(&self) -> u32 {
        self.requirements
            .estimated_minutes
            .unwrap_or(DEFAULT_ESTIMATE_MINUTES)
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

/// Task totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl TaskCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            counts.total += 1;
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    /// Tasks that will not change status again without intervention.
    pub fn resolved(&self) -> usize {
        self.completed + self.failed + self.blocked
    }

    /// Resolved share in `0.0..=1.0`; an empty set counts as done.
    pub fn fraction_resolved(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.resolved() as f64 / self.total as f64
        }
    }
}
