//! Agent data model.
//!
//! An agent is a spawned worker process bound to a scope. The record
//! tracks the lifecycle status, heartbeat, and the opaque process handle
//! returned by the spawner.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key holding the reason an agent was terminated.
pub const TERMINATION_REASON_KEY: &str = "termination_reason";

/// Metadata key holding the reason an agent failed.
pub const FAILURE_REASON_KEY: &str = "failure_reason";

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Create a new unique agent identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Status of an agent in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered, process not yet confirmed running.
    #[default]
    Pending,
    /// Process confirmed running.
    Active,
    /// Finished its work.
    Completed,
    /// Failed to start or failed while running.
    Failed,
    /// Stopped by an operator, the engine, or cleanup.
    Terminated,
}

impl AgentStatus {
    /// Check if no further status change is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Terminated
        )
    }

    /// Whether the agent ended without completing its work.
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, AgentStatus::Failed | AgentStatus::Terminated)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        matches!(
            (self, next),
            (AgentStatus::Pending, AgentStatus::Active)
                | (AgentStatus::Pending, AgentStatus::Failed)
                | (AgentStatus::Pending, AgentStatus::Terminated)
                | (AgentStatus::Active, AgentStatus::Completed)
                | (AgentStatus::Active, AgentStatus::Failed)
                | (AgentStatus::Active, AgentStatus::Terminated)
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Pending => write!(f, "pending"),
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Completed => write!(f, "completed"),
            AgentStatus::Failed => write!(f, "failed"),
            AgentStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Opaque handle to a running worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Spawner-specific handle (pid, container id, ...).
    pub handle: String,
    /// Session identifier reported by the worker, if any.
    pub session_id: Option<String>,
}

/// A spawned worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Role label, e.g. "backend" or "architect".
    pub role: String,
    pub scope: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    /// Coordination channel this agent reports to.
    pub channel: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub last_heartbeat: DateTime<Utc>,
    pub process: Option<ProcessHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Agent {
    /// Create a pending agent record.
    pub fn new(role: &str, scope: &str) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            role: role.to_string(),
            scope: scope.to_string(),
            status: AgentStatus::Pending,
            capabilities: Vec::new(),
            channel: None,
            metadata: serde_json::Map::new(),
            last_heartbeat: now,
            process: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Move to `next`, validating the transition.
    pub fn transition(&mut self, next: AgentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                entity: "agent",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Merge metadata entries; allowed in any status.
    pub fn annotate(&mut self, metadata: serde_json::Map<String, serde_json::Value>) {
        self.metadata.extend(metadata);
        self.updated_at = Utc::now();
    }

    /// Read a string metadata entry.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a live agent last reported before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.last_heartbeat < cutoff
    }
}
