use thiserror::Error;

use crate::core::agent::AgentId;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Dependency {task} -> {depends_on} would create a cycle")]
    Cycle { task: TaskId, depends_on: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Timed out waiting for dependencies: {}", format_agents(.agents))]
    DependencyTimeout { agents: Vec<AgentId> },

    #[error("Dependencies failed: {}", format_agents(.agents))]
    DependencyFailed { agents: Vec<AgentId> },

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Cleanup finished with {} failure(s)", .failures.len())]
    CleanupPartialFailure {
        failures: Vec<crate::cleanup::CleanupFailure>,
    },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Concurrent modification of {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

fn format_agents(agents: &[AgentId]) -> String {
    agents
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
