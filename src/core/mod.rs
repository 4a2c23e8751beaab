//! Core data model: tasks, agents, and the task dependency graph.

pub mod agent;
pub mod dag;
pub mod task;

pub use agent::{Agent, AgentId, AgentStatus, ProcessHandle};
pub use dag::{CriticalPath, DependencyEdge, DependencyType, TaskDAG};
pub use task::{
    Task, TaskCounts, TaskId, TaskKind, TaskRequirements, TaskResults, TaskSpec, TaskStatus,
};
