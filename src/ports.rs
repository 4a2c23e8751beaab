//! Narrow interfaces to external collaborators.
//!
//! The orchestrator never talks to a process runtime, chat layer,
//! classifier, or search index directly. Reference adapters live in
//! [`crate::spawner`], [`crate::channels`], and [`crate::planner`].

use crate::core::agent::{AgentId, ProcessHandle};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable carrying the agent id into the worker process.
pub const ENV_AGENT_ID: &str = "CONDUCTOR_AGENT_ID";
/// Environment variable carrying the working scope.
pub const ENV_SCOPE: &str = "CONDUCTOR_SCOPE";
/// Environment variable carrying the agent role.
pub const ENV_ROLE: &str = "CONDUCTOR_ROLE";
/// Environment variable carrying a session to resume.
pub const ENV_RESUME_SESSION: &str = "CONDUCTOR_RESUME_SESSION";
/// Environment variable carrying the capability tier chosen for the agent.
pub const ENV_TIER: &str = "CONDUCTOR_TIER";
/// Environment variable naming the run's coordination channel.
pub const ENV_CHANNEL: &str = "CONDUCTOR_CHANNEL";

/// Everything a spawner needs to start a worker.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub agent_id: AgentId,
    pub role: String,
    /// Opaque instructions, passed through untouched.
    pub prompt: String,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
}

impl ProcessRequest {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, request: ProcessRequest) -> Result<ProcessHandle>;

    async fn kill(&self, handle: &ProcessHandle) -> Result<()>;
}

/// Summary of a coordination channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub closed: bool,
}

/// Member of a coordination channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub agent_id: Option<AgentId>,
    pub active: bool,
    pub last_seen: DateTime<Utc>,
}

#[async_trait]
pub trait CoordinationChannel: Send + Sync {
    /// Create a channel, or return the existing one with that name.
    async fn create_channel(&self, name: &str, scope: &str) -> Result<ChannelInfo>;

    async fn send_message(&self, channel: &str, sender: &str, body: &str) -> Result<()>;

    async fn list_participants(&self, channel: &str) -> Result<Vec<Participant>>;

    /// Open channels, optionally limited to a scope.
    async fn list_channels(&self, scope: Option<&str>) -> Result<Vec<ChannelInfo>>;

    async fn close(&self, channel: &str) -> Result<()>;
}

/// Classifier verdict for a piece of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    /// Capability tier label, e.g. "basic", "standard", "advanced".
    pub tier: String,
    /// Normalized score in `0.0..=1.0`.
    pub score: f32,
    pub rationale: String,
}

#[async_trait]
pub trait ComplexityClassifier: Send + Sync {
    async fn analyze(&self, description: &str) -> Result<ComplexityAnalysis>;
}

/// A prior note returned by knowledge search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub title: String,
    pub body: String,
    pub relevance: f32,
}

#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, scope: &str, query: &str) -> Result<Vec<Note>>;
}
