//! Agent lifecycle manager.
//!
//! Owns every mutation of agent records: registration, dependency-gated
//! launch, status changes, heartbeats, and termination. Each status change
//! is written with compare-and-swap and announced on the event bus.

use crate::config::WaiterConfig;
use crate::core::agent::{
    Agent, AgentId, AgentStatus, ProcessHandle, FAILURE_REASON_KEY, TERMINATION_REASON_KEY,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventPayload};
use crate::orchestration::waiter::{DependencyWaiter, WaitOptions};
use crate::ports::{ProcessRequest, ProcessSpawner, ENV_AGENT_ID, ENV_ROLE, ENV_SCOPE};
use crate::store::{retry_on_conflict, AgentQuery, EntityStore};
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything needed to create and start an agent.
#[derive(Debug, Clone, Default)]
pub struct AgentSpec {
    pub role: String,
    pub scope: String,
    pub capabilities: Vec<String>,
    /// Opaque instructions handed to the spawner.
    pub prompt: String,
    /// Agents that must complete before this one starts.
    pub depends_on: Vec<AgentId>,
    /// Overrides the configured dependency timeout.
    pub dependency_timeout: Option<Duration>,
    pub channel: Option<String>,
    pub metadata: Map<String, Value>,
    /// Extra environment for the worker process.
    pub env: Vec<(String, String)>,
}

impl AgentSpec {
    pub fn new(role: &str, scope: &str) -> Self {
        Self {
            role: role.to_string(),
            scope: scope.to_string(),
            ..Default::default()
        }
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    pub fn with_dependencies(mut self, agents: impl IntoIterator<Item = AgentId>) -> Self {
        self.depends_on.extend(agents);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = Some(timeout);
        self
    }

    pub fn with_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// The launch half of this definition.
    pub fn launch_plan(&self) -> LaunchPlan {
        LaunchPlan {
            prompt: self.prompt.clone(),
            depends_on: self.depends_on.clone(),
            dependency_timeout: self.dependency_timeout,
            env: self.env.clone(),
        }
    }
}

/// How to start an already registered agent.
#[derive(Debug, Clone, Default)]
pub struct LaunchPlan {
    pub prompt: String,
    pub depends_on: Vec<AgentId>,
    pub dependency_timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
}

pub struct AgentLifecycleManager {
    store: Arc<dyn EntityStore>,
    bus: Arc<EventBus>,
    spawner: Arc<dyn ProcessSpawner>,
    waiter: DependencyWaiter,
    wait_defaults: WaitOptions,
}

impl AgentLifecycleManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        bus: Arc<EventBus>,
        spawner: Arc<dyn ProcessSpawner>,
        config: &WaiterConfig,
    ) -> Self {
        let waiter = DependencyWaiter::new(Arc::clone(&store), Arc::clone(&bus));
        Self {
            store,
            bus,
            spawner,
            waiter,
            wait_defaults: WaitOptions::from_config(config),
        }
    }

    pub fn waiter(&self) -> &DependencyWaiter {
        &self.waiter
    }

    /// Register then launch.
    pub async fn spawn(&self, spec: AgentSpec) -> Result<Agent> {
        let plan = spec.launch_plan();
        let agent = self.register(spec).await?;
        self.launch(agent.id, &plan).await
    }

    /// Create a pending agent record without starting anything.
    pub async fn register(&self, spec: AgentSpec) -> Result<Agent> {
        if spec.role.trim().is_empty() {
            return Err(Error::Validation("agent role must not be empty".into()));
        }
        if spec.scope.trim().is_empty() {
            return Err(Error::Validation("agent scope must not be empty".into()));
        }

        let mut agent = Agent::new(&spec.role, &spec.scope);
        agent.capabilities = spec.capabilities;
        agent.channel = spec.channel;
        agent.metadata = spec.metadata;
        let agent = self.store.insert_agent(agent).await?;
        debug!(agent = %agent.id.short(), role = %agent.role, "agent registered");
        Ok(agent)
    }

    /// Start a registered agent once its dependencies have completed.
    ///
    /// # Errors
    /// `DependencyFailed` / `DependencyTimeout` when a dependency does not
    /// complete, `SpawnFailed` when the process cannot start. In each case
    /// the agent is marked failed and no process is left running.
    pub async fn launch(&self, agent_id: AgentId, plan: &LaunchPlan) -> Result<Agent> {
        let agent = self.get(agent_id).await?;
        ensure_pending(&agent)?;

        if !plan.depends_on.is_empty() {
            let mut options = self.wait_defaults.clone().fail_fast();
            if let Some(timeout) = plan.dependency_timeout {
                options.timeout = timeout;
            }
            debug!(
                agent = %agent_id.short(),
                dependencies = plan.depends_on.len(),
                "waiting before launch"
            );
            let waited = self
                .waiter
                .wait_for(&plan.depends_on, &agent.scope, options)
                .await
                .and_then(|result| result.into_result());
            if let Err(e) = waited {
                self.mark_failed(agent_id, &e.to_string()).await;
                return Err(e);
            }
            // Terminated while we waited.
            ensure_pending(&self.get(agent_id).await?)?;
        }

        let request = self.process_request(&agent, plan);
        let handle = match self.spawner.spawn(request).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = match e {
                    Error::SpawnFailed(msg) => msg,
                    other => other.to_string(),
                };
                warn!(agent = %agent_id.short(), error = %reason, "spawn failed");
                self.mark_failed(agent_id, &reason).await;
                return Err(Error::SpawnFailed(reason));
            }
        };

        match retry_on_conflict(|| self.try_activate(agent_id, handle.clone())).await {
            Ok(agent) => {
                info!(agent = %agent.id.short(), role = %agent.role, pid = %handle.handle, "agent spawned");
                self.publish(
                    &agent,
                    EventPayload::AgentSpawned {
                        agent_id,
                        role: agent.role.clone(),
                        previous: AgentStatus::Pending,
                        status: AgentStatus::Active,
                    },
                );
                Ok(agent)
            }
            Err(e) => {
                if let Err(kill_err) = self.spawner.kill(&handle).await {
                    warn!(agent = %agent_id.short(), error = %kill_err, "failed to kill orphaned process");
                }
                Err(e)
            }
        }
    }

    async fn try_activate(&self, agent_id: AgentId, handle: ProcessHandle) -> Result<Agent> {
        let mut agent = self.get(agent_id).await?;
        agent.transition(AgentStatus::Active)?;
        agent.process = Some(handle);
        agent.last_heartbeat = Utc::now();
        self.store.update_agent(agent).await
    }

    fn process_request(&self, agent: &Agent, plan: &LaunchPlan) -> ProcessRequest {
        let mut env = vec![
            (ENV_AGENT_ID.to_string(), agent.id.to_string()),
            (ENV_SCOPE.to_string(), agent.scope.clone()),
            (ENV_ROLE.to_string(), agent.role.clone()),
        ];
        env.extend(plan.env.iter().cloned());
        ProcessRequest {
            agent_id: agent.id,
            role: agent.role.clone(),
            prompt: plan.prompt.clone(),
            env,
            working_dir: PathBuf::from(&agent.scope),
        }
    }

    /// Stop an agent.
    ///
    /// Returns `false` without side effects when the agent is already
    /// terminal. Of several concurrent callers exactly one gets `true`.
    pub async fn terminate(&self, agent_id: AgentId, reason: &str) -> Result<bool> {
        let outcome = retry_on_conflict(|| self.try_terminate(agent_id, reason)).await?;
        let Some((agent, previous)) = outcome else {
            debug!(agent = %agent_id.short(), "terminate: already terminal");
            return Ok(false);
        };

        if let Some(handle) = &agent.process {
            if let Err(e) = self.spawner.kill(handle).await {
                warn!(agent = %agent_id.short(), error = %e, "failed to kill agent process");
            }
        }
        info!(agent = %agent_id.short(), reason, "agent terminated");
        self.publish(
            &agent,
            EventPayload::AgentTerminated {
                agent_id,
                previous,
                reason: Some(reason.to_string()),
            },
        );
        Ok(true)
    }

    async fn try_terminate(
        &self,
        agent_id: AgentId,
        reason: &str,
    ) -> Result<Option<(Agent, AgentStatus)>> {
        let mut agent = self.get(agent_id).await?;
        if agent.is_terminal() {
            return Ok(None);
        }
        let previous = agent.status;
        agent.transition(AgentStatus::Terminated)?;
        agent
            .metadata
            .insert(TERMINATION_REASON_KEY.to_string(), Value::from(reason));
        let saved = self.store.update_agent(agent).await?;
        Ok(Some((saved, previous)))
    }

    /// Refresh the heartbeat. Terminal agents are left alone.
    pub async fn heartbeat(&self, agent_id: AgentId) -> Result<()> {
        retry_on_conflict(|| async {
            let mut agent = self.get(agent_id).await?;
            if agent.is_terminal() {
                debug!(agent = %agent_id.short(), status = %agent.status, "heartbeat ignored");
                return Ok(());
            }
            agent.last_heartbeat = Utc::now();
            self.store.update_agent(agent).await.map(|_| ())
        })
        .await
    }

    /// Move an agent to `status`, merging `metadata`.
    ///
    /// Terminating goes through [`terminate`](Self::terminate), using the
    /// `termination_reason` entry of `metadata` when present.
    pub async fn update_status(
        &self,
        agent_id: AgentId,
        status: AgentStatus,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Agent> {
        if status == AgentStatus::Terminated {
            let reason = metadata
                .as_ref()
                .and_then(|m| m.get(TERMINATION_REASON_KEY))
                .and_then(|v| v.as_str())
                .unwrap_or("status_update")
                .to_string();
            if let Some(metadata) = metadata {
                self.annotate(agent_id, metadata).await?;
            }
            self.terminate(agent_id, &reason).await?;
            return self.get(agent_id).await;
        }

        let (agent, previous) =
            retry_on_conflict(|| self.try_update_status(agent_id, status, metadata.clone())).await?;
        if let Some(previous) = previous {
            info!(agent = %agent.id.short(), from = %previous, to = %status, "agent status changed");
            self.publish(
                &agent,
                EventPayload::AgentStatusChange {
                    agent_id,
                    previous,
                    status,
                },
            );
        }
        Ok(agent)
    }

    async fn try_update_status(
        &self,
        agent_id: AgentId,
        status: AgentStatus,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(Agent, Option<AgentStatus>)> {
        let mut agent = self.get(agent_id).await?;
        let previous = agent.status;
        if previous == status {
            return Ok((agent, None));
        }
        agent.transition(status)?;
        if let Some(metadata) = metadata {
            agent.metadata.extend(metadata);
        }
        let saved = self.store.update_agent(agent).await?;
        Ok((saved, Some(previous)))
    }

    /// Merge metadata; allowed in any status, no event.
    pub async fn annotate(&self, agent_id: AgentId, metadata: Map<String, Value>) -> Result<Agent> {
        retry_on_conflict(|| async {
            let mut agent = self.get(agent_id).await?;
            agent.annotate(metadata.clone());
            self.store.update_agent(agent).await
        })
        .await
    }

    pub async fn get(&self, agent_id: AgentId) -> Result<Agent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or(Error::AgentNotFound(agent_id))
    }

    pub async fn list(&self, query: &AgentQuery) -> Result<Vec<Agent>> {
        self.store.list_agents(query).await
    }

    /// Best-effort failure marking; an agent that is already terminal stays
    /// as it is.
    async fn mark_failed(&self, agent_id: AgentId, reason: &str) {
        let mut metadata = Map::new();
        metadata.insert(FAILURE_REASON_KEY.to_string(), Value::from(reason));
        match self
            .update_status(agent_id, AgentStatus::Failed, Some(metadata))
            .await
        {
            Ok(_) => {}
            Err(Error::InvalidTransition { .. }) => {
                debug!(agent = %agent_id.short(), "agent already terminal, not marking failed")
            }
            Err(e) => warn!(agent = %agent_id.short(), error = %e, "failed to mark agent failed"),
        }
    }

    fn publish(&self, agent: &Agent, payload: EventPayload) {
        self.bus.publish(Event::new(&agent.scope, payload));
    }
}

fn ensure_pending(agent: &Agent) -> Result<()> {
    if agent.status != AgentStatus::Pending {
        return Err(Error::InvalidTransition {
            entity: "agent",
            from: agent.status.to_string(),
            to: AgentStatus::Active.to_string(),
        });
    }
    Ok(())
}
