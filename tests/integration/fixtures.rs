//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A fake process spawner that records requests
//! - Simulated workers driven by `agent_spawned` events
//! - A coordination channel whose `close` can be made to fail
//! - A fully wired [`Conductor`] over an inspectable store

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use conductor::channels::ChannelHub;
use conductor::config::{Config, EngineConfig, WaiterConfig};
use conductor::core::agent::{AgentId, AgentStatus, ProcessHandle, FAILURE_REASON_KEY};
use conductor::core::task::{TaskResults, TaskStatus};
use conductor::events::{Event, EventFilter, EventKind, EventPayload, SubscriptionId};
use conductor::orchestration::{AgentLifecycleManager, TaskGraphManager};
use conductor::ports::{ChannelInfo, CoordinationChannel, Participant, ProcessRequest, ProcessSpawner};
use conductor::store::{EntityStore, MemoryStore};
use conductor::{Conductor, Error, Result};

/// Upper bound for any single scenario.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(10);

/// Config with short polls so scenarios finish quickly.
pub fn fast_config() -> Config {
    Config {
        waiter: WaiterConfig {
            default_timeout_secs: 5,
            poll_interval_ms: 20,
        },
        engine: EngineConfig {
            max_run_minutes: 1,
            monitor_poll_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

// ========== Spawner ==========

/// Records every spawn and kill; refuses roles listed in `refuse`.
#[derive(Default)]
pub struct FakeSpawner {
    spawned: Mutex<Vec<ProcessRequest>>,
    killed: AtomicUsize,
    refuse: HashSet<String>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing(roles: &[&str]) -> Self {
        Self {
            refuse: roles.iter().map(|r| r.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawned_roles(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.role).collect()
    }

    pub fn kill_count(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, request: ProcessRequest) -> Result<ProcessHandle> {
        if self.refuse.contains(&request.role) {
            return Err(Error::SpawnFailed(format!("{} refused", request.role)));
        }
        let handle = format!("fake-{}", request.agent_id.short());
        self.spawned.lock().unwrap().push(request);
        Ok(ProcessHandle {
            handle,
            session_id: None,
        })
    }

    async fn kill(&self, _handle: &ProcessHandle) -> Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ========== Channels ==========

/// Channel hub whose `close` fails for names with a given prefix.
pub struct FlakyChannels {
    pub hub: ChannelHub,
    broken_prefix: String,
}

impl FlakyChannels {
    pub fn new(broken_prefix: &str) -> Self {
        Self {
            hub: ChannelHub::new(),
            broken_prefix: broken_prefix.to_string(),
        }
    }
}

#[async_trait]
impl CoordinationChannel for FlakyChannels {
    async fn create_channel(&self, name: &str, scope: &str) -> Result<ChannelInfo> {
        self.hub.create_channel(name, scope).await
    }

    async fn send_message(&self, channel: &str, sender: &str, body: &str) -> Result<()> {
        self.hub.send_message(channel, sender, body).await
    }

    async fn list_participants(&self, channel: &str) -> Result<Vec<Participant>> {
        self.hub.list_participants(channel).await
    }

    async fn list_channels(&self, scope: Option<&str>) -> Result<Vec<ChannelInfo>> {
        self.hub.list_channels(scope).await
    }

    async fn close(&self, channel: &str) -> Result<()> {
        if channel.starts_with(&self.broken_prefix) {
            return Err(Error::Channel(format!("{} is stuck", channel)));
        }
        self.hub.close(channel).await
    }
}

// ========== Harness ==========

/// A conductor plus handles on its fakes.
pub struct Harness {
    pub conductor: Conductor,
    pub store: Arc<MemoryStore>,
    pub spawner: Arc<FakeSpawner>,
    pub hub: Arc<ChannelHub>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_spawner(FakeSpawner::new())
    }

    pub fn with_spawner(spawner: FakeSpawner) -> Self {
        let store = Arc::new(MemoryStore::new());
        let spawner = Arc::new(spawner);
        let hub = Arc::new(ChannelHub::new());

        let shared_store: Arc<dyn EntityStore> = store.clone();
        let shared_spawner: Arc<dyn ProcessSpawner> = spawner.clone();
        let shared_hub: Arc<dyn CoordinationChannel> = hub.clone();
        let conductor = Conductor::builder(fast_config())
            .store(shared_store)
            .spawner(shared_spawner)
            .channels(shared_hub)
            .build();

        Self {
            conductor,
            store,
            spawner,
            hub,
        }
    }

    pub fn graph(&self) -> &Arc<TaskGraphManager> {
        self.conductor.graph()
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        self.conductor.lifecycle()
    }

    /// Attach simulated workers; agents with a role in `failing_roles`
    /// start their task and then fail.
    pub fn attach_workers(&self, failing_roles: &[&str]) -> SubscriptionId {
        attach_workers(
            &self.conductor,
            failing_roles.iter().map(|r| r.to_string()).collect(),
        )
    }
}

// ========== Simulated Workers ==========

fn attach_workers(conductor: &Conductor, failing: HashSet<String>) -> SubscriptionId {
    let graph = Arc::clone(conductor.graph());
    let lifecycle = Arc::clone(conductor.lifecycle());
    let failing = Arc::new(failing);

    conductor.bus().subscribe(
        &[EventKind::AgentSpawned],
        EventFilter::any(),
        move |event: Event| {
            let EventPayload::AgentSpawned { agent_id, role, .. } = event.payload else {
                return;
            };
            let graph = Arc::clone(&graph);
            let lifecycle = Arc::clone(&lifecycle);
            let fails = failing.contains(&role);
            let scope = event.scope;
            tokio::spawn(async move {
                work(&graph, &lifecycle, agent_id, &scope, fails).await;
            });
        },
    )
}

/// Take every task assigned to the agent through to completion, or stop
/// halfway and fail.
async fn work(
    graph: &TaskGraphManager,
    lifecycle: &AgentLifecycleManager,
    agent_id: AgentId,
    scope: &str,
    fails: bool,
) {
    let tasks = graph.list(scope).await.expect("list tasks");
    for task in tasks
        .into_iter()
        .filter(|t| t.assigned_agent == Some(agent_id))
    {
        if task.status == TaskStatus::Pending {
            graph
                .update_status(task.id, TaskStatus::InProgress, None)
                .await
                .expect("start task");
        }
        if !fails {
            graph
                .update_status(
                    task.id,
                    TaskStatus::Completed,
                    Some(TaskResults::new(format!("done by {}", agent_id.short()))),
                )
                .await
                .expect("complete task");
        }
    }

    let (status, metadata) = if fails {
        let mut metadata = Map::new();
        metadata.insert(
            FAILURE_REASON_KEY.to_string(),
            Value::from("simulated failure"),
        );
        (AgentStatus::Failed, Some(metadata))
    } else {
        (AgentStatus::Completed, None)
    };
    lifecycle
        .update_status(agent_id, status, metadata)
        .await
        .expect("report agent status");
}
