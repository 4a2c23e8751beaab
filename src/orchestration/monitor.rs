//! Progress views over runs, agents, channels and scopes.

use crate::config::timer_period;
use crate::core::agent::{AgentId, AgentStatus};
use crate::core::task::{Task, TaskCounts, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventFilter, SubscriptionGuard};
use crate::ports::CoordinationChannel;
use crate::run::{OrchestrationRun, RunId, RunPhase, RunRegistry, RunStatus};
use crate::store::{AgentQuery, EntityStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Capacity of progress channels handed to callers.
pub const UPDATE_BUFFER: usize = 64;

const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(30 * 60);

/// What to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorTarget {
    Agent(AgentId),
    Run(RunId),
    Channel(String),
    Scope(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorMode {
    /// One update, then the channel closes.
    #[default]
    Snapshot,
    /// Updates on every change until the target finishes or time runs out.
    Follow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailLevel {
    #[default]
    Summary,
    /// Include per-agent and per-task rows.
    Full,
}

#[derive(Debug, Clone)]
pub struct MonitorQuery {
    pub target: MonitorTarget,
    pub mode: MonitorMode,
    pub detail: DetailLevel,
    pub max_duration: Duration,
}

impl MonitorQuery {
    pub fn new(target: MonitorTarget) -> Self {
        Self {
            target,
            mode: MonitorMode::Snapshot,
            detail: DetailLevel::Summary,
            max_duration: DEFAULT_MAX_DURATION,
        }
    }

    pub fn follow(mut self) -> Self {
        self.mode = MonitorMode::Follow;
        self
    }

    pub fn full(mut self) -> Self {
        self.detail = DetailLevel::Full;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub role: String,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            status: task.status,
            assigned_agent: task.assigned_agent,
        }
    }
}

/// A point-in-time progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub run_id: Option<RunId>,
    pub scope: String,
    pub phase: Option<RunPhase>,
    pub percent: u8,
    pub counts: TaskCounts,
    pub message: String,
    /// Nothing further will change for this target.
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<AgentSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskSummary>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn new(scope: &str, percent: u8, counts: TaskCounts, message: impl Into<String>) -> Self {
        Self {
            run_id: None,
            scope: scope.to_string(),
            phase: None,
            percent: percent.min(100),
            counts,
            message: message.into(),
            finished: false,
            agents: Vec::new(),
            tasks: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Update describing `run` as it is now.
    pub fn for_run(run: &OrchestrationRun, counts: TaskCounts, message: impl Into<String>) -> Self {
        Self {
            run_id: Some(run.id),
            phase: Some(run.phase),
            finished: run.status != RunStatus::Running,
            ..Self::new(&run.scope, run.progress, counts, message)
        }
    }

    /// Equal apart from timestamp and detail rows.
    fn same_state(&self, other: &ProgressUpdate) -> bool {
        self.percent == other.percent
            && self.phase == other.phase
            && self.counts == other.counts
            && self.finished == other.finished
            && self.message == other.message
    }
}

/// Resolved target: which scope to read and which ids to keep.
struct View {
    scope: String,
    run: Option<OrchestrationRun>,
    agents: Option<Vec<AgentId>>,
    tasks: Option<Vec<TaskId>>,
    finished: Option<bool>,
}

#[derive(Clone)]
pub struct RunMonitor {
    store: Arc<dyn EntityStore>,
    bus: Arc<EventBus>,
    runs: Arc<RunRegistry>,
    channels: Arc<dyn CoordinationChannel>,
    poll: Duration,
}

impl RunMonitor {
    pub fn new(
        store: Arc<dyn EntityStore>,
        bus: Arc<EventBus>,
        runs: Arc<RunRegistry>,
        channels: Arc<dyn CoordinationChannel>,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            runs,
            channels,
            poll: timer_period(poll),
        }
    }

    /// Stream progress for `query`.
    ///
    /// # Errors
    /// Unknown targets fail here, before any update is sent.
    pub async fn monitor(&self, query: MonitorQuery) -> Result<mpsc::Receiver<ProgressUpdate>> {
        let first = self.snapshot(&query).await?;
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);

        if query.mode == MonitorMode::Snapshot || first.finished {
            // Capacity is never exhausted by a single update.
            let _ = tx.try_send(first);
            return Ok(rx);
        }

        let this = self.clone();
        tokio::spawn(async move { this.follow(query, first, tx).await });
        Ok(rx)
    }

    async fn follow(&self, query: MonitorQuery, first: ProgressUpdate, tx: mpsc::Sender<ProgressUpdate>) {
        let (sub, mut events) = self
            .bus
            .subscribe_channel(&[], EventFilter::scope(&first.scope));
        let _guard = SubscriptionGuard::new(&self.bus, sub);

        let deadline = Instant::now() + query.max_duration;
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last = first.clone();
        if tx.send(first).await.is_err() {
            return;
        }

        let mut bus_open = true;
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(target_scope = %last.scope, "monitor reached max duration");
                    break;
                }
                event = events.recv(), if bus_open => {
                    if event.is_none() {
                        bus_open = false;
                    }
                }
                _ = ticker.tick() => {}
            }

            let update = match self.snapshot(&query).await {
                Ok(update) => update,
                Err(e) => {
                    debug!(error = %e, "monitor target gone");
                    break;
                }
            };
            if update.same_state(&last) {
                continue;
            }
            let finished = update.finished;
            last = update.clone();
            if tx.send(update).await.is_err() || finished {
                break;
            }
        }
    }

    /// Current progress for the query's target.
    pub async fn snapshot(&self, query: &MonitorQuery) -> Result<ProgressUpdate> {
        let view = self.resolve(&query.target).await?;

        let mut tasks = self.store.list_tasks(Some(&view.scope)).await?;
        if let Some(ids) = &view.tasks {
            tasks.retain(|t| ids.contains(&t.id));
        }
        let mut agents = self.store.list_agents(&AgentQuery::scope(&view.scope)).await?;
        if let Some(ids) = &view.agents {
            agents.retain(|a| ids.contains(&a.id));
        }

        let counts = TaskCounts::from_tasks(&tasks);
        let active = agents.iter().filter(|a| !a.is_terminal()).count();
        let message = format!(
            "{}/{} tasks resolved, {} agent(s) running",
            counts.resolved(),
            counts.total,
            active
        );

        let mut update = match &view.run {
            Some(run) => ProgressUpdate::for_run(run, counts, message),
            None => {
                let percent = if counts.total == 0 {
                    if !agents.is_empty() && active == 0 { 100 } else { 0 }
                } else {
                    (counts.fraction_resolved() * 100.0).round() as u8
                };
                let mut update = ProgressUpdate::new(&view.scope, percent, counts, message);
                update.finished = view.finished.unwrap_or_else(|| {
                    counts.total > 0 && counts.resolved() == counts.total && active == 0
                });
                update
            }
        };

        if query.detail == DetailLevel::Full {
            update.agents = agents
                .iter()
                .map(|a| AgentSummary {
                    id: a.id,
                    role: a.role.clone(),
                    status: a.status,
                })
                .collect();
            update.tasks = tasks.iter().map(TaskSummary::from).collect();
        }
        Ok(update)
    }

    async fn resolve(&self, target: &MonitorTarget) -> Result<View> {
        match target {
            MonitorTarget::Agent(id) => {
                let agent = self
                    .store
                    .get_agent(*id)
                    .await?
                    .ok_or(Error::AgentNotFound(*id))?;
                let tasks = self.tasks_assigned_to(&agent.scope, &[*id]).await?;
                Ok(View {
                    finished: Some(agent.is_terminal()),
                    scope: agent.scope,
                    run: None,
                    agents: Some(vec![*id]),
                    tasks: Some(tasks),
                })
            }
            MonitorTarget::Run(id) => {
                let state = self
                    .runs
                    .get(*id)
                    .ok_or_else(|| Error::RunNotFound(id.to_string()))?;
                let run = state.run().clone();
                Ok(View {
                    scope: run.scope.clone(),
                    agents: Some(run.agent_ids.clone()),
                    tasks: Some(run.task_ids.clone()),
                    finished: None,
                    run: Some(run),
                })
            }
            MonitorTarget::Channel(name) => {
                let channel = self
                    .channels
                    .list_channels(None)
                    .await?
                    .into_iter()
                    .find(|c| &c.name == name)
                    .ok_or_else(|| Error::ChannelNotFound(name.clone()))?;
                let agents: Vec<AgentId> = self
                    .channels
                    .list_participants(name)
                    .await?
                    .into_iter()
                    .filter_map(|p| p.agent_id)
                    .collect();
                let tasks = self.tasks_assigned_to(&channel.scope, &agents).await?;
                Ok(View {
                    scope: channel.scope,
                    run: None,
                    agents: Some(agents),
                    tasks: Some(tasks),
                    finished: Some(channel.closed),
                })
            }
            MonitorTarget::Scope(scope) => Ok(View {
                scope: scope.clone(),
                run: None,
                agents: None,
                tasks: None,
                finished: None,
            }),
        }
    }

    async fn tasks_assigned_to(&self, scope: &str, agents: &[AgentId]) -> Result<Vec<TaskId>> {
        Ok(self
            .store
            .list_tasks(Some(scope))
            .await?
            .into_iter()
            .filter(|t| t.assigned_agent.is_some_and(|a| agents.contains(&a)))
            .map(|t| t.id)
            .collect())
    }
}
