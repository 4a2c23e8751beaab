//! Blocking wait for a set of agents to reach terminal status.
//!
//! The waiter subscribes to lifecycle events before taking its first
//! snapshot, so a transition that lands between the two is still seen.
//! A periodic re-read of the store backs up the event path.

use crate::config::{timer_period, WaiterConfig};
use crate::core::agent::{AgentId, AgentStatus};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventFilter, EventKind, SubscriptionGuard};
use crate::store::EntityStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    /// Return as soon as any agent fails or is terminated.
    pub wait_for_any_failure: bool,
    /// Store re-read interval.
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from_config(&WaiterConfig::default())
    }
}

impl WaitOptions {
    pub fn from_config(config: &WaiterConfig) -> Self {
        Self {
            timeout: config.default_timeout(),
            wait_for_any_failure: false,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.wait_for_any_failure = true;
        self
    }
}

/// Outcome of [`DependencyWaiter::wait_for`]. Lists keep request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitResult {
    /// True only when every agent completed.
    pub success: bool,
    pub completed_agents: Vec<AgentId>,
    /// Agents that failed or were terminated.
    pub failed_agents: Vec<AgentId>,
    /// Agents still unresolved at the deadline.
    pub timeout_agents: Vec<AgentId>,
    /// Agents left unresolved by a fail-fast return.
    pub unresolved_agents: Vec<AgentId>,
    pub wait_duration_ms: u64,
}

impl WaitResult {
    /// Turn an unsuccessful wait into the matching dependency error.
    pub fn into_result(self) -> Result<WaitResult> {
        if self.success {
            Ok(self)
        } else if !self.failed_agents.is_empty() {
            Err(Error::DependencyFailed {
                agents: self.failed_agents,
            })
        } else {
            Err(Error::DependencyTimeout {
                agents: self.timeout_agents,
            })
        }
    }
}

pub struct DependencyWaiter {
    store: Arc<dyn EntityStore>,
    bus: Arc<EventBus>,
}

impl DependencyWaiter {
    pub fn new(store: Arc<dyn EntityStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Wait until every agent in `agent_ids` is terminal, the deadline
    /// passes, or (with `wait_for_any_failure`) one of them fails.
    ///
    /// # Errors
    /// `AgentNotFound` if any id is unknown; store errors are propagated.
    pub async fn wait_for(
        &self,
        agent_ids: &[AgentId],
        scope: &str,
        options: WaitOptions,
    ) -> Result<WaitResult> {
        let started = Instant::now();
        let mut ids: Vec<AgentId> = Vec::with_capacity(agent_ids.len());
        for id in agent_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        if ids.is_empty() {
            return Ok(WaitResult {
                success: true,
                ..Default::default()
            });
        }

        let (sub_id, mut rx) = self.bus.subscribe_channel(
            &EventKind::AGENT_LIFECYCLE,
            EventFilter::scope(scope).with_agents(ids.iter().copied()),
        );
        let _guard = SubscriptionGuard::new(&self.bus, sub_id);

        let mut resolved: HashMap<AgentId, AgentStatus> = HashMap::new();
        self.refresh(&ids, &mut resolved).await?;
        debug!(
            agents = ids.len(),
            already_resolved = resolved.len(),
            timeout_ms = options.timeout.as_millis() as u64,
            "waiting for dependencies"
        );

        let deadline = tokio::time::Instant::now() + options.timeout;
        let mut poll = tokio::time::interval(timer_period(options.poll_interval));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;
        let mut bus_open = true;

        loop {
            if let Some(result) = evaluate(&ids, &resolved, options.wait_for_any_failure, started) {
                log_result(&result);
                return Ok(result);
            }

            tokio::select! {
                event = rx.recv(), if bus_open => match event {
                    Some(event) => {
                        if let (Some(id), Some(status)) =
                            (event.payload.agent_id(), event.payload.agent_status())
                        {
                            if status.is_terminal() && ids.contains(&id) {
                                resolved.entry(id).or_insert(status);
                            }
                        }
                    }
                    None => bus_open = false,
                },
                _ = poll.tick() => self.refresh(&ids, &mut resolved).await?,
                _ = tokio::time::sleep_until(deadline) => {
                    self.refresh(&ids, &mut resolved).await?;
                    let result = evaluate(&ids, &resolved, options.wait_for_any_failure, started)
                        .unwrap_or_else(|| timed_out(&ids, &resolved, started));
                    log_result(&result);
                    return Ok(result);
                }
            }
        }
    }

    /// Record terminal statuses from the store. First terminal status wins.
    async fn refresh(
        &self,
        ids: &[AgentId],
        resolved: &mut HashMap<AgentId, AgentStatus>,
    ) -> Result<()> {
        for &id in ids {
            if resolved.contains_key(&id) {
                continue;
            }
            let agent = self
                .store
                .get_agent(id)
                .await?
                .ok_or(Error::AgentNotFound(id))?;
            if agent.is_terminal() {
                resolved.insert(id, agent.status);
            }
        }
        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn partition(
    ids: &[AgentId],
    resolved: &HashMap<AgentId, AgentStatus>,
) -> (Vec<AgentId>, Vec<AgentId>, Vec<AgentId>) {
    let mut completed = Vec::new();
    let mut failed = Vec::new();
    let mut pending = Vec::new();
    for &id in ids {
        match resolved.get(&id) {
            Some(AgentStatus::Completed) => completed.push(id),
            Some(_) => failed.push(id),
            None => pending.push(id),
        }
    }
    (completed, failed, pending)
}

/// A final result if the wait can end now.
fn evaluate(
    ids: &[AgentId],
    resolved: &HashMap<AgentId, AgentStatus>,
    fail_fast: bool,
    started: Instant,
) -> Option<WaitResult> {
    let (completed, failed, pending) = partition(ids, resolved);
    if pending.is_empty() {
        return Some(WaitResult {
            success: failed.is_empty(),
            completed_agents: completed,
            failed_agents: failed,
            wait_duration_ms: elapsed_ms(started),
            ..Default::default()
        });
    }
    if fail_fast && !failed.is_empty() {
        return Some(WaitResult {
            success: false,
            completed_agents: completed,
            failed_agents: failed,
            unresolved_agents: pending,
            wait_duration_ms: elapsed_ms(started),
            ..Default::default()
        });
    }
    None
}

fn timed_out(
    ids: &[AgentId],
    resolved: &HashMap<AgentId, AgentStatus>,
    started: Instant,
) -> WaitResult {
    let (completed, failed, pending) = partition(ids, resolved);
    WaitResult {
        success: false,
        completed_agents: completed,
        failed_agents: failed,
        timeout_agents: pending,
        unresolved_agents: Vec::new(),
        wait_duration_ms: elapsed_ms(started),
    }
}

fn log_result(result: &WaitResult) {
    if result.success {
        debug!(
            completed = result.completed_agents.len(),
            ms = result.wait_duration_ms,
            "dependencies resolved"
        );
    } else {
        info!(
            completed = result.completed_agents.len(),
            failed = result.failed_agents.len(),
            timed_out = result.timeout_agents.len(),
            unresolved = result.unresolved_agents.len(),
            ms = result.wait_duration_ms,
            "dependency wait unsuccessful"
        );
    }
}
