//! In-process event bus.
//!
//! Every state transition in the orchestrator is announced here. Each
//! subscription owns an unbounded queue, so `publish` never waits on a
//! slow consumer and events from one publisher reach a subscriber in the
//! order they were published.
//!
//! Two consumption styles are supported:
//! - [`EventBus::subscribe`] runs a handler on a dedicated tokio task.
//! - [`EventBus::subscribe_channel`] hands back an [`EventReceiver`] for
//!   callers that want to `select!` over events themselves.

use crate::core::agent::{AgentId, AgentStatus};
use crate::core::task::{TaskId, TaskStatus};
use crate::run::{RunId, RunPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Discriminant of an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentSpawned,
    AgentStatusChange,
    AgentTerminated,
    TaskUpdate,
    RunProgress,
    SystemError,
}

impl EventKind {
    /// Kinds that carry an agent status change.
    pub const AGENT_LIFECYCLE: [EventKind; 3] = [
        EventKind::AgentSpawned,
        EventKind::AgentStatusChange,
        EventKind::AgentTerminated,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::AgentSpawned => "agent_spawned",
            EventKind::AgentStatusChange => "agent_status_change",
            EventKind::AgentTerminated => "agent_terminated",
            EventKind::TaskUpdate => "task_update",
            EventKind::RunProgress => "run_progress",
            EventKind::SystemError => "system_error",
        };
        write!(f, "{}", s)
    }
}

/// Type-specific event contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An agent's process is confirmed running.
    AgentSpawned {
        agent_id: AgentId,
        role: String,
        previous: AgentStatus,
        status: AgentStatus,
    },
    AgentStatusChange {
        agent_id: AgentId,
        previous: AgentStatus,
        status: AgentStatus,
    },
    AgentTerminated {
        agent_id: AgentId,
        previous: AgentStatus,
        reason: Option<String>,
    },
    TaskUpdate {
        task_id: TaskId,
        /// `None` when the task was just created.
        previous: Option<TaskStatus>,
        status: TaskStatus,
        agent_id: Option<AgentId>,
    },
    RunProgress {
        run_id: RunId,
        phase: RunPhase,
        percent: u8,
        message: String,
    },
    SystemError {
        source: String,
        message: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AgentSpawned { .. } => EventKind::AgentSpawned,
            EventPayload::AgentStatusChange { .. } => EventKind::AgentStatusChange,
            EventPayload::AgentTerminated { .. } => EventKind::AgentTerminated,
            EventPayload::TaskUpdate { .. } => EventKind::TaskUpdate,
            EventPayload::RunProgress { .. } => EventKind::RunProgress,
            EventPayload::SystemError { .. } => EventKind::SystemError,
        }
    }

    /// The agent this event is about, if any.
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            EventPayload::AgentSpawned { agent_id, .. }
            | EventPayload::AgentStatusChange { agent_id, .. }
            | EventPayload::AgentTerminated { agent_id, .. } => Some(*agent_id),
            EventPayload::TaskUpdate { agent_id, .. } => *agent_id,
            _ => None,
        }
    }

    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            EventPayload::TaskUpdate { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    /// New agent status carried by a lifecycle event.
    pub fn agent_status(&self) -> Option<AgentStatus> {
        match self {
            EventPayload::AgentSpawned { status, .. }
            | EventPayload::AgentStatusChange { status, .. } => Some(*status),
            EventPayload::AgentTerminated { .. } => Some(AgentStatus::Terminated),
            _ => None,
        }
    }
}

/// An immutable notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub payload: EventPayload,
    /// Repository scope the event belongs to.
    pub scope: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(scope: &str, payload: EventPayload) -> Self {
        Self {
            payload,
            scope: scope.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Delivery filter evaluated before an event is queued for a subscriber.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub scope: Option<String>,
    pub agent_ids: Option<HashSet<AgentId>>,
    pub task_ids: Option<HashSet<TaskId>>,
}

impl EventFilter {
    /// Match every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Match events of one scope.
    pub fn scope(scope: &str) -> Self {
        Self {
            scope: Some(scope.to_string()),
            ..Default::default()
        }
    }

    pub fn with_agents(mut self, ids: impl IntoIterator<Item = AgentId>) -> Self {
        self.agent_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_tasks(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.task_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(scope) = &self.scope {
            if &event.scope != scope {
                return false;
            }
        }
        if let Some(ids) = &self.agent_ids {
            match event.payload.agent_id() {
                Some(id) if ids.contains(&id) => {}
                _ => return false,
            }
        }
        if let Some(ids) = &self.task_ids {
            match event.payload.task_id() {
                Some(id) if ids.contains(&id) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscription {
    /// Empty means every kind.
    kinds: HashSet<EventKind>,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
    /// Cleared on unsubscribe so queued events are not handed to the handler.
    active: Arc<AtomicBool>,
    handler_task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn wants(&self, event: &Event) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind())) && self.filter.matches(event)
    }
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<SubscriptionId, Subscription>,
    closed: bool,
}

/// Receiving side of a channel subscription.
pub struct EventReceiver {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. `None` once unsubscribed or the bus shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Publish/subscribe hub.
///
/// Constructed by the composition root and shared by `Arc`.
pub struct EventBus {
    state: Mutex<BusState>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a handler for `kinds` (empty slice = all kinds).
    ///
    /// The handler runs on its own tokio task, so it may call back into
    /// the bus, including unsubscribing itself. Must be called from within
    /// a tokio runtime.
    pub fn subscribe<F>(&self, kinds: &[EventKind], filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let active = Arc::new(AtomicBool::new(true));

        let task_active = Arc::clone(&active);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !task_active.load(Ordering::Acquire) {
                    break;
                }
                handler(event);
            }
        });

        self.insert(
            id,
            Subscription {
                kinds: kinds.iter().copied().collect(),
                filter,
                tx,
                active,
                handler_task: Some(handler_task),
            },
        );
        id
    }

    /// Subscribe with a receiver instead of a handler.
    pub fn subscribe_channel(
        &self,
        kinds: &[EventKind],
        filter: EventFilter,
    ) -> (SubscriptionId, EventReceiver) {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(
            id,
            Subscription {
                kinds: kinds.iter().copied().collect(),
                filter,
                tx,
                active: Arc::new(AtomicBool::new(true)),
                handler_task: None,
            },
        );
        (id, EventReceiver { id, rx })
    }

    fn insert(&self, id: SubscriptionId, subscription: Subscription) {
        let mut state = self.lock();
        if state.closed {
            // Dropping the subscription closes its queue immediately.
            warn!(%id, "subscribe after bus shutdown");
            subscription.active.store(false, Ordering::Release);
            return;
        }
        state.subscribers.insert(id, subscription);
        debug!(%id, total = state.subscribers.len(), "subscribed");
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.lock().subscribers.remove(&id);
        match removed {
            Some(sub) => {
                sub.active.store(false, Ordering::Release);
                debug!(%id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let mut state = self.lock();
        if state.closed {
            return 0;
        }

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, sub) in &state.subscribers {
            if !sub.wants(&event) {
                continue;
            }
            if sub.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(*id);
            }
        }
        for id in gone {
            state.subscribers.remove(&id);
            trace!(%id, "dropped subscription with closed receiver");
        }

        trace!(kind = %event.kind(), scope = %event.scope, delivered, "published");
        delivered
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Stop accepting events, close every queue, and wait for handler
    /// tasks to finish the events already handed to them.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Subscription> = {
            let mut state = self.lock();
            state.closed = true;
            state.subscribers.drain().map(|(_, sub)| sub).collect()
        };

        let count = drained.len();
        let mut tasks = Vec::new();
        for sub in drained {
            drop(sub.tx);
            if let Some(task) = sub.handler_task {
                tasks.push(task);
            }
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "event handler task ended abnormally");
            }
        }
        debug!(count, "event bus shut down");
        count
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribes when dropped.
pub struct SubscriptionGuard<'a> {
    bus: &'a EventBus,
    id: SubscriptionId,
}

impl<'a> SubscriptionGuard<'a> {
    pub fn new(bus: &'a EventBus, id: SubscriptionId) -> Self {
        Self { bus, id }
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
