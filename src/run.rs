//! Orchestration run records and phase tracking.

use crate::cleanup::CleanupReport;
use crate::core::agent::AgentId;
use crate::core::task::{TaskCounts, TaskId, TaskStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// Unique identifier for an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Phases of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Gather prior knowledge about the objective.
    Research,
    /// Decompose the objective into a task graph.
    Planning,
    /// Register and launch agents.
    Execution,
    /// Track progress until every agent resolves.
    Monitoring,
    /// Reclaim agents and channels.
    Cleanup,
}

impl RunPhase {
    pub const ALL: [RunPhase; 5] = [
        RunPhase::Research,
        RunPhase::Planning,
        RunPhase::Execution,
        RunPhase::Monitoring,
        RunPhase::Cleanup,
    ];

    /// The only phase this one may move to.
    pub fn next(self) -> Option<RunPhase> {
        match self {
            RunPhase::Research => Some(RunPhase::Planning),
            RunPhase::Planning => Some(RunPhase::Execution),
            RunPhase::Execution => Some(RunPhase::Monitoring),
            RunPhase::Monitoring => Some(RunPhase::Cleanup),
            RunPhase::Cleanup => None,
        }
    }

    /// Progress percent range covered by this phase.
    pub fn band(self) -> (u8, u8) {
        match self {
            RunPhase::Research => (0, 10),
            RunPhase::Planning => (10, 20),
            RunPhase::Execution => (20, 30),
            RunPhase::Monitoring => (30, 90),
            RunPhase::Cleanup => (90, 100),
        }
    }

    /// Map a `0.0..=1.0` fraction of this phase onto overall progress.
    pub fn scale(self, fraction: f64) -> u8 {
        let (start, end) = self.band();
        let span = f64::from(end - start);
        start + (span * fraction.clamp(0.0, 1.0)).round() as u8
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Research => write!(f, "research"),
            RunPhase::Planning => write!(f, "planning"),
            RunPhase::Execution => write!(f, "execution"),
            RunPhase::Monitoring => write!(f, "monitoring"),
            RunPhase::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Final state of one task in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub agent_id: Option<AgentId>,
    pub summary: Option<String>,
}

/// Detail attached to a run outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub tasks: Vec<TaskOutcome>,
    pub failures: Vec<String>,
    pub counts: TaskCounts,
    pub duration_ms: u64,
    pub cleanup: Option<CleanupReport>,
}

/// What a caller gets back from a run, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    pub message: String,
    pub data: RunReport,
}

impl RunOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: RunReport::default(),
        }
    }
}

/// A run of the phased orchestration driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub id: RunId,
    pub title: String,
    pub objective: String,
    pub scope: String,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub progress: u8,
    pub agent_ids: Vec<AgentId>,
    pub task_ids: Vec<TaskId>,
    pub root_task: Option<TaskId>,
    pub channel: Option<String>,
    /// Worker session to resume, passed through to spawned agents.
    pub resume_session: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl OrchestrationRun {
    pub fn new(title: &str, objective: &str, scope: &str) -> Self {
        Self {
            id: RunId::new(),
            title: title.to_string(),
            objective: objective.to_string(),
            scope: scope.to_string(),
            phase: RunPhase::Research,
            status: RunStatus::Running,
            progress: 0,
            agent_ids: Vec::new(),
            task_ids: Vec::new(),
            root_task: None,
            channel: None,
            resume_session: None,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        }
    }
}

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: RunPhase,
    pub entered_at: DateTime<Utc>,
}

/// Wraps a run and enforces the phase order.
///
/// Research -> Planning -> Execution -> Monitoring -> Cleanup, no skipping
/// and no re-entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    run: OrchestrationRun,
    phase_history: Vec<PhaseHistoryEntry>,
}

impl RunState {
    pub fn new(run: OrchestrationRun) -> Self {
        let initial = run.phase;
        Self {
            run,
            phase_history: vec![PhaseHistoryEntry {
                phase: initial,
                entered_at: Utc::now(),
            }],
        }
    }

    pub fn can_transition(&self, target: RunPhase) -> bool {
        self.run.status == RunStatus::Running && self.run.phase.next() == Some(target)
    }

    /// Move to `target`, raising progress to the start of its band.
    pub fn transition(&mut self, target: RunPhase) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.run.phase.to_string(),
                to: target.to_string(),
            });
        }
        self.run.phase = target;
        self.run.progress = self.run.progress.max(target.band().0);
        self.phase_history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    /// Set progress; never moves backwards.
    pub fn set_progress(&mut self, percent: u8) -> u8 {
        self.run.progress = self.run.progress.max(percent.min(100));
        self.run.progress
    }

    /// Record the terminal outcome.
    pub fn finish(&mut self, outcome: RunOutcome) {
        self.run.status = if outcome.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        if outcome.success {
            self.run.progress = 100;
        }
        self.run.finished_at = Some(Utc::now());
        self.run.outcome = Some(outcome);
    }

    pub fn current_phase(&self) -> RunPhase {
        self.run.phase
    }

    pub fn phase_history(&self) -> &[PhaseHistoryEntry] {
        &self.phase_history
    }

    pub fn run(&self) -> &OrchestrationRun {
        &self.run
    }

    pub fn run_mut(&mut self) -> &mut OrchestrationRun {
        &mut self.run
    }

    pub fn is_finished(&self) -> bool {
        self.run.status != RunStatus::Running
    }
}

#[derive(Default)]
struct Runs {
    active: HashMap<RunId, RunState>,
    archived: HashMap<RunId, RunState>,
}

/// Active and archived runs.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<Runs>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: RunState) -> RunId {
        let id = state.run().id;
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.active.insert(id, state);
        id
    }

    /// Look up a run, active or archived.
    pub fn get(&self, id: RunId) -> Option<RunState> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        runs.active
            .get(&id)
            .or_else(|| runs.archived.get(&id))
            .cloned()
    }

    /// Mutate an active run in place.
    pub fn update<T>(&self, id: RunId, f: impl FnOnce(&mut RunState) -> Result<T>) -> Result<T> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let state = runs
            .active
            .get_mut(&id)
            .ok_or_else(|| Error::RunNotFound(id.to_string()))?;
        f(state)
    }

    /// Move a run from active to archived.
    pub fn archive(&self, id: RunId) -> Result<()> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let state = runs
            .active
            .remove(&id)
            .ok_or_else(|| Error::RunNotFound(id.to_string()))?;
        runs.archived.insert(id, state);
        Ok(())
    }

    pub fn active(&self) -> Vec<RunState> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<RunState> = runs.active.values().cloned().collect();
        list.sort_by_key(|s| s.run().started_at);
        list
    }

    pub fn archived(&self) -> Vec<RunState> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<RunState> = runs.archived.values().cloned().collect();
        list.sort_by_key(|s| s.run().started_at);
        list
    }
}
