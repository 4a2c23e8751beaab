//! Orchestration layer.
//!
//! Managers that own task and agent state, the dependency waiter agents
//! block on before starting, the phased run driver, and progress views.

mod engine;
mod graph;
mod lifecycle;
mod monitor;
mod waiter;

pub use engine::{
    OrchestrationEngine, RunRequest, ENGINE_SENDER, META_RUN_ID, META_TASK_ID, META_TIER,
    REASON_RUN_COMPLETE, REASON_RUN_TIMEOUT, ROOT_TASK_KIND,
};
pub use graph::{SubtaskSpec, TaskGraphManager, TaskTree};
pub use lifecycle::{AgentLifecycleManager, AgentSpec, LaunchPlan};
pub use monitor::{
    AgentSummary, DetailLevel, MonitorMode, MonitorQuery, MonitorTarget, ProgressUpdate,
    RunMonitor, TaskSummary, UPDATE_BUFFER,
};
pub use waiter::{DependencyWaiter, WaitOptions, WaitResult};
