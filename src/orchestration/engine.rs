//! Phased orchestration driver.
//!
//! A run moves research -> planning -> execution -> monitoring -> cleanup.
//! Any failure before cleanup ends the run as failed, but the cleanup work
//! (terminating agents, settling tasks, closing the channel) always runs.

use crate::cleanup::CleanupScheduler;
use crate::config::EngineConfig;
use crate::core::agent::{Agent, AgentId, AgentStatus, FAILURE_REASON_KEY, TERMINATION_REASON_KEY};
use crate::core::task::{Task, TaskCounts, TaskId, TaskRequirements, TaskResults, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventFilter, EventKind, EventPayload, SubscriptionGuard};
use crate::orchestration::graph::{SubtaskSpec, TaskGraphManager};
use crate::orchestration::lifecycle::{AgentLifecycleManager, AgentSpec, LaunchPlan};
use crate::orchestration::monitor::ProgressUpdate;
use crate::planner::{DefaultPlanner, Plan, PlannedTask, Planner, ResearchContext};
use crate::ports::{
    ComplexityClassifier, CoordinationChannel, KnowledgeSearch, ENV_CHANNEL, ENV_RESUME_SESSION,
    ENV_TIER,
};
use crate::run::{
    OrchestrationRun, RunId, RunOutcome, RunPhase, RunRegistry, RunReport, RunState, TaskOutcome,
};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Kind given to the task that stands for a whole run.
pub const ROOT_TASK_KIND: &str = "orchestration";
/// Sender name used for engine posts on run channels.
pub const ENGINE_SENDER: &str = "conductor";

/// Termination reason for agents still running when a run finishes.
pub const REASON_RUN_COMPLETE: &str = "run_complete";
/// Termination reason for agents still running when a run times out.
pub const REASON_RUN_TIMEOUT: &str = "run_timeout";

/// Metadata keys written on agents the engine creates.
pub const META_RUN_ID: &str = "run_id";
pub const META_TASK_ID: &str = "task_id";
pub const META_TIER: &str = "tier";

/// Caller input for a run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub objective: String,
    pub scope: String,
    pub title: Option<String>,
    /// Overrides the configured run limit.
    pub max_duration: Option<Duration>,
    /// Worker session to resume.
    pub resume_session: Option<String>,
}

impl RunRequest {
    pub fn new(objective: &str, scope: &str) -> Self {
        Self {
            objective: objective.to_string(),
            scope: scope.to_string(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_resume(mut self, session: &str) -> Self {
        self.resume_session = Some(session.to_string());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.objective.trim().is_empty() {
            return Err(Error::Validation("objective must not be empty".into()));
        }
        if self.scope.trim().is_empty() {
            return Err(Error::Validation("scope must not be empty".into()));
        }
        Ok(())
    }

    fn display_title(&self) -> String {
        match &self.title {
            Some(title) if !title.trim().is_empty() => title.clone(),
            _ => self.objective.chars().take(60).collect(),
        }
    }
}

/// One agent of a run and the task it owns.
#[derive(Debug, Clone)]
struct RosterEntry {
    task_id: TaskId,
    agent_id: AgentId,
    role: String,
    plan: LaunchPlan,
}

type LaunchResult = (AgentId, Result<Agent>);

/// Working state of a single execution.
struct RunContext {
    id: RunId,
    scope: String,
    objective: String,
    resume_session: Option<String>,
    max_duration: Duration,
    started: Instant,
    progress: Option<mpsc::Sender<ProgressUpdate>>,
    root: Option<TaskId>,
    channel: Option<String>,
    roster: Vec<RosterEntry>,
    launches: JoinSet<LaunchResult>,
    /// Agents whose failure has been applied to their task.
    settled: HashSet<AgentId>,
    /// Counts last reported, to skip duplicate updates.
    last_counts: Option<TaskCounts>,
    failures: Vec<String>,
    timed_out: bool,
}

impl RunContext {
    fn task_ids(&self) -> Vec<TaskId> {
        self.roster.iter().map(|e| e.task_id).collect()
    }

    fn fail(&mut self, message: String) {
        warn!(run = %self.id.short(), "{}", message);
        self.failures.push(message);
    }
}

pub struct OrchestrationEngine {
    graph: Arc<TaskGraphManager>,
    lifecycle: Arc<AgentLifecycleManager>,
    cleanup: Arc<CleanupScheduler>,
    channels: Arc<dyn CoordinationChannel>,
    bus: Arc<EventBus>,
    runs: Arc<RunRegistry>,
    planner: Arc<dyn Planner>,
    classifier: Option<Arc<dyn ComplexityClassifier>>,
    knowledge: Option<Arc<dyn KnowledgeSearch>>,
    config: EngineConfig,
}

impl OrchestrationEngine {
    pub fn new(
        graph: Arc<TaskGraphManager>,
        lifecycle: Arc<AgentLifecycleManager>,
        cleanup: Arc<CleanupScheduler>,
        channels: Arc<dyn CoordinationChannel>,
        bus: Arc<EventBus>,
        runs: Arc<RunRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            graph,
            lifecycle,
            cleanup,
            channels,
            bus,
            runs,
            planner: Arc::new(DefaultPlanner),
            classifier: None,
            knowledge: None,
            config,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ComplexityClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeSearch>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    /// Validate a request and register its run in the research phase.
    pub fn prepare(&self, request: &RunRequest) -> Result<RunId> {
        request.validate()?;
        let mut run = OrchestrationRun::new(&request.display_title(), &request.objective, &request.scope);
        run.resume_session = request.resume_session.clone();
        let id = self.runs.insert(RunState::new(run));
        info!(run = %id.short(), scope = %request.scope, "run registered");
        Ok(id)
    }

    /// Prepare and execute in one call.
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        match self.prepare(&request) {
            Ok(id) => self.execute(id, &request, None).await,
            Err(e) => RunOutcome::failure(e.to_string()),
        }
    }

    /// Drive a prepared run to completion.
    ///
    /// Never fails: every error ends up in the returned outcome.
    pub async fn execute(
        &self,
        run_id: RunId,
        request: &RunRequest,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> RunOutcome {
        let mut ctx = RunContext {
            id: run_id,
            scope: request.scope.clone(),
            objective: request.objective.clone(),
            resume_session: request.resume_session.clone(),
            max_duration: request
                .max_duration
                .unwrap_or_else(|| self.config.max_run_duration()),
            started: Instant::now(),
            progress,
            root: None,
            channel: None,
            roster: Vec::new(),
            launches: JoinSet::new(),
            settled: HashSet::new(),
            last_counts: None,
            failures: Vec::new(),
            timed_out: false,
        };

        let result = self.drive(&mut ctx).await;
        self.finish(&mut ctx, result).await
    }

    async fn drive(&self, ctx: &mut RunContext) -> Result<()> {
        self.emit(ctx, TaskCounts::default(), "researching").await;
        let research = self.research(ctx).await;

        self.enter(ctx, RunPhase::Planning)?;
        let plan = self.planner.plan(&ctx.objective, &research).await?;
        if plan.is_empty() {
            return Err(Error::Validation("planner produced no tasks".into()));
        }
        let tasks = self.materialize(ctx, &plan).await?;

        self.enter(ctx, RunPhase::Execution)?;
        self.launch_roster(ctx, &plan, &tasks).await?;

        self.enter(ctx, RunPhase::Monitoring)?;
        self.monitor(ctx).await
    }

    fn enter(&self, ctx: &RunContext, phase: RunPhase) -> Result<()> {
        self.runs.update(ctx.id, |state| state.transition(phase))?;
        info!(run = %ctx.id.short(), phase = %phase, "run phase");
        Ok(())
    }

    // ========== Research ==========

    async fn research(&self, ctx: &RunContext) -> ResearchContext {
        let Some(knowledge) = &self.knowledge else {
            debug!(run = %ctx.id.short(), "no knowledge search configured");
            return ResearchContext::default();
        };
        match knowledge.search(&ctx.scope, &ctx.objective).await {
            Ok(notes) => {
                debug!(run = %ctx.id.short(), notes = notes.len(), "research complete");
                ResearchContext { notes }
            }
            Err(e) => {
                warn!(run = %ctx.id.short(), error = %e, "knowledge search failed, continuing without notes");
                ResearchContext::default()
            }
        }
    }

    // ========== Planning ==========

    /// Create the root task and the plan's tasks beneath it.
    async fn materialize(&self, ctx: &mut RunContext, plan: &Plan) -> Result<Vec<Task>> {
        let dependencies = plan.dependency_indices()?;

        let title = self
            .runs
            .get(ctx.id)
            .map(|s| s.run().title.clone())
            .unwrap_or_else(|| ctx.objective.clone());
        let root = self
            .graph
            .create_task(TaskSpec::new(&ctx.scope, ROOT_TASK_KIND, &title).with_description(&ctx.objective))
            .await?;
        ctx.root = Some(root.id);
        self.graph.update_status(root.id, TaskStatus::InProgress, None).await?;

        let mut subtasks = Vec::with_capacity(plan.tasks.len());
        for (planned, deps) in plan.tasks.iter().zip(dependencies) {
            let tier = self.classify(planned).await;
            let mut requirements = TaskRequirements {
                capabilities: planned.capabilities.clone(),
                estimated_minutes: planned.estimated_minutes,
                ..Default::default()
            };
            requirements.extra.insert(META_TIER.into(), Value::from(tier));
            requirements.extra.insert("plan_key".into(), Value::from(planned.key.clone()));

            let spec = TaskSpec::new(&ctx.scope, planned.kind.clone(), &planned.title)
                .with_description(&planned.description)
                .with_priority(planned.priority)
                .with_requirements(requirements);
            subtasks.push(deps.into_iter().fold(SubtaskSpec::new(spec), SubtaskSpec::after));
        }

        let tasks = self.graph.breakdown(root.id, subtasks).await?;
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        self.runs.update(ctx.id, |state| {
            let run = state.run_mut();
            run.root_task = Some(root.id);
            run.task_ids = task_ids;
            Ok(())
        })?;
        info!(run = %ctx.id.short(), tasks = tasks.len(), "plan materialized");
        Ok(tasks)
    }

    async fn classify(&self, planned: &PlannedTask) -> String {
        let Some(classifier) = &self.classifier else {
            return self.config.default_tier.clone();
        };
        let text = format!("{}\n{}", planned.title, planned.description);
        match classifier.analyze(&text).await {
            Ok(analysis) => analysis.tier,
            Err(e) => {
                warn!(task = %planned.key, error = %e, "classification failed, using default tier");
                self.config.default_tier.clone()
            }
        }
    }

    // ========== Execution ==========

    async fn launch_roster(&self, ctx: &mut RunContext, plan: &Plan, tasks: &[Task]) -> Result<()> {
        if tasks.len() != plan.tasks.len() {
            return Err(Error::Validation(format!(
                "roster mismatch: {} planned, {} created",
                plan.tasks.len(),
                tasks.len()
            )));
        }

        let channel = format!("run-{}", ctx.id.short());
        match self.channels.create_channel(&channel, &ctx.scope).await {
            Ok(_) => {
                let notice = format!("run started: {}", ctx.objective);
                if let Err(e) = self.channels.send_message(&channel, ENGINE_SENDER, &notice).await {
                    warn!(channel = %channel, error = %e, "failed to post run notice");
                }
                ctx.channel = Some(channel);
            }
            Err(e) => warn!(channel = %channel, error = %e, "failed to open run channel"),
        }

        // Register every agent first so dependency ids exist.
        let dependencies = plan.dependency_indices()?;
        let mut agents = Vec::with_capacity(tasks.len());
        for (planned, task) in plan.tasks.iter().zip(tasks) {
            let agent = self.lifecycle.register(self.agent_spec(ctx, planned, task)).await?;
            agents.push(agent.id);
        }
        self.runs.update(ctx.id, |state| {
            let run = state.run_mut();
            run.agent_ids = agents.clone();
            run.channel = ctx.channel.clone();
            Ok(())
        })?;

        for (index, (planned, task)) in plan.tasks.iter().zip(tasks).enumerate() {
            let depends_on = dependencies[index]
                .iter()
                .map(|&dep| {
                    agents.get(dep).copied().ok_or_else(|| {
                        Error::Validation(format!("task {} depends on unknown index {}", index, dep))
                    })
                })
                .collect::<Result<Vec<AgentId>>>()?;

            let launch = LaunchPlan {
                prompt: agent_prompt(ctx, task),
                depends_on,
                dependency_timeout: Some(ctx.max_duration),
                env: self.agent_env(ctx, task),
            };
            ctx.roster.push(RosterEntry {
                task_id: task.id,
                agent_id: agents[index],
                role: planned.role.clone(),
                plan: launch,
            });
            self.graph.assign(task.id, agents[index]).await?;
        }

        let roster = ctx.roster.clone();
        for entry in roster {
            if entry.plan.depends_on.is_empty() {
                self.lifecycle.launch(entry.agent_id, &entry.plan).await?;
            } else {
                let lifecycle = Arc::clone(&self.lifecycle);
                let graph = Arc::clone(&self.graph);
                ctx.launches.spawn(async move {
                    let result = lifecycle.launch(entry.agent_id, &entry.plan).await;
                    if result.is_ok() {
                        start_deferred(&graph, entry.task_id, entry.agent_id).await;
                    }
                    (entry.agent_id, result)
                });
            }
        }
        info!(
            run = %ctx.id.short(),
            agents = ctx.roster.len(),
            deferred = ctx.launches.len(),
            "agents launched"
        );
        Ok(())
    }

    fn agent_spec(&self, ctx: &RunContext, planned: &PlannedTask, task: &Task) -> AgentSpec {
        let tier = task
            .requirements
            .extra
            .get(META_TIER)
            .and_then(Value::as_str)
            .unwrap_or(&self.config.default_tier)
            .to_string();
        let mut spec = AgentSpec::new(&planned.role, &ctx.scope)
            .with_capabilities(planned.capabilities.clone())
            .with_metadata(META_RUN_ID, ctx.id.to_string())
            .with_metadata(META_TASK_ID, task.id.to_string())
            .with_metadata(META_TIER, tier);
        if let Some(channel) = &ctx.channel {
            spec = spec.with_channel(channel);
        }
        spec
    }

    fn agent_env(&self, ctx: &RunContext, task: &Task) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(tier) = task.requirements.extra.get(META_TIER).and_then(Value::as_str) {
            env.push((ENV_TIER.to_string(), tier.to_string()));
        }
        if let Some(channel) = &ctx.channel {
            env.push((ENV_CHANNEL.to_string(), channel.clone()));
        }
        if let Some(session) = &ctx.resume_session {
            env.push((ENV_RESUME_SESSION.to_string(), session.clone()));
        }
        env
    }

    // ========== Monitoring ==========

    async fn monitor(&self, ctx: &mut RunContext) -> Result<()> {
        // Run progress is left out; the engine publishes it itself.
        let kinds = [
            EventKind::AgentSpawned,
            EventKind::AgentStatusChange,
            EventKind::AgentTerminated,
            EventKind::TaskUpdate,
        ];
        let (sub, mut events) = self
            .bus
            .subscribe_channel(&kinds, EventFilter::scope(&ctx.scope));
        let _guard = SubscriptionGuard::new(&self.bus, sub);

        let deadline = ctx.started + ctx.max_duration;
        let mut ticker = tokio::time::interval(self.config.monitor_poll());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut launches = std::mem::take(&mut ctx.launches);
        let mut bus_open = true;
        let result = loop {
            let resolved = match self.observe(ctx).await {
                Ok(resolved) => resolved,
                Err(e) => break Err(e),
            };
            if resolved {
                break Ok(());
            }

            tokio::select! {
                event = events.recv(), if bus_open => {
                    if event.is_none() {
                        bus_open = false;
                    }
                }
                Some(joined) = launches.join_next(), if !launches.is_empty() => {
                    match joined {
                        Ok((_, Ok(_))) => {}
                        Ok((agent_id, Err(e))) => {
                            ctx.fail(format!("agent {} did not start: {}", agent_id.short(), e));
                        }
                        Err(e) => ctx.fail(format!("launch task failed: {}", e)),
                    }
                }
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    ctx.timed_out = true;
                    break Ok(());
                }
            }
        };
        ctx.launches = launches;
        result
    }

    /// Apply agent failures to tasks, publish progress, and report whether
    /// every roster agent has resolved.
    async fn observe(&self, ctx: &mut RunContext) -> Result<bool> {
        let mut resolved = true;
        let roster = ctx.roster.clone();
        for entry in &roster {
            let agent = self.lifecycle.get(entry.agent_id).await?;
            if !agent.is_terminal() {
                resolved = false;
                continue;
            }
            if agent.status.is_unsuccessful() && ctx.settled.insert(agent.id) {
                let reason = agent_reason(&agent);
                ctx.fail(format!(
                    "agent {} ({}) {}: {}",
                    agent.id.short(),
                    entry.role,
                    agent.status,
                    reason
                ));
                self.settle_task(entry.task_id, &reason).await;
            }
        }

        let counts = self.graph.progress_of(&ctx.task_ids()).await?;
        if ctx.last_counts != Some(counts) {
            ctx.last_counts = Some(counts);
            self.emit(
                ctx,
                counts,
                &format!("{}/{} tasks resolved", counts.resolved(), counts.total),
            )
            .await;
        }
        Ok(resolved)
    }

    /// Fail an unfinished task, or block it if it never started.
    async fn settle_task(&self, task_id: TaskId, reason: &str) {
        let task = match self.graph.get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task = %task_id.short(), error = %e, "cannot settle task");
                return;
            }
        };
        let target = match task.status {
            TaskStatus::Pending => TaskStatus::Blocked,
            TaskStatus::InProgress => TaskStatus::Failed,
            _ => return,
        };
        match self
            .graph
            .update_status(task_id, target, Some(TaskResults::new(reason)))
            .await
        {
            Ok(_) => {}
            // The worker moved it first.
            Err(Error::InvalidTransition { .. }) => {
                debug!(task = %task_id.short(), "task changed while settling")
            }
            Err(e) => warn!(task = %task_id.short(), error = %e, "failed to settle task"),
        }
    }

    /// Publish run progress. Caller updates are best effort except the
    /// final one, which waits for buffer room.
    async fn emit(&self, ctx: &RunContext, counts: TaskCounts, message: &str) {
        let state = self.runs.update(ctx.id, |state| {
            let phase = state.current_phase();
            if phase == RunPhase::Monitoring {
                state.set_progress(phase.scale(counts.fraction_resolved()));
            }
            Ok(state.run().clone())
        });
        let run = match state {
            Ok(run) => run,
            Err(e) => {
                debug!(run = %ctx.id.short(), error = %e, "progress for unknown run");
                return;
            }
        };

        self.bus.publish(Event::new(
            &ctx.scope,
            EventPayload::RunProgress {
                run_id: run.id,
                phase: run.phase,
                percent: run.progress,
                message: message.to_string(),
            },
        ));
        let Some(tx) = &ctx.progress else {
            return;
        };
        let update = ProgressUpdate::for_run(&run, counts, message);
        if update.finished {
            if tx.send(update).await.is_err() {
                debug!(run = %ctx.id.short(), "progress receiver gone");
            }
        } else if tx.try_send(update).is_err() {
            debug!(run = %ctx.id.short(), "progress receiver full or gone, update dropped");
        }
    }

    // ========== Cleanup ==========

    async fn finish(&self, ctx: &mut RunContext, result: Result<()>) -> RunOutcome {
        let reached_cleanup = match &result {
            Ok(()) => match self.enter(ctx, RunPhase::Cleanup) {
                Ok(()) => true,
                Err(e) => {
                    ctx.fail(e.to_string());
                    false
                }
            },
            Err(e) => {
                ctx.fail(format!("run failed: {}", e));
                false
            }
        };
        if ctx.timed_out {
            ctx.fail(format!("run exceeded {:?}", ctx.max_duration));
        }

        let reason = if ctx.timed_out {
            REASON_RUN_TIMEOUT
        } else {
            REASON_RUN_COMPLETE
        };
        let terminations = join_all(ctx.roster.iter().map(|entry| async move {
            let result = self.lifecycle.terminate(entry.agent_id, reason).await;
            (entry.agent_id, result)
        }))
        .await;
        for (agent_id, result) in terminations {
            match result {
                Ok(true) => debug!(agent = %agent_id.short(), reason, "agent stopped by run"),
                Ok(false) => {}
                Err(e) => ctx.fail(format!("failed to stop agent {}: {}", agent_id.short(), e)),
            }
        }
        ctx.launches.shutdown().await;

        for entry in ctx.roster.clone() {
            self.settle_task(entry.task_id, reason).await;
        }

        let sweep = self
            .cleanup
            .sweep(&self.cleanup.default_options().scoped(&ctx.scope))
            .await;
        for failure in &sweep.failures {
            warn!(target_item = %failure.target, error = %failure.message, "cleanup failure during run");
        }

        if let Some(channel) = &ctx.channel {
            if let Err(e) = self.channels.close(channel).await {
                warn!(channel = %channel, error = %e, "failed to close run channel");
            }
        }

        let (tasks, counts) = match self.task_outcomes(ctx).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                ctx.fail(format!("failed to read task outcomes: {}", e));
                (Vec::new(), TaskCounts::default())
            }
        };
        let success = reached_cleanup
            && ctx.failures.is_empty()
            && counts.total > 0
            && counts.completed == counts.total;
        let elapsed = ctx.started.elapsed();
        let message = if success {
            format!("completed {} task(s) in {:.1}s", counts.total, elapsed.as_secs_f64())
        } else if let Some(first) = ctx.failures.first() {
            first.clone()
        } else {
            format!("{} of {} task(s) completed", counts.completed, counts.total)
        };

        if let Some(root) = ctx.root {
            let status = if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            if let Err(e) = self
                .graph
                .update_status(root, status, Some(TaskResults::new(message.clone())))
                .await
            {
                warn!(task = %root.short(), error = %e, "failed to finish root task");
            }
        }

        let outcome = RunOutcome {
            success,
            message,
            data: RunReport {
                tasks,
                failures: ctx.failures.clone(),
                counts,
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                cleanup: Some(sweep),
            },
        };

        let recorded = self.runs.update(ctx.id, |state| {
            state.finish(outcome.clone());
            Ok(())
        });
        if recorded.is_ok() {
            self.emit(ctx, counts, &outcome.message).await;
        }
        if let Err(e) = self.runs.archive(ctx.id) {
            warn!(run = %ctx.id.short(), error = %e, "failed to archive run");
        }
        info!(
            run = %ctx.id.short(),
            success = outcome.success,
            completed = counts.completed,
            total = counts.total,
            "run finished"
        );
        outcome
    }

    async fn task_outcomes(&self, ctx: &RunContext) -> Result<(Vec<TaskOutcome>, TaskCounts)> {
        let mut tasks = Vec::with_capacity(ctx.roster.len());
        for entry in &ctx.roster {
            tasks.push(self.graph.get(entry.task_id).await?);
        }
        let counts = TaskCounts::from_tasks(&tasks);
        let outcomes = tasks
            .into_iter()
            .map(|task| TaskOutcome {
                task_id: task.id,
                title: task.title,
                status: task.status,
                agent_id: task.assigned_agent,
                summary: task.results.map(|r| r.summary),
            })
            .collect();
        Ok((outcomes, counts))
    }
}

/// Re-assign a task whose agent waited on dependencies, so the task leaves
/// pending once its own dependencies are complete.
async fn start_deferred(graph: &TaskGraphManager, task_id: TaskId, agent_id: AgentId) {
    match graph.assign(task_id, agent_id).await {
        Ok(task) => debug!(task = %task_id.short(), status = %task.status, "deferred task started"),
        // The worker already finished it.
        Err(Error::Validation(e)) => debug!(task = %task_id.short(), "{}", e),
        Err(e) => warn!(task = %task_id.short(), error = %e, "failed to start deferred task"),
    }
}

fn agent_prompt(ctx: &RunContext, task: &Task) -> String {
    let mut prompt = format!("{}\n\n{}", task.title, task.description);
    if !task.requirements.acceptance_criteria.is_empty() {
        prompt.push_str("\n\nAcceptance criteria:");
        for criterion in &task.requirements.acceptance_criteria {
            prompt.push_str(&format!("\n- {}", criterion));
        }
    }
    prompt.push_str(&format!("\n\nTask: {}\nRun: {}", task.id, ctx.id));
    prompt
}

fn agent_reason(agent: &Agent) -> String {
    let key = if agent.status == AgentStatus::Terminated {
        TERMINATION_REASON_KEY
    } else {
        FAILURE_REASON_KEY
    };
    agent.metadata_str(key).unwrap_or("no reason given").to_string()
}
