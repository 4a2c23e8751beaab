//! Full orchestration runs against simulated workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use conductor::core::agent::{AgentStatus, TERMINATION_REASON_KEY};
use conductor::core::task::{Task, TaskId, TaskResults, TaskSpec, TaskStatus};
use conductor::events::{EventFilter, EventKind, EventPayload};
use conductor::orchestration::{
    MonitorQuery, MonitorTarget, ProgressUpdate, RunRequest, SubtaskSpec, TaskGraphManager,
    REASON_RUN_TIMEOUT, ROOT_TASK_KIND,
};
use conductor::planner::{DefaultPlanner, Planner, ResearchContext};
use conductor::ports::{CoordinationChannel, ENV_CHANNEL, ENV_TIER};
use conductor::run::{RunId, RunOutcome, RunPhase, RunState, RunStatus};
use conductor::RunHandle;

use super::fixtures::{Harness, SCENARIO_TIMEOUT};

const SCOPE: &str = "/work/e2e";

/// Drain progress, then collect the outcome.
async fn drive(mut handle: RunHandle) -> (Vec<ProgressUpdate>, RunOutcome) {
    let collected = async move {
        let mut updates = Vec::new();
        while let Some(update) = handle.progress.recv().await {
            updates.push(update);
        }
        (updates, handle.wait().await)
    };
    tokio::time::timeout(SCENARIO_TIMEOUT, collected)
        .await
        .expect("run finished in time")
}

fn statuses(outcome: &RunOutcome) -> Vec<TaskStatus> {
    outcome.data.tasks.iter().map(|t| t.status).collect()
}

async fn ready_ids(graph: &TaskGraphManager) -> Vec<TaskId> {
    graph
        .find_ready(SCOPE)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect()
}

async fn until_monitoring(harness: &Harness, run_id: RunId) -> RunState {
    tokio::time::timeout(SCENARIO_TIMEOUT, async {
        loop {
            let state = harness.conductor.run_status(run_id).unwrap();
            if state.current_phase() == RunPhase::Monitoring {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run reached monitoring")
}

async fn until_started(graph: &TaskGraphManager, id: TaskId) -> Task {
    tokio::time::timeout(SCENARIO_TIMEOUT, async {
        loop {
            let task = graph.get(id).await.unwrap();
            if task.status != TaskStatus::Pending {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task left pending")
}

// ========== Readiness ==========

#[tokio::test]
async fn test_default_plan_becomes_ready_in_order() {
    let harness = Harness::new();
    let graph = harness.graph();
    let plan = DefaultPlanner
        .plan("build and test a function", &ResearchContext::default())
        .await
        .unwrap();

    let root = graph
        .create_task(TaskSpec::new(SCOPE, ROOT_TASK_KIND, "build and test a function"))
        .await
        .unwrap();
    graph
        .update_status(root.id, TaskStatus::InProgress, None)
        .await
        .unwrap();
    let subtasks = plan
        .tasks
        .iter()
        .zip(plan.dependency_indices().unwrap())
        .map(|(planned, deps)| {
            let spec = TaskSpec::new(SCOPE, planned.kind.clone(), &planned.title);
            deps.into_iter().fold(SubtaskSpec::new(spec), SubtaskSpec::after)
        })
        .collect();
    let tasks = graph.breakdown(root.id, subtasks).await.unwrap();
    let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Analyze requirements", "Implement changes", "Verify changes"]
    );

    // Only the analysis task is ready at first; each completion frees the next.
    for (step, task) in tasks.iter().enumerate() {
        assert_eq!(ready_ids(graph).await, vec![task.id], "step {}", step);
        graph
            .update_status(task.id, TaskStatus::InProgress, None)
            .await
            .unwrap();
        assert!(ready_ids(graph).await.is_empty());
        graph
            .update_status(task.id, TaskStatus::Completed, Some(TaskResults::new("ok")))
            .await
            .unwrap();
    }
    assert!(ready_ids(graph).await.is_empty());
}

#[tokio::test]
async fn test_each_task_starts_with_its_agent() {
    let harness = Harness::new();
    let graph = harness.graph();
    let lifecycle = harness.lifecycle();

    let handle = harness
        .conductor
        .start_run(RunRequest::new("build and test a function", SCOPE))
        .unwrap();
    let state = until_monitoring(&harness, handle.run_id).await;
    let tasks = state.run().task_ids.clone();
    let agents = state.run().agent_ids.clone();
    assert_eq!(tasks.len(), 3);

    // The analysis task went to its agent as soon as the plan was materialized.
    assert_eq!(harness.spawner.spawned_roles(), vec!["architect"]);
    assert_eq!(graph.get(tasks[1]).await.unwrap().status, TaskStatus::Pending);
    assert!(ready_ids(graph).await.is_empty());

    // Completing a step by hand starts the next agent together with its task,
    // so nothing is ever left over for another scheduler to pick up.
    for step in 0..tasks.len() {
        let task = until_started(graph, tasks[step]).await;
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent, Some(agents[step]));
        assert_eq!(
            lifecycle.get(agents[step]).await.unwrap().status,
            AgentStatus::Active
        );
        assert!(ready_ids(graph).await.is_empty());

        graph
            .update_status(tasks[step], TaskStatus::Completed, Some(TaskResults::new("ok")))
            .await
            .unwrap();
        lifecycle
            .update_status(agents[step], AgentStatus::Completed, None)
            .await
            .unwrap();
    }

    let (updates, outcome) = drive(handle).await;
    assert!(outcome.success, "run failed: {}", outcome.message);
    assert_eq!(outcome.data.counts.completed, 3);
    assert_eq!(outcome.data.counts.total, 3);
    assert_eq!(
        harness.spawner.spawned_roles(),
        vec!["architect", "implementer", "tester"]
    );
    assert!(updates.last().unwrap().finished);
    assert!(ready_ids(graph).await.is_empty());
}

// ========== Success ==========

#[tokio::test]
async fn test_three_task_run_completes() {
    let harness = Harness::new();
    harness.attach_workers(&[]);
    let (_, mut task_events) = harness
        .conductor
        .bus()
        .subscribe_channel(&[EventKind::TaskUpdate], EventFilter::scope(SCOPE));

    let handle = harness
        .conductor
        .start_run(RunRequest::new("add user login", SCOPE).with_title("Login"))
        .unwrap();
    let run_id = handle.run_id;
    let (updates, outcome) = drive(handle).await;

    assert!(outcome.success, "run failed: {}", outcome.message);
    assert!(outcome.data.failures.is_empty());
    assert_eq!(outcome.data.counts.total, 3);
    assert_eq!(outcome.data.counts.completed, 3);
    let titles: Vec<&str> = outcome.data.tasks.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Analyze requirements", "Implement changes", "Verify changes"]
    );
    for task in &outcome.data.tasks {
        assert!(task.agent_id.is_some());
        assert!(task.summary.as_deref().unwrap_or_default().starts_with("done by"));
    }

    // Agents start strictly in dependency order.
    assert_eq!(
        harness.spawner.spawned_roles(),
        vec!["architect", "implementer", "tester"]
    );

    let state = harness.conductor.run_status(run_id).unwrap();
    let run = state.run();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.progress, 100);
    assert_eq!(run.title, "Login");
    let phases: Vec<RunPhase> = state.phase_history().iter().map(|h| h.phase).collect();
    assert_eq!(phases, RunPhase::ALL.to_vec());

    let root = harness.graph().get(run.root_task.unwrap()).await.unwrap();
    assert_eq!(root.status, TaskStatus::Completed);
    for &agent_id in &run.agent_ids {
        let agent = harness.lifecycle().get(agent_id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Completed);
    }

    // Every spawn carries the run channel and a tier; the channel is closed afterwards.
    let channel = run.channel.clone().unwrap();
    for request in harness.spawner.requests() {
        assert_eq!(request.env_value(ENV_CHANNEL), Some(channel.as_str()));
        assert!(request.env_value(ENV_TIER).is_some());
        assert_eq!(request.working_dir, PathBuf::from(SCOPE));
    }
    assert!(harness.hub.list_channels(Some(SCOPE)).await.unwrap().is_empty());
    let notices = harness.hub.messages(&channel).await.unwrap();
    assert!(notices[0].body.contains("add user login"));

    // Progress only moves forward and ends at 100.
    assert_eq!(updates.first().unwrap().phase, Some(RunPhase::Research));
    assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
    let last = updates.last().unwrap();
    assert!(last.finished);
    assert_eq!(last.percent, 100);
    assert_eq!(last.counts.completed, 3);

    // Each task's events form a legal chain, and no task starts before its
    // dependency completes.
    let mut last_status: HashMap<TaskId, TaskStatus> = HashMap::new();
    let mut started_at: HashMap<TaskId, usize> = HashMap::new();
    let mut completed_at: HashMap<TaskId, usize> = HashMap::new();
    let mut index = 0;
    while let Some(event) = task_events.try_recv() {
        let EventPayload::TaskUpdate {
            task_id,
            previous,
            status,
            ..
        } = event.payload
        else {
            continue;
        };
        assert_eq!(previous, last_status.get(&task_id).copied());
        last_status.insert(task_id, status);
        if status == TaskStatus::InProgress && previous != Some(TaskStatus::InProgress) {
            started_at.insert(task_id, index);
        }
        if status == TaskStatus::Completed {
            completed_at.insert(task_id, index);
        }
        index += 1;
    }
    let ids: Vec<TaskId> = outcome.data.tasks.iter().map(|t| t.task_id).collect();
    assert!(completed_at[&ids[0]] < started_at[&ids[1]]);
    assert!(completed_at[&ids[1]] < started_at[&ids[2]]);
    assert!(ready_ids(harness.graph()).await.is_empty());
}

// ========== Failure ==========

#[tokio::test]
async fn test_failed_worker_blocks_downstream() {
    let harness = Harness::new();
    harness.attach_workers(&["implementer"]);

    let handle = harness
        .conductor
        .start_run(RunRequest::new("add user login", SCOPE))
        .unwrap();
    let run_id = handle.run_id;
    let (updates, outcome) = drive(handle).await;

    assert!(!outcome.success);
    assert_eq!(
        statuses(&outcome),
        vec![TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Blocked]
    );
    assert!(outcome
        .data
        .failures
        .iter()
        .any(|f| f.contains("implementer") && f.contains("simulated failure")));

    // The tester never started.
    assert_eq!(harness.spawner.spawned_roles(), vec!["architect", "implementer"]);

    let state = harness.conductor.run_status(run_id).unwrap();
    assert_eq!(state.run().status, RunStatus::Failed);
    assert!(state.run().progress < 100);
    let root = harness
        .graph()
        .get(state.run().root_task.unwrap())
        .await
        .unwrap();
    assert_eq!(root.status, TaskStatus::Failed);

    let agents = &state.run().agent_ids;
    let tester = harness.lifecycle().get(agents[2]).await.unwrap();
    assert_eq!(tester.status, AgentStatus::Failed);

    let last = updates.last().unwrap();
    assert!(last.finished);
    assert_eq!(last.counts.failed, 1);
    assert_eq!(last.counts.blocked, 1);
}

#[tokio::test]
async fn test_run_times_out_without_workers() {
    let harness = Harness::new();

    let handle = harness
        .conductor
        .start_run(
            RunRequest::new("add user login", SCOPE).with_max_duration(Duration::from_millis(300)),
        )
        .unwrap();
    let run_id = handle.run_id;
    let (_, outcome) = drive(handle).await;

    assert!(!outcome.success);
    assert!(outcome.data.failures.iter().any(|f| f.contains("exceeded")));
    assert_eq!(outcome.data.counts.completed, 0);
    assert_eq!(outcome.data.counts.resolved(), 3);

    let state = harness.conductor.run_status(run_id).unwrap();
    assert_eq!(state.run().status, RunStatus::Failed);

    let architect = harness
        .lifecycle()
        .get(state.run().agent_ids[0])
        .await
        .unwrap();
    assert_eq!(architect.status, AgentStatus::Terminated);
    assert_eq!(
        architect.metadata_str(TERMINATION_REASON_KEY),
        Some(REASON_RUN_TIMEOUT)
    );
    assert!(harness.spawner.kill_count() >= 1);
    for &agent_id in &state.run().agent_ids {
        let agent = harness.lifecycle().get(agent_id).await.unwrap();
        assert!(agent.status.is_unsuccessful());
    }
}

// ========== Monitoring ==========

#[tokio::test]
async fn test_follow_monitor_ends_when_run_finishes() {
    let harness = Harness::new();
    harness.attach_workers(&[]);

    let handle = harness
        .conductor
        .start_run(RunRequest::new("add user login", SCOPE))
        .unwrap();
    let run_id = handle.run_id;
    let mut follow = harness
        .conductor
        .monitor(MonitorQuery::new(MonitorTarget::Run(run_id)).follow())
        .await
        .unwrap();

    let seen = tokio::time::timeout(SCENARIO_TIMEOUT, async move {
        let mut seen = Vec::new();
        while let Some(update) = follow.recv().await {
            seen.push(update);
        }
        seen
    })
    .await
    .unwrap();
    let outcome = handle.wait().await;
    assert!(outcome.success);

    let last = seen.last().unwrap();
    assert!(last.finished);
    assert_eq!(last.run_id, Some(run_id));
    assert_eq!(last.percent, 100);

    // Scope view after the fact includes the root task.
    let mut snapshot = harness
        .conductor
        .monitor(MonitorQuery::new(MonitorTarget::Scope(SCOPE.to_string())).full())
        .await
        .unwrap();
    let view = snapshot.recv().await.unwrap();
    assert_eq!(view.counts.total, 4);
    assert_eq!(view.counts.completed, 4);
    assert_eq!(view.tasks.len(), 4);
    assert_eq!(view.agents.len(), 3);
    assert!(snapshot.recv().await.is_none());
}
