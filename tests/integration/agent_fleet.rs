//! Agent lifecycle and dependency waits across concurrent callers.

use std::time::{Duration, Instant};

use futures::future::join_all;

use conductor::core::agent::{AgentId, AgentStatus, TERMINATION_REASON_KEY};
use conductor::events::{EventFilter, EventKind, EventPayload};
use conductor::orchestration::{AgentLifecycleManager, AgentSpec, WaitOptions};
use conductor::Error;

use super::fixtures::{FakeSpawner, Harness, SCENARIO_TIMEOUT};

const SCOPE: &str = "/work/fleet";

async fn active(lifecycle: &AgentLifecycleManager, role: &str) -> AgentId {
    lifecycle
        .spawn(AgentSpec::new(role, SCOPE).with_prompt("do the thing"))
        .await
        .unwrap()
        .id
}

async fn finish(lifecycle: &AgentLifecycleManager, id: AgentId, status: AgentStatus) {
    lifecycle.update_status(id, status, None).await.unwrap();
}

fn wait_options(harness: &Harness) -> WaitOptions {
    WaitOptions::from_config(&harness.conductor.config().waiter)
}

// ========== Termination ==========

#[tokio::test]
async fn test_concurrent_termination_has_one_winner() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle();
    let id = active(lifecycle, "backend").await;
    let (_, mut events) = harness
        .conductor
        .bus()
        .subscribe_channel(&[EventKind::AgentTerminated], EventFilter::any());

    let results = join_all((0..16).map(|i| {
        let lifecycle = lifecycle.clone();
        async move { lifecycle.terminate(id, &format!("caller {}", i)).await }
    }))
    .await;

    let winners = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(harness.spawner.kill_count(), 1);

    assert!(events.try_recv().is_some());
    assert!(events.try_recv().is_none());

    let agent = lifecycle.get(id).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Terminated);
    assert!(agent.metadata_str(TERMINATION_REASON_KEY).is_some());
}

#[tokio::test]
async fn test_terminating_finished_agent_is_noop() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle();
    let id = active(lifecycle, "docs").await;
    finish(lifecycle, id, AgentStatus::Completed).await;

    assert!(!lifecycle.terminate(id, "late").await.unwrap());
    assert_eq!(lifecycle.get(id).await.unwrap().status, AgentStatus::Completed);
    assert_eq!(harness.spawner.kill_count(), 0);
}

// ========== Dependency Waits ==========

#[tokio::test]
async fn test_wait_result_keeps_request_order() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle();

    for order in [[0usize, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]] {
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(active(lifecycle, &format!("worker-{}", i)).await);
        }

        let finisher = {
            let lifecycle = lifecycle.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                for index in order {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    lifecycle
                        .update_status(ids[index], AgentStatus::Completed, None)
                        .await
                        .unwrap();
                }
            })
        };

        let result = lifecycle
            .waiter()
            .wait_for(&ids, SCOPE, wait_options(&harness))
            .await
            .unwrap();
        finisher.await.unwrap();

        assert!(result.success);
        assert_eq!(result.completed_agents, ids);
        assert!(result.failed_agents.is_empty());
        assert!(result.timeout_agents.is_empty());
    }
}

#[tokio::test]
async fn test_timeout_lists_exactly_the_unresolved() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle();
    let a = active(lifecycle, "a").await;
    let b = active(lifecycle, "b").await;
    let c = active(lifecycle, "c").await;
    finish(lifecycle, b, AgentStatus::Completed).await;

    let result = lifecycle
        .waiter()
        .wait_for(
            &[a, b, c],
            SCOPE,
            wait_options(&harness).with_timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.completed_agents, vec![b]);
    assert_eq!(result.timeout_agents, vec![a, c]);
    assert!(result.wait_duration_ms >= 150);
    assert!(matches!(
        result.into_result(),
        Err(Error::DependencyTimeout { agents }) if agents == vec![a, c]
    ));
}

#[tokio::test]
async fn test_first_failure_short_circuits_the_wait() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle();
    let a = active(lifecycle, "a").await;
    let b = active(lifecycle, "b").await;

    let failer = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lifecycle
                .update_status(a, AgentStatus::Failed, None)
                .await
                .unwrap();
        })
    };

    let started = Instant::now();
    let result = lifecycle
        .waiter()
        .wait_for(&[a, b], SCOPE, wait_options(&harness).fail_fast())
        .await
        .unwrap();
    failer.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!result.success);
    assert_eq!(result.failed_agents, vec![a]);
    assert_eq!(result.unresolved_agents, vec![b]);
    assert!(result.timeout_agents.is_empty());
}

#[tokio::test]
async fn test_dependent_launch_waits_for_dependency() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle();
    let first = active(lifecycle, "schema").await;

    let dependent = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            lifecycle
                .spawn(AgentSpec::new("api", SCOPE).with_dependencies([first]))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(harness.spawner.spawned_roles(), vec!["schema".to_string()]);
    assert!(!dependent.is_finished());

    finish(lifecycle, first, AgentStatus::Completed).await;
    let agent = tokio::time::timeout(SCENARIO_TIMEOUT, dependent)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(agent.status, AgentStatus::Active);
    assert_eq!(
        harness.spawner.spawned_roles(),
        vec!["schema".to_string(), "api".to_string()]
    );
}

#[tokio::test]
async fn test_refused_spawn_cascades_to_dependents() {
    let harness = Harness::with_spawner(FakeSpawner::refusing(&["ghost"]));
    let lifecycle = harness.lifecycle();

    let err = lifecycle
        .spawn(AgentSpec::new("ghost", SCOPE))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpawnFailed(_)));
    let ghost = lifecycle
        .list(&conductor::store::AgentQuery::scope(SCOPE))
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.role == "ghost")
        .unwrap();
    assert_eq!(ghost.status, AgentStatus::Failed);

    let err = lifecycle
        .spawn(AgentSpec::new("follower", SCOPE).with_dependencies([ghost.id]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyFailed { agents } if agents == vec![ghost.id]));
    assert!(harness.spawner.requests().is_empty());
}

// ========== Event Ordering ==========

#[tokio::test]
async fn test_lifecycle_events_follow_status_order() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle();
    let (_, mut events) = harness
        .conductor
        .bus()
        .subscribe_channel(&EventKind::AGENT_LIFECYCLE, EventFilter::scope(SCOPE));

    let first = active(lifecycle, "first").await;
    let second_task = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            lifecycle
                .spawn(AgentSpec::new("second", SCOPE).with_dependencies([first]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    finish(lifecycle, first, AgentStatus::Completed).await;
    let second = second_task.await.unwrap().unwrap().id;
    lifecycle.terminate(second, "done").await.unwrap();

    let mut received = Vec::new();
    while let Some(event) = events.try_recv() {
        received.push(event.payload);
    }

    assert_eq!(received.len(), 4);
    assert!(matches!(
        &received[0],
        EventPayload::AgentSpawned { agent_id, .. } if *agent_id == first
    ));
    assert!(matches!(
        &received[1],
        EventPayload::AgentStatusChange { agent_id, previous: AgentStatus::Active, status: AgentStatus::Completed }
            if *agent_id == first
    ));
    assert!(matches!(
        &received[2],
        EventPayload::AgentSpawned { agent_id, .. } if *agent_id == second
    ));
    assert!(matches!(
        &received[3],
        EventPayload::AgentTerminated { agent_id, previous: AgentStatus::Active, .. }
            if *agent_id == second
    ));
}
