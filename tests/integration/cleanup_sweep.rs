//! Cleanup sweeps over a populated store.

use std::sync::Arc;

use chrono::Utc;

use conductor::core::agent::{AgentId, AgentStatus, TERMINATION_REASON_KEY};
use conductor::orchestration::AgentSpec;
use conductor::ports::{CoordinationChannel, ProcessSpawner};
use conductor::store::{AgentRepository, EntityStore, MemoryStore};
use conductor::{Conductor, Error};

use super::fixtures::{fast_config, FakeSpawner, FlakyChannels, Harness};

const SCOPE: &str = "/work/cleanup";

async fn age_heartbeat(store: &MemoryStore, id: AgentId, minutes_ago: i64) {
    let mut agent = store.get_agent(id).await.unwrap().unwrap();
    agent.last_heartbeat = Utc::now() - chrono::Duration::minutes(minutes_ago);
    store.update_agent(agent).await.unwrap();
}

async fn snapshot_json(store: &MemoryStore) -> serde_json::Value {
    serde_json::to_value(store.snapshot().await).unwrap()
}

// ========== Dry Run ==========

#[tokio::test]
async fn test_dry_run_reports_without_mutating() {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle();

    let stale = lifecycle.spawn(AgentSpec::new("stuck", SCOPE)).await.unwrap().id;
    let fresh = lifecycle.spawn(AgentSpec::new("busy", SCOPE)).await.unwrap().id;
    age_heartbeat(&harness.store, stale, 90).await;

    harness.hub.create_channel("old-room", SCOPE).await.unwrap();
    harness
        .hub
        .set_last_activity("old-room", Utc::now() - chrono::Duration::hours(3))
        .await
        .unwrap();
    harness.hub.create_channel("new-room", SCOPE).await.unwrap();

    let before = snapshot_json(&harness.store).await;
    let report = harness.conductor.sweep(true).await;
    let after = snapshot_json(&harness.store).await;

    assert!(report.dry_run);
    assert_eq!(report.stale_agents, vec![stale]);
    assert_eq!(report.inactive_channels, vec!["old-room".to_string()]);
    assert_eq!(report.acted_count(), 0);
    assert_eq!(before, after);
    assert_eq!(harness.spawner.kill_count(), 0);
    assert_eq!(harness.hub.list_channels(Some(SCOPE)).await.unwrap().len(), 2);

    // The same sweep for real.
    let report = harness.conductor.sweep(false).await;
    assert!(report.is_success());
    assert_eq!(report.terminated_agents, vec![stale]);
    assert_eq!(report.closed_channels, vec!["old-room".to_string()]);

    let agent = lifecycle.get(stale).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Terminated);
    assert_eq!(agent.metadata_str(TERMINATION_REASON_KEY), Some("stale"));
    assert_eq!(lifecycle.get(fresh).await.unwrap().status, AgentStatus::Active);

    let open: Vec<String> = harness
        .hub
        .list_channels(Some(SCOPE))
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(open, vec!["new-room".to_string()]);
}

#[tokio::test]
async fn test_second_sweep_finds_nothing() {
    let harness = Harness::new();
    let stale = harness
        .lifecycle()
        .spawn(AgentSpec::new("stuck", SCOPE))
        .await
        .unwrap()
        .id;
    age_heartbeat(&harness.store, stale, 45).await;

    assert_eq!(harness.conductor.sweep(false).await.terminated_agents, vec![stale]);
    let again = harness.conductor.sweep(false).await;
    assert_eq!(again.candidate_count(), 0);
    assert_eq!(harness.spawner.kill_count(), 1);
}

// ========== Partial Failure ==========

#[tokio::test]
async fn test_channel_failure_does_not_abort_sweep() {
    let store = Arc::new(MemoryStore::new());
    let spawner = Arc::new(FakeSpawner::new());
    let channels = Arc::new(FlakyChannels::new("stuck-"));

    let shared_store: Arc<dyn EntityStore> = store.clone();
    let shared_spawner: Arc<dyn ProcessSpawner> = spawner.clone();
    let shared_channels: Arc<dyn CoordinationChannel> = channels.clone();
    let conductor = Conductor::builder(fast_config())
        .store(shared_store)
        .spawner(shared_spawner)
        .channels(shared_channels)
        .build();

    let stale = conductor
        .lifecycle()
        .spawn(AgentSpec::new("stuck", SCOPE))
        .await
        .unwrap()
        .id;
    age_heartbeat(&store, stale, 120).await;

    let long_ago = Utc::now() - chrono::Duration::days(1);
    for name in ["stuck-room", "idle-room"] {
        channels.create_channel(name, SCOPE).await.unwrap();
        channels.hub.set_last_activity(name, long_ago).await.unwrap();
    }

    let report = conductor.sweep(false).await;
    assert!(!report.is_success());
    assert_eq!(report.terminated_agents, vec![stale]);
    assert_eq!(report.closed_channels, vec!["idle-room".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, "stuck-room");

    match report.into_result() {
        Err(Error::CleanupPartialFailure { failures }) => assert_eq!(failures.len(), 1),
        other => panic!("expected partial failure, got {:?}", other.map(|r| r.acted_count())),
    }
}
