//! Task graph properties through the public manager API.

use std::collections::HashSet;

use conductor::core::dag::DependencyType;
use conductor::core::task::{TaskId, TaskKind, TaskResults, TaskSpec, TaskStatus};
use conductor::events::{EventFilter, EventKind, EventPayload};
use conductor::orchestration::TaskGraphManager;
use conductor::Error;

use super::fixtures::Harness;

const SCOPE: &str = "/work/graph";

async fn create(graph: &TaskGraphManager, title: &str) -> TaskId {
    graph
        .create_task(TaskSpec::new(SCOPE, TaskKind::Feature, title))
        .await
        .unwrap()
        .id
}

async fn complete(graph: &TaskGraphManager, id: TaskId) {
    graph
        .update_status(id, TaskStatus::InProgress, None)
        .await
        .unwrap();
    graph
        .update_status(id, TaskStatus::Completed, Some(TaskResults::new("ok")))
        .await
        .unwrap();
}

async fn ready_ids(graph: &TaskGraphManager) -> HashSet<TaskId> {
    graph
        .find_ready(SCOPE)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect()
}

/// Minimal linear congruential generator so the edge sequence is
/// reproducible without pulling in a rand dependency.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound
    }
}

// ========== Acyclicity ==========

#[tokio::test]
async fn test_random_edges_never_form_a_cycle() {
    let harness = Harness::new();
    let graph = harness.graph();

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(create(graph, &format!("task {}", i)).await);
    }

    let mut rng = Lcg(0x5eed);
    let mut accepted = 0;
    let mut rejected = 0;
    for _ in 0..80 {
        let task = ids[rng.next(ids.len())];
        let depends_on = ids[rng.next(ids.len())];
        let before = graph.list_dependencies(task).await.unwrap();

        match graph
            .add_dependency(task, depends_on, DependencyType::Completion)
            .await
        {
            Ok(()) => accepted += 1,
            Err(Error::Cycle { .. }) => {
                rejected += 1;
                assert_eq!(graph.list_dependencies(task).await.unwrap(), before);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }

        // The critical path needs a topological order, so it fails on any cycle.
        graph.critical_path(SCOPE).await.unwrap();
    }

    assert!(accepted > 0);
    assert!(rejected > 0);
}

#[tokio::test]
async fn test_closing_a_chain_is_rejected() {
    let harness = Harness::new();
    let graph = harness.graph();
    let a = create(graph, "a").await;
    let b = create(graph, "b").await;
    let c = create(graph, "c").await;

    graph.add_dependency(b, a, DependencyType::Completion).await.unwrap();
    graph.add_dependency(c, b, DependencyType::Data).await.unwrap();

    let err = graph
        .add_dependency(a, c, DependencyType::Completion)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cycle { task, depends_on } if task == a && depends_on == c));
    assert!(graph.list_dependencies(a).await.unwrap().is_empty());
    assert_eq!(graph.list_dependents(a).await.unwrap(), vec![b]);
}

// ========== Readiness ==========

#[tokio::test]
async fn test_readiness_follows_diamond() {
    let harness = Harness::new();
    let graph = harness.graph();
    let a = create(graph, "design").await;
    let b = create(graph, "backend").await;
    let c = create(graph, "frontend").await;
    let d = create(graph, "integrate").await;
    for (task, dep) in [(b, a), (c, a), (d, b), (d, c)] {
        graph.add_dependency(task, dep, DependencyType::Completion).await.unwrap();
    }

    assert_eq!(ready_ids(graph).await, HashSet::from([a]));

    complete(graph, a).await;
    assert_eq!(ready_ids(graph).await, HashSet::from([b, c]));

    complete(graph, b).await;
    assert_eq!(ready_ids(graph).await, HashSet::from([c]));

    complete(graph, c).await;
    assert_eq!(ready_ids(graph).await, HashSet::from([d]));
}

#[tokio::test]
async fn test_failed_dependency_keeps_dependent_unready() {
    let harness = Harness::new();
    let graph = harness.graph();
    let a = create(graph, "migrate").await;
    let b = create(graph, "backfill").await;
    graph.add_dependency(b, a, DependencyType::Completion).await.unwrap();

    graph.update_status(a, TaskStatus::InProgress, None).await.unwrap();
    graph
        .update_status(a, TaskStatus::Failed, Some(TaskResults::new("schema drift")))
        .await
        .unwrap();

    assert!(ready_ids(graph).await.is_empty());
    assert_eq!(graph.progress(SCOPE).await.unwrap().failed, 1);
}

// ========== Transition Legality ==========

fn path_to(status: TaskStatus) -> &'static [TaskStatus] {
    match status {
        TaskStatus::Pending => &[],
        TaskStatus::InProgress => &[TaskStatus::InProgress],
        TaskStatus::Completed => &[TaskStatus::InProgress, TaskStatus::Completed],
        TaskStatus::Failed => &[TaskStatus::InProgress, TaskStatus::Failed],
        TaskStatus::Blocked => &[TaskStatus::Blocked],
    }
}

#[tokio::test]
async fn test_only_legal_transitions_are_applied() {
    let all = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ];
    let harness = Harness::new();
    let graph = harness.graph();
    let (_, mut events) = harness
        .conductor
        .bus()
        .subscribe_channel(&[EventKind::TaskUpdate], EventFilter::scope(SCOPE));

    for from in all {
        for to in all {
            let id = create(graph, &format!("{} -> {}", from, to)).await;
            for &step in path_to(from) {
                graph.update_status(id, step, None).await.unwrap();
            }
            while events.try_recv().is_some() {}

            let result = graph.update_status(id, to, None).await;
            let stored = graph.get(id).await.unwrap().status;
            if from == to {
                assert!(result.is_ok(), "{} -> {} should be a no-op", from, to);
                assert!(events.try_recv().is_none());
            } else if from.can_transition_to(to) {
                assert!(result.is_ok(), "{} -> {} should be legal", from, to);
                assert_eq!(stored, to);
                let event = events.try_recv().expect("transition publishes");
                assert!(matches!(
                    event.payload,
                    EventPayload::TaskUpdate { previous: Some(p), status, .. } if p == from && status == to
                ));
            } else {
                assert!(
                    matches!(result, Err(Error::InvalidTransition { .. })),
                    "{} -> {} should be rejected",
                    from,
                    to
                );
                assert_eq!(stored, from);
                assert!(events.try_recv().is_none());
            }
        }
    }
}
