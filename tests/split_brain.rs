//! Concurrent runs racing for the same cluster

use slotctl::common::OrchestratorConfig;
use slotctl::node::LocalCluster;
use slotctl::orchestrator::{Controller, RunResult, RunState, StaticRegistry};
use slotctl::topology::{Role, Topology};
use std::sync::Arc;
use std::time::Duration;

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        total_slots: 1024,
        min_masters: 3,
        replicas_per_master: 0,
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

fn controller(cluster: &Arc<LocalCluster>, registry: StaticRegistry) -> Controller {
    Controller::new(config(), Arc::new(registry), cluster.clone()).unwrap()
}

fn cluster(ids: &[&str]) -> Arc<LocalCluster> {
    let cluster = Arc::new(LocalCluster::new(1024));
    for id in ids {
        cluster.add_node(*id);
    }
    cluster
}

fn without(cluster: &LocalCluster, id: &str) -> StaticRegistry {
    StaticRegistry::new(
        cluster
            .candidates()
            .into_iter()
            .filter(|c| c.id.as_str() != id)
            .collect(),
    )
}

fn fingerprint(result: &RunResult) -> String {
    result.topology.as_ref().unwrap().fingerprint().unwrap()
}

fn split(first: RunResult, second: RunResult) -> (RunResult, RunResult) {
    match (first.state, second.state) {
        (RunState::Succeeded, RunState::Aborted) => (first, second),
        (RunState::Aborted, RunState::Succeeded) => (second, first),
        other => panic!("expected one winner and one aborted run, got {:?}", other),
    }
}

fn assert_applied_everywhere(cluster: &LocalCluster, topology: &Topology) {
    let fingerprint = topology.fingerprint().unwrap();
    for id in topology.node_ids() {
        let state = cluster.agent(id.as_str()).unwrap().state();
        assert!(
            state.matches(topology.epoch, &fingerprint),
            "{} holds epoch {} {:?}",
            id,
            state.epoch,
            state.fingerprint
        );
    }
}

/// Run without `a` anchors on `b`, the full run anchors on `a`. Push delays
/// interleave them: each anchor lands before the other run's fan-out, and
/// every fan-out overlaps the other run's pushes.
async fn race_with_different_anchors() -> (Arc<LocalCluster>, RunResult, RunResult) {
    let cluster = cluster(&["a", "b", "c", "d"]);
    cluster.set_push_delay("a", Duration::from_millis(5));
    cluster.set_push_delay("b", Duration::from_millis(20));
    cluster.set_push_delay("c", Duration::from_millis(10));
    cluster.set_push_delay("d", Duration::from_millis(10));

    let partial = controller(&cluster, without(&cluster, "a"));
    let full = controller(&cluster, cluster.registry());
    let (first, second) = tokio::join!(partial.run(), full.run());
    (cluster, first, second)
}

#[tokio::test(start_paused = true)]
async fn test_racing_runs_with_different_anchors_one_wins() {
    let (cluster, first, second) = race_with_different_anchors().await;
    assert_eq!(first.epoch, Some(1));
    assert_eq!(second.epoch, Some(1));
    assert_ne!(fingerprint(&first), fingerprint(&second));

    let (winner, loser) = split(first, second);
    assert!(fingerprint(&winner) > fingerprint(&loser));

    let failure = loser.failure.as_ref().unwrap();
    assert!(!failure.requires_remediation);
    assert_eq!(failure.phase, RunState::Converging);
    assert!(failure.reason.contains("Stale epoch"), "{}", failure.reason);

    assert_applied_everywhere(&cluster, winner.topology.as_ref().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_next_run_repairs_after_race() {
    let (cluster, first, second) = race_with_different_anchors().await;
    split(first, second);

    for _ in 0..2 {
        let settled = controller(&cluster, cluster.registry()).run().await;
        assert_eq!(settled.state, RunState::Succeeded, "{:?}", settled.failure);
        assert_applied_everywhere(&cluster, settled.topology.as_ref().unwrap());
    }
    let last = controller(&cluster, cluster.registry()).run().await;
    assert_eq!(last.pushes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_identical_racing_runs_both_succeed() {
    let cluster = cluster(&["a", "b", "c"]);
    cluster.add_node_with("d", Role::Master, None);
    for id in ["a", "b", "c", "d"] {
        cluster.set_probe_delay(id, Duration::from_millis(50));
    }
    let one = controller(&cluster, cluster.registry());
    let two = controller(&cluster, cluster.registry());

    let (first, second) = tokio::join!(one.run(), two.run());
    assert_eq!(first.state, RunState::Succeeded, "{:?}", first.failure);
    assert_eq!(second.state, RunState::Succeeded, "{:?}", second.failure);
    assert_eq!(first.topology, second.topology);
    assert_applied_everywhere(&cluster, first.topology.as_ref().unwrap());
}
