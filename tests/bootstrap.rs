//! Bootstrap and re-run tests against an in-process cluster

use slotctl::common::OrchestratorConfig;
use slotctl::node::LocalCluster;
use slotctl::orchestrator::{Controller, NodeOutcome, RunState};
use slotctl::topology::{NodeId, Role, SlotRange};
use std::sync::Arc;
use std::time::Duration;

fn config(total_slots: u32, min_masters: usize, replicas_per_master: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        total_slots,
        min_masters,
        replicas_per_master,
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

fn cluster(total_slots: u32, ids: &[&str]) -> Arc<LocalCluster> {
    let cluster = Arc::new(LocalCluster::new(total_slots));
    for id in ids {
        cluster.add_node(*id);
    }
    cluster
}

fn controller(cluster: &Arc<LocalCluster>, cfg: OrchestratorConfig) -> Controller {
    Controller::new(cfg, Arc::new(cluster.registry()), cluster.clone()).unwrap()
}

#[tokio::test]
async fn test_fresh_bootstrap_three_masters() {
    let cluster = cluster(16384, &["A", "B", "C"]);
    let result = controller(&cluster, config(16384, 3, 0)).run().await;

    assert_eq!(result.state, RunState::Succeeded);
    assert_eq!(result.epoch, Some(1));
    assert_eq!(result.pushes, 3);

    let topology = result.topology.unwrap();
    assert_eq!(topology.slots[&NodeId::from("A")], vec![SlotRange::new(0, 5461)]);
    assert_eq!(
        topology.slots[&NodeId::from("B")],
        vec![SlotRange::new(5462, 10922)]
    );
    assert_eq!(
        topology.slots[&NodeId::from("C")],
        vec![SlotRange::new(10923, 16383)]
    );

    for id in ["A", "B", "C"] {
        let state = cluster.agent(id).unwrap().state();
        assert_eq!(state.epoch, 1);
        assert_eq!(state.role, Role::Master);
        assert_eq!(state.peers.len(), 2);
        assert_eq!(result.outcomes[&NodeId::from(id)], NodeOutcome::Converged);
    }
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let cluster = cluster(4096, &["a", "b", "c", "d", "e", "f"]);
    let cfg = config(4096, 1, 1);

    let first = controller(&cluster, cfg.clone()).run().await;
    assert_eq!(first.state, RunState::Succeeded);
    let pushes_after_first = cluster.push_count();

    for _ in 0..3 {
        let again = controller(&cluster, cfg.clone()).run().await;
        assert_eq!(again.state, RunState::Succeeded);
        assert_eq!(again.epoch, first.epoch);
        assert_eq!(again.topology, first.topology);
        assert_eq!(again.pushes, 0);
    }
    assert_eq!(cluster.push_count(), pushes_after_first);
}

#[tokio::test]
async fn test_bootstrap_with_replicas_is_balanced() {
    let ids: Vec<String> = (0..9).map(|i| format!("node-{}", i)).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let cluster = cluster(16384, &refs);

    let result = controller(&cluster, config(16384, 1, 2)).run().await;
    assert_eq!(result.state, RunState::Succeeded, "{:?}", result.failure);

    let topology = result.topology.unwrap();
    assert_eq!(topology.slots.len(), 3);
    assert_eq!(topology.replicas.len(), 6);
    for master in topology.masters() {
        assert_eq!(topology.replicas_of(master).len(), 2);
    }

    let replica = &topology.replicas[0];
    let state = cluster.agent(replica.replica.as_str()).unwrap().state();
    assert_eq!(state.role, Role::Replica);
}

#[tokio::test]
async fn test_failure_domains_spread_replicas() {
    let cluster = Arc::new(LocalCluster::new(1024));
    cluster.add_node_with("m1", Role::Master, Some("zone-a"));
    cluster.add_node_with("m2", Role::Master, Some("zone-b"));
    cluster.add_node_with("r1", Role::Replica, Some("zone-a"));
    cluster.add_node_with("r2", Role::Replica, Some("zone-b"));

    let result = controller(&cluster, config(1024, 2, 1)).run().await;
    assert_eq!(result.state, RunState::Succeeded);

    let topology = result.topology.unwrap();
    assert_eq!(topology.master_of(&"r1".into()), Some(&NodeId::from("m2")));
    assert_eq!(topology.master_of(&"r2".into()), Some(&NodeId::from("m1")));
}

#[tokio::test]
async fn test_more_masters_than_slots_fails() {
    let cluster = cluster(2, &["a", "b", "c"]);
    let result = controller(&cluster, config(2, 1, 0)).run().await;

    assert_eq!(result.state, RunState::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.phase, RunState::Planning);
    assert!(failure.requires_remediation);
    assert_eq!(cluster.push_count(), 0);
}
