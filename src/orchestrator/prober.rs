//! Node prober
//!
//! Reads every candidate's self-reported state in parallel. A failed or slow
//! probe marks the node unreachable; it never fails the run.

use crate::common::utils::timestamp_now;
use crate::orchestrator::control::ControlPlane;
use crate::topology::{Node, NodeState, Reachability};
use crate::{Error, Result};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Prober {
    control: Arc<dyn ControlPlane>,
    probe_timeout: Duration,
    max_concurrency: usize,
}

impl Prober {
    pub fn new(control: Arc<dyn ControlPlane>, probe_timeout: Duration, max_concurrency: usize) -> Self {
        Self {
            control,
            probe_timeout,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Read one node's state within `timeout`.
    pub async fn probe(&self, node: &Node, timeout: Duration) -> Result<NodeState> {
        let unreachable = |reason: String| Error::NodeUnreachable {
            node: node.id.to_string(),
            reason,
        };

        match tokio::time::timeout(timeout, self.control.get_state(node)).await {
            Ok(Ok(state)) if state.id != node.id => Err(unreachable(format!(
                "identity mismatch: {} answered",
                state.id
            ))),
            Ok(Ok(state)) => Ok(state),
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!("probe timed out after {:?}", timeout))),
        }
    }

    /// Probe every node, at most `max_concurrency` at a time, and return them
    /// (sorted by id) with reachability and reported state filled in.
    ///
    /// No probe outlives `deadline`; once it has passed the remaining nodes
    /// are marked unreachable without being contacted.
    pub async fn probe_all(&self, nodes: Vec<Node>, deadline: Instant) -> Vec<Node> {
        let mut probed: Vec<Node> = stream::iter(nodes)
            .map(|node| self.probe_into(node, deadline))
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        probed.sort_by(|a, b| a.id.cmp(&b.id));

        let reachable = probed.iter().filter(|n| n.is_reachable()).count();
        tracing::info!(
            reachable,
            unreachable = probed.len() - reachable,
            "Probing complete"
        );
        probed
    }

    async fn probe_into(&self, mut node: Node, deadline: Instant) -> Node {
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .min(self.probe_timeout);

        let result = if budget.is_zero() {
            Err(Error::NodeUnreachable {
                node: node.id.to_string(),
                reason: "run deadline passed before probe".into(),
            })
        } else {
            self.probe(&node, budget).await
        };

        node.last_probed_at = Some(timestamp_now());
        match result {
            Ok(state) => {
                tracing::debug!(node = %node.id, epoch = state.epoch, role = %state.role, "Probed");
                node.reachability = Reachability::Reachable;
                node.reported = Some(state);
            }
            Err(e) => {
                let reason = match e {
                    Error::NodeUnreachable { reason, .. } => reason,
                    other => other.to_string(),
                };
                tracing::warn!(node = %node.id, "Probe failed: {}", reason);
                node.reachability = Reachability::Unreachable(reason);
                node.reported = None;
            }
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LocalCluster;
    use crate::orchestrator::discovery::{DiscoveryClient, Registry};
    use crate::topology::Role;

    async fn nodes_of(cluster: &LocalCluster) -> Vec<Node> {
        let registry: Arc<dyn Registry> = Arc::new(cluster.registry());
        DiscoveryClient::new(registry).discover().await.unwrap()
    }

    #[tokio::test]
    async fn test_probe_all_marks_reachability() {
        let cluster = Arc::new(LocalCluster::new(64));
        for id in ["a", "b", "c"] {
            cluster.add_node(id);
        }
        cluster.set_down("b", true);

        let prober = Prober::new(cluster.clone(), Duration::from_secs(1), 2);
        let nodes = nodes_of(&cluster).await;
        let probed = prober
            .probe_all(nodes, Instant::now() + Duration::from_secs(5))
            .await;

        assert_eq!(probed.len(), 3);
        assert!(probed[0].is_reachable());
        assert!(matches!(probed[1].reachability, Reachability::Unreachable(_)));
        assert!(probed[1].reported.is_none());
        assert!(probed[2].is_reachable());
        assert!(probed.iter().all(|n| n.last_probed_at.is_some()));
        assert_eq!(probed[0].reported.as_ref().unwrap().role, Role::Unassigned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_times_out() {
        let cluster = Arc::new(LocalCluster::new(64));
        cluster.add_node("a");
        cluster.add_node("slow");
        cluster.set_probe_delay("slow", Duration::from_secs(10));

        let prober = Prober::new(cluster.clone(), Duration::from_millis(500), 4);
        let probed = prober
            .probe_all(nodes_of(&cluster).await, Instant::now() + Duration::from_secs(60))
            .await;

        assert!(probed[0].is_reachable());
        match &probed[1].reachability {
            Reachability::Unreachable(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_probes() {
        let cluster = Arc::new(LocalCluster::new(64));
        cluster.add_node("a");
        let prober = Prober::new(cluster.clone(), Duration::from_secs(1), 4);
        let probed = prober
            .probe_all(nodes_of(&cluster).await, Instant::now())
            .await;
        assert!(!probed[0].is_reachable());
        assert_eq!(cluster.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_identity_mismatch_is_unreachable() {
        let cluster = Arc::new(LocalCluster::new(64));
        cluster.add_node("a");
        let prober = Prober::new(cluster.clone(), Duration::from_secs(1), 1);

        // registry claims a different id for the same agent
        let mut node = nodes_of(&cluster).await.remove(0);
        node.id = "impostor".into();
        let err = prober.probe(&node, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::NodeUnreachable { .. }));
    }
}
