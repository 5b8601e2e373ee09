//! In-process cluster of node agents
//!
//! Implements [`ControlPlane`] directly on top of [`NodeAgent`]s, with fault
//! injection. Used by `slotctl simulate` and the test suites. Nodes are
//! addressed as `local://<id>`.

use crate::node::agent::NodeAgent;
use crate::orchestrator::control::{ApplyOutcome, ControlPlane};
use crate::orchestrator::discovery::{Candidate, StaticRegistry};
use crate::topology::{Node, NodeId, NodeState, Role, Topology};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SCHEME: &str = "local://";

#[derive(Debug, Clone, Default)]
struct Fault {
    down: bool,
    probe_delay: Option<Duration>,
    push_delay: Option<Duration>,
    failing_pushes: u32,
}

struct Member {
    agent: Arc<NodeAgent>,
    declared_role: Role,
    failure_domain: Option<String>,
    fault: Fault,
}

pub struct LocalCluster {
    total_slots: u32,
    members: Mutex<BTreeMap<NodeId, Member>>,
    pushes: AtomicUsize,
    probes: AtomicUsize,
}

impl LocalCluster {
    pub fn new(total_slots: u32) -> Self {
        Self {
            total_slots,
            members: Mutex::new(BTreeMap::new()),
            pushes: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn total_slots(&self) -> u32 {
        self.total_slots
    }

    fn members(&self) -> MutexGuard<'_, BTreeMap<NodeId, Member>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn address_of(id: &str) -> String {
        format!("{}{}", SCHEME, id)
    }

    /// Start a fresh node and list it in the registry
    pub fn add_node(&self, id: impl Into<NodeId>) -> Arc<NodeAgent> {
        self.add_node_with(id, Role::Unassigned, None)
    }

    pub fn add_node_with(
        &self,
        id: impl Into<NodeId>,
        declared_role: Role,
        failure_domain: Option<&str>,
    ) -> Arc<NodeAgent> {
        let id = id.into();
        let agent = Arc::new(NodeAgent::new(id.clone(), self.total_slots));
        self.members().insert(
            id,
            Member {
                agent: agent.clone(),
                declared_role,
                failure_domain: failure_domain.map(str::to_string),
                fault: Fault::default(),
            },
        );
        agent
    }

    /// Terminate a node: gone from the registry and the control plane
    pub fn remove_node(&self, id: &str) -> Option<Arc<NodeAgent>> {
        self.members().remove(&NodeId::from(id)).map(|m| m.agent)
    }

    pub fn agent(&self, id: &str) -> Option<Arc<NodeAgent>> {
        self.members()
            .get(&NodeId::from(id))
            .map(|m| m.agent.clone())
    }

    fn with_fault(&self, id: &str, f: impl FnOnce(&mut Fault)) {
        if let Some(member) = self.members().get_mut(&NodeId::from(id)) {
            f(&mut member.fault);
        }
    }

    /// Keep the node listed but refuse every control-plane call
    pub fn set_down(&self, id: &str, down: bool) {
        self.with_fault(id, |f| f.down = down);
    }

    /// Delay state responses; the state returned is the one at request time
    pub fn set_probe_delay(&self, id: &str, delay: Duration) {
        self.with_fault(id, |f| f.probe_delay = Some(delay));
    }

    pub fn set_push_delay(&self, id: &str, delay: Duration) {
        self.with_fault(id, |f| f.push_delay = Some(delay));
    }

    /// Fail the next `count` pushes to `id` with a connection error
    pub fn fail_pushes(&self, id: &str, count: u32) {
        self.with_fault(id, |f| f.failing_pushes = count);
    }

    /// Pushes that reached an agent
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// State reads that reached an agent
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.members()
            .iter()
            .map(|(id, m)| Candidate {
                id: id.clone(),
                address: Self::address_of(id.as_str()),
                declared_role: m.declared_role,
                failure_domain: m.failure_domain.clone(),
            })
            .collect()
    }

    /// Registry snapshot of the current members
    pub fn registry(&self) -> StaticRegistry {
        StaticRegistry::new(self.candidates())
    }

    fn resolve(&self, node: &Node) -> Result<(Arc<NodeAgent>, Fault)> {
        let unreachable = |reason: &str| {
            Error::ConnectionFailed(format!("{}: {}", node.address, reason))
        };
        let id = node
            .address
            .strip_prefix(SCHEME)
            .ok_or_else(|| unreachable("not a local address"))?;
        let members = self.members();
        let member = members
            .get(&NodeId::from(id))
            .ok_or_else(|| unreachable("no such node"))?;
        if member.fault.down {
            return Err(unreachable("connection refused"));
        }
        Ok((member.agent.clone(), member.fault.clone()))
    }

    fn take_push_failure(&self, id: &NodeId) -> bool {
        match self.members().get_mut(id) {
            Some(m) if m.fault.failing_pushes > 0 => {
                m.fault.failing_pushes -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ControlPlane for LocalCluster {
    async fn get_state(&self, node: &Node) -> Result<NodeState> {
        let (agent, fault) = self.resolve(node)?;
        self.probes.fetch_add(1, Ordering::SeqCst);
        // the answer is taken now and delivered after the delay
        let state = agent.state();
        if let Some(delay) = fault.probe_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(state)
    }

    async fn apply_topology(&self, node: &Node, topology: &Topology) -> Result<ApplyOutcome> {
        let (agent, fault) = self.resolve(node)?;
        if self.take_push_failure(agent.id()) {
            return Err(Error::ConnectionFailed(format!(
                "{}: injected failure",
                node.address
            )));
        }
        if let Some(delay) = fault.push_delay {
            tokio::time::sleep(delay).await;
        }
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(agent.apply(topology.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_by_address() {
        let cluster = LocalCluster::new(16);
        cluster.add_node("a");
        let node = Node::new("a", LocalCluster::address_of("a"), Role::Unassigned);
        assert_eq!(cluster.get_state(&node).await.unwrap().id, NodeId::from("a"));

        let stray = Node::new("a", "10.0.0.1:7000", Role::Unassigned);
        assert!(cluster.get_state(&stray).await.is_err());
    }

    #[tokio::test]
    async fn test_down_and_removed_nodes() {
        let cluster = LocalCluster::new(16);
        cluster.add_node("a");
        cluster.add_node_with("b", Role::Master, Some("zone-2"));
        let a = Node::new("a", LocalCluster::address_of("a"), Role::Unassigned);

        cluster.set_down("a", true);
        assert!(matches!(
            cluster.get_state(&a).await,
            Err(Error::ConnectionFailed(_))
        ));
        cluster.set_down("a", false);
        assert!(cluster.get_state(&a).await.is_ok());

        cluster.remove_node("a");
        assert!(cluster.get_state(&a).await.is_err());
        let candidates = cluster.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].declared_role, Role::Master);
        assert_eq!(candidates[0].failure_domain.as_deref(), Some("zone-2"));
    }
}
