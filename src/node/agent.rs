//! Node agent: the control-plane state a data node keeps about its cluster
//!
//! Holds the applied topology and enforces the epoch rule on every push: a
//! lower epoch is refused, and at the same epoch the higher fingerprint wins.

use crate::common::hash;
use crate::orchestrator::control::{ApplyOutcome, RejectReason};
use crate::topology::{precedes, Health, NodeId, NodeState, Role, Topology};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Applied {
    topology: Option<Topology>,
    fingerprint: Option<String>,
    health: Health,
}

impl Applied {
    fn epoch(&self) -> u64 {
        self.topology.as_ref().map(|t| t.epoch).unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct NodeAgent {
    id: NodeId,
    total_slots: u32,
    applied: RwLock<Applied>,
}

impl NodeAgent {
    pub fn new(id: impl Into<NodeId>, total_slots: u32) -> Self {
        Self {
            id: id.into(),
            total_slots,
            applied: RwLock::new(Applied::default()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    // a panicked writer leaves the last fully applied state behind
    fn read(&self) -> RwLockReadGuard<'_, Applied> {
        self.applied.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Applied> {
        self.applied.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn epoch(&self) -> u64 {
        self.read().epoch()
    }

    pub fn set_health(&self, health: Health) {
        self.write().health = health;
    }

    pub fn state(&self) -> NodeState {
        let applied = self.read();
        match &applied.topology {
            None => NodeState {
                health: applied.health,
                ..NodeState::empty(self.id.clone())
            },
            Some(t) => NodeState {
                id: self.id.clone(),
                role: t.role_of(&self.id),
                epoch: t.epoch,
                peers: t.peers_of(&self.id),
                health: applied.health,
                fingerprint: applied.fingerprint.clone(),
                topology: Some(t.clone()),
            },
        }
    }

    /// Apply a pushed topology if its epoch allows it.
    pub fn apply(&self, topology: Topology) -> ApplyOutcome {
        let malformed = |detail: String| {
            tracing::warn!(node = %self.id, "Refusing malformed topology: {}", detail);
            ApplyOutcome::Rejected(RejectReason::MalformedTopology(detail))
        };

        if topology.total_slots != self.total_slots {
            return malformed(format!(
                "slot space {} does not match local {}",
                topology.total_slots, self.total_slots
            ));
        }
        if let Err(e) = topology.validate() {
            return malformed(e.to_string());
        }
        if topology.role_of(&self.id) == Role::Unassigned {
            return malformed(format!("{} is not a member", self.id));
        }
        let fingerprint = match topology.fingerprint() {
            Ok(fp) => fp,
            Err(e) => return malformed(e.to_string()),
        };

        let mut applied = self.write();
        let current = applied.epoch();
        let offered = (topology.epoch, Some(fingerprint.as_str()));
        let held = (current, applied.fingerprint.as_deref());

        if offered == held {
            tracing::debug!(node = %self.id, epoch = current, "Topology already applied");
            return ApplyOutcome::Ack;
        }
        if !precedes(held, offered) {
            tracing::warn!(
                node = %self.id,
                offered = topology.epoch,
                current,
                "Rejecting stale topology"
            );
            return ApplyOutcome::Rejected(RejectReason::StaleEpoch {
                current_epoch: current,
            });
        }

        tracing::info!(
            node = %self.id,
            epoch = topology.epoch,
            role = %topology.role_of(&self.id),
            fingerprint = hash::short(&fingerprint),
            "Applied topology"
        );
        applied.topology = Some(topology);
        applied.fingerprint = Some(fingerprint);
        ApplyOutcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{partition_fresh, NodeId, ReplicaLink};
    use std::collections::BTreeMap;

    fn topology(epoch: u64, masters: &[&str], links: &[(&str, &str)]) -> Topology {
        let ids: Vec<NodeId> = masters.iter().map(|m| NodeId::from(*m)).collect();
        let mut members = BTreeMap::new();
        for id in masters.iter().chain(links.iter().map(|(_, r)| r)) {
            members.insert(NodeId::from(*id), format!("local://{}", id));
        }
        Topology {
            epoch,
            total_slots: 32,
            slots: partition_fresh(&ids, 32).unwrap(),
            replicas: links.iter().map(|(m, r)| ReplicaLink::new(*m, *r)).collect(),
            members,
        }
    }

    #[test]
    fn test_fresh_state() {
        let agent = NodeAgent::new("a", 32);
        let state = agent.state();
        assert!(state.is_empty());
        assert_eq!(state.role, Role::Unassigned);
        assert!(state.fingerprint.is_none());
    }

    #[test]
    fn test_apply_sets_role_and_peers() {
        let agent = NodeAgent::new("r", 32);
        let t = topology(1, &["a", "b"], &[("a", "r")]);
        assert_eq!(agent.apply(t.clone()), ApplyOutcome::Ack);

        let state = agent.state();
        assert_eq!(state.epoch, 1);
        assert_eq!(state.role, Role::Replica);
        assert_eq!(state.peers, vec![NodeId::from("a"), NodeId::from("b")]);
        assert_eq!(state.fingerprint, Some(t.fingerprint().unwrap()));
    }

    #[test]
    fn test_same_epoch_same_content_is_idempotent() {
        let agent = NodeAgent::new("a", 32);
        let t = topology(3, &["a", "b"], &[]);
        assert_eq!(agent.apply(t.clone()), ApplyOutcome::Ack);
        assert_eq!(agent.apply(t), ApplyOutcome::Ack);
        assert_eq!(agent.epoch(), 3);
    }

    #[test]
    fn test_lower_epoch_rejected() {
        let agent = NodeAgent::new("a", 32);
        assert_eq!(agent.apply(topology(5, &["a", "b"], &[])), ApplyOutcome::Ack);

        let stale = ApplyOutcome::Rejected(RejectReason::StaleEpoch { current_epoch: 5 });
        assert_eq!(agent.apply(topology(4, &["a", "b"], &[])), stale);
        assert_eq!(agent.apply(topology(4, &["a", "c"], &[])), stale);
        assert_eq!(agent.epoch(), 5);

        assert_eq!(agent.apply(topology(6, &["a", "c"], &[])), ApplyOutcome::Ack);
        assert_eq!(agent.state().peers, vec![NodeId::from("c")]);
    }

    #[test]
    fn test_same_epoch_higher_fingerprint_wins() {
        let mut both = vec![topology(5, &["a", "b"], &[]), topology(5, &["a", "c"], &[])];
        both.sort_by_key(|t| t.fingerprint().unwrap());
        let high = both.pop().unwrap();
        let low = both.pop().unwrap();

        // low first: replaced by high
        let agent = NodeAgent::new("a", 32);
        assert_eq!(agent.apply(low.clone()), ApplyOutcome::Ack);
        assert_eq!(agent.apply(high.clone()), ApplyOutcome::Ack);
        assert_eq!(agent.state().fingerprint, Some(high.fingerprint().unwrap()));

        // high first: low is refused
        let agent = NodeAgent::new("a", 32);
        assert_eq!(agent.apply(high.clone()), ApplyOutcome::Ack);
        assert_eq!(
            agent.apply(low),
            ApplyOutcome::Rejected(RejectReason::StaleEpoch { current_epoch: 5 })
        );
        assert_eq!(agent.state().fingerprint, Some(high.fingerprint().unwrap()));
    }

    #[test]
    fn test_malformed_rejected() {
        let agent = NodeAgent::new("a", 32);

        let mut gap = topology(1, &["a", "b"], &[]);
        gap.slots.insert("b".into(), vec![]);
        assert!(matches!(
            agent.apply(gap),
            ApplyOutcome::Rejected(RejectReason::MalformedTopology(_))
        ));

        let other_space = Topology {
            total_slots: 64,
            ..topology(1, &["a"], &[])
        };
        assert!(matches!(
            agent.apply(other_space),
            ApplyOutcome::Rejected(RejectReason::MalformedTopology(_))
        ));

        let not_member = topology(1, &["b"], &[]);
        assert!(matches!(
            agent.apply(not_member),
            ApplyOutcome::Rejected(RejectReason::MalformedTopology(d)) if d.contains("not a member")
        ));
        assert_eq!(agent.epoch(), 0);
    }

    #[test]
    fn test_health_reported() {
        let agent = NodeAgent::new("a", 32);
        agent.set_health(Health::Loading);
        assert_eq!(agent.state().health, Health::Loading);
    }
}
