//! Role selection: which reachable nodes become masters, replicas, or stay idle

use crate::topology::types::{Node, Role, Topology};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What to do with replica candidates beyond `replicas_per_master × masters`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExcessReplicaPolicy {
    /// Leave them unassigned; they are reported idle
    #[default]
    LeaveUnassigned,
    /// Assign every candidate, exceeding the per-master target
    Spread,
}

#[derive(Debug, Clone, Default)]
pub struct RoleSelection {
    pub masters: Vec<Node>,
    pub replicas: Vec<Node>,
    pub idle: Vec<Node>,
}

impl RoleSelection {
    pub fn total(&self) -> usize {
        self.masters.len() + self.replicas.len() + self.idle.len()
    }
}

/// Role a node currently plays: its place in the prior topology if it has
/// one, otherwise what it declared in the registry.
pub fn effective_role(node: &Node, prior: Option<&Topology>) -> Role {
    match prior.map(|t| t.role_of(&node.id)) {
        Some(Role::Unassigned) | None => node.declared_role,
        Some(role) => role,
    }
}

/// Split `nodes` (all reachable) into masters, replicas and idle nodes.
///
/// Masters are the prior topology's surviving masters plus nodes declared
/// `master`. On a fresh bootstrap further nodes are promoted until there are
/// `max(min_masters, nodes / (replicas_per_master + 1))` masters; on an
/// existing cluster only until `min_masters`. Unassigned nodes are promoted
/// before replicas, each group in id order. Nodes reporting `loading` or
/// `failing` are never promoted; they may still be placed as replicas.
pub fn select_roles(
    nodes: &[Node],
    prior: Option<&Topology>,
    min_masters: usize,
    replicas_per_master: usize,
    policy: ExcessReplicaPolicy,
) -> RoleSelection {
    let mut sorted: Vec<&Node> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted.dedup_by(|a, b| a.id == b.id);

    let fresh = prior.map(|t| t.slots.is_empty()).unwrap_or(true);
    let (mut masters, mut pool): (Vec<&Node>, Vec<&Node>) = sorted
        .into_iter()
        .partition(|n| effective_role(n, prior) == Role::Master);

    let wanted = if fresh {
        min_masters.max((masters.len() + pool.len()) / (replicas_per_master + 1))
    } else {
        min_masters
    };

    // healthy unassigned first, replicas last, unhealthy never
    pool.sort_by_key(|n| {
        (
            !n.is_healthy(),
            effective_role(n, prior) == Role::Replica,
            n.id.clone(),
        )
    });
    let eligible = pool.iter().take_while(|n| n.is_healthy()).count();
    let promote = wanted.saturating_sub(masters.len()).min(eligible);
    masters.extend(pool.drain(..promote));
    masters.sort_by(|a, b| a.id.cmp(&b.id));

    let master_ids: BTreeSet<_> = masters.iter().map(|n| &n.id).collect();
    let follows_survivor = |n: &Node| {
        prior
            .and_then(|t| t.master_of(&n.id))
            .map(|m| master_ids.contains(m))
            .unwrap_or(false)
    };
    pool.sort_by_key(|n| {
        (
            !follows_survivor(*n),
            effective_role(n, prior) != Role::Replica,
            n.id.clone(),
        )
    });

    let capacity = match policy {
        ExcessReplicaPolicy::LeaveUnassigned => replicas_per_master * masters.len(),
        ExcessReplicaPolicy::Spread => usize::MAX,
    };
    let take = capacity.min(pool.len());
    let mut replicas: Vec<Node> = pool.drain(..take).cloned().collect();
    replicas.sort_by(|a, b| a.id.cmp(&b.id));

    let mut idle: Vec<Node> = pool.into_iter().cloned().collect();
    idle.sort_by(|a, b| a.id.cmp(&b.id));

    RoleSelection {
        masters: masters.into_iter().cloned().collect(),
        replicas,
        idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::partitioner::partition_fresh;
    use crate::topology::types::{Health, NodeId, NodeState, ReplicaLink};
    use std::collections::BTreeMap;

    fn node(id: &str, role: Role) -> Node {
        Node::new(id, format!("http://{}", id), role)
    }

    fn reporting(id: &str, health: Health) -> Node {
        let mut n = node(id, Role::Unassigned);
        n.reported = Some(NodeState {
            health,
            ..NodeState::empty(NodeId::from(id))
        });
        n
    }

    fn ids(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    fn prior(masters: &[&str], links: &[(&str, &str)]) -> Topology {
        let master_ids: Vec<NodeId> = masters.iter().map(|m| NodeId::from(*m)).collect();
        let mut members = BTreeMap::new();
        for id in masters.iter().chain(links.iter().map(|(_, r)| r)) {
            members.insert(NodeId::from(*id), format!("http://{}", id));
        }
        Topology {
            epoch: 3,
            total_slots: 64,
            slots: partition_fresh(&master_ids, 64).unwrap(),
            replicas: links.iter().map(|(m, r)| ReplicaLink::new(*m, *r)).collect(),
            members,
        }
    }

    #[test]
    fn test_fresh_all_masters() {
        let nodes = vec![
            node("n3", Role::Unassigned),
            node("n1", Role::Unassigned),
            node("n2", Role::Unassigned),
        ];
        let sel = select_roles(&nodes, None, 3, 0, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.masters), vec!["n1", "n2", "n3"]);
        assert!(sel.replicas.is_empty());
        assert!(sel.idle.is_empty());
    }

    #[test]
    fn test_fresh_with_replicas() {
        let nodes: Vec<Node> = (1..=6)
            .map(|i| node(&format!("n{}", i), Role::Unassigned))
            .collect();
        let sel = select_roles(&nodes, None, 1, 1, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.masters), vec!["n1", "n2", "n3"]);
        assert_eq!(ids(&sel.replicas), vec!["n4", "n5", "n6"]);
    }

    #[test]
    fn test_declared_replicas_promoted_last() {
        let nodes = vec![
            node("a", Role::Replica),
            node("b", Role::Replica),
            node("c", Role::Unassigned),
        ];
        let sel = select_roles(&nodes, None, 2, 1, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.masters), vec!["a", "c"]);
        assert_eq!(ids(&sel.replicas), vec!["b"]);
    }

    #[test]
    fn test_existing_cluster_keeps_masters() {
        let p = prior(&["a", "b", "c"], &[]);
        let nodes = vec![
            node("a", Role::Unassigned),
            node("b", Role::Unassigned),
            node("x", Role::Unassigned),
        ];
        let sel = select_roles(&nodes, Some(&p), 1, 0, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.masters), vec!["a", "b"]);
        assert_eq!(ids(&sel.idle), vec!["x"]);
    }

    #[test]
    fn test_declared_master_joins_existing_cluster() {
        let p = prior(&["a", "b", "c"], &[]);
        let nodes = vec![
            node("a", Role::Unassigned),
            node("b", Role::Unassigned),
            node("c", Role::Unassigned),
            node("d", Role::Master),
        ];
        let sel = select_roles(&nodes, Some(&p), 1, 0, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.masters), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_existing_replicas_kept_before_newcomers() {
        let p = prior(&["a", "b"], &[("a", "r1"), ("b", "r2")]);
        let nodes = vec![
            node("a", Role::Unassigned),
            node("b", Role::Unassigned),
            node("r0", Role::Unassigned),
            node("r1", Role::Unassigned),
            node("r2", Role::Unassigned),
        ];
        let sel = select_roles(&nodes, Some(&p), 1, 1, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.replicas), vec!["r1", "r2"]);
        assert_eq!(ids(&sel.idle), vec!["r0"]);

        let sel = select_roles(&nodes, Some(&p), 1, 1, ExcessReplicaPolicy::Spread);
        assert_eq!(ids(&sel.replicas), vec!["r0", "r1", "r2"]);
        assert!(sel.idle.is_empty());
    }

    #[test]
    fn test_promotes_below_min_masters() {
        let p = prior(&["a", "b"], &[("b", "r1")]);
        let nodes = vec![node("a", Role::Unassigned), node("r1", Role::Unassigned)];
        let sel = select_roles(&nodes, Some(&p), 2, 0, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.masters), vec!["a", "r1"]);
        assert_eq!(sel.total(), 2);
    }

    #[test]
    fn test_unhealthy_nodes_not_promoted() {
        let nodes = vec![
            reporting("a", Health::Failing),
            reporting("b", Health::Ok),
            reporting("c", Health::Loading),
            reporting("d", Health::Ok),
            node("e", Role::Replica),
        ];
        let sel = select_roles(&nodes, None, 3, 1, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.masters), vec!["b", "d", "e"]);
        assert_eq!(ids(&sel.replicas), vec!["a", "c"]);
    }

    #[test]
    fn test_only_unhealthy_left_stays_below_target() {
        let p = prior(&["a", "b"], &[]);
        let nodes = vec![node("a", Role::Unassigned), reporting("x", Health::Failing)];
        let sel = select_roles(&nodes, Some(&p), 2, 0, ExcessReplicaPolicy::LeaveUnassigned);
        assert_eq!(ids(&sel.masters), vec!["a"]);
        assert_eq!(ids(&sel.idle), vec!["x"]);
    }
}
