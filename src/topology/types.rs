//! Cluster data model: nodes, slots, replica links and the topology itself

use crate::common::hash;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Index into the fixed keyspace, `0..total_slots`
pub type Slot = u32;

/// Stable node identity (instance id or address).
///
/// Ordering is lexicographic; every deterministic choice in the planner
/// follows it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Role a node declares in the registry or reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Unassigned,
    Master,
    Replica,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Unassigned => write!(f, "unassigned"),
            Role::Master => write!(f, "master"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// Inclusive interval `[start, end]` of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: Slot,
    pub end: Slot,
}

#[allow(clippy::len_without_is_empty)]
impl SlotRange {
    pub fn new(start: Slot, end: Slot) -> Self {
        debug_assert!(start <= end, "inverted slot range {}-{}", start, end);
        Self { start, end }
    }

    pub fn single(slot: Slot) -> Self {
        Self::new(slot, slot)
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.start <= slot && slot <= self.end
    }

    pub fn slots(&self) -> std::ops::RangeInclusive<Slot> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Total number of slots covered by a set of ranges
pub fn ranges_len(ranges: &[SlotRange]) -> u32 {
    ranges.iter().map(SlotRange::len).sum()
}

/// Collapse ascending slots into the fewest ranges
pub fn compress(slots: impl IntoIterator<Item = Slot>) -> Vec<SlotRange> {
    let mut out: Vec<SlotRange> = Vec::new();
    for slot in slots {
        match out.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(slot) => last.end = slot,
            _ => out.push(SlotRange::single(slot)),
        }
    }
    out
}

/// `(master, replica)` pairing
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaLink {
    pub master: NodeId,
    pub replica: NodeId,
}

impl ReplicaLink {
    pub fn new(master: impl Into<NodeId>, replica: impl Into<NodeId>) -> Self {
        Self {
            master: master.into(),
            replica: replica.into(),
        }
    }
}

/// Slot ownership by master
pub type Assignment = BTreeMap<NodeId, Vec<SlotRange>>;

/// Epoch-stamped cluster layout pushed to every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub epoch: u64,
    pub total_slots: u32,
    pub slots: Assignment,
    /// Sorted by replica id
    pub replicas: Vec<ReplicaLink>,
    /// Client-facing address of every member
    pub members: BTreeMap<NodeId, String>,
}

/// Everything in a topology except its epoch
#[derive(Serialize)]
struct Content<'a> {
    total_slots: u32,
    slots: &'a Assignment,
    replicas: &'a [ReplicaLink],
    members: &'a BTreeMap<NodeId, String>,
}

impl Topology {
    /// Digest of the assignment, independent of the epoch.
    pub fn fingerprint(&self) -> Result<String> {
        hash::fingerprint(&Content {
            total_slots: self.total_slots,
            slots: &self.slots,
            replicas: &self.replicas,
            members: &self.members,
        })
    }

    pub fn masters(&self) -> impl Iterator<Item = &NodeId> {
        self.slots.keys()
    }

    pub fn is_master(&self, id: &NodeId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn master_of(&self, replica: &NodeId) -> Option<&NodeId> {
        self.replicas
            .iter()
            .find(|l| &l.replica == replica)
            .map(|l| &l.master)
    }

    pub fn replicas_of(&self, master: &NodeId) -> Vec<&NodeId> {
        self.replicas
            .iter()
            .filter(|l| &l.master == master)
            .map(|l| &l.replica)
            .collect()
    }

    pub fn role_of(&self, id: &NodeId) -> Role {
        if self.is_master(id) {
            Role::Master
        } else if self.master_of(id).is_some() {
            Role::Replica
        } else {
            Role::Unassigned
        }
    }

    pub fn slot_count(&self, master: &NodeId) -> u32 {
        self.slots.get(master).map(|r| ranges_len(r)).unwrap_or(0)
    }

    pub fn owner_of(&self, slot: Slot) -> Option<&NodeId> {
        self.slots
            .iter()
            .find(|(_, ranges)| ranges.iter().any(|r| r.contains(slot)))
            .map(|(id, _)| id)
    }

    /// Masters and replicas, in id order
    pub fn node_ids(&self) -> BTreeSet<&NodeId> {
        self.slots
            .keys()
            .chain(self.replicas.iter().map(|l| &l.replica))
            .collect()
    }

    pub fn peers_of(&self, id: &NodeId) -> Vec<NodeId> {
        self.node_ids()
            .into_iter()
            .filter(|n| *n != id)
            .cloned()
            .collect()
    }

    /// Check the structural invariants: every slot owned exactly once, every
    /// master non-empty, replicas disjoint from masters and linked once.
    pub fn validate(&self) -> Result<()> {
        let malformed = |msg: String| Err(Error::MalformedTopology(msg));

        if self.total_slots == 0 {
            return malformed("total_slots is zero".into());
        }
        if self.slots.is_empty() {
            return malformed("no masters".into());
        }

        let mut all: Vec<(SlotRange, &NodeId)> = Vec::new();
        for (master, ranges) in &self.slots {
            if ranges.is_empty() {
                return malformed(format!("master {} owns no slots", master));
            }
            for r in ranges {
                if r.start > r.end || r.end >= self.total_slots {
                    return malformed(format!("master {} has invalid range {}", master, r));
                }
                all.push((*r, master));
            }
        }
        all.sort();

        let mut next: Slot = 0;
        for (r, master) in &all {
            if r.start < next {
                return malformed(format!("range {} of {} overlaps", r, master));
            }
            if r.start > next {
                return malformed(format!("slots {}-{} unassigned", next, r.start - 1));
            }
            next = r.end + 1;
        }
        if next != self.total_slots {
            return malformed(format!(
                "slots {}-{} unassigned",
                next,
                self.total_slots - 1
            ));
        }

        let mut seen = BTreeSet::new();
        for link in &self.replicas {
            if !self.slots.contains_key(&link.master) {
                return malformed(format!(
                    "replica {} follows unknown master {}",
                    link.replica, link.master
                ));
            }
            if self.slots.contains_key(&link.replica) {
                return malformed(format!("{} is both master and replica", link.replica));
            }
            if !seen.insert(&link.replica) {
                return malformed(format!("replica {} linked twice", link.replica));
            }
        }

        for id in self.node_ids() {
            if !self.members.contains_key(id) {
                return malformed(format!("{} missing from members", id));
            }
        }

        Ok(())
    }
}

/// Where a node stands with respect to the orchestrator's probes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable(String),
}

/// Self-reported health of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Ok,
    Loading,
    Failing,
}

/// What a node says about itself over the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: NodeId,
    pub role: Role,
    /// Epoch of the applied topology, 0 if none
    pub epoch: u64,
    #[serde(default)]
    pub peers: Vec<NodeId>,
    #[serde(default)]
    pub health: Health,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<Topology>,
}

impl NodeState {
    /// State of a freshly started node that has never joined a cluster
    pub fn empty(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Unassigned,
            epoch: 0,
            peers: Vec::new(),
            health: Health::Ok,
            fingerprint: None,
            topology: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.epoch == 0 && self.topology.is_none()
    }

    /// Has this node applied exactly this topology?
    pub fn matches(&self, epoch: u64, fingerprint: &str) -> bool {
        self.epoch == epoch && self.fingerprint.as_deref() == Some(fingerprint)
    }

    /// Does the topology this node holds take precedence over the given one?
    pub fn outranks(&self, epoch: u64, fingerprint: &str) -> bool {
        precedes((epoch, Some(fingerprint)), (self.epoch, self.fingerprint.as_deref()))
    }
}

/// Order in which nodes accept topologies: by epoch, then by fingerprint.
///
/// Two runs stamping the same epoch on different topologies are ordered the
/// same way on every node, so the higher fingerprint wins everywhere.
pub fn precedes(lower: (u64, Option<&str>), higher: (u64, Option<&str>)) -> bool {
    lower < higher
}

/// A cluster member as seen by the orchestrator during one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Control-plane base URL (or any address the control plane understands)
    pub address: String,
    pub declared_role: Role,
    #[serde(default)]
    pub reachability: Reachability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
    /// Last successful probe result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<NodeState>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>, declared_role: Role) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            declared_role,
            reachability: Reachability::Unknown,
            last_probed_at: None,
            failure_domain: None,
            reported: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.failure_domain = Some(domain.into());
        self
    }

    pub fn is_reachable(&self) -> bool {
        self.reachability == Reachability::Reachable
    }

    /// Epoch this node last reported, 0 if never probed successfully
    pub fn reported_epoch(&self) -> u64 {
        self.reported.as_ref().map(|s| s.epoch).unwrap_or(0)
    }

    /// False once the node reported itself loading or failing
    pub fn is_healthy(&self) -> bool {
        self.reported
            .as_ref()
            .map(|s| s.health == Health::Ok)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo(slots: Vec<(&str, Vec<SlotRange>)>, replicas: Vec<ReplicaLink>) -> Topology {
        let mut members = BTreeMap::new();
        for (id, _) in &slots {
            members.insert(NodeId::from(*id), format!("http://{}", id));
        }
        for l in &replicas {
            members.insert(l.replica.clone(), format!("http://{}", l.replica));
        }
        Topology {
            epoch: 1,
            total_slots: 16,
            slots: slots
                .into_iter()
                .map(|(id, r)| (NodeId::from(id), r))
                .collect(),
            replicas,
            members,
        }
    }

    #[test]
    fn test_compress() {
        let ranges = compress([0, 1, 2, 5, 6, 9]);
        assert_eq!(
            ranges,
            vec![
                SlotRange::new(0, 2),
                SlotRange::new(5, 6),
                SlotRange::single(9)
            ]
        );
        assert_eq!(ranges_len(&ranges), 6);
        assert!(compress(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_validate_ok() {
        let t = topo(
            vec![
                ("a", vec![SlotRange::new(0, 7)]),
                ("b", vec![SlotRange::new(8, 9), SlotRange::new(10, 15)]),
            ],
            vec![ReplicaLink::new("a", "c")],
        );
        t.validate().unwrap();
        assert_eq!(t.role_of(&"c".into()), Role::Replica);
        assert_eq!(t.owner_of(12), Some(&NodeId::from("b")));
        assert_eq!(t.peers_of(&"a".into()).len(), 2);
    }

    #[test]
    fn test_validate_gap_and_overlap() {
        let gap = topo(
            vec![
                ("a", vec![SlotRange::new(0, 6)]),
                ("b", vec![SlotRange::new(8, 15)]),
            ],
            vec![],
        );
        assert!(matches!(gap.validate(), Err(Error::MalformedTopology(m)) if m.contains("7-7")));

        let overlap = topo(
            vec![
                ("a", vec![SlotRange::new(0, 8)]),
                ("b", vec![SlotRange::new(8, 15)]),
            ],
            vec![],
        );
        assert!(overlap.validate().is_err());

        let short = topo(vec![("a", vec![SlotRange::new(0, 14)])], vec![]);
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_validate_replica_rules() {
        let both = topo(
            vec![
                ("a", vec![SlotRange::new(0, 7)]),
                ("b", vec![SlotRange::new(8, 15)]),
            ],
            vec![ReplicaLink::new("a", "b")],
        );
        assert!(both.validate().is_err());

        let twice = topo(
            vec![
                ("a", vec![SlotRange::new(0, 7)]),
                ("b", vec![SlotRange::new(8, 15)]),
            ],
            vec![ReplicaLink::new("a", "c"), ReplicaLink::new("b", "c")],
        );
        assert!(twice.validate().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_epoch() {
        let mut a = topo(vec![("a", vec![SlotRange::new(0, 15)])], vec![]);
        let fp = a.fingerprint().unwrap();
        a.epoch = 42;
        assert_eq!(a.fingerprint().unwrap(), fp);
        a.slots.insert("b".into(), vec![]);
        assert_ne!(a.fingerprint().unwrap(), fp);
    }

    #[test]
    fn test_precedence_by_epoch_then_fingerprint() {
        assert!(precedes((1, Some("ff")), (2, Some("00"))));
        assert!(precedes((2, Some("0a")), (2, Some("0b"))));
        assert!(precedes((0, None), (0, Some("00"))));
        assert!(!precedes((2, Some("0b")), (2, Some("0b"))));

        let mut state = NodeState::empty("a".into());
        state.epoch = 3;
        state.fingerprint = Some("0b".into());
        assert!(state.outranks(3, "0a"));
        assert!(!state.outranks(3, "0c"));
        assert!(!state.outranks(3, "0b"));
        assert!(!state.outranks(4, "00"));
    }

    #[test]
    fn test_node_state_wire_format() {
        let json = r#"{"id":"n1","role":"master","epoch":3}"#;
        let state: NodeState = serde_json::from_str(json).unwrap();
        assert_eq!(state.role, Role::Master);
        assert_eq!(state.health, Health::Ok);
        assert!(state.peers.is_empty());
        assert!(!state.is_empty());
    }
}
