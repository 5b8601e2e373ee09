//! Replica assignment
//!
//! Replicas are spread so that per-master counts differ by at most one.
//! Existing links survive as long as they fit inside that balance; the rest
//! go, in id order, to the master with the fewest replicas. Among equally
//! loaded masters a master in another failure domain wins, then id order.

use crate::topology::types::{Node, NodeId, ReplicaLink};
use std::collections::{BTreeMap, BTreeSet};

/// Assign replicas with no history
pub fn assign_replicas(masters: &[Node], replicas: &[Node]) -> Vec<ReplicaLink> {
    assign_replicas_with_prior(masters, replicas, &[])
}

/// Assign replicas, keeping `prior` links where balance allows.
///
/// A node present in both lists is treated as a master only. The result is
/// sorted by replica id.
pub fn assign_replicas_with_prior(
    masters: &[Node],
    replicas: &[Node],
    prior: &[ReplicaLink],
) -> Vec<ReplicaLink> {
    let mut masters: Vec<&Node> = masters.iter().collect();
    masters.sort_by(|a, b| a.id.cmp(&b.id));
    masters.dedup_by(|a, b| a.id == b.id);
    if masters.is_empty() {
        return Vec::new();
    }

    let master_ids: BTreeSet<&NodeId> = masters.iter().map(|m| &m.id).collect();
    let mut pending: Vec<&Node> = replicas
        .iter()
        .filter(|r| !master_ids.contains(&r.id))
        .collect();
    pending.sort_by(|a, b| a.id.cmp(&b.id));
    pending.dedup_by(|a, b| a.id == b.id);

    let index: BTreeMap<&NodeId, usize> = masters
        .iter()
        .enumerate()
        .map(|(i, m)| (&m.id, i))
        .collect();
    let mut previous: BTreeMap<&NodeId, usize> = BTreeMap::new();
    for link in prior {
        if let Some(idx) = index.get(&link.master) {
            previous.entry(&link.replica).or_insert(*idx);
        }
    }

    let base = pending.len() / masters.len();
    let mut spare = pending.len() % masters.len();
    let mut counts = vec![0usize; masters.len()];
    let mut chosen: BTreeMap<&NodeId, usize> = BTreeMap::new();

    // Keep prior links up to the base quota, then let at most `spare`
    // masters keep one more.
    for replica in &pending {
        if let Some(&idx) = previous.get(&replica.id) {
            if counts[idx] < base {
                counts[idx] += 1;
                chosen.insert(&replica.id, idx);
            }
        }
    }
    for replica in &pending {
        if chosen.contains_key(&replica.id) {
            continue;
        }
        if let Some(&idx) = previous.get(&replica.id) {
            if counts[idx] == base && spare > 0 {
                counts[idx] += 1;
                spare -= 1;
                chosen.insert(&replica.id, idx);
            }
        }
    }

    for replica in &pending {
        if chosen.contains_key(&replica.id) {
            continue;
        }
        let fewest = counts.iter().copied().min().unwrap_or(0);
        let idx = (0..masters.len())
            .filter(|i| counts[*i] == fewest)
            .min_by_key(|i| (domain_rank(replica, masters[*i]), *i))
            .unwrap_or(0);
        counts[idx] += 1;
        chosen.insert(&replica.id, idx);
    }

    chosen
        .into_iter()
        .map(|(replica, idx)| ReplicaLink {
            master: masters[idx].id.clone(),
            replica: replica.clone(),
        })
        .collect()
}

/// 0: known different domain, 1: unknown, 2: same domain
fn domain_rank(replica: &Node, master: &Node) -> u8 {
    match (&replica.failure_domain, &master.failure_domain) {
        (Some(r), Some(m)) if r != m => 0,
        (Some(_), Some(_)) => 2,
        _ => 1,
    }
}
