//! Topology builder
//!
//! Turns a role selection into an epoch-stamped [`Topology`]. The epoch is
//! derived from what the nodes report, never from local state, so any
//! orchestrator instance can plan.

use crate::common::hash;
use crate::topology::partitioner::{moved_slots, partition};
use crate::topology::replicas::assign_replicas_with_prior;
use crate::topology::roles::{select_roles, ExcessReplicaPolicy, RoleSelection};
use crate::topology::types::{Node, NodeId, Topology};
use crate::Result;
use std::collections::BTreeMap;

/// Output of one planning pass
#[derive(Debug, Clone)]
pub struct Plan {
    pub topology: Topology,
    pub fingerprint: String,
    pub roles: RoleSelection,
    /// False when the assignment equals the prior one and its epoch is reused
    pub changed: bool,
    /// Slots that change owner relative to the prior topology
    pub moved_slots: u32,
}

#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    pub total_slots: u32,
    pub min_masters: usize,
    pub replicas_per_master: usize,
    pub excess_replicas: ExcessReplicaPolicy,
}

impl TopologyBuilder {
    pub fn new(total_slots: u32, min_masters: usize, replicas_per_master: usize) -> Self {
        Self {
            total_slots,
            min_masters,
            replicas_per_master,
            excess_replicas: ExcessReplicaPolicy::default(),
        }
    }

    pub fn with_excess_replicas(mut self, policy: ExcessReplicaPolicy) -> Self {
        self.excess_replicas = policy;
        self
    }

    pub fn select_roles(&self, nodes: &[Node], prior: Option<&Topology>) -> RoleSelection {
        select_roles(
            nodes,
            self.usable_prior(prior),
            self.min_masters,
            self.replicas_per_master,
            self.excess_replicas,
        )
    }

    /// Partition, assign replicas and stamp the epoch.
    ///
    /// `observed_epoch` is the highest epoch reported by any probed node.
    pub fn build(
        &self,
        roles: RoleSelection,
        prior: Option<&Topology>,
        observed_epoch: u64,
    ) -> Result<Plan> {
        self.stamp(roles, prior, observed_epoch, true)
    }

    /// Like [`build`](Self::build), but always stamps `observed_epoch + 1`.
    ///
    /// For clusters whose nodes hold different topologies at the observed
    /// epoch: reusing it would leave the nodes holding the other one behind.
    pub fn build_over_split(
        &self,
        roles: RoleSelection,
        prior: Option<&Topology>,
        observed_epoch: u64,
    ) -> Result<Plan> {
        self.stamp(roles, prior, observed_epoch, false)
    }

    fn stamp(
        &self,
        roles: RoleSelection,
        prior: Option<&Topology>,
        observed_epoch: u64,
        reuse_epoch: bool,
    ) -> Result<Plan> {
        let prior = self.usable_prior(prior);
        let master_ids: Vec<NodeId> = roles.masters.iter().map(|n| n.id.clone()).collect();
        let slots = partition(&master_ids, self.total_slots, prior.map(|t| &t.slots))?;

        let prior_links = prior.map(|t| t.replicas.as_slice()).unwrap_or(&[]);
        let replicas = assign_replicas_with_prior(&roles.masters, &roles.replicas, prior_links);

        let members: BTreeMap<NodeId, String> = roles
            .masters
            .iter()
            .chain(roles.replicas.iter())
            .map(|n| (n.id.clone(), n.address.clone()))
            .collect();

        let mut topology = Topology {
            epoch: 0,
            total_slots: self.total_slots,
            slots,
            replicas,
            members,
        };
        let fingerprint = topology.fingerprint()?;

        let reused = match prior {
            Some(p) if reuse_epoch && p.epoch >= observed_epoch => {
                (p.fingerprint()? == fingerprint).then_some(p.epoch)
            }
            _ => None,
        };
        let changed = reused.is_none();
        let epoch = reused.unwrap_or(observed_epoch + 1);
        topology.epoch = epoch;

        if let Err(e) = topology.validate() {
            tracing::error!("Planner produced an invalid topology: {}", e);
            return Err(e);
        }

        let moved = prior
            .map(|p| moved_slots(&p.slots, &topology.slots, self.total_slots))
            .unwrap_or(0);

        tracing::info!(
            epoch,
            changed,
            moved_slots = moved,
            masters = topology.slots.len(),
            replicas = topology.replicas.len(),
            idle = roles.idle.len(),
            fingerprint = hash::short(&fingerprint),
            "Planned topology"
        );

        Ok(Plan {
            topology,
            fingerprint,
            roles,
            changed,
            moved_slots: moved,
        })
    }

    /// A prior topology over a different slot space cannot seed this one
    fn usable_prior<'a>(&self, prior: Option<&'a Topology>) -> Option<&'a Topology> {
        prior.filter(|t| t.total_slots == self.total_slots)
    }
}
