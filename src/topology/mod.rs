//! Pure planning: data model, slot partitioning, replica assignment and
//! topology construction. Nothing in here performs I/O.

pub mod builder;
pub mod partitioner;
pub mod replicas;
pub mod roles;
pub mod types;

pub use builder::{Plan, TopologyBuilder};
pub use partitioner::{moved_slots, partition, partition_fresh};
pub use replicas::{assign_replicas, assign_replicas_with_prior};
pub use roles::{select_roles, ExcessReplicaPolicy, RoleSelection};
pub use types::{
    precedes, Assignment, Health, Node, NodeId, NodeState, Reachability, ReplicaLink, Role,
    Slot, SlotRange, Topology,
};
