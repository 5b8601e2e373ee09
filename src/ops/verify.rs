//! Verify cluster integrity
//!
//! Read-only: probes every registered node and checks that they agree on one
//! topology and that the topology covers the slot space.

use crate::common::config::OrchestratorConfig;
use crate::common::Result;
use crate::orchestrator::{ControlPlane, DiscoveryClient, Prober, Registry};
use crate::topology::{NodeId, Topology};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub total_nodes: usize,
    pub unreachable: Vec<NodeId>,
    pub highest_epoch: u64,
    /// Nodes holding the highest epoch's topology
    pub current: Vec<NodeId>,
    /// Nodes behind the highest epoch, with the epoch they hold
    pub lagging: BTreeMap<NodeId, u64>,
    /// Nodes at the highest epoch with different content
    pub disagreeing: Vec<NodeId>,
    /// Members of the highest topology absent from the registry
    pub missing_members: Vec<NodeId>,
    pub slots_per_master: BTreeMap<NodeId, u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }
}

pub async fn verify_cluster(
    registry: Arc<dyn Registry>,
    control: Arc<dyn ControlPlane>,
    config: &OrchestratorConfig,
) -> Result<VerifyReport> {
    tracing::info!("Starting cluster verification");

    let nodes = DiscoveryClient::new(registry).discover().await?;
    let deadline = Instant::now() + config.run_timeout;
    let probed = Prober::new(control, config.probe_timeout, config.max_concurrency)
        .probe_all(nodes, deadline)
        .await;

    let mut report = VerifyReport {
        total_nodes: probed.len(),
        ..Default::default()
    };

    let states: Vec<_> = probed
        .iter()
        .filter_map(|n| match &n.reported {
            Some(s) if n.is_reachable() => Some(s),
            _ => {
                report.unreachable.push(n.id.clone());
                None
            }
        })
        .collect();

    report.highest_epoch = states.iter().map(|s| s.epoch).max().unwrap_or(0);
    if report.highest_epoch == 0 {
        report.problems.push("no node holds a topology".into());
        return Ok(report);
    }

    // the first node (id order) at the highest epoch is the reference
    let reference: Option<(&Topology, &str)> = states
        .iter()
        .filter(|s| s.epoch == report.highest_epoch)
        .find_map(|s| Some((s.topology.as_ref()?, s.fingerprint.as_deref()?)));

    let Some((topology, fingerprint)) = reference else {
        report
            .problems
            .push(format!("no node at epoch {} reports its topology", report.highest_epoch));
        return Ok(report);
    };

    for state in &states {
        if state.epoch < report.highest_epoch {
            report.lagging.insert(state.id.clone(), state.epoch);
        } else if state.fingerprint.as_deref() == Some(fingerprint) {
            report.current.push(state.id.clone());
        } else {
            report.disagreeing.push(state.id.clone());
        }
    }

    if let Err(e) = topology.validate() {
        report.problems.push(e.to_string());
    }
    if topology.total_slots != config.total_slots {
        report.problems.push(format!(
            "topology has {} slots, expected {}",
            topology.total_slots, config.total_slots
        ));
    }
    for master in topology.masters() {
        report
            .slots_per_master
            .insert(master.clone(), topology.slot_count(master));
    }
    for id in topology.node_ids() {
        if !probed.iter().any(|n| &n.id == id) {
            report.missing_members.push(id.clone());
        }
    }

    if !report.disagreeing.is_empty() {
        report.problems.push(format!(
            "{} node(s) disagree at epoch {}",
            report.disagreeing.len(),
            report.highest_epoch
        ));
    }
    if !report.lagging.is_empty() {
        report
            .problems
            .push(format!("{} node(s) behind", report.lagging.len()));
    }
    if !report.missing_members.is_empty() {
        report.problems.push(format!(
            "{} member(s) not in registry",
            report.missing_members.len()
        ));
    }

    tracing::info!(
        epoch = report.highest_epoch,
        current = report.current.len(),
        problems = report.problems.len(),
        "Verification complete"
    );
    Ok(report)
}
