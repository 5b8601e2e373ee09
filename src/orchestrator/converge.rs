//! Convergence driver
//!
//! Pushes a topology to its members and waits until each one reports having
//! applied it. Pushes go out in two steps: one anchor node alone, then
//! everyone else concurrently. Nodes order topologies by epoch and then by
//! fingerprint, so when two runs race with the same epoch every node ends up
//! preferring the same one, and the other run sees it and stops.

use crate::common::hash;
use crate::common::retry::RetryPolicy;
use crate::orchestrator::control::{ApplyOutcome, ControlPlane, RejectReason};
use crate::topology::{Node, NodeId, Topology};
use crate::{Error, Result};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Where one node ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum NodeOutcome {
    /// Reports the target epoch and fingerprint
    Converged,
    /// Not yet confirmed when the run ended
    Pending,
    Rejected(String),
    Unreachable(String),
    /// Reachable but given no role
    Idle,
}

impl NodeOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, NodeOutcome::Converged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Converged,
    /// Masters converged, replication below target
    Degraded,
    Failed,
    /// A newer or competing topology exists; nothing more was pushed
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ConvergenceResult {
    pub outcomes: BTreeMap<NodeId, NodeOutcome>,
    /// Nodes a push was sent to
    pub pushes: usize,
    pub verdict: Verdict,
    /// Node and epoch that caused a `Superseded` verdict
    pub superseded_by: Option<(NodeId, u64)>,
    /// Node holding a competing topology at our epoch, with its epoch
    pub stale_at: Option<(NodeId, u64)>,
    /// Human-readable reasons behind a `Degraded` or `Failed` verdict
    pub problems: Vec<String>,
}

enum PushResult {
    Acked,
    Stale(u64),
    Malformed(String),
    Failed(String),
}

pub struct ConvergenceDriver {
    control: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
    max_concurrency: usize,
    poll_interval: Duration,
    replica_target: usize,
}

impl ConvergenceDriver {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        retry: RetryPolicy,
        max_concurrency: usize,
        poll_interval: Duration,
        replica_target: usize,
    ) -> Self {
        Self {
            control,
            retry,
            max_concurrency: max_concurrency.max(1),
            poll_interval,
            replica_target,
        }
    }

    /// Drive `members` (probed nodes of `topology`) to `topology` within
    /// `timeout`. Work still in flight at the deadline is dropped and those
    /// nodes stay `Pending` or `Unreachable`.
    pub async fn converge(
        &self,
        topology: &Topology,
        members: &[Node],
        timeout: Duration,
    ) -> Result<ConvergenceResult> {
        let deadline = Instant::now() + timeout;
        let fingerprint = topology.fingerprint()?;
        let epoch = topology.epoch;

        let mut order: Vec<&Node> = members
            .iter()
            .filter(|n| topology.members.contains_key(&n.id))
            .collect();
        order.sort_by_key(|n| (!topology.is_master(&n.id), n.id.clone()));

        let mut run = Tracker::default();

        // Short-circuit on what the probes already told us
        let mut to_push: Vec<&Node> = Vec::new();
        for &node in &order {
            match &node.reported {
                Some(s) if s.epoch > epoch => run.supersede(&node.id, s.epoch),
                Some(s) if s.matches(epoch, &fingerprint) => {
                    run.set(&node.id, NodeOutcome::Converged);
                }
                Some(s) if s.outranks(epoch, &fingerprint) => {
                    run.mark_stale(&node.id, epoch, s.epoch);
                }
                _ => {
                    run.set(&node.id, NodeOutcome::Pending);
                    to_push.push(node);
                }
            }
        }
        for id in topology.members.keys() {
            if !run.outcomes.contains_key(id) {
                run.set(id, NodeOutcome::Unreachable("not probed".into()));
            }
        }

        if !run.stopped() {
            if let Some((anchor, rest)) = to_push.split_first() {
                tracing::debug!(node = %anchor.id, epoch, "Pushing to anchor");
                run.pushes += 1;
                match timeout_at(deadline, self.push(anchor, topology)).await {
                    Ok(result) => run.record_push(&anchor.id, epoch, result),
                    Err(_) => run.set(&anchor.id, NodeOutcome::Pending),
                }

                if !run.stopped() && !rest.is_empty() && Instant::now() < deadline {
                    self.fan_out(rest, topology, deadline, &mut run).await;
                }
            }
        }

        if !run.stopped() {
            self.poll(&order, epoch, &fingerprint, deadline, &mut run)
                .await;
        }

        let result = self.judge(topology, run);
        tracing::info!(
            epoch,
            fingerprint = hash::short(&fingerprint),
            pushes = result.pushes,
            verdict = ?result.verdict,
            "Convergence finished"
        );
        Ok(result)
    }

    async fn fan_out(
        &self,
        nodes: &[&Node],
        topology: &Topology,
        deadline: Instant,
        run: &mut Tracker,
    ) {
        run.pushes += nodes.len();
        let mut pushes = stream::iter(nodes.iter().copied())
            .map(|node| async move { (node.id.clone(), self.push(node, topology).await) })
            .buffer_unordered(self.max_concurrency);

        loop {
            match timeout_at(deadline, pushes.next()).await {
                Ok(Some((id, result))) => run.record_push(&id, topology.epoch, result),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("Convergence deadline reached with pushes outstanding");
                    break;
                }
            }
        }
    }

    async fn push(&self, node: &Node, topology: &Topology) -> PushResult {
        let what = format!("push to {}", node.id);
        let outcome = self
            .retry
            .retry(&what, || self.control.apply_topology(node, topology))
            .await;

        match outcome {
            Ok(ApplyOutcome::Ack) => PushResult::Acked,
            Ok(ApplyOutcome::Rejected(RejectReason::StaleEpoch { current_epoch })) => {
                tracing::warn!(
                    node = %node.id,
                    offered = topology.epoch,
                    current = current_epoch,
                    "Push rejected: stale epoch"
                );
                PushResult::Stale(current_epoch)
            }
            Ok(ApplyOutcome::Rejected(RejectReason::MalformedTopology(detail))) => {
                tracing::error!(node = %node.id, "Push rejected as malformed: {}", detail);
                PushResult::Malformed(detail)
            }
            Err(e) => {
                tracing::warn!(node = %node.id, "Push failed: {}", e);
                PushResult::Failed(e.to_string())
            }
        }
    }

    /// Re-read pending nodes until they all report the target, one reports
    /// something newer, or the deadline passes.
    async fn poll(
        &self,
        order: &[&Node],
        epoch: u64,
        fingerprint: &str,
        deadline: Instant,
        run: &mut Tracker,
    ) {
        loop {
            let pending: Vec<&Node> = order
                .iter()
                .copied()
                .filter(|n| run.outcomes.get(&n.id) == Some(&NodeOutcome::Pending))
                .collect();
            if pending.is_empty() || Instant::now() >= deadline {
                return;
            }

            let mut reads = stream::iter(pending)
                .map(|node| async move { (node.id.clone(), self.control.get_state(node).await) })
                .buffer_unordered(self.max_concurrency);

            loop {
                match timeout_at(deadline, reads.next()).await {
                    Ok(Some((id, Ok(state)))) => {
                        if state.epoch > epoch {
                            run.supersede(&id, state.epoch);
                        } else if state.matches(epoch, fingerprint) {
                            run.set(&id, NodeOutcome::Converged);
                        } else if state.outranks(epoch, fingerprint) {
                            run.mark_stale(&id, epoch, state.epoch);
                        }
                    }
                    Ok(Some((id, Err(e)))) => {
                        tracing::debug!(node = %id, "Poll failed: {}", e);
                    }
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
            if run.stopped() {
                return;
            }

            let still_pending = run
                .outcomes
                .values()
                .any(|o| *o == NodeOutcome::Pending);
            if !still_pending {
                return;
            }
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(self.poll_interval);
            tokio::time::sleep(wait).await;
        }
    }

    fn judge(&self, topology: &Topology, run: Tracker) -> ConvergenceResult {
        let Tracker {
            outcomes,
            pushes,
            superseded_by,
            stale_at,
            malformed,
        } = run;
        let mut problems = Vec::new();

        let verdict = if superseded_by.is_some() || stale_at.is_some() {
            if let Some((node, e)) = &superseded_by {
                problems.push(format!("{} holds epoch {}", node, e));
            }
            Verdict::Superseded
        } else {
            for (node, detail) in &malformed {
                let rejected = Error::PushRejected {
                    node: node.to_string(),
                    reason: RejectReason::MalformedTopology(detail.clone()).to_string(),
                };
                problems.push(rejected.to_string());
            }
            for master in topology.masters() {
                match outcomes.get(master) {
                    Some(NodeOutcome::Converged) => {}
                    other => problems.push(format!("master {} not converged: {:?}", master, other)),
                }
            }

            if !problems.is_empty() {
                Verdict::Failed
            } else {
                for link in &topology.replicas {
                    if !outcomes.get(&link.replica).is_some_and(NodeOutcome::is_converged) {
                        problems.push(format!("replica {} not converged", link.replica));
                    }
                }
                if self.replica_target > 0 {
                    for master in topology.masters() {
                        let have = topology.replicas_of(master).len();
                        if have < self.replica_target {
                            problems.push(format!(
                                "master {} has {}/{} replicas",
                                master, have, self.replica_target
                            ));
                        }
                    }
                }
                if problems.is_empty() {
                    Verdict::Converged
                } else {
                    Verdict::Degraded
                }
            }
        };

        ConvergenceResult {
            outcomes,
            pushes,
            verdict,
            superseded_by,
            stale_at,
            problems,
        }
    }
}

/// Mutable bookkeeping for one convergence pass
#[derive(Default)]
struct Tracker {
    outcomes: BTreeMap<NodeId, NodeOutcome>,
    pushes: usize,
    superseded_by: Option<(NodeId, u64)>,
    stale_at: Option<(NodeId, u64)>,
    malformed: Vec<(NodeId, String)>,
}

impl Tracker {
    fn set(&mut self, id: &NodeId, outcome: NodeOutcome) {
        self.outcomes.insert(id.clone(), outcome);
    }

    /// Nothing more may be pushed or waited for
    fn stopped(&self) -> bool {
        self.stale_at.is_some() || self.superseded_by.is_some() || !self.malformed.is_empty()
    }

    fn supersede(&mut self, id: &NodeId, epoch: u64) {
        tracing::warn!(node = %id, epoch, "Node reports a newer epoch");
        self.set(id, NodeOutcome::Rejected(format!("holds newer epoch {}", epoch)));
        let newer = self
            .superseded_by
            .as_ref()
            .map(|(_, e)| epoch > *e)
            .unwrap_or(true);
        if newer {
            self.superseded_by = Some((id.clone(), epoch));
        }
    }

    /// `id` holds a topology that wins over the one offered at `offered`
    fn mark_stale(&mut self, id: &NodeId, offered: u64, current: u64) {
        let stale = Error::StaleEpoch {
            node: id.to_string(),
            offered,
            current,
        };
        self.set(id, NodeOutcome::Rejected(stale.to_string()));
        if self.stale_at.is_none() {
            self.stale_at = Some((id.clone(), current));
        }
    }

    fn record_push(&mut self, id: &NodeId, offered: u64, result: PushResult) {
        match result {
            PushResult::Acked => self.set(id, NodeOutcome::Pending),
            PushResult::Stale(current) => self.mark_stale(id, offered, current),
            PushResult::Malformed(detail) => {
                let reason = RejectReason::MalformedTopology(detail.clone());
                self.set(id, NodeOutcome::Rejected(reason.to_string()));
                self.malformed.push((id.clone(), detail));
            }
            PushResult::Failed(reason) => self.set(id, NodeOutcome::Unreachable(reason)),
        }
    }
}
