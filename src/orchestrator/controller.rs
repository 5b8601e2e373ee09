//! Orchestrator controller: one run of discover → probe → plan → converge
//!
//! The controller keeps nothing between runs. Everything it knows about the
//! cluster comes from the registry and from what nodes report, so runs can be
//! triggered from anywhere, any number of times.

use crate::common::config::OrchestratorConfig;
use crate::orchestrator::control::ControlPlane;
use crate::orchestrator::converge::{ConvergenceDriver, NodeOutcome, Verdict};
use crate::orchestrator::discovery::{DiscoveryClient, Registry};
use crate::orchestrator::prober::Prober;
use crate::topology::{Node, NodeId, Plan, Reachability, RoleSelection, Topology, TopologyBuilder};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Discovering,
    Probing,
    Planning,
    Converging,
    Succeeded,
    DegradedSucceeded,
    Failed,
    /// Another run's topology won; nothing needs fixing
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::DegradedSucceeded | RunState::Failed | RunState::Aborted
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Discovering => "discovering",
            RunState::Probing => "probing",
            RunState::Planning => "planning",
            RunState::Converging => "converging",
            RunState::Succeeded => "succeeded",
            RunState::DegradedSucceeded => "degraded_succeeded",
            RunState::Failed => "failed",
            RunState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a run did not succeed cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Phase the run was in
    pub phase: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    pub reason: String,
    pub requires_remediation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub transitions: Vec<RunState>,
    pub outcomes: BTreeMap<NodeId, NodeOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<Topology>,
    /// Nodes a topology was pushed to
    pub pushes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    /// Replication shortfalls behind a degraded result
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self.state, RunState::Succeeded | RunState::DegradedSucceeded)
    }
}

/// What `plan` would push, without pushing it
#[derive(Debug, Clone)]
pub struct PlanReport {
    pub nodes: Vec<Node>,
    pub plan: Plan,
}

pub struct Controller {
    config: OrchestratorConfig,
    discovery: DiscoveryClient,
    prober: Prober,
    builder: TopologyBuilder,
    driver: ConvergenceDriver,
}

impl Controller {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<dyn Registry>,
        control: Arc<dyn ControlPlane>,
    ) -> Result<Self> {
        config.validate()?;
        let builder = TopologyBuilder::new(
            config.total_slots,
            config.min_masters,
            config.replicas_per_master,
        )
        .with_excess_replicas(config.excess_replicas);
        let prober = Prober::new(control.clone(), config.probe_timeout, config.max_concurrency);
        let driver = ConvergenceDriver::new(
            control,
            config.retry,
            config.max_concurrency,
            config.poll_interval,
            config.replicas_per_master,
        );

        Ok(Self {
            discovery: DiscoveryClient::new(registry),
            prober,
            builder,
            driver,
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Execute one orchestration run. Never returns an error: every failure
    /// ends up in the result's state and failure report.
    pub async fn run(&self) -> RunResult {
        let mut run = Run::start();
        let deadline = Instant::now() + self.config.run_timeout;
        tracing::info!(run_id = %run.id, "Starting orchestration run");

        run.enter(RunState::Discovering);
        let nodes = match self.discover(deadline).await {
            Ok(nodes) => nodes,
            Err(e) => return run.fail(None, e),
        };

        run.enter(RunState::Probing);
        let probed = self.prober.probe_all(nodes, deadline).await;
        let mut reachable = Vec::new();
        for node in probed {
            match &node.reachability {
                Reachability::Reachable => reachable.push(node),
                Reachability::Unreachable(reason) => {
                    run.outcome(&node.id, NodeOutcome::Unreachable(reason.clone()));
                }
                Reachability::Unknown => {
                    run.outcome(&node.id, NodeOutcome::Unreachable("not probed".into()));
                }
            }
        }

        let prior = prior_topology(&reachable);
        let roles = self.builder.select_roles(&reachable, prior.topology.as_ref());
        if roles.masters.len() < self.config.min_masters {
            return run.fail(
                None,
                Error::InsufficientMasters {
                    needed: self.config.min_masters,
                    available: roles.masters.len(),
                },
            );
        }

        run.enter(RunState::Planning);
        let plan = match self.build(roles, &prior) {
            Ok(plan) => plan,
            Err(e) => return run.fail(None, e),
        };
        for node in &plan.roles.idle {
            run.outcome(&node.id, NodeOutcome::Idle);
        }
        run.epoch = Some(plan.topology.epoch);
        run.topology = Some(plan.topology.clone());

        run.enter(RunState::Converging);
        let members: Vec<Node> = plan
            .roles
            .masters
            .iter()
            .chain(plan.roles.replicas.iter())
            .cloned()
            .collect();
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .min(self.config.converge_timeout);
        let result = match self.driver.converge(&plan.topology, &members, budget).await {
            Ok(result) => result,
            Err(e) => return run.fail(None, e),
        };

        run.pushes = result.pushes;
        for (id, outcome) in result.outcomes {
            run.outcome(&id, outcome);
        }

        match result.verdict {
            Verdict::Converged => run.finish(RunState::Succeeded),
            Verdict::Degraded => {
                run.warnings = result.problems;
                run.finish(RunState::DegradedSucceeded)
            }
            Verdict::Superseded => {
                let ours = plan.topology.epoch;
                let cause = match (result.superseded_by, result.stale_at) {
                    (Some((node, epoch)), _) => Some((
                        node.clone(),
                        Error::Superseded {
                            node: node.to_string(),
                            epoch,
                            ours,
                        },
                    )),
                    (None, Some((node, current))) => Some((
                        node.clone(),
                        Error::StaleEpoch {
                            node: node.to_string(),
                            offered: ours,
                            current,
                        },
                    )),
                    (None, None) => None,
                };
                let (node, reason) = match cause {
                    Some((node, e)) => (Some(node), e.to_string()),
                    None => (
                        run.first_rejected(),
                        "another run's topology was applied first".into(),
                    ),
                };
                run.abort(node, reason)
            }
            Verdict::Failed => {
                let node = run.first_master_not_converged(&plan.topology);
                let reason = result.problems.join("; ");
                run.fail_with(node, reason, true)
            }
        }
    }

    /// Discover and probe, then plan without pushing
    pub async fn plan(&self) -> Result<PlanReport> {
        let deadline = Instant::now() + self.config.run_timeout;
        let nodes = self.discover(deadline).await?;
        let probed = self.prober.probe_all(nodes, deadline).await;
        let reachable: Vec<Node> = probed.iter().filter(|n| n.is_reachable()).cloned().collect();

        let prior = prior_topology(&reachable);
        let roles = self.builder.select_roles(&reachable, prior.topology.as_ref());
        if roles.masters.len() < self.config.min_masters {
            return Err(Error::InsufficientMasters {
                needed: self.config.min_masters,
                available: roles.masters.len(),
            });
        }
        let plan = self.build(roles, &prior)?;
        Ok(PlanReport { nodes: probed, plan })
    }

    fn build(&self, roles: RoleSelection, prior: &Prior) -> Result<Plan> {
        if prior.split {
            tracing::warn!(
                epoch = prior.epoch,
                "Nodes disagree at the highest epoch, planning past it"
            );
            self.builder
                .build_over_split(roles, prior.topology.as_ref(), prior.epoch)
        } else {
            self.builder.build(roles, prior.topology.as_ref(), prior.epoch)
        }
    }

    async fn discover(&self, deadline: Instant) -> Result<Vec<Node>> {
        let nodes = timeout_at(deadline, self.discovery.discover())
            .await
            .map_err(|_| Error::DiscoveryUnavailable("run deadline passed during discovery".into()))??;
        if nodes.is_empty() {
            return Err(Error::DiscoveryUnavailable(
                "registry returned no candidates".into(),
            ));
        }
        Ok(nodes)
    }
}

/// What the reachable nodes hold at the highest epoch any of them reports
#[derive(Debug, Clone, Default)]
pub struct Prior {
    /// Highest reported epoch, 0 on a fresh cluster
    pub epoch: u64,
    /// Topology to plan from: the one that wins at `epoch`
    pub topology: Option<Topology>,
    /// Nodes at `epoch` hold different topologies
    pub split: bool,
}

/// Reconstruct the previous assignment from node reports.
///
/// Nodes at the highest epoch can disagree when two runs stamped the same
/// epoch or a run stopped midway. The topology nodes would keep (highest
/// fingerprint) seeds the plan, and `split` tells the planner not to reuse
/// the epoch.
pub fn prior_topology(nodes: &[Node]) -> Prior {
    let epoch = nodes.iter().map(Node::reported_epoch).max().unwrap_or(0);
    if epoch == 0 {
        return Prior::default();
    }

    let held: BTreeMap<Option<&str>, Option<&Topology>> = nodes
        .iter()
        .filter_map(|n| n.reported.as_ref())
        .filter(|s| s.epoch == epoch)
        .map(|s| (s.fingerprint.as_deref(), s.topology.as_ref()))
        .collect();
    let split = held.len() > 1;

    let topology = held
        .values()
        .rev()
        .flatten()
        .find(|t| match t.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(epoch, "Ignoring invalid reported topology: {}", e);
                false
            }
        })
        .map(|t| (*t).clone());

    Prior {
        epoch,
        topology,
        split,
    }
}

/// Bookkeeping for one run
struct Run {
    id: Uuid,
    started_at: DateTime<Utc>,
    state: RunState,
    transitions: Vec<RunState>,
    outcomes: BTreeMap<NodeId, NodeOutcome>,
    epoch: Option<u64>,
    topology: Option<Topology>,
    pushes: usize,
    warnings: Vec<String>,
}

impl Run {
    fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
            outcomes: BTreeMap::new(),
            epoch: None,
            topology: None,
            pushes: 0,
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, state: RunState) {
        tracing::info!(run_id = %self.id, phase = %state, "Entering phase");
        self.state = state;
        self.transitions.push(state);
    }

    fn outcome(&mut self, id: &NodeId, outcome: NodeOutcome) {
        self.outcomes.insert(id.clone(), outcome);
    }

    fn first_rejected(&self) -> Option<NodeId> {
        self.outcomes
            .iter()
            .find(|(_, o)| matches!(o, NodeOutcome::Rejected(_)))
            .map(|(id, _)| id.clone())
    }

    fn first_master_not_converged(&self, topology: &Topology) -> Option<NodeId> {
        topology
            .masters()
            .find(|m| !self.outcomes.get(*m).is_some_and(NodeOutcome::is_converged))
            .cloned()
    }

    fn finish(mut self, state: RunState) -> RunResult {
        self.enter(state);
        self.into_result(None)
    }

    fn fail(self, node: Option<NodeId>, error: Error) -> RunResult {
        if error.is_stale() {
            return self.abort(node, error.to_string());
        }
        let remediate = error.requires_remediation();
        self.fail_with(node, error.to_string(), remediate)
    }

    fn fail_with(mut self, node: Option<NodeId>, reason: String, remediate: bool) -> RunResult {
        tracing::error!(run_id = %self.id, phase = %self.state, "Run failed: {}", reason);
        let report = FailureReport {
            phase: self.state,
            node,
            reason,
            requires_remediation: remediate,
        };
        self.enter(RunState::Failed);
        self.into_result(Some(report))
    }

    fn abort(mut self, node: Option<NodeId>, reason: String) -> RunResult {
        tracing::warn!(run_id = %self.id, phase = %self.state, "Run aborted: {}", reason);
        let report = FailureReport {
            phase: self.state,
            node,
            reason,
            requires_remediation: false,
        };
        self.enter(RunState::Aborted);
        self.into_result(Some(report))
    }

    fn into_result(self, failure: Option<FailureReport>) -> RunResult {
        tracing::info!(
            run_id = %self.id,
            state = %self.state,
            epoch = ?self.epoch,
            pushes = self.pushes,
            "Run finished"
        );
        RunResult {
            run_id: self.id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            state: self.state,
            transitions: self.transitions,
            outcomes: self.outcomes,
            epoch: self.epoch,
            topology: self.topology,
            pushes: self.pushes,
            failure,
            warnings: self.warnings,
        }
    }
}
