//! Orchestration: discovery, probing, convergence and the run controller

pub mod control;
pub mod controller;
pub mod converge;
pub mod discovery;
pub mod prober;

pub use control::{ApplyOutcome, ControlPlane, HttpControlPlane, RejectReason};
pub use controller::{
    prior_topology, Controller, FailureReport, PlanReport, Prior, RunResult, RunState,
};
pub use converge::{ConvergenceDriver, ConvergenceResult, NodeOutcome, Verdict};
pub use discovery::{Candidate, DiscoveryClient, HttpRegistry, Registry, StaticRegistry};
pub use prober::Prober;

use crate::common::config::{Config, RegistryConfig};
use crate::{Error, Result};
use std::sync::Arc;

/// Build the registry a config points at: HTTP if `url` is set, otherwise the
/// static candidates file.
pub fn registry_from_config(config: &RegistryConfig, request_timeout: std::time::Duration) -> Result<Arc<dyn Registry>> {
    match (&config.url, &config.candidates_file) {
        (Some(url), _) => Ok(Arc::new(HttpRegistry::new(url, config.retry, request_timeout)?)),
        (None, Some(path)) => Ok(Arc::new(StaticRegistry::from_file(path)?)),
        (None, None) => Err(Error::InvalidConfig(
            "registry.url or registry.candidates_file must be set".into(),
        )),
    }
}

/// One run against real nodes over HTTP
pub async fn run_orchestration(config: &Config) -> Result<RunResult> {
    let orchestrator = &config.orchestrator;
    let registry = registry_from_config(&config.registry, orchestrator.probe_timeout)?;
    let control = Arc::new(HttpControlPlane::new(orchestrator.probe_timeout)?);
    let controller = Controller::new(orchestrator.clone(), registry, control)?;
    Ok(controller.run().await)
}
