//! Configuration for slotctl components

use crate::common::retry::RetryPolicy;
use crate::common::utils::duration_str;
use crate::topology::ExcessReplicaPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SLOTCTL_CONFIG";

/// Largest slot space a cluster may be configured with
pub const MAX_TOTAL_SLOTS: u32 = 1 << 20;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    /// Node agent settings (only read by `slotctl-node`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from the file named by `SLOTCTL_CONFIG` (default `slotctl.toml`),
    /// then `SLOTCTL_*` environment variables. A missing file is not an error.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "slotctl.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("SLOTCTL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.orchestrator.validate()?;
        Ok(config)
    }
}

/// Settings for one orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Size of the keyspace; fixed for the lifetime of a cluster
    #[serde(default = "default_total_slots")]
    pub total_slots: u32,

    #[serde(default = "default_min_masters")]
    pub min_masters: usize,

    #[serde(default)]
    pub replicas_per_master: usize,

    #[serde(default = "default_probe_timeout", with = "duration_str")]
    pub probe_timeout: Duration,

    #[serde(default = "default_converge_timeout", with = "duration_str")]
    pub converge_timeout: Duration,

    /// Deadline for the whole run, discovery included
    #[serde(default = "default_run_timeout", with = "duration_str")]
    pub run_timeout: Duration,

    /// Upper bound on concurrent probes and pushes
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,

    /// Retry policy for topology pushes
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub excess_replicas: ExcessReplicaPolicy,
}

fn default_total_slots() -> u32 {
    16384
}
fn default_min_masters() -> usize {
    1
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_converge_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_run_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_max_concurrency() -> usize {
    16
}
fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            total_slots: default_total_slots(),
            min_masters: default_min_masters(),
            replicas_per_master: 0,
            probe_timeout: default_probe_timeout(),
            converge_timeout: default_converge_timeout(),
            run_timeout: default_run_timeout(),
            max_concurrency: default_max_concurrency(),
            poll_interval: default_poll_interval(),
            retry: RetryPolicy::default(),
            excess_replicas: ExcessReplicaPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.total_slots == 0 {
            return Err(Error::InvalidConfig("total_slots must be > 0".into()));
        }
        if self.total_slots > MAX_TOTAL_SLOTS {
            return Err(Error::InvalidConfig(format!(
                "total_slots ({}) exceeds the maximum of {}",
                self.total_slots, MAX_TOTAL_SLOTS
            )));
        }
        if self.min_masters == 0 {
            return Err(Error::InvalidConfig("min_masters must be >= 1".into()));
        }
        if self.min_masters > self.total_slots as usize {
            return Err(Error::InvalidConfig(format!(
                "min_masters ({}) exceeds total_slots ({})",
                self.min_masters, self.total_slots
            )));
        }
        if self.max_concurrency == 0 {
            return Err(Error::InvalidConfig("max_concurrency must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry.max_attempts must be > 0".into()));
        }
        if self.probe_timeout.is_zero() || self.converge_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Where candidates come from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of an HTTP registry exposing `GET /candidates`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Static candidate list (TOML or JSON), used when `url` is unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates_file: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Node agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,

    pub bind_addr: SocketAddr,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    #[serde(default = "default_total_slots")]
    pub total_slots: u32,
}
