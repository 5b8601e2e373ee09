//! Common utilities and types shared across slotctl

pub mod config;
pub mod error;
pub mod hash;
pub mod retry;
pub mod utils;

pub use config::{Config, NodeConfig, OrchestratorConfig, RegistryConfig, MAX_TOTAL_SLOTS};
pub use error::{Error, Result};
pub use hash::{blake3_hash, fingerprint};
pub use retry::RetryPolicy;
pub use utils::{format_duration, format_share, parse_duration, timestamp_now};
