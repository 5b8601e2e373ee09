//! Error types for slotctl

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Discovery Errors ===
    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("Invalid candidate {id}: {reason}")]
    InvalidCandidate { id: String, reason: String },

    // === Planning Errors ===
    #[error("No masters available")]
    NoMastersAvailable,

    #[error("Insufficient slot granularity: {masters} masters for {total_slots} slots")]
    InsufficientSlotGranularity { masters: usize, total_slots: u32 },

    #[error("Insufficient masters: need {needed}, have {available}")]
    InsufficientMasters { needed: usize, available: usize },

    #[error("Malformed topology: {0}")]
    MalformedTopology(String),

    // === Per-node Errors ===
    #[error("Node {node} unreachable: {reason}")]
    NodeUnreachable { node: String, reason: String },

    #[error("Stale epoch on {node}: offered {offered}, node is at {current}")]
    StaleEpoch {
        node: String,
        offered: u64,
        current: u64,
    },

    #[error("Superseded: {node} reports epoch {epoch}, above ours ({ours})")]
    Superseded { node: String, epoch: u64, ours: u64 },

    #[error("Push rejected by {node}: {reason}")]
    PushRejected { node: String, reason: String },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::Http(_)
                | Error::NodeUnreachable { .. }
        )
    }

    /// Does this error need an operator (or the provisioning side) to act?
    ///
    /// Stale and superseded runs are expected under concurrent triggers and
    /// resolve themselves on the next run.
    pub fn requires_remediation(&self) -> bool {
        !matches!(
            self,
            Error::StaleEpoch { .. }
                | Error::Superseded { .. }
                | Error::DiscoveryUnavailable(_)
                | Error::NodeUnreachable { .. }
                | Error::Timeout(_)
                | Error::ConnectionFailed(_)
        )
    }

    /// Errors signalling that a newer topology exists somewhere in the cluster.
    pub fn is_stale(&self) -> bool {
        matches!(self, Error::StaleEpoch { .. } | Error::Superseded { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}
