//! Node control-plane client
//!
//! Wire format (JSON over HTTP):
//! - `GET  /cluster/state`    → [`NodeState`]
//! - `POST /cluster/topology` → `200` ack, `409` stale epoch, `422` malformed

use crate::topology::{Node, NodeState, Topology};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const STATE_PATH: &str = "/cluster/state";
pub const TOPOLOGY_PATH: &str = "/cluster/topology";

/// Why a node refused a topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The node holds a newer epoch, or this epoch with a higher fingerprint
    StaleEpoch { current_epoch: u64 },
    MalformedTopology(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::StaleEpoch { current_epoch } => {
                write!(f, "stale epoch (node at {})", current_epoch)
            }
            RejectReason::MalformedTopology(detail) => write!(f, "malformed topology: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Ack,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    Ack,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    StaleEpoch,
    MalformedTopology,
}

/// JSON body of a `POST /cluster/topology` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub status: ApplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectKind>,
    /// Epoch the node holds after handling the request
    pub current_epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApplyResponse {
    pub fn from_outcome(outcome: &ApplyOutcome, current_epoch: u64) -> Self {
        match outcome {
            ApplyOutcome::Ack => Self {
                status: ApplyStatus::Ack,
                reason: None,
                current_epoch,
                detail: None,
            },
            ApplyOutcome::Rejected(RejectReason::StaleEpoch { current_epoch }) => Self {
                status: ApplyStatus::Reject,
                reason: Some(RejectKind::StaleEpoch),
                current_epoch: *current_epoch,
                detail: None,
            },
            ApplyOutcome::Rejected(RejectReason::MalformedTopology(detail)) => Self {
                status: ApplyStatus::Reject,
                reason: Some(RejectKind::MalformedTopology),
                current_epoch,
                detail: Some(detail.clone()),
            },
        }
    }

    pub fn into_outcome(self) -> ApplyOutcome {
        match (self.status, self.reason) {
            (ApplyStatus::Ack, _) => ApplyOutcome::Ack,
            (ApplyStatus::Reject, Some(RejectKind::StaleEpoch)) => {
                ApplyOutcome::Rejected(RejectReason::StaleEpoch {
                    current_epoch: self.current_epoch,
                })
            }
            (ApplyStatus::Reject, _) => ApplyOutcome::Rejected(RejectReason::MalformedTopology(
                self.detail.unwrap_or_else(|| "no detail".to_string()),
            )),
        }
    }
}

/// Control-plane operations the orchestrator needs from a node
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_state(&self, node: &Node) -> Result<NodeState>;

    async fn apply_topology(&self, node: &Node, topology: &Topology) -> Result<ApplyOutcome>;
}

/// `ControlPlane` over HTTP, addressing nodes by their `address`
pub struct HttpControlPlane {
    client: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// `10.0.0.5:7000` → `http://10.0.0.5:7000`
pub fn base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_state(&self, node: &Node) -> Result<NodeState> {
        let url = format!("{}{}", base_url(&node.address), STATE_PATH);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("GET {} returned {}", url, resp.status())));
        }
        Ok(resp.json::<NodeState>().await?)
    }

    async fn apply_topology(&self, node: &Node, topology: &Topology) -> Result<ApplyOutcome> {
        let url = format!("{}{}", base_url(&node.address), TOPOLOGY_PATH);
        let resp = self.client.post(&url).json(topology).send().await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                Ok(resp.json::<ApplyResponse>().await?.into_outcome())
            }
            other => Err(Error::Http(format!("POST {} returned {}", url, other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("10.0.0.5:7000"), "http://10.0.0.5:7000");
        assert_eq!(base_url("http://node-1:7000/"), "http://node-1:7000");
        assert_eq!(base_url("https://node-1"), "https://node-1");
    }

    #[test]
    fn test_apply_response_wire_format() {
        let stale = ApplyOutcome::Rejected(RejectReason::StaleEpoch { current_epoch: 5 });
        let json = serde_json::to_value(ApplyResponse::from_outcome(&stale, 5)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "reject", "reason": "stale_epoch", "current_epoch": 5})
        );

        let back: ApplyResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back.into_outcome(), stale);

        let ack: ApplyResponse =
            serde_json::from_str(r#"{"status":"ack","current_epoch":4}"#).unwrap();
        assert_eq!(ack.into_outcome(), ApplyOutcome::Ack);
    }

    #[test]
    fn test_malformed_detail_carried() {
        let bad = ApplyOutcome::Rejected(RejectReason::MalformedTopology("gap".into()));
        let resp = ApplyResponse::from_outcome(&bad, 2);
        assert_eq!(resp.current_epoch, 2);
        assert_eq!(resp.detail.as_deref(), Some("gap"));
        assert_eq!(resp.into_outcome(), bad);
    }
}
