//! Discovery: fetch the candidate set from the service registry
//!
//! The registry is the only source of membership. Candidates are returned as
//! listed; health is the prober's business.

use crate::common::retry::RetryPolicy;
use crate::orchestrator::control::base_url;
use crate::topology::{Node, NodeId, Role};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: NodeId,
    pub address: String,
    #[serde(default)]
    pub declared_role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

impl Candidate {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            declared_role: Role::Unassigned,
            failure_domain: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.declared_role = role;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.failure_domain = Some(domain.into());
        self
    }

    fn into_node(self) -> Node {
        let mut node = Node::new(self.id, self.address, self.declared_role);
        node.failure_domain = self.failure_domain;
        node
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_candidates(&self) -> Result<Vec<Candidate>>;
}

/// Fixed candidate list
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct CandidateFile {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl StaticRegistry {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    /// Load `[[candidates]]` entries from a TOML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let file: CandidateFile = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        Ok(Self::new(file.candidates))
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn list_candidates(&self) -> Result<Vec<Candidate>> {
        Ok(self.candidates.clone())
    }
}

/// Registry served over HTTP at `GET {url}/candidates`
pub struct HttpRegistry {
    url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpRegistry {
    pub fn new(url: &str, retry: RetryPolicy, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            url: format!("{}/candidates", base_url(url)),
            client,
            retry,
        })
    }

    async fn fetch(&self) -> Result<Vec<Candidate>> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "GET {} returned {}",
                self.url,
                resp.status()
            )));
        }
        Ok(resp.json::<Vec<Candidate>>().await?)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn list_candidates(&self) -> Result<Vec<Candidate>> {
        self.retry
            .retry("registry query", || self.fetch())
            .await
            .map_err(|e| Error::DiscoveryUnavailable(e.to_string()))
    }
}

/// Turns registry candidates into nodes for one run
#[derive(Clone)]
pub struct DiscoveryClient {
    registry: Arc<dyn Registry>,
}

impl DiscoveryClient {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// All candidates as unprobed nodes, sorted by id.
    ///
    /// Fails on registry errors and on malformed candidate sets; an empty
    /// set is returned as is.
    pub async fn discover(&self) -> Result<Vec<Node>> {
        let candidates = self.registry.list_candidates().await.map_err(|e| match e {
            Error::DiscoveryUnavailable(_) => e,
            other => Error::DiscoveryUnavailable(other.to_string()),
        })?;

        let mut seen = BTreeSet::new();
        for c in &candidates {
            if c.id.as_str().is_empty() {
                return Err(Error::InvalidCandidate {
                    id: String::new(),
                    reason: "empty id".into(),
                });
            }
            if c.address.is_empty() {
                return Err(Error::InvalidCandidate {
                    id: c.id.to_string(),
                    reason: "empty address".into(),
                });
            }
            if !seen.insert(c.id.clone()) {
                return Err(Error::InvalidCandidate {
                    id: c.id.to_string(),
                    reason: "listed more than once".into(),
                });
            }
        }

        let mut nodes: Vec<Node> = candidates.into_iter().map(Candidate::into_node).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::info!(candidates = nodes.len(), "Discovered candidates");
        Ok(nodes)
    }
}
