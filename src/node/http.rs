//! HTTP control plane served by each node

use crate::common::NodeConfig;
use crate::node::agent::NodeAgent;
use crate::orchestrator::control::{
    ApplyOutcome, ApplyResponse, RejectReason, STATE_PATH, TOPOLOGY_PATH,
};
use crate::topology::Topology;
use crate::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Router};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct NodeHttpState {
    pub agent: Arc<NodeAgent>,
}

pub fn create_router(agent: Arc<NodeAgent>) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route(STATE_PATH, axum::routing::get(get_state))
        .route(TOPOLOGY_PATH, axum::routing::post(apply_topology))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(NodeHttpState { agent })
}

async fn health(State(state): State<NodeHttpState>) -> impl IntoResponse {
    let node = state.agent.state();
    axum::Json(json!({
        "status": node.health,
        "id": node.id,
        "epoch": node.epoch,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_state(State(state): State<NodeHttpState>) -> impl IntoResponse {
    axum::Json(state.agent.state())
}

async fn apply_topology(
    State(state): State<NodeHttpState>,
    axum::Json(topology): axum::Json<Topology>,
) -> impl IntoResponse {
    let outcome = state.agent.apply(topology);
    let status = match &outcome {
        ApplyOutcome::Ack => StatusCode::OK,
        ApplyOutcome::Rejected(RejectReason::StaleEpoch { .. }) => StatusCode::CONFLICT,
        ApplyOutcome::Rejected(RejectReason::MalformedTopology(_)) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
    };
    let body = ApplyResponse::from_outcome(&outcome, state.agent.epoch());
    (status, axum::Json(body))
}

/// Standalone node control-plane server
pub struct NodeServer {
    config: NodeConfig,
    agent: Arc<NodeAgent>,
}

impl NodeServer {
    pub fn new(config: NodeConfig) -> Self {
        let agent = Arc::new(NodeAgent::new(config.id.as_str(), config.total_slots));
        Self { config, agent }
    }

    pub fn agent(&self) -> Arc<NodeAgent> {
        self.agent.clone()
    }

    /// Serve until ctrl-c
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting node agent: {}", self.config.id);
        tracing::info!("  Control plane: {}", self.config.bind_addr);
        tracing::info!("  Total slots: {}", self.config.total_slots);
        if let Some(domain) = &self.config.failure_domain {
            tracing::info!("  Failure domain: {}", domain);
        }

        let router = create_router(self.agent.clone());
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        tracing::info!("✓ Node agent ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await?;

        tracing::info!("Node agent stopped");
        Ok(())
    }
}
