//! Node agent binary: serves the cluster control plane for one data node

use anyhow::Result;
use clap::Parser;
use slotctl::common::{Config, NodeConfig, MAX_TOTAL_SLOTS};
use slotctl::node::NodeServer;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "slotctl-node")]
#[command(about = "slotctl node agent - control plane for one cluster member")]
#[command(version)]
struct Args {
    /// Node ID (must match the registry entry)
    #[arg(short, long)]
    id: Option<String>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Failure domain (zone, rack)
    #[arg(long)]
    failure_domain: Option<String>,

    #[arg(long)]
    total_slots: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // File config first, CLI arguments take priority
    let file_node = Config::load()?.node;
    let id = args
        .id
        .or_else(|| file_node.as_ref().map(|n| n.id.clone()))
        .ok_or_else(|| anyhow::anyhow!("node id required (--id or [node].id)"))?;
    let bind_addr = match (args.bind, &file_node) {
        (Some(addr), _) => addr,
        (None, Some(n)) => n.bind_addr,
        (None, None) => "127.0.0.1:7000".parse()?,
    };
    let config = NodeConfig {
        id,
        bind_addr,
        failure_domain: args
            .failure_domain
            .or_else(|| file_node.as_ref().and_then(|n| n.failure_domain.clone())),
        total_slots: args
            .total_slots
            .or_else(|| file_node.as_ref().map(|n| n.total_slots))
            .unwrap_or(16384),
    };
    anyhow::ensure!(
        (1..=MAX_TOTAL_SLOTS).contains(&config.total_slots),
        "total_slots must be between 1 and {}",
        MAX_TOTAL_SLOTS
    );

    NodeServer::new(config).serve().await?;

    Ok(())
}
