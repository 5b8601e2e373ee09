//! CLI for cluster orchestration

use clap::{Args, Parser, Subcommand};
use slotctl::common::{format_share, Config};
use slotctl::node::LocalCluster;
use slotctl::ops::verify_cluster;
use slotctl::orchestrator::{
    registry_from_config, run_orchestration, ControlPlane, Controller, HttpControlPlane,
    Registry, RunResult, RunState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "slotctl")]
#[command(about = "Bootstrap and topology orchestrator for slot-partitioned clusters")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $SLOTCTL_CONFIG or ./slotctl.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Target {
    /// HTTP registry base URL
    #[arg(long)]
    registry: Option<String>,

    /// Static candidates file (TOML or JSON)
    #[arg(long, conflicts_with = "registry")]
    candidates: Option<PathBuf>,

    #[arg(long)]
    total_slots: Option<u32>,

    #[arg(long)]
    min_masters: Option<usize>,

    /// Replicas per master
    #[arg(long)]
    replicas: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one orchestration run
    Run(Target),

    /// Probe the cluster and print the topology a run would push
    Plan(Target),

    /// Check that all nodes agree on one complete topology
    Verify(Target),

    /// Orchestrate an in-process cluster
    Simulate {
        /// Number of nodes
        #[arg(long, default_value = "6")]
        nodes: usize,

        /// Nodes to mark unreachable (by index, comma-separated)
        #[arg(long, value_delimiter = ',')]
        down: Vec<usize>,

        #[arg(long, default_value = "16384")]
        total_slots: u32,

        #[arg(long, default_value = "1")]
        min_masters: usize,

        /// Replicas per master
        #[arg(long, default_value = "0")]
        replicas: usize,
    },
}

fn load_config(cli: &Cli, target: Option<&Target>) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(t) = target {
        if let Some(url) = &t.registry {
            config.registry.url = Some(url.clone());
            config.registry.candidates_file = None;
        }
        if let Some(path) = &t.candidates {
            config.registry.url = None;
            config.registry.candidates_file = Some(path.clone());
        }
        if let Some(n) = t.total_slots {
            config.orchestrator.total_slots = n;
        }
        if let Some(n) = t.min_masters {
            config.orchestrator.min_masters = n;
        }
        if let Some(n) = t.replicas {
            config.orchestrator.replicas_per_master = n;
        }
        config.orchestrator.validate()?;
    }
    Ok(config)
}

fn http_stack(config: &Config) -> anyhow::Result<(Arc<dyn Registry>, Arc<dyn ControlPlane>)> {
    let timeout = config.orchestrator.probe_timeout;
    let registry = registry_from_config(&config.registry, timeout)?;
    let control: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(timeout)?);
    Ok((registry, control))
}

fn print_run(result: &RunResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("Run {}: {}", result.run_id, result.state);
    if let Some(epoch) = result.epoch {
        println!("  Epoch: {}", epoch);
    }
    println!("  Pushes: {}", result.pushes);
    if let Some(topology) = &result.topology {
        for master in topology.masters() {
            println!(
                "  {} master  {}",
                master,
                format_share(topology.slot_count(master), topology.total_slots)
            );
            for replica in topology.replicas_of(master) {
                println!("    {} replica", replica);
            }
        }
    }
    for (node, outcome) in &result.outcomes {
        println!("  {}: {:?}", node, outcome);
    }
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
    if let Some(failure) = &result.failure {
        println!("  {} in {}: {}", result.state, failure.phase, failure.reason);
    }
    Ok(())
}

fn finish(result: &RunResult) -> anyhow::Result<()> {
    match (&result.state, &result.failure) {
        (RunState::Failed, Some(failure)) => {
            anyhow::bail!("run failed during {}: {}", failure.phase, failure.reason)
        }
        (RunState::Failed, None) => anyhow::bail!("run failed"),
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let target = match &cli.command {
        Commands::Run(t) | Commands::Plan(t) | Commands::Verify(t) => Some(t.clone()),
        Commands::Simulate { .. } => None,
    };
    let config = load_config(&cli, target.as_ref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &cli.command {
        Commands::Run(_) => {
            let result = run_orchestration(&config).await?;
            print_run(&result, cli.json)?;
            finish(&result)?;
        }

        Commands::Plan(_) => {
            let (registry, control) = http_stack(&config)?;
            let controller = Controller::new(config.orchestrator.clone(), registry, control)?;
            let report = controller.plan().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report.plan.topology)?);
            } else {
                let topology = &report.plan.topology;
                println!(
                    "Epoch {} ({})",
                    topology.epoch,
                    if report.plan.changed { "new" } else { "unchanged" }
                );
                println!("  Slots moved: {}", report.plan.moved_slots);
                for master in topology.masters() {
                    println!(
                        "  {} master  {}",
                        master,
                        format_share(topology.slot_count(master), topology.total_slots)
                    );
                }
                for link in &topology.replicas {
                    println!("  {} replica of {}", link.replica, link.master);
                }
                for node in &report.plan.roles.idle {
                    println!("  {} idle", node.id);
                }
                for node in report.nodes.iter().filter(|n| !n.is_reachable()) {
                    println!("  {} unreachable", node.id);
                }
            }
        }

        Commands::Verify(_) => {
            let (registry, control) = http_stack(&config)?;
            let report = verify_cluster(registry, control, &config.orchestrator).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Verification report:");
                println!("  Nodes: {}", report.total_nodes);
                println!("  Highest epoch: {}", report.highest_epoch);
                println!("  Current: {}", report.current.len());
                println!("  Lagging: {}", report.lagging.len());
                println!("  Disagreeing: {}", report.disagreeing.len());
                println!("  Unreachable: {}", report.unreachable.len());
                for problem in &report.problems {
                    println!("  problem: {}", problem);
                }
            }
            if !report.is_healthy() {
                anyhow::bail!("cluster is not healthy");
            }
        }

        Commands::Simulate {
            nodes,
            down,
            total_slots,
            min_masters,
            replicas,
        } => {
            let cluster = Arc::new(LocalCluster::new(*total_slots));
            for i in 0..*nodes {
                cluster.add_node(format!("node-{:02}", i));
            }
            for i in down {
                cluster.set_down(&format!("node-{:02}", i), true);
            }

            let mut orchestrator = config.orchestrator.clone();
            orchestrator.total_slots = *total_slots;
            orchestrator.min_masters = *min_masters;
            orchestrator.replicas_per_master = *replicas;
            let controller =
                Controller::new(orchestrator, Arc::new(cluster.registry()), cluster.clone())?;
            let result = controller.run().await;
            print_run(&result, cli.json)?;
            finish(&result)?;
        }
    }

    Ok(())
}
