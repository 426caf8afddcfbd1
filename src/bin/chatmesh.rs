/// chatmesh - run or inspect a chat-mesh coordination node
///
/// Usage:
///   chatmesh start --server-id <id> --servers-conf <path>  - Run a node
///   chatmesh check --servers-conf <path>                   - Validate a server list
use anyhow::{Context, Result};
use chat_mesh::config::{ClusterConfig, Topology, parse_servers};
use chat_mesh::node::{ClusterStatus, CoordinatorNode};
use chat_mesh::types::ServerDescriptor;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;

/// Coordination node for a peer-to-peer chat backend.
#[derive(Parser)]
#[command(name = "chatmesh")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a coordination node
    ///
    /// Recovers cluster state from live neighbours, then serves peer
    /// coordination traffic until Ctrl+C.
    ///
    /// Example:
    ///   chatmesh start --server-id s1 --servers-conf servers.conf
    Start {
        /// Id of this server in the configuration file
        #[arg(short, long)]
        server_id: String,

        /// Path to the static server list
        #[arg(short = 'c', long)]
        servers_conf: PathBuf,

        /// Seconds between heartbeat rounds
        #[arg(long, default_value_t = 60)]
        heartbeat_secs: u64,
    },

    /// Validate a server list and print the derived priorities
    Check {
        /// Path to the static server list
        #[arg(short = 'c', long)]
        servers_conf: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Start {
            server_id,
            servers_conf,
            heartbeat_secs,
        } => run_node(&server_id, &servers_conf, heartbeat_secs).await,
        Commands::Check { servers_conf } => check_config(&servers_conf),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default = if verbose {
        "chat_mesh=debug,chatmesh=debug"
    } else {
        "chat_mesh=info,chatmesh=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Validate a configuration file.
fn check_config(path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let entries = parse_servers(&contents).context("Invalid server list")?;
    let first = entries
        .first()
        .map(|e| e.server_id.clone())
        .context("Server list is empty")?;

    // Splitting on any id runs the duplicate checks over the whole list.
    let topology = Topology::from_entries(entries, &first).context("Invalid server list")?;

    let mut servers: Vec<ServerDescriptor> = topology.neighbours.into_values().collect();
    servers.push(topology.current);
    servers.sort_by(|a, b| b.priority.cmp(&a.priority));

    println!("{}", "Server list OK".bold().green());
    println!();
    for server in &servers {
        println!(
            "  {} {:<10} {} {:<5} {} {}",
            "*".cyan(),
            server.server_id.bold(),
            "priority".bright_black(),
            server.priority,
            "coordination".bright_black(),
            server.coordination_addr()
        );
    }
    println!();
    println!(
        "{} {}",
        "Initial leader when all are up:".bright_white(),
        servers[0].server_id
    );
    Ok(())
}

async fn run_node(server_id: &str, servers_conf: &Path, heartbeat_secs: u64) -> Result<()> {
    let topology = Topology::load(servers_conf, server_id)
        .with_context(|| format!("Failed to load {}", servers_conf.display()))?;
    let config = ClusterConfig::new().heartbeat_interval(Duration::from_secs(heartbeat_secs.max(1)));

    let address = topology.current.coordination_addr();
    let node = CoordinatorNode::new(topology, config);

    println!("{}", "Starting chat-mesh node...".bold().cyan());
    println!();

    let outcome = node.start().await.context("Failed to start node")?;

    println!("  {} {}", "Server ID:".bright_white(), node.server_id());
    println!("  {} {}", "Coordination:".bright_white(), address);
    println!("  {} {}", "Leader:".bright_white(), outcome.leader);
    if !outcome.responders.is_empty() {
        println!(
            "  {} {}",
            "Neighbours up:".bright_white(),
            outcome.responders.join(", ")
        );
    }
    println!();
    println!("{}", "Node is running. Press Ctrl+C to stop.".green());
    println!();

    let report = async {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            print_status(&node.status().await);
        }
    };

    tokio::select! {
        _ = report => {}
        _ = signal::ctrl_c() => {
            println!();
            println!("{}", "Shutting down...".yellow());
        }
    }

    node.stop().await.context("Failed to stop node")?;
    println!("{}", "Node stopped.".green());
    Ok(())
}

fn print_status(status: &ClusterStatus) {
    let leader = match (&status.leader, status.is_leader) {
        (Some(_), true) => "self".green().to_string(),
        (Some(id), false) => id.clone(),
        (None, _) => "unknown".red().to_string(),
    };

    println!("{}", "Cluster status:".bright_black());
    println!("  {} {}", "Leader:".bright_white(), leader);
    println!("  {} [{}]", "View:".bright_white(), status.view.join(", "));
    println!(
        "  {} {} clients, {} rooms",
        "Registry:".bright_white(),
        status.global_clients,
        status.global_rooms
    );
    if status.pending_clients + status.pending_rooms > 0 {
        println!(
            "  {} {} clients, {} rooms",
            "Pending:".bright_white(),
            status.pending_clients,
            status.pending_rooms
        );
    }
    println!();
}
