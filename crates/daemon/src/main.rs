/// CareLedger Daemon
///
/// Runs one ledger node: it joins its configured peers over QUIC, keeps the
/// shared chain in sync and serves the operator API on localhost.

use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use careledger_common::NodeConfig;
use careledger_core::{Node, NodeStats};
use careledger_daemon::ApiServer;

const DEFAULT_CONFIG_PATH: &str = "careledger.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("help" | "--help" | "-h") => print_help(),
        Some("version" | "--version" | "-v") => {
            println!("CareLedger Daemon v{}", env!("CARGO_PKG_VERSION"));
        }
        Some("node") | None => {
            let config_path = args
                .get(2)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
            run_node(config_path).await?;
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Load the configuration, or write the defaults there for next time
fn load_config(path: &PathBuf) -> Result<NodeConfig> {
    if path.exists() {
        info!("Loading configuration from {:?}", path);
        return Ok(NodeConfig::from_file(path)?);
    }

    info!("No configuration file found, using defaults");
    let config = NodeConfig::default();
    if let Err(e) = config.to_file(path) {
        warn!("Failed to save default config: {}", e);
    } else {
        info!("Saved default configuration to {:?}", path);
    }
    Ok(config)
}

async fn run_node(config_path: PathBuf) -> Result<()> {
    info!("Starting CareLedger Daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&config_path)?;
    let api_addr = SocketAddr::from(([127, 0, 0, 1], config.api_port));

    let mut node = Node::new(config).await?;
    node.start().await?;
    let node = Arc::new(node);

    let api_server = ApiServer::new(api_addr, node.clone());
    tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            warn!("API server error: {}", e);
        }
    });

    print_node_stats(&node.stats().await, api_addr);

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    node.stop().await?;

    info!("Node stopped");
    Ok(())
}

fn print_node_stats(stats: &NodeStats, api_addr: SocketAddr) {
    let listen = stats
        .listen_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    println!("\n========================================");
    println!("         CareLedger Node Status");
    println!("========================================");
    println!("Node:             {}", stats.node_name);
    println!("Account:          {} ({})", stats.account, stats.role);
    println!("Status:           {}", if stats.is_running { "Running" } else { "Stopped" });
    println!("Peer listener:    {}", listen);
    println!("API:              http://{}", api_addr);
    println!("Chain length:     {}", stats.chain_length);
    println!("Tip:              {}", stats.tip_hash);
    println!("Pending:          {}", stats.pending);
    println!("Peers:            {}", stats.peer_count);
    println!("========================================\n");
}

fn print_help() {
    println!("CareLedger Daemon - healthcare e-cash ledger node");
    println!();
    println!("USAGE:");
    println!("    careledger-daemon [COMMAND] [CONFIG]");
    println!();
    println!("COMMANDS:");
    println!("    node        Run a ledger node (default)");
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("CONFIG:");
    println!("    Path to a TOML node configuration (default: {})", DEFAULT_CONFIG_PATH);
    println!("    A default file is written there if it does not exist.");
    println!();
    println!("EXAMPLES:");
    println!("    # Clinic, lab and pharmacy on one host");
    println!("    careledger-daemon node clinic.toml");
    println!("    careledger-daemon node lab.toml");
    println!("    careledger-daemon node pharmacy.toml");
    println!();
    println!("    # Drive a node");
    println!("    curl -X POST localhost:7480/api/workflow/register \\");
    println!("         -H 'content-type: application/json' -d '{{\"patient_name\":\"Jane Roe\"}}'");
    println!("    curl -X POST localhost:7480/api/mine");
}
