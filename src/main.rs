//! loopnode CLI - edge node agent for the loopnode proxy network
//!
//! Registers this host with a gateway over a persistent WebSocket and
//! serves tunnel and proxy requests until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use loopnode_agent::{Agent, AgentConfig};

/// loopnode - residential proxy edge node
#[derive(Parser, Debug)]
#[command(name = "loopnode")]
#[command(about = "loopnode - residential proxy edge node")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the gateway and serve until interrupted
    #[command(long_about = r#"
Connect this host to a gateway and serve tunnel and proxy requests.
Reconnects automatically with exponential backoff and honors server
cooldowns; only Ctrl-C stops it.

EXAMPLES:
  # Connect with a generated, persisted node id
  loopnode run

  # Connect to a staging gateway with a fixed node id
  loopnode run --gateway wss://staging.example.io:9443/ws \
    --node-id "lab-node-3"

ENVIRONMENT VARIABLES:
  LOOPNODE_GATEWAY    Gateway WebSocket URL
  LOOPNODE_NODE_ID    Node identifier (optional)
  LOOPNODE_STATE_DIR  State directory (default ~/.loopnode)
    "#)]
    Run {
        /// Gateway WebSocket URL (ws:// or wss://)
        #[arg(long, env = "LOOPNODE_GATEWAY")]
        gateway: Option<String>,

        /// Stable node identifier; generated and persisted when omitted
        #[arg(long, env = "LOOPNODE_NODE_ID")]
        node_id: Option<String>,

        /// Device model string reported to the gateway
        #[arg(long)]
        device_model: Option<String>,

        /// Directory for persisted state
        #[arg(long, env = "LOOPNODE_STATE_DIR")]
        state_dir: Option<PathBuf>,

        /// Skip gateway certificate verification (development only)
        #[arg(long)]
        insecure: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            gateway,
            node_id,
            device_model,
            state_dir,
            insecure,
        } => {
            let mut config = AgentConfig::default().with_insecure_skip_verify(insecure);
            if let Some(gateway) = gateway {
                config = config.with_server_url(&gateway);
            }
            if let Some(node_id) = node_id {
                config = config.with_node_id(&node_id);
            }
            if let Some(device_model) = device_model {
                config = config.with_device_model(&device_model);
            }
            if let Some(state_dir) = state_dir {
                config = config.with_state_dir(state_dir);
            }

            let agent = Agent::new(config).context("Failed to initialize agent")?;
            info!(node_id = %agent.node_id(), "Node identity resolved");

            agent.start().await.context("Failed to start agent")?;

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Interrupt received, shutting down");

            agent.stop().await;

            let (connections, disconnections) = agent.connection_stats();
            info!(connections, disconnections, "Done");
        }
    }

    Ok(())
}
