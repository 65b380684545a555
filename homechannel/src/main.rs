//! HomeChannel coordinator
//!
//! Binds the agent UDP endpoint and the client WebSocket endpoint and relays
//! signaling between them until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use homechannel_lib::config::{load_json, CoordinatorConfig};
use homechannel_lib::coordinator::Coordinator;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "homechannel-coordinator", version, about)]
struct Args {
    /// Configuration file (defaults to <config_dir>/homechannel/coordinator.json)
    #[arg(short, long, env = "HOMECHANNEL_COORDINATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Override the WebSocket signaling address
    #[arg(long)]
    signaling_addr: Option<SocketAddr>,

    /// Override the agent UDP address
    #[arg(long)]
    agent_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config: CoordinatorConfig =
        load_json(args.config.as_deref(), "coordinator").context("loading configuration")?;
    if let Some(addr) = args.signaling_addr {
        config.signaling_addr = addr;
    }
    if let Some(addr) = args.agent_addr {
        config.agent_addr = addr;
    }
    config.validate().context("invalid configuration")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("[coordinator] Ctrl-C received, shutting down");
                signal.cancel();
            }
            Err(e) => warn!("[coordinator] cannot listen for Ctrl-C: {}", e),
        }
    });

    Coordinator::run(config, shutdown)
        .await
        .context("coordinator failed")
}
