//! HomeChannel Agent
//!
//! Shares allow-listed directories with clients that know the password.
//! Prints the public key clients must be given, registers with the
//! coordinator and answers offers until Ctrl-C.

mod fs;
mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use homechannel_lib::agent::{AgentIdentity, AgentRuntime};
use homechannel_lib::apps::{AppRegistry, ChannelRouter};
use homechannel_lib::config::{config_dir, load_json, AgentConfig};
use homechannel_lib::crypto::key_fingerprint;
use homechannel_lib::rtc::webrtc::WebRtcAnswerer;

use crate::fs::{FileService, FilesConfig, APP_NAME};

/// Agent configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AgentSettings {
    #[serde(flatten)]
    agent: AgentConfig,
    files: FilesConfig,
}

#[derive(Debug, Parser)]
#[command(name = "homechannel-agent", version, about)]
struct Args {
    /// Configuration file (defaults to <config_dir>/homechannel/agent.json)
    #[arg(short, long, env = "HOMECHANNEL_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Coordinator UDP endpoint, host:port
    #[arg(long)]
    coordinator: Option<String>,

    /// Password clients must prove knowledge of
    #[arg(long, env = "HOMECHANNEL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key file, created on first start
    #[arg(long)]
    key: Option<PathBuf>,

    /// Directory to share; may be repeated
    #[arg(long = "share")]
    shares: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings: AgentSettings =
        load_json(args.config.as_deref(), "agent").context("loading configuration")?;
    if let Some(addr) = args.coordinator {
        settings.agent.coordinator_addr = addr;
    }
    if let Some(password) = args.password {
        settings.agent.password = password;
    }
    if !args.shares.is_empty() {
        settings.files.roots = args.shares;
    }
    settings.agent.validate().context("invalid configuration")?;

    let key_path = match args.key {
        Some(p) => p,
        None => match &settings.agent.private_key_path {
            Some(p) => PathBuf::from(p),
            None => config_dir()
                .context("no configuration directory; pass --key")?
                .join("agent.pem"),
        },
    };
    let identity = AgentIdentity::load_or_create(&key_path, settings.agent.signature_algorithm)
        .context("loading agent key")?;
    println!("{}", identity.public_key());

    let files = FileService::new(&settings.files).context("opening shared directories")?;
    for root in files.roots() {
        info!("[agent] sharing {}", root.display());
    }
    let registry = AppRegistry::new();
    registry.register(APP_NAME, Arc::new(files.into_handler()))?;
    let router = Arc::new(ChannelRouter::new(Arc::new(registry)));

    let answerer = Arc::new(WebRtcAnswerer::new(settings.agent.ice_servers.clone()));
    info!(
        "[agent] starting as {}",
        key_fingerprint(&identity.public_key())
    );
    let runtime = Arc::new(AgentRuntime::new(
        settings.agent,
        Arc::new(identity),
        answerer,
        router,
    ));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("[agent] Ctrl-C received, shutting down");
                signal.cancel();
            }
            Err(e) => warn!("[agent] cannot listen for Ctrl-C: {}", e),
        }
    });

    runtime.run(shutdown).await.context("agent failed")
}
