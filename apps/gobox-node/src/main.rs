//! # Gobox Node
//!
//! Runs one Gobox node, storage or client, until asked to stop.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            gobox-node                                   │
//! │                                                                         │
//! │  gobox.toml + GOBOX_* ──► GoboxConfig ──► StorageNode | ClientNode      │
//! │                                                │                        │
//! │  Ctrl+C / SIGTERM ─────────────────────────────┴──► shutdown (ordered)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage:
//!   gobox-node --config ./gobox.toml
//!   gobox-node --role client --relay ws://storage:7700/relay --root ~/Gobox

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gobox_sync::{ClientNode, GoboxConfig, NodeRole, NodeStatus, SharedConfig, StorageNode};

#[derive(Parser, Debug)]
#[command(name = "gobox-node")]
#[command(about = "Gobox storage or client node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "GOBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Override node.role (storage or client)
    #[arg(long)]
    role: Option<NodeRole>,

    /// Override storage.root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Override relay.url
    #[arg(long)]
    relay: Option<String>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,

    /// Seconds between status log lines (0 disables)
    #[arg(long, default_value = "60")]
    status_interval: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Command line settings applied on top of the file and environment.
#[derive(Debug, Clone)]
struct Overrides {
    role: Option<NodeRole>,
    root: Option<PathBuf>,
    relay: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut GoboxConfig) {
        if let Some(role) = self.role {
            config.node.role = role;
        }
        if let Some(root) = &self.root {
            config.storage.root = root.clone();
        }
        if let Some(relay) = &self.relay {
            config.relay.url = Some(relay.clone());
        }
    }
}

enum Node {
    Storage(StorageNode),
    Client(ClientNode),
}

impl Node {
    async fn start(config: SharedConfig) -> Result<Self> {
        let role = config.get().node.role;
        let node = match role {
            NodeRole::Storage => Node::Storage(
                StorageNode::start(config)
                    .await
                    .context("Failed to start storage node")?,
            ),
            NodeRole::Client => Node::Client(
                ClientNode::start(config)
                    .await
                    .context("Failed to start client node")?,
            ),
        };
        Ok(node)
    }

    async fn status(&self) -> NodeStatus {
        match self {
            Node::Storage(node) => node.status(),
            Node::Client(node) => node.status().await,
        }
    }

    async fn shutdown(&self) {
        match self {
            Node::Storage(node) => node.shutdown().await,
            Node::Client(node) => node.shutdown().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose.
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(true)
        .init();

    info!("Starting Gobox node...");

    let mut config =
        GoboxConfig::load(args.config.clone()).context("Failed to load configuration")?;
    let overrides = Overrides {
        role: args.role,
        root: args.root,
        relay: args.relay,
    };
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if args.write_config {
        config
            .save(args.config)
            .context("Failed to write configuration")?;
        info!("Configuration written");
        return Ok(());
    }

    info!(
        role = %config.node.role,
        root = %config.storage.root.display(),
        relay = config.relay.url.as_deref().unwrap_or("-"),
        direct = config.direct.enabled,
        "Configuration loaded"
    );

    let config_path = args.config;
    let shared = SharedConfig::new(config);
    let started = shared.get();
    let listener = shared.subscribe(move |config| {
        if *config == *started {
            info!("Configuration reloaded, nothing changed");
        } else {
            warn!("Configuration changed on disk; restart the node to apply it");
        }
    });

    let node = Node::start(shared.clone()).await?;
    run_until_shutdown(&node, &shared, config_path, &overrides, args.status_interval).await;

    shared.unsubscribe(listener);
    node.shutdown().await;
    info!("Node shutdown complete");
    Ok(())
}

/// Logs status periodically and reloads the configuration on SIGHUP until
/// a shutdown signal arrives.
async fn run_until_shutdown(
    node: &Node,
    shared: &SharedConfig,
    config_path: Option<PathBuf>,
    overrides: &Overrides,
    status_interval: u64,
) {
    let signal = shutdown_signal();
    tokio::pin!(signal);

    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    ticker.tick().await;
    let mut reload = ReloadSignal::install();

    loop {
        tokio::select! {
            _ = &mut signal => return,
            _ = reload.recv() => {
                match GoboxConfig::load(config_path.clone()) {
                    Ok(mut fresh) => {
                        overrides.apply(&mut fresh);
                        if let Err(e) = shared.update(|config| *config = fresh) {
                            warn!(error = %e, "Reloaded configuration rejected");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to reload configuration"),
                }
            }
            _ = ticker.tick(), if status_interval > 0 => {
                let status = node.status().await;
                info!(
                    role = %status.role,
                    connection = %status.connection,
                    peers = status.peers,
                    pending = status.pending,
                    last_error = status.last_error.as_deref().unwrap_or("-"),
                    "Node status"
                );
            }
        }
    }
}

/// SIGHUP on unix; never fires elsewhere.
struct ReloadSignal {
    #[cfg(unix)]
    inner: Option<tokio::signal::unix::Signal>,
}

impl ReloadSignal {
    fn install() -> Self {
        #[cfg(unix)]
        {
            let inner = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .map_err(|e| warn!(error = %e, "Failed to install SIGHUP handler"))
                .ok();
            ReloadSignal { inner }
        }
        #[cfg(not(unix))]
        {
            ReloadSignal {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if let Some(signal) = self.inner.as_mut() {
                if signal.recv().await.is_some() {
                    return;
                }
            }
        }
        std::future::pending::<()>().await
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
