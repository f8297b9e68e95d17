//! Shared fixtures for the node-level scenarios.
//!
//! Every node binds loopback port 0 and keeps its tree in a temporary
//! directory, so scenarios can run side by side.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use gobox_sync::{
    channels, ClientNode, ConnectorConfig, ConnectorHandle, EventTransport, Expected,
    GoboxConfig, NodeRole, RegistryBuilder, RelayConnector, SharedConfig, StorageNode,
};

pub const SETTLE: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn storage_config(root: &Path, direct: bool) -> GoboxConfig {
    let mut config = GoboxConfig::default();
    config.node.role = NodeRole::Storage;
    config.node.name = "storage".into();
    config.storage.root = root.to_path_buf();
    config.relay.bind_addr = "127.0.0.1".into();
    config.relay.hub_port = 0;
    config.relay.query_timeout_secs = 10;
    config.sync.retry_max_elapsed_secs = 5;
    config.direct.enabled = direct;
    config.direct.bind_addr = "127.0.0.1".into();
    config.direct.port = 0;
    config.direct.discovery_port = 0;
    config
}

pub fn client_config(root: &Path, hub: SocketAddr) -> GoboxConfig {
    let mut config = GoboxConfig::default();
    config.node.role = NodeRole::Client;
    config.node.name = "client".into();
    config.storage.root = root.to_path_buf();
    config.relay.url = Some(relay_url(hub));
    config.relay.query_timeout_secs = 10;
    config.relay.connect_timeout_secs = 5;
    config.sync.retry_max_elapsed_secs = 5;
    config.direct.enabled = false;
    config
}

pub fn relay_url(hub: SocketAddr) -> String {
    format!("ws://{}/relay", hub)
}

pub struct Storage {
    pub dir: TempDir,
    pub node: StorageNode,
}

impl Storage {
    pub async fn start(direct: bool) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let config = storage_config(dir.path(), direct);
        let node = StorageNode::start(SharedConfig::new(config)).await.unwrap();
        Storage { dir, node }
    }

    pub fn hub(&self) -> SocketAddr {
        self.node.hub_addr().unwrap()
    }
}

pub struct Client {
    pub dir: TempDir,
    pub node: ClientNode,
}

impl Client {
    pub async fn start(hub: SocketAddr) -> Self {
        Self::start_with(hub, |_| {}).await
    }

    pub async fn start_with(hub: SocketAddr, tweak: impl FnOnce(&mut GoboxConfig)) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut config = client_config(dir.path(), hub);
        tweak(&mut config);
        let node = ClientNode::start(SharedConfig::new(config)).await.unwrap();
        Client { dir, node }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// A bare relay peer that ignores sync events.
pub async fn raw_peer(hub: SocketAddr) -> (ConnectorHandle, EventTransport) {
    let registry = RegistryBuilder::new()
        .on_event(channels::SYNC_EVENT, |_| async { Ok(()) })
        .build(&Expected {
            events: channels::CLIENT_EVENTS,
            queries: &[],
        })
        .unwrap();
    let config = ConnectorConfig {
        url: relay_url(hub),
        ..Default::default()
    };
    let handle = RelayConnector::spawn(config, Arc::new(registry));
    let transport = handle.connected(Duration::from_secs(5)).await.unwrap();
    (handle, transport)
}

/// Polls `check` until it holds or `limit` runs out.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Reads a file, `None` while it does not exist.
pub async fn read(path: &Path) -> Option<Vec<u8>> {
    tokio::fs::read(path).await.ok()
}
