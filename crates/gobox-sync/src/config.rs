//! # Node Configuration
//!
//! Configuration for a Gobox node, built once at process start and shared.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     GOBOX_ROLE=client                                                  │
//! │     GOBOX_RELAY_URL=ws://relay:7700/relay                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/gobox/gobox.toml (Linux)                                 │
//! │     ~/Library/Application Support/io.gobox.gobox/gobox.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [node]
//! role = "storage"   # storage | client
//! name = "nas"
//!
//! [storage]
//! root = "/srv/gobox"
//!
//! [relay]
//! url = "ws://relay.example:7700/relay"   # clients only
//! hub_port = 7700                         # storage only
//!
//! [sync]
//! echo_window_ms = 2000
//!
//! [direct]
//! enabled = true
//! port = 7443
//! discovery_port = 7701
//! ```
//!
//! ## Sharing
//! [`SharedConfig`] wraps the loaded [`GoboxConfig`]. Components read a
//! snapshot with [`SharedConfig::get`]; [`SharedConfig::update`] validates
//! a change, swaps it in and notifies every subscribed listener.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gobox_db::DbConfig;

use crate::connector::ConnectorConfig;
use crate::discovery::{broadcast_target, DEFAULT_DISCOVERY_PORT};
use crate::engine::fsops::INTERNAL_DIR;
use crate::engine::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::hub::{HubConfig, DEFAULT_HUB_PORT};
use crate::transport::TransportOptions;

// =============================================================================
// Node Role
// =============================================================================

/// Which side of the relay this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Owns the authoritative tree and runs the relay hub.
    #[default]
    Storage,

    /// Mirrors the tree through the relay.
    Client,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Storage => write!(f, "storage"),
            NodeRole::Client => write!(f, "client"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "storage" | "server" => Ok(NodeRole::Storage),
            "client" => Ok(NodeRole::Client),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown node role: '{}'. Valid options: storage, client",
                other
            ))),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default)]
    pub role: NodeRole,

    /// Human-readable node name, used in logs and the TLS certificate.
    #[serde(default = "default_node_name")]
    pub name: String,
}

fn default_node_name() -> String {
    "gobox".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            role: NodeRole::default(),
            name: default_node_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory kept in sync.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Tree database. Default: `<root>/.gobox/gobox.db`
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_root() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join("Gobox"))
        .unwrap_or_else(|| PathBuf::from("gobox"))
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            root: default_root(),
            db_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Relay WebSocket URL (client role).
    #[serde(default)]
    pub url: Option<String>,

    /// Hub listening port (storage role). 0 picks a free port.
    #[serde(default = "default_hub_port")]
    pub hub_port: u16,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Deadline per query (seconds). 0 waits until response or close.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum reconnection attempts. 0 retries forever.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_hub_port() -> u16 {
    DEFAULT_HUB_PORT
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_query_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings {
            url: None,
            hub_port: default_hub_port(),
            bind_addr: default_bind_addr(),
            query_timeout_secs: default_query_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// How long the engine remembers what it wrote to a path.
    #[serde(default = "default_echo_window")]
    pub echo_window_ms: u64,

    /// Upper bound on retrying one transient failure.
    #[serde(default = "default_retry_max_elapsed")]
    pub retry_max_elapsed_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_echo_window() -> u64 {
    2000
}

fn default_retry_max_elapsed() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            echo_window_ms: default_echo_window(),
            retry_max_elapsed_secs: default_retry_max_elapsed(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Direct transfer settings.
///
/// ```text
/// storage role                       client role
/// ────────────                       ───────────
/// port, bind_addr   HTTPS listener   probe_target, probe_timeout_ms
/// discovery_port    UDP responder    discovery_port (probe destination)
/// credential_ttl    grant lifetime   cooldown_secs after a failed attempt
/// session_*         JWT sessions
/// public_ip         sent in grants
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTPS port. 0 picks a free port.
    #[serde(default = "default_direct_port")]
    pub port: u16,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Probe destination. Default: broadcast on `discovery_port`.
    #[serde(default)]
    pub probe_target: Option<String>,

    #[serde(default = "default_credential_ttl")]
    pub credential_ttl_secs: u64,

    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Session signing secret. Default: random per process.
    #[serde(default)]
    pub session_secret: Option<String>,

    /// Address advertised in grants.
    #[serde(default)]
    pub public_ip: Option<String>,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_direct_port() -> u16 {
    7443
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_probe_timeout() -> u64 {
    500
}

fn default_credential_ttl() -> u64 {
    60
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_cooldown() -> u64 {
    60
}

impl Default for DirectSettings {
    fn default() -> Self {
        DirectSettings {
            enabled: true,
            port: default_direct_port(),
            bind_addr: default_bind_addr(),
            discovery_port: default_discovery_port(),
            probe_timeout_ms: default_probe_timeout(),
            probe_target: None,
            credential_ttl_secs: default_credential_ttl(),
            session_ttl_secs: default_session_ttl(),
            session_secret: None,
            public_ip: None,
            cooldown_secs: default_cooldown(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoboxConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub direct: DirectSettings,
}

impl GoboxConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (gobox.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(path = %path.display(), "Loading config from file");
                let contents = std::fs::read_to_string(&path).map_err(|e| {
                    SyncError::ConfigLoadFailed(format!("{}: {}", path.display(), e))
                })?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(path = %path.display(), "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides(std::env::vars().collect());
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration as pretty TOML.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(SyncError::InvalidConfig("storage.root must be set".into()));
        }

        match (&self.node.role, &self.relay.url) {
            (NodeRole::Client, None) => {
                return Err(SyncError::InvalidConfig(
                    "relay.url is required for client nodes".into(),
                ))
            }
            (_, Some(url)) if !url.starts_with("ws://") && !url.starts_with("wss://") => {
                return Err(SyncError::InvalidUrl(format!(
                    "Relay URL must start with ws:// or wss://, got: {}",
                    url
                )))
            }
            _ => {}
        }

        if self.sync.queue_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.queue_capacity must be greater than 0".into(),
            ));
        }
        if self.direct.probe_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "direct.probe_timeout_ms must be greater than 0".into(),
            ));
        }
        if let Some(target) = &self.direct.probe_target {
            target.parse::<SocketAddr>().map_err(|_| {
                SyncError::InvalidConfig(format!("direct.probe_target is not ip:port: {}", target))
            })?;
        }
        if let Some(ip) = &self.direct.public_ip {
            ip.parse::<IpAddr>().map_err(|_| {
                SyncError::InvalidConfig(format!("direct.public_ip is not an address: {}", ip))
            })?;
        }
        Ok(())
    }

    /// Applies `GOBOX_*` overrides. Unparseable values are logged and
    /// ignored.
    fn apply_env_overrides(&mut self, vars: BTreeMap<String, String>) {
        fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
            let parsed = value.parse().ok();
            if parsed.is_none() {
                warn!(key, value, "Ignoring unparseable environment override");
            }
            parsed
        }

        for (key, value) in &vars {
            match key.as_str() {
                "GOBOX_ROLE" => {
                    if let Some(role) = parsed(key, value) {
                        debug!(role = %value, "Overriding role from environment");
                        self.node.role = role;
                    }
                }
                "GOBOX_NODE_NAME" => self.node.name = value.clone(),
                "GOBOX_ROOT" => self.storage.root = PathBuf::from(value),
                "GOBOX_DB_PATH" => self.storage.db_path = Some(PathBuf::from(value)),
                "GOBOX_RELAY_URL" => {
                    debug!(url = %value, "Overriding relay URL from environment");
                    self.relay.url = Some(value.clone());
                }
                "GOBOX_HUB_PORT" => {
                    if let Some(port) = parsed(key, value) {
                        self.relay.hub_port = port;
                    }
                }
                "GOBOX_DIRECT_ENABLED" => {
                    if let Some(enabled) = parsed(key, value) {
                        self.direct.enabled = enabled;
                    }
                }
                "GOBOX_DIRECT_PORT" => {
                    if let Some(port) = parsed(key, value) {
                        self.direct.port = port;
                    }
                }
                "GOBOX_DISCOVERY_PORT" => {
                    if let Some(port) = parsed(key, value) {
                        self.direct.discovery_port = port;
                    }
                }
                "GOBOX_PUBLIC_IP" => self.direct.public_ip = Some(value.clone()),
                "GOBOX_SESSION_SECRET" => self.direct.session_secret = Some(value.clone()),
                _ => {}
            }
        }
    }

    /// `gobox.toml` in the platform config directory.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "gobox", "gobox")
            .map(|dirs| dirs.config_dir().join("gobox.toml"))
    }

    // =========================================================================
    // Component Settings
    // =========================================================================

    pub fn db_config(&self) -> DbConfig {
        let path = self
            .storage
            .db_path
            .clone()
            .unwrap_or_else(|| self.storage.root.join(INTERNAL_DIR).join("gobox.db"));
        DbConfig::new(path)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(&self.storage.root);
        config.echo_window = Duration::from_millis(self.sync.echo_window_ms);
        config.retry_max_elapsed = Duration::from_secs(self.sync.retry_max_elapsed_secs);
        config.queue_capacity = self.sync.queue_capacity;
        config
    }

    fn transport_options(&self, label: &str) -> TransportOptions {
        let timeout = (self.relay.query_timeout_secs > 0)
            .then(|| Duration::from_secs(self.relay.query_timeout_secs));
        TransportOptions::default()
            .labelled(label)
            .query_timeout(timeout)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            port: self.relay.hub_port,
            bind_addr: self.relay.bind_addr.clone(),
            transport: self.transport_options("peer"),
        }
    }

    /// Connector settings; `None` without a relay URL.
    pub fn connector_config(&self) -> Option<ConnectorConfig> {
        let url = self.relay.url.clone()?;
        Some(ConnectorConfig {
            url,
            connect_timeout: Duration::from_secs(self.relay.connect_timeout_secs),
            max_retries: self.relay.max_retries,
            transport: self.transport_options("relay"),
            ..Default::default()
        })
    }

    pub fn direct_bind(&self) -> SyncResult<SocketAddr> {
        format!("{}:{}", self.direct.bind_addr, self.direct.port)
            .parse()
            .map_err(|_| SyncError::InvalidConfig("direct.bind_addr is not an address".into()))
    }

    pub fn discovery_bind(&self) -> SyncResult<SocketAddr> {
        format!("{}:{}", self.direct.bind_addr, self.direct.discovery_port)
            .parse()
            .map_err(|_| SyncError::InvalidConfig("direct.bind_addr is not an address".into()))
    }

    /// Where client probes go.
    pub fn probe_target(&self) -> SocketAddr {
        self.direct
            .probe_target
            .as_deref()
            .and_then(|target| target.parse().ok())
            .unwrap_or_else(|| broadcast_target(self.direct.discovery_port))
    }
}

// =============================================================================
// Shared Configuration
// =============================================================================

/// Identifies a subscribed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&GoboxConfig) + Send + Sync>;

struct SharedInner {
    current: RwLock<Arc<GoboxConfig>>,
    listeners: RwLock<BTreeMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

/// The process-wide configuration, passed to components explicitly.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<SharedInner>,
}

impl SharedConfig {
    pub fn new(config: GoboxConfig) -> Self {
        SharedConfig {
            inner: Arc::new(SharedInner {
                current: RwLock::new(Arc::new(config)),
                listeners: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<GoboxConfig> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Registers `listener`, called with the new config after each update.
    pub fn subscribe(&self, listener: impl Fn(&GoboxConfig) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Arc::new(listener));
        id
    }

    /// Returns whether `id` was subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Applies `change` to a copy, validates it, swaps it in and notifies
    /// listeners. An invalid result leaves the current config untouched.
    pub fn update(&self, change: impl FnOnce(&mut GoboxConfig)) -> SyncResult<Arc<GoboxConfig>> {
        let mut next = (*self.get()).clone();
        change(&mut next);
        next.validate()?;

        let next = Arc::new(next);
        *self.inner.current.write().unwrap_or_else(|p| p.into_inner()) = next.clone();

        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&next);
        }
        debug!("Configuration updated");
        Ok(next)
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("config", &self.get())
            .finish_non_exhaustive()
    }
}
