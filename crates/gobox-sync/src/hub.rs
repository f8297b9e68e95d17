//! # Relay Hub Server
//!
//! The WebSocket endpoint a storage node exposes to client nodes. Every
//! accepted connection gets its own [`EventTransport`] in server role, all
//! sharing one handler registry and one [`PeerSet`].
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Relay Hub Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      HubServer (Axum)                           │   │
//! │  │                                                                 │   │
//! │  │  /relay  ──▶ WebSocket upgrade ──▶ EventTransport (server role) │   │
//! │  │  /health ──▶ "OK"                        │                      │   │
//! │  │                                          ▼                      │   │
//! │  │                          ┌──────────────────────────┐           │   │
//! │  │                          │         PeerSet          │           │   │
//! │  │                          └────┬────────┬────────┬───┘           │   │
//! │  │                               ▼        ▼        ▼               │   │
//! │  │                          client #1 client #2 client #3          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Envelope routing:                                                     │
//! │  ─────────────────                                                     │
//! │  query (forServer)      → storage handler, reply to the sender only   │
//! │  event + broadcast      → every other peer, then local handler        │
//! │  event + forPeer        → every other peer only                        │
//! │  HubHandle::broadcast   → every peer                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{future, SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::registry::HandlerRegistry;
use crate::shutdown::signalled;
use crate::transport::{EventTransport, LinkRole, PeerSet, TransportOptions};

// =============================================================================
// Constants
// =============================================================================

/// Default relay port.
pub const DEFAULT_HUB_PORT: u16 = 7700;

/// Maximum envelope size (64MB, content travels base64 in fallback mode).
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// How long shutdown waits for the server task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Hub Configuration
// =============================================================================

/// Configuration for the hub server.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Port to listen on (0 picks a free port).
    pub port: u16,
    /// Bind address (default: 0.0.0.0).
    pub bind_addr: String,
    /// Options for each accepted connection's transport.
    pub transport: TransportOptions,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            port: DEFAULT_HUB_PORT,
            bind_addr: "0.0.0.0".to_string(),
            transport: TransportOptions::default().labelled("peer"),
        }
    }
}

impl HubConfig {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Hub State
// =============================================================================

struct HubState {
    registry: Arc<HandlerRegistry>,
    peers: PeerSet,
    transport: TransportOptions,
}

// =============================================================================
// Hub Server
// =============================================================================

/// The relay hub.
pub struct HubServer {
    config: HubConfig,
    state: Arc<HubState>,
}

/// Handle for controlling a running hub.
#[derive(Clone)]
pub struct HubHandle {
    local_addr: SocketAddr,
    peers: PeerSet,
    shutdown_tx: watch::Sender<bool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl HubHandle {
    /// Address the hub actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connected peers.
    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Returns the number of connected clients.
    pub fn client_count(&self) -> usize {
        self.peers.len()
    }

    /// Sends an event to every connected client.
    pub fn broadcast(&self, name: &str, payload: impl Serialize) -> SyncResult<usize> {
        if *self.shutdown_tx.borrow() {
            return Err(SyncError::ShuttingDown);
        }
        self.peers.broadcast(name, payload)
    }

    /// Stops accepting connections and closes every peer transport.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.peers.close_all();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Hub server did not stop within the grace period");
            }
        }
        info!("Hub server stopped");
    }
}

impl HubServer {
    /// Creates a new hub server.
    ///
    /// `peers` is shared with whoever else publishes to connected clients
    /// (the storage committer).
    pub fn new(config: HubConfig, registry: Arc<HandlerRegistry>, peers: PeerSet) -> Self {
        let state = Arc::new(HubState {
            registry,
            peers,
            transport: config.transport.clone(),
        });
        HubServer { config, state }
    }

    /// Binds the listener, starts serving and returns a handle.
    pub async fn start(self) -> SyncResult<HubHandle> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let app = Router::new()
            .route("/relay", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone());

        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Hub server started");

        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                signalled(&mut shutdown_rx).await;
                info!("Hub server shutting down");
            })
            .await;
            if let Err(e) = served {
                warn!(error = %e, "Hub server exited with error");
            }
        });

        Ok(HubHandle {
            local_addr,
            peers: self.state.peers.clone(),
            shutdown_tx,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!(addr = %addr, "New relay connection");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Attaches a server-role transport to an upgraded socket.
async fn handle_socket(socket: WebSocket, state: Arc<HubState>, addr: SocketAddr) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(SyncError::from)
        .with(|text: String| future::ready(Ok::<_, SyncError>(Message::Text(text.into()))));

    let stream = stream.filter_map(|item| {
        future::ready(match item {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary relay frame");
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(SyncError::from(e))),
        })
    });

    let transport = EventTransport::attach(
        stream,
        sink,
        state.registry.clone(),
        LinkRole::Server(state.peers.clone()),
        state.transport.clone().labelled(addr.to_string()),
    );

    let peers = state.peers.clone();
    transport.on_close(move || {
        info!(addr = %addr, remaining = peers.len(), "Relay peer disconnected");
    });
}
