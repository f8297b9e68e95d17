//! # Relay Connector
//!
//! WebSocket client for the relay, with automatic reconnection and backoff.
//! Every established link gets a fresh [`EventTransport`]; the previous one
//! is closed, which fails whatever queries were still pending on it.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Relay Connection States                              │
//! │                                                                         │
//! │  ┌────────────┐    spawn()      ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              │ transport  │  └─────┬──────┘                   │
//! │        │              │ published  │        │                           │
//! │        │              └─────┬──────┘        │  timer expired            │
//! │        │             transport closed       │                           │
//! │        │                    ▼               │                           │
//! │        │              ┌────────────┐        │                           │
//! │        └── shutdown ─ │Reconnecting│ ◄──────┘                          │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  BACKOFF: 500ms, 1s, 2s, … capped at max_backoff                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::registry::HandlerRegistry;
use crate::shutdown::signalled;
use crate::transport::{EventTransport, LinkRole, TransportOptions};

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the relay client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting before reconnection attempt.
    Backoff,
    /// Reconnection in progress.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Connector Configuration
// =============================================================================

/// Configuration for the relay connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Relay WebSocket URL, e.g. `ws://relay:7700/relay`.
    pub url: String,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Maximum consecutive failed attempts (0 = infinite).
    pub max_retries: u32,

    /// Options for each transport attached to an established link.
    pub transport: TransportOptions,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_retries: 0, // Infinite
            transport: TransportOptions::default().labelled("relay"),
        }
    }
}

// =============================================================================
// Connector Handle
// =============================================================================

/// Handle to a running connector.
#[derive(Clone)]
pub struct ConnectorHandle {
    state: Arc<RwLock<ConnectionState>>,
    current: watch::Receiver<Option<EventTransport>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectorHandle {
    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Returns true if currently connected.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// The live transport, if any.
    pub fn transport(&self) -> Option<EventTransport> {
        self.current
            .borrow()
            .clone()
            .filter(|transport| !transport.is_closed())
    }

    /// Receives every newly published transport (and `None` on loss).
    pub fn subscribe(&self) -> watch::Receiver<Option<EventTransport>> {
        self.current.clone()
    }

    /// Waits until a transport is available.
    pub async fn connected(&self, limit: Duration) -> SyncResult<EventTransport> {
        let mut current = self.current.clone();
        let wait = async move {
            let live = current
                .wait_for(|t| t.as_ref().is_some_and(|t| !t.is_closed()))
                .await;
            live.map(|t| t.clone())
        };
        match timeout(limit, wait).await {
            Ok(Ok(transport)) => transport.ok_or(SyncError::TransportClosed),
            Ok(Err(_)) => Err(SyncError::ShuttingDown),
            Err(_) => Err(SyncError::timeout(limit)),
        }
    }

    /// Stops reconnecting and closes the live transport. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(transport) = self.current.borrow().clone() {
            transport.close();
        }
    }
}

// =============================================================================
// Relay Connector
// =============================================================================

/// WebSocket relay client with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let config = ConnectorConfig {
///     url: "ws://relay.local:7700/relay".into(),
///     ..Default::default()
/// };
///
/// let handle = RelayConnector::spawn(config, registry);
/// let transport = handle.connected(Duration::from_secs(10)).await?;
/// let children: Vec<FileNode> = transport.request("listChildren", NodeIdRequest { id: 0 }).await?;
/// ```
pub struct RelayConnector {
    config: ConnectorConfig,
    registry: Arc<HandlerRegistry>,
    state: Arc<RwLock<ConnectionState>>,
    current: watch::Sender<Option<EventTransport>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayConnector {
    /// Creates a connector and spawns its background task.
    pub fn spawn(config: ConnectorConfig, registry: Arc<HandlerRegistry>) -> ConnectorHandle {
        let (current_tx, current_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let connector = RelayConnector {
            config,
            registry,
            state: state.clone(),
            current: current_tx,
            shutdown_rx,
        };

        tokio::spawn(connector.run());

        ConnectorHandle {
            state,
            current: current_rx,
            shutdown_tx,
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Main connector loop.
    async fn run(mut self) {
        info!(url = %self.config.url, "Relay connector starting");

        let mut backoff = self.create_backoff();
        let mut retry_count = 0u32;

        loop {
            if self.is_shutting_down() {
                break;
            }

            *self.state.write().await = ConnectionState::Connecting;

            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!(url = %self.config.url, "Relay connected");
                    backoff.reset();
                    retry_count = 0;

                    let (stream, sink) = websocket_link(ws_stream);
                    let transport = EventTransport::attach(
                        stream,
                        sink,
                        self.registry.clone(),
                        LinkRole::Client,
                        self.config.transport.clone(),
                    );

                    *self.state.write().await = ConnectionState::Connected;
                    self.current.send_replace(Some(transport.clone()));

                    tokio::select! {
                        _ = transport.closed() => warn!("Relay link lost"),
                        _ = signalled(&mut self.shutdown_rx) => {
                            info!("Shutdown signal received, closing relay link");
                            transport.close();
                        }
                    }
                    self.current.send_replace(None);
                }
                Err(e) => {
                    error!(error = %e, url = %self.config.url, "Failed to connect to relay");
                }
            }

            if self.is_shutting_down() {
                break;
            }

            *self.state.write().await = ConnectionState::Backoff;

            if self.config.max_retries > 0 {
                retry_count += 1;
                if retry_count >= self.config.max_retries {
                    error!(
                        max_retries = self.config.max_retries,
                        "Max reconnection attempts reached"
                    );
                    break;
                }
            }

            if let Some(duration) = backoff.next_backoff() {
                debug!(?duration, attempt = retry_count, "Waiting before reconnect");

                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        *self.state.write().await = ConnectionState::Reconnecting;
                    }
                    _ = signalled(&mut self.shutdown_rx) => {
                        info!("Shutdown during backoff");
                        break;
                    }
                }
            } else {
                error!("Backoff exhausted");
                break;
            }
        }

        *self.state.write().await = ConnectionState::Disconnected;
        self.current.send_replace(None);
        info!("Relay connector stopped");
    }

    async fn connect_with_timeout(
        &self,
    ) -> SyncResult<WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
        match timeout(self.config.connect_timeout, connect_async(self.config.url.as_str())).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::timeout(self.config.connect_timeout)),
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Relay Link
// =============================================================================

/// Where callers find the transport to the storage node.
#[derive(Clone)]
pub enum RelayLink {
    /// A single transport, e.g. an in-memory pair.
    Fixed(EventTransport),
    /// Whatever transport the connector currently holds.
    Connector(ConnectorHandle),
}

impl RelayLink {
    /// The live transport. Being disconnected is transient: the connector
    /// is expected to come back.
    pub fn current(&self) -> SyncResult<EventTransport> {
        let transport = match self {
            RelayLink::Fixed(transport) => Some(transport.clone()).filter(|t| !t.is_closed()),
            RelayLink::Connector(handle) => handle.transport(),
        };
        transport.ok_or_else(|| SyncError::ConnectionFailed("relay not connected".into()))
    }
}

impl From<EventTransport> for RelayLink {
    fn from(transport: EventTransport) -> Self {
        RelayLink::Fixed(transport)
    }
}

// =============================================================================
// WebSocket Link Adapter
// =============================================================================

/// Splits a tungstenite WebSocket into the text stream and sink a
/// transport attaches to. Binary frames are ignored; pings are answered by
/// tungstenite itself.
pub fn websocket_link<S>(
    ws: WebSocketStream<S>,
) -> (
    impl Stream<Item = SyncResult<String>> + Send + Unpin + 'static,
    impl Sink<String, Error = SyncError> + Send + Unpin + 'static,
)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink
        .sink_map_err(SyncError::from)
        .with(|text: String| future::ready(Ok::<_, SyncError>(WsMessage::Text(text.into()))));

    let stream = stream.filter_map(|item| {
        future::ready(match item {
            Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(WsMessage::Binary(_)) => {
                warn!("Received unexpected binary message");
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(SyncError::from(e))),
        })
    });

    (stream, sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_connector_config_default() {
        let config = ConnectorConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 0); // Infinite
        assert_eq!(config.transport.label, "relay");
    }

    #[tokio::test]
    async fn test_unreachable_relay_gives_up_after_max_retries() {
        let handle = RelayConnector::spawn(
            ConnectorConfig {
                url: "ws://127.0.0.1:1/relay".into(),
                connect_timeout: Duration::from_millis(200),
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
                max_retries: 2,
                ..Default::default()
            },
            Arc::new(HandlerRegistry::empty()),
        );

        let err = handle.connected(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown | SyncError::Timeout(_)));
        assert!(handle.transport().is_none());
        handle.shutdown();
    }
}
