//! # Sync Error Types
//!
//! Error types for transport, engine and direct transfer operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  InvalidUrl     │  │  TransportClosed│  │  MissingHandler         │ │
//! │  │  ConfigLoad/Save│  │  Timeout        │  │  DuplicateHandler       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Store        │  │     Remote      │  │      Direct             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Store(DbError) │  │  Remote{kind,   │  │  Unavailable            │ │
//! │  │  NotFound       │  │    message}     │  │  Unauthorized           │ │
//! │  │  InvalidState   │  │                 │  │  TlsError               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every variant maps onto an [`ErrorKind`]; that kind travels over the wire
//! in query error replies and drives the engine's retry decision.

use std::time::Duration;

use gobox_core::{CoreError, ErrorKind};
use gobox_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid relay or direct URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Could not reach the other side. Nothing was sent.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport closed; every query still pending fails with this.
    #[error("Transport closed")]
    TransportClosed,

    /// A query or connect attempt exceeded its deadline.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Envelope or payload that does not decode.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// An expected event or query name has no handler.
    #[error("No handler registered for '{0}'")]
    MissingHandler(String),

    /// A name was registered twice, or registered but not expected.
    #[error("Handler for '{0}' registered more than once or not expected")]
    DuplicateHandler(String),

    // =========================================================================
    // Tree Errors
    // =========================================================================
    /// Error from the local file-tree store.
    #[error(transparent)]
    Store(#[from] DbError),

    /// Domain validation failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A path or node the engine looked for is not there.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request does not fit the current state of the tree.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Error reported by the other side of a query, carried verbatim.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    // =========================================================================
    // Direct Transfer Errors
    // =========================================================================
    /// Direct channel could not be used; the caller falls back to the relay.
    #[error("Direct transfer unavailable: {0}")]
    Unavailable(String),

    /// Credential or session token rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // =========================================================================
    // Filesystem Errors
    // =========================================================================
    /// Local filesystem or watcher failure.
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The node is shutting down.
    #[error("Shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::TransportClosed,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<axum::Error> for SyncError {
    fn from(err: axum::Error) -> Self {
        SyncError::WebSocketError(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Filesystem(err.to_string())
    }
}

impl From<notify::Error> for SyncError {
    fn from(err: notify::Error) -> Self {
        SyncError::Filesystem(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<rustls::Error> for SyncError {
    fn from(err: rustls::Error) -> Self {
        SyncError::TlsError(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Wraps an error reported by a remote peer.
    pub fn remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        SyncError::Remote {
            kind,
            message: message.into(),
        }
    }

    /// A timeout after `limit`, in milliseconds (saturating).
    pub fn timeout(limit: Duration) -> Self {
        SyncError::Timeout(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
    }

    /// Taxonomy kind used on the wire and for retry decisions.
    ///
    /// ## Mapping
    /// ```text
    /// ConnectionFailed, Timeout, WebSocketError  → Transient
    /// TransportClosed, ShuttingDown              → TransportClosed
    /// Store / Core / Remote                      → their own kind
    /// configuration and protocol                 → InvalidRequest
    /// ```
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidConfig(_)
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_)
            | SyncError::InvalidMessage(_)
            | SyncError::SerializationFailed(_) => ErrorKind::InvalidRequest,

            SyncError::ConnectionFailed(_)
            | SyncError::Timeout(_)
            | SyncError::WebSocketError(_) => ErrorKind::Transient,

            SyncError::TransportClosed | SyncError::ShuttingDown => ErrorKind::TransportClosed,

            SyncError::Store(err) => err.kind(),
            SyncError::Core(err) => err.kind(),
            SyncError::Remote { kind, .. } => *kind,

            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::InvalidState(_) => ErrorKind::InvalidState,
            SyncError::Unavailable(_) | SyncError::TlsError(_) => ErrorKind::Unavailable,
            SyncError::Unauthorized(_) => ErrorKind::Unauthorized,

            SyncError::MissingHandler(_)
            | SyncError::DuplicateHandler(_)
            | SyncError::Filesystem(_)
            | SyncError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the operation can be retried as-is.
    ///
    /// Only transient conditions qualify. A query that failed with
    /// `TransportClosed` may already have been committed remotely, so it is
    /// not retried blindly.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Timeout(500).is_retryable());
        assert!(SyncError::Store(DbError::PoolExhausted).is_retryable());
        assert!(SyncError::remote(ErrorKind::Transient, "busy").is_retryable());

        assert!(!SyncError::TransportClosed.is_retryable());
        assert!(!SyncError::remote(ErrorKind::Conflict, "taken").is_retryable());
        assert!(!SyncError::Store(DbError::Corruption("cycle".into())).is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_timeout_saturates_instead_of_wrapping() {
        assert!(matches!(
            SyncError::timeout(Duration::from_millis(1500)),
            SyncError::Timeout(1500)
        ));
        assert!(matches!(SyncError::timeout(Duration::MAX), SyncError::Timeout(u64::MAX)));
    }

    #[test]
    fn test_store_errors_keep_their_kind() {
        let err = SyncError::from(DbError::conflict(0, "notes.txt"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("notes.txt"));
    }

    #[test]
    fn test_remote_message_is_verbatim() {
        let err = SyncError::remote(ErrorKind::Unauthorized, "credential already used");
        assert_eq!(err.to_string(), "credential already used");
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::InvalidUrl("x".into()).is_config_error());
        assert!(!SyncError::TransportClosed.is_config_error());
    }
}
