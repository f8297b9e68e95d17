//! # gobox-sync: Transport, Sync Engine and Direct Transfer for Gobox
//!
//! This crate keeps a tree of files consistent between one authoritative
//! storage node and any number of client nodes, talking through a relay.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Gobox Sync Architecture                        │
//! │                                                                         │
//! │  CLIENT NODE                         STORAGE NODE                       │
//! │  ───────────                         ────────────                       │
//! │  ┌────────────────┐                  ┌────────────────┐                 │
//! │  │  FsWatcher     │                  │  FsWatcher     │                 │
//! │  └───────┬────────┘                  └───────┬────────┘                 │
//! │          ▼                                   ▼                          │
//! │  ┌────────────────┐   createNode …   ┌────────────────┐                 │
//! │  │  SyncEngine    │═════ relay ═════▶│  SyncEngine    │                 │
//! │  │  (mirror db)   │◀════════════════ │  Committer     │                 │
//! │  └───────┬────────┘    syncEvent     │  (tree db)     │                 │
//! │          │                           └───────┬────────┘                 │
//! │          │        ┌─────────────────────┐    │                          │
//! │          └───────▶│ EventTransport      │◀───┘ HubServer (/relay)       │
//! │   RelayConnector  │ events + correlated │                               │
//! │                   │ queries, one socket │                               │
//! │                   └─────────────────────┘                               │
//! │                                                                         │
//! │  DIRECT TRANSFER (optional, bulk content):                              │
//! │  probe (UDP) → directCredential (relay) → /directLogin (pinned TLS)     │
//! │  → GET /file, POST /upload with a session token                         │
//! │  Any failure falls back to the relay.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Transport
//! - [`protocol`] - Envelope format, channel names, query payloads
//! - [`registry`] - Verified event and query handler tables
//! - [`transport`] - `EventTransport`: events, correlated queries, peer sets
//! - [`connector`] - WebSocket relay client with reconnection
//! - [`hub`] - Relay hub (axum WebSocket server)
//!
//! ### Sync
//! - [`engine`] - Per-path ordered sync engine, authorities, committer
//! - [`watcher`] - Filesystem notifications into the engine
//!
//! ### Direct Transfer
//! - [`discovery`] - UDP probe and responder
//! - [`direct`] - Credentials, sessions, TLS, HTTPS server and client
//!
//! ### Node
//! - [`config`] - `GoboxConfig` (TOML + environment) and `SharedConfig`
//! - [`node`] - `StorageNode` / `ClientNode` wiring and shutdown
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gobox_sync::{GoboxConfig, SharedConfig, StorageNode};
//!
//! let config = SharedConfig::new(GoboxConfig::load(None)?);
//! let node = StorageNode::start(config).await?;
//!
//! println!("{:?}", node.status());
//! node.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Transport
pub mod connector;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod transport;

// Sync
pub mod engine;
pub mod watcher;

// Direct transfer
pub mod direct;
pub mod discovery;

// Node
pub mod config;
pub mod error;
pub mod node;
mod shutdown;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{GoboxConfig, ListenerId, NodeRole, SharedConfig};
pub use connector::{ConnectionState, ConnectorConfig, ConnectorHandle, RelayConnector, RelayLink};
pub use engine::{EngineConfig, EngineHandle, LocalChange, SyncEngine, SyncObserver};
pub use error::{SyncError, SyncResult};
pub use hub::{HubConfig, HubHandle, HubServer};
pub use node::{ClientNode, NodeStatus, StorageNode};
pub use protocol::{channels, EmitOptions};
pub use registry::{Expected, HandlerRegistry, RegistryBuilder};
pub use transport::{EventTransport, PeerSet, PendingQuery, TransportOptions};
pub use watcher::FsWatcher;
