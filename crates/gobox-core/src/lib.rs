//! # gobox-core: Pure Domain Types for Gobox
//!
//! Every Gobox node (the authoritative storage node and any number of
//! clients) speaks in terms of the types defined here. Nothing in this crate
//! touches a socket, a database or the filesystem.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Gobox Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  apps/gobox-node (binary)                        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   gobox-sync: transport ─ hub ─ engine ─ watcher ─ direct       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               gobox-db (file-tree store, SQLite)                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ gobox-core (THIS CRATE) ★                       │   │
//! │  │   types • error taxonomy • validation • mime                    │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - FileNode, NodeRef, Sharing, SyncEvent, Mutation
//! - [`error`] - Error taxonomy shared on the wire
//! - [`validation`] - Node names and relative paths
//! - [`mime`] - Extension based content type guessing
//!
//! ## Example Usage
//!
//! ```rust
//! use gobox_core::{NodeRef, ROOT_ID};
//!
//! let by_path = NodeRef::path("docs/report.pdf");
//! assert_eq!(by_path, NodeRef::Path { segments: vec!["docs".into(), "report.pdf".into()] });
//!
//! let by_child = NodeRef::child(ROOT_ID, "docs");
//! assert!(matches!(by_child, NodeRef::Child { parent_id: 0, .. }));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod mime;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ErrorKind, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Id of the root directory. Every tree is rooted here.
pub const ROOT_ID: NodeId = 0;

/// Longest node name accepted, in bytes.
///
/// Matches the common filesystem limit so that every stored name can be
/// materialized on disk by any client.
pub const MAX_NAME_BYTES: usize = 255;
