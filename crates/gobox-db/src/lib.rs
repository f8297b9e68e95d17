//! # gobox-db: File-Tree Store for Gobox
//!
//! This crate keeps the hierarchical file metadata of a Gobox node in
//! SQLite. The storage node's copy is authoritative; each client keeps a
//! mirror that adopts the storage node's ids.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Gobox Data Flow                                 │
//! │                                                                         │
//! │  Sync engine (gobox-sync)                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     gobox-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ FileTreeRepo  │    │ 001_file_    │  │   │
//! │  │   │ SqlitePool    │◄───│ SharingRepo   │    │   tree.sql   │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/gobox.db                                           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - File tree and sharing repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gobox_core::{NodeAttrs, NodeRef, ROOT_ID};
//! use gobox_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("gobox.db")).await?;
//!
//! let docs = db.tree().insert(ROOT_ID, "docs", true, attrs).await?;
//! let same = db.tree().resolve(&NodeRef::path("docs")).await?;
//! assert_eq!(docs.id, same.id);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::sharing::SharingRepository;
pub use repository::tree::{FileTreeRepository, ReplicaOutcome};
