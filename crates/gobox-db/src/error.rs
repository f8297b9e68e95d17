//! # Database Error Types
//!
//! Error types for file-tree store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Adds context and a taxonomy kind              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError::Store (gobox-sync) ← engine decides retry vs surface       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  queryResponse { _error: { code, message } } → requesting client       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use gobox_core::{ErrorKind, NodeId};
use thiserror::Error;

/// File-tree store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Node (or other entity) not found.
    ///
    /// ## When This Occurs
    /// - Unknown id
    /// - No visible child with the given name
    /// - A path segment that does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A visible sibling already holds the name.
    #[error("Name conflict: '{name}' already exists in directory {parent_id}")]
    Conflict { parent_id: NodeId, name: String },

    /// Operation not valid for the node as it stands.
    ///
    /// ## When This Occurs
    /// - Listing children of a file
    /// - Inserting under a trashed directory
    /// - Moving a directory into its own subtree
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The stored tree violates a structural invariant (a parent cycle or a
    /// dangling parent). Fatal for the operation, never retried.
    #[error("Tree corruption: {0}")]
    Corruption(String),

    /// The name failed validation before reaching the database.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Unique constraint violation not attributable to a sibling name.
    #[error("Duplicate {field}")]
    UniqueViolation { field: String },

    /// The database was busy or locked; the write was not made durable.
    #[error("Database busy: {0}")]
    Busy(String),

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn node_not_found(id: NodeId) -> Self {
        DbError::not_found("Node", id.to_string())
    }

    pub fn conflict(parent_id: NodeId, name: impl Into<String>) -> Self {
        DbError::Conflict {
            parent_id,
            name: name.into(),
        }
    }

    /// Taxonomy kind used for retry decisions and wire codes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::NotFound { .. } => ErrorKind::NotFound,
            DbError::Conflict { .. } | DbError::UniqueViolation { .. } => ErrorKind::Conflict,
            DbError::InvalidState(_) => ErrorKind::InvalidState,
            DbError::InvalidName(_) => ErrorKind::InvalidRequest,
            DbError::Corruption(_) => ErrorKind::Corruption,
            DbError::Busy(_) | DbError::PoolExhausted => ErrorKind::Transient,
            DbError::ConnectionFailed(_)
            | DbError::MigrationFailed(_)
            | DbError::QueryFailed(_)
            | DbError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → constraint / busy / query failure
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation { field }
                } else if msg.contains("database is locked") || msg.contains("database is busy") {
                    DbError::Busy(msg.to_string())
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<gobox_core::ValidationError> for DbError {
    fn from(err: gobox_core::ValidationError) -> Self {
        DbError::InvalidName(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(DbError::node_not_found(4).kind(), ErrorKind::NotFound);
        assert_eq!(DbError::conflict(0, "a").kind(), ErrorKind::Conflict);
        assert_eq!(DbError::PoolExhausted.kind(), ErrorKind::Transient);
        assert_eq!(
            DbError::Corruption("cycle".into()).kind(),
            ErrorKind::Corruption
        );
    }

    #[test]
    fn test_conflict_message_names_the_sibling() {
        assert_eq!(
            DbError::conflict(0, "notes.txt").to_string(),
            "Name conflict: 'notes.txt' already exists in directory 0"
        );
    }
}
