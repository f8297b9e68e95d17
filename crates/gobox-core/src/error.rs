//! # Error Types
//!
//! Domain-specific error types for gobox-core, plus the [`ErrorKind`]
//! taxonomy that every other crate maps its errors onto.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  gobox-core errors (this file)                                         │
//! │  ├── ErrorKind        - Wire-visible taxonomy (NOT_FOUND, CONFLICT...)  │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Name / path validation failures                │
//! │                                                                         │
//! │  gobox-db errors (separate crate)                                      │
//! │  └── DbError          - Store failures, each with a kind()             │
//! │                                                                         │
//! │  gobox-sync errors (separate crate)                                    │
//! │  └── SyncError        - Transport, engine, direct transfer             │
//! │                                                                         │
//! │  Flow: ValidationError → DbError → SyncError → queryResponse._error    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Kind
// =============================================================================

/// Classification shared by every layer and carried over the wire.
///
/// ## Retry Policy
/// ```text
/// Transient          → retried with backoff by the sync engine
/// Unavailable        → caller falls back (direct transfer → relay)
/// Conflict           → surfaced to the user, never retried
/// Corruption         → fatal for the operation, never retried
/// everything else    → surfaced as-is
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    Corruption,
    Unauthorized,
    Unavailable,
    TransportClosed,
    Transient,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    /// Stable wire code, identical to the serde representation.
    pub const fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::Corruption => "CORRUPTION",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::TransportClosed => "TRANSPORT_CLOSED",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Only transient conditions may be retried automatically.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Domain errors raised by pure logic in this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A mutation was built for an operation that makes no sense for the node.
    ///
    /// ## When This Occurs
    /// - Writing content to a directory
    /// - Moving or trashing the root
    #[error("Invalid operation on node {id}: {reason}")]
    InvalidOperation { id: u64, reason: String },

    /// Content could not be decoded from its wire representation.
    #[error("Invalid content encoding: {0}")]
    InvalidEncoding(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidOperation { .. } => ErrorKind::InvalidState,
            CoreError::InvalidEncoding(_) | CoreError::Validation(_) => ErrorKind::InvalidRequest,
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors for names and paths.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} bytes")]
    TooLong { field: String, max: usize },

    /// Invalid format (separator in a name, reserved name, NUL byte).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes_match_serde() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::InvalidState,
            ErrorKind::Corruption,
            ErrorKind::Unauthorized,
            ErrorKind::Unavailable,
            ErrorKind::TransportClosed,
            ErrorKind::Transient,
            ErrorKind::InvalidRequest,
            ErrorKind::Internal,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::Corruption.is_retryable());
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let err: CoreError = ValidationError::Required {
            field: "name".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(err.to_string(), "Validation error: name is required");
    }
}
