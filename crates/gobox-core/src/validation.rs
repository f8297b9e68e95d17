//! # Validation Module
//!
//! Node names and relative paths.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: THIS MODULE                                                  │
//! │  ├── Non-empty, ≤ 255 bytes                                            │
//! │  └── No separator, no NUL, not "." or ".."                             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: gobox-db                                                     │
//! │  └── Visible sibling names are unique (partial UNIQUE index)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use gobox_core::validation::{validate_name, split_path};
//!
//! assert!(validate_name("report.pdf").is_ok());
//! assert!(validate_name("a/b").is_err());
//! assert_eq!(split_path("docs/report.pdf"), vec!["docs", "report.pdf"]);
//! ```

use crate::error::ValidationError;
use crate::MAX_NAME_BYTES;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a single node name.
///
/// ## Rules
/// - Must not be empty
/// - At most 255 bytes
/// - Must not contain `/`, `\` or NUL
/// - Must not be `.` or `..`
pub fn validate_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "name".to_string(),
        });
    }

    if name.len() > MAX_NAME_BYTES {
        return Err(ValidationError::TooLong {
            field: "name".to_string(),
            max: MAX_NAME_BYTES,
        });
    }

    if name == "." || name == ".." {
        return Err(ValidationError::InvalidFormat {
            field: "name".to_string(),
            reason: format!("'{}' is reserved", name),
        });
    }

    if name.contains(['/', '\\', '\0']) {
        return Err(ValidationError::InvalidFormat {
            field: "name".to_string(),
            reason: "must not contain path separators or NUL".to_string(),
        });
    }

    Ok(())
}

/// Splits a `/` separated relative path into segments, skipping empty ones.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Validates every segment of a path.
pub fn validate_segments(segments: &[String]) -> ValidationResult<()> {
    segments.iter().try_for_each(|s| validate_name(s))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_accepts_ordinary_names() {
        assert!(validate_name("notes.txt").is_ok());
        assert!(validate_name(".hidden").is_ok());
        assert!(validate_name("with space").is_ok());
    }

    #[test]
    fn test_validate_name_rejects_bad_names() {
        assert!(matches!(
            validate_name(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            validate_name(".."),
            Err(ValidationError::InvalidFormat { .. })
        ));
        assert!(matches!(
            validate_name("a\\b"),
            Err(ValidationError::InvalidFormat { .. })
        ));
        assert!(matches!(
            validate_name(&"x".repeat(256)),
            Err(ValidationError::TooLong { max: 255, .. })
        ));
    }

    #[test]
    fn test_validate_segments_stops_at_first_bad_segment() {
        let segments = vec!["docs".to_string(), "".to_string()];
        assert!(validate_segments(&segments).is_err());
        assert!(validate_segments(&split_path("docs/a.txt")).is_ok());
    }
}
