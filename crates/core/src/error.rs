//! Base validation error model.

use thiserror::Error;

/// Result type used for value construction and validation.
pub type DomainResult<T> = Result<T, DomainError>;

/// Validation-level error.
///
/// Keep this focused on deterministic failures of value construction
/// (malformed input, broken invariants). Transport concerns belong to the
/// event bus error taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty topic).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Reject empty or whitespace-only names (topics, groups, subjects).
pub fn require_name(kind: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{kind} must not be empty")));
    }
    Ok(())
}
