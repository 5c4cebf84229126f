//! Error types for linkweave.
//!
//! Library crates use [`LinkweaveError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-edge placement failures are not errors: they are recorded on the edge
//! as [`crate::UnplacedReason`] and never abort a run. Only a missing scope
//! prerequisite ([`LinkweaveError::Configuration`]) is fatal to a whole run.

use std::path::PathBuf;

/// Top-level error type for all linkweave operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkweaveError {
    /// Application configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A scope is missing a prerequisite for planning (no hub, draft pages, ...).
    #[error("configuration error in scope {scope}: {message}")]
    Configuration { scope: String, message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Generation or term-enrichment collaborator failure.
    #[error("generation error: {0}")]
    Generation(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input data (malformed import, bad edit request, ...).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A referenced scope, page, edge, snapshot or task does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with current state (e.g. planning an already planned scope).
    #[error("conflict: {0}")]
    Conflict(String),

    /// State a write was computed from changed before the write committed.
    #[error("stale read: {0}")]
    Stale(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LinkweaveError>;

impl LinkweaveError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a scope configuration error.
    pub fn configuration(scope: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            scope: scope.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error naming the missing entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort a whole scope run.
    pub fn is_fatal_to_scope(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Whether recomputing against fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LinkweaveError::config("min_budget exceeds max_budget");
        assert_eq!(
            err.to_string(),
            "config error: min_budget exceeds max_budget"
        );

        let err = LinkweaveError::configuration("silo-1", "no resolvable hub");
        assert_eq!(
            err.to_string(),
            "configuration error in scope silo-1: no resolvable hub"
        );
    }

    #[test]
    fn only_configuration_is_fatal() {
        assert!(LinkweaveError::configuration("s", "x").is_fatal_to_scope());
        assert!(!LinkweaveError::Generation("timeout".into()).is_fatal_to_scope());
        assert!(!LinkweaveError::Storage("locked".into()).is_fatal_to_scope());
    }

    #[test]
    fn only_stale_reads_are_retryable() {
        assert!(LinkweaveError::Stale("page p changed".into()).is_retryable());
        assert!(!LinkweaveError::Conflict("already planned".into()).is_retryable());
    }
}
