//! Error types for inboxmirror.
//!
//! Library crates use [`MirrorError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all inboxmirror operations.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to the source.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The authenticated session could not be established or used.
    #[error("session error: {0}")]
    Session(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad status name, malformed id, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A background crawl task ended without reporting a result.
    #[error("job error: {0}")]
    Job(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MirrorError>;

impl MirrorError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = MirrorError::config("missing credentials");
        assert_eq!(err.to_string(), "config error: missing credentials");

        let err = MirrorError::validation("unknown status 'pending'");
        assert!(err.to_string().contains("unknown status"));

        let err = MirrorError::NotFound("target 42".into());
        assert_eq!(err.to_string(), "not found: target 42");
    }
}
