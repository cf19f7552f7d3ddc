//! Error types for DailyBrief.
//!
//! Library crates use [`DailyBriefError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all DailyBrief operations.
#[derive(Debug, thiserror::Error)]
pub enum DailyBriefError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to a feed or the enrichment API.
    #[error("network error: {0}")]
    Network(String),

    /// Feed or response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Image decoding or encoding error.
    #[error("media error: {0}")]
    Media(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (response shape mismatch, inconsistent answer key, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DailyBriefError>;

impl DailyBriefError {
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

    /// Whether this error must abort the whole run.
    ///
    /// Storage and configuration failures are fatal; everything else is
    /// handled at the item boundary by the phase that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DailyBriefError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = DailyBriefError::validation("answer not among options");
        assert!(err.to_string().contains("answer not among options"));
    }

    #[test]
    fn fatal_classification() {
        assert!(DailyBriefError::Storage("locked".into()).is_fatal());
        assert!(DailyBriefError::config("no feeds").is_fatal());
        assert!(!DailyBriefError::Network("timeout".into()).is_fatal());
        assert!(!DailyBriefError::validation("bad shape").is_fatal());
        assert!(!DailyBriefError::Media("corrupt".into()).is_fatal());
    }
}
