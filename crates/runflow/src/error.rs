//! Error types for runflow operations

use thiserror::Error;

/// Result type alias for runflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the callback core or returned by handler implementations.
///
/// Handler event methods return `Result<()>`; the dispatchers catch those
/// errors at the dispatch boundary, so callers of a manager never observe them.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input to the configuration resolver, surfaced at `configure`
    /// time rather than at dispatch time.
    #[error("invalid callback configuration: {0}")]
    InvalidConfig(String),

    /// Failure reported by a callback handler.
    #[error("callback handler failed: {0}")]
    Handler(String),

    /// JSON serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure (e.g. from the file handler).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for handler-defined failures that fit no other variant.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Convenience constructor for handler-side failures.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Stable variant label, used to deduplicate warning logs per
    /// (event, error-kind) pair.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::Handler(_) => "handler",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}
