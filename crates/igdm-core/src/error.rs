//! Error types for the core library.

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A configuration-related error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A path resolution or validation error.
    #[error("path error: {0}")]
    Path(String),

    /// An I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An authentication or session-related error.
    #[error("authentication error: {0}")]
    Auth(String),

    /// An error reported by the platform gateway.
    #[error("API error: {0}")]
    Api(String),

    /// A generic error for other cases.
    #[error("error: {0}")]
    Other(String),
}

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
