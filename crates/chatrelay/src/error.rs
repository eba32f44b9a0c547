//! Error types for chatrelay

use thiserror::Error;

use crate::upstream::UpstreamError;

/// Main error type for chatrelay operations
#[derive(Error, Debug)]
pub enum ChatRelayError {
    /// Configuration errors (file loading, invalid gateway URL, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failures talking to the LLM gateway
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Conversation store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Rejected client input
    #[error("{0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for ChatRelayError {
    fn from(e: serde_json::Error) -> Self {
        ChatRelayError::Serialization(e.to_string())
    }
}

/// Result type alias for chatrelay operations
pub type Result<T> = std::result::Result<T, ChatRelayError>;
