//! Common error types for Outbox.

use thiserror::Error;

/// Top-level error type for Outbox operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The durable key-value store rejected a read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport-level failure talking to the remote service.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote service answered without a success acknowledgment.
    #[error("Remote rejected action: {status} - {body}")]
    Remote { status: u16, body: String },

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A channel to a running task was closed.
    #[error("Closed: {0}")]
    Closed(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
