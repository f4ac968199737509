//! Common error types for the outbox queue.

use thiserror::Error;

/// Top-level error type for queue operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller named an action type outside the closed enumeration.
    #[error("Unknown action type: {0}")]
    UnknownActionType(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The durable queue could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote delivery failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote delivery did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A host capability is not available.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A background task has stopped.
    #[error("Shut down: {0}")]
    Shutdown(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
