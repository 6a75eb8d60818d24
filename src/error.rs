//! Error types for the live query engine.

use thiserror::Error;

/// Main error type for live query operations.
#[derive(Debug, Error)]
pub enum LiveQueryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed registration {id}: {reason}")]
    MalformedRegistration { id: String, reason: String },

    #[error("Not allowed to subscribe to channel: {0}")]
    AuthorizationDenied(String),

    #[error("Query evaluation failed: {0}")]
    Evaluation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reconnect retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Record has no identity field: {0}")]
    MissingIdentity(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Registration store not initialized")]
    NotInitialized,

    #[error("Subscription manager has shut down")]
    ManagerClosed,
}

impl From<serde_json::Error> for LiveQueryError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            LiveQueryError::Deserialization(e.to_string())
        } else {
            LiveQueryError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for LiveQueryError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        LiveQueryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for LiveQueryError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        LiveQueryError::Deserialization(e.to_string())
    }
}

/// Result type for live query operations.
pub type Result<T> = std::result::Result<T, LiveQueryError>;
