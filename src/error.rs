//! Error types for state synchronization
//!
//! This module defines the error type shared by the cache, the messaging
//! client, the write batcher and the authoritative service.

use crate::classify::ErrorKind;
use thiserror::Error;

/// Main error type for synchronization operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Classified failure crossing the boundary channel (after retries)
    #[error("Boundary call failed ({kind}) after {attempts} attempt(s): {message}")]
    Boundary {
        kind: ErrorKind,
        message: String,
        attempts: u32,
    },

    /// The remote side answered with `ok: false`
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// A response payload did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Persistent store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl SyncError {
    /// Classified kind of this error, used by retry and rollback decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Boundary { kind, .. } => *kind,
            SyncError::Rejected(_) => ErrorKind::Permanent,
            SyncError::SerializationError(_) | SyncError::Protocol(_) => ErrorKind::Corruption,
            SyncError::Storage(message) => {
                crate::classify::classify(Some(&crate::classify::Failure::new(message.clone())))
            }
            SyncError::ConfigError(_) | SyncError::Other(_) => ErrorKind::Permanent,
        }
    }
}

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<String> for SyncError {
    fn from(s: String) -> Self {
        SyncError::Other(s)
    }
}

impl From<&str> for SyncError {
    fn from(s: &str) -> Self {
        SyncError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::SerializationError(e.to_string())
    }
}
