//! Error types for cncflow-core

use thiserror::Error;

use crate::record::Command;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cncflow-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Durable queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A record payload could not be decoded for its command
    #[error("Invalid {command} payload: {reason}")]
    Payload { command: Command, reason: String },

    /// An internal invariant was violated (e.g. empty batch from a non-empty window)
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cooperative cancellation was requested
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Shorthand for a payload decoding failure.
    #[must_use]
    pub fn payload(command: Command, reason: impl Into<String>) -> Self {
        Self::Payload {
            command,
            reason: reason.into(),
        }
    }
}

/// Storage-specific errors.
///
/// The variants map one-to-one onto the fault classes consumed by
/// [`crate::fault::classify`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Momentary contention (lock held by another writer)
    #[error("Storage busy: {0}")]
    Busy(String),

    /// Backend temporarily unreachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Optimistic read conflict
    #[error("Stale read: {0}")]
    StaleRead(String),

    /// Transaction could not be serialized against a concurrent one
    #[error("Transaction serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Backend reports a state it cannot operate in (e.g. read-only, corrupt schema)
    #[error("Invalid storage state: {0}")]
    Invalid(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Queue-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue handle is not initialized")]
    NotInitialized,

    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue corrupted: {0}")]
    Corrupted(String),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let err = Error::Storage(StorageError::Busy("SQLITE_BUSY".to_string()));
        assert!(err.to_string().contains("SQLITE_BUSY"));

        let err = Error::payload(Command::Alarms, "expected an array");
        let msg = err.to_string();
        assert!(msg.contains("alarms"), "{msg}");
        assert!(msg.contains("expected an array"), "{msg}");

        let err = Error::Invariant("empty batch".to_string());
        assert!(err.to_string().contains("empty batch"));
    }

    #[test]
    fn queue_error_display() {
        assert!(
            QueueError::NotInitialized
                .to_string()
                .contains("not initialized")
        );
        assert!(
            QueueError::Unavailable("disk".to_string())
                .to_string()
                .contains("disk")
        );
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::ReadFailed("cncflow.toml".to_string(), "denied".to_string());
        let msg = err.to_string();
        assert!(msg.contains("cncflow.toml") && msg.contains("denied"));
    }

    // --- From conversions ---

    #[test]
    fn from_storage_error() {
        let err: Error = StorageError::Database("test".to_string()).into();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn from_queue_error() {
        let err: Error = QueueError::NotInitialized.into();
        assert!(matches!(err, Error::Queue(QueueError::NotInitialized)));
    }

    #[test]
    fn from_io_error() {
        let err: Error = std::io::Error::other("test").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
