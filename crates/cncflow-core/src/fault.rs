//! Fault taxonomy for the import loop.
//!
//! All retry decisions go through [`classify`]; neither the retry controller
//! nor the scheduler inspect error variants directly.

use std::fmt;
use std::io::ErrorKind;

use crate::error::{Error, QueueError, StorageError};

/// Failure class, from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Safe to retry immediately (momentary contention)
    Transient,
    /// Retry after the policy delay (backend temporarily unreachable)
    TransientWithDelay,
    /// Optimistic read conflict; retry the whole loop iteration
    StaleRead,
    /// Serialization failure; retry the whole loop iteration
    SerializationFailure,
    /// Cooperative cancellation; stop without logging an error
    Cancelled,
    /// Anything else: abandon the batch for this iteration
    Other,
    /// Invalid state, unauthorized, out of memory: terminate the process
    Fatal,
}

impl FaultClass {
    /// Retried in place by the retry controller.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::TransientWithDelay)
    }

    /// Retried by re-running the scheduler iteration.
    #[must_use]
    pub fn retries_iteration(self) -> bool {
        matches!(self, Self::StaleRead | Self::SerializationFailure)
    }

    #[must_use]
    pub fn is_fatal(self) -> bool {
        self == Self::Fatal
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::TransientWithDelay => "transient_with_delay",
            Self::StaleRead => "stale_read",
            Self::SerializationFailure => "serialization_failure",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error into the fault taxonomy.
#[must_use]
pub fn classify(error: &Error) -> FaultClass {
    match error {
        Error::Storage(e) => match e {
            StorageError::Busy(_) => FaultClass::Transient,
            StorageError::Unavailable(_) => FaultClass::TransientWithDelay,
            StorageError::StaleRead(_) => FaultClass::StaleRead,
            StorageError::SerializationFailure(_) => FaultClass::SerializationFailure,
            StorageError::Unauthorized(_)
            | StorageError::Invalid(_)
            | StorageError::OutOfMemory(_) => FaultClass::Fatal,
            StorageError::Database(_) | StorageError::NotFound(_) => FaultClass::Other,
        },
        Error::Queue(e) => match e {
            QueueError::Unavailable(_) => FaultClass::TransientWithDelay,
            QueueError::NotInitialized | QueueError::Corrupted(_) => FaultClass::Other,
        },
        // A configuration problem discovered at runtime cannot heal by itself
        Error::Config(_) => FaultClass::Fatal,
        Error::Io(e) => match e.kind() {
            ErrorKind::OutOfMemory | ErrorKind::PermissionDenied => FaultClass::Fatal,
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                FaultClass::Transient
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected => FaultClass::TransientWithDelay,
            _ => FaultClass::Other,
        },
        Error::Payload { .. } | Error::Invariant(_) | Error::Json(_) => FaultClass::Other,
        Error::Cancelled(_) => FaultClass::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::record::Command;

    #[test]
    fn storage_classification_table() {
        let cases = [
            (StorageError::Busy("b".into()), FaultClass::Transient),
            (
                StorageError::Unavailable("u".into()),
                FaultClass::TransientWithDelay,
            ),
            (StorageError::StaleRead("s".into()), FaultClass::StaleRead),
            (
                StorageError::SerializationFailure("s".into()),
                FaultClass::SerializationFailure,
            ),
            (StorageError::Unauthorized("u".into()), FaultClass::Fatal),
            (StorageError::Invalid("i".into()), FaultClass::Fatal),
            (StorageError::OutOfMemory("o".into()), FaultClass::Fatal),
            (StorageError::Database("d".into()), FaultClass::Other),
            (StorageError::NotFound("n".into()), FaultClass::Other),
        ];
        for (err, expected) in cases {
            let err = Error::Storage(err);
            assert_eq!(classify(&err), expected, "{err}");
        }
    }

    #[test]
    fn queue_unavailable_is_delayed_transient() {
        let err = Error::Queue(QueueError::Unavailable("offline".into()));
        assert_eq!(classify(&err), FaultClass::TransientWithDelay);
        assert_eq!(
            classify(&Error::Queue(QueueError::Corrupted("x".into()))),
            FaultClass::Other
        );
    }

    #[test]
    fn io_kinds_are_classified() {
        let io = |kind| Error::Io(std::io::Error::new(kind, "io"));
        assert_eq!(classify(&io(ErrorKind::TimedOut)), FaultClass::Transient);
        assert_eq!(
            classify(&io(ErrorKind::ConnectionRefused)),
            FaultClass::TransientWithDelay
        );
        assert_eq!(classify(&io(ErrorKind::OutOfMemory)), FaultClass::Fatal);
        assert_eq!(classify(&io(ErrorKind::PermissionDenied)), FaultClass::Fatal);
        assert_eq!(classify(&io(ErrorKind::NotFound)), FaultClass::Other);
    }

    #[test]
    fn misc_errors() {
        assert_eq!(
            classify(&Error::Cancelled("stop".into())),
            FaultClass::Cancelled
        );
        assert_eq!(
            classify(&Error::payload(Command::Stamp, "bad")),
            FaultClass::Other
        );
        assert_eq!(
            classify(&Error::Config(ConfigError::ValidationError("x".into()))),
            FaultClass::Fatal
        );
    }

    #[test]
    fn class_predicates() {
        assert!(FaultClass::Transient.is_retryable());
        assert!(FaultClass::TransientWithDelay.is_retryable());
        assert!(!FaultClass::StaleRead.is_retryable());
        assert!(FaultClass::StaleRead.retries_iteration());
        assert!(FaultClass::SerializationFailure.retries_iteration());
        assert!(!FaultClass::Other.retries_iteration());
        assert!(FaultClass::Fatal.is_fatal());
        assert!(!FaultClass::Other.is_fatal());
    }
}
