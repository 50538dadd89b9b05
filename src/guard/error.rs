use std::time::Duration;
use thiserror::Error;

use crate::keys::KeyError;
use crate::lock::LockError;

/// Outcome of a guarded call that did not produce the operation's own result.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The same logical request is already in flight.
    #[error("Duplicate request rejected: {key} is already in progress")]
    IdempotentConflict { key: String },

    #[error("Timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Could not derive lock key: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Guarded operation failed: {0}")]
    Operation(#[source] E),
}

impl<E> GuardError<E> {
    /// Only a lock timeout is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GuardError::LockTimeout { .. })
    }

    pub fn operation_error(self) -> Option<E> {
        match self {
            GuardError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_retryable_only_on_timeout() {
        let timeout: GuardError<io::Error> = GuardError::LockTimeout {
            key: "k".into(),
            waited: Duration::from_secs(3),
        };
        assert!(timeout.is_retryable());

        let conflict: GuardError<io::Error> = GuardError::IdempotentConflict { key: "k".into() };
        assert!(!conflict.is_retryable());

        let lock: GuardError<io::Error> = LockError::Unavailable("down".into()).into();
        assert!(!lock.is_retryable());
    }

    #[test]
    fn test_operation_error_passthrough() {
        let err: GuardError<io::Error> =
            GuardError::Operation(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_string(), "Guarded operation failed: boom");
        assert_eq!(err.operation_error().unwrap().to_string(), "boom");
    }
}
