//! Error types for record store operations.

use std::io;
use thiserror::Error;

/// Result type for record store operations.
pub type StoreResult<T> = Result<T, StorageError>;

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store is temporarily unreachable.
    ///
    /// Callers treat this as transient and retry the whole unit of work.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be interpreted.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

impl StorageError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates a corrupted error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StorageError::unavailable("disk detached");
        assert_eq!(err.to_string(), "store unavailable: disk detached");

        let err = StorageError::Closed;
        assert_eq!(err.to_string(), "store is closed");
    }
}
