//! Error types for the sync core.

use crate::remote::RemoteError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The local record store failed.
    ///
    /// Treated as fatal to the current drain cycle: no task state can be
    /// safely updated without the store, so the cycle aborts and is retried
    /// on the next poll tick.
    #[error("storage error: {0}")]
    Storage(#[from] tether_store::StorageError),

    /// A persisted row could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A remote operation failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Registering a relationship would create a dependency cycle.
    ///
    /// Raised at registration time and fatal to initialization: a
    /// misconfigured relationship graph must fail fast, not silently
    /// misorder sync.
    #[error("circular dependency: {}", chain.join(" -> "))]
    CircularDependency {
        /// The entity types forming the cycle, in traversal order.
        chain: Vec<String>,
    },

    /// No remote adapter is registered for an entity type.
    #[error("unknown entity type: {entity_type}")]
    UnknownEntityType {
        /// The unregistered entity type name.
        entity_type: String,
    },

    /// Automatic id negotiation failed and the task was parked in the
    /// conflict state for manual resolution.
    #[error("id conflict for {entity_type} {entity_id}: {message}")]
    IdConflict {
        /// Entity type name.
        entity_type: String,
        /// The contested entity id.
        entity_id: String,
        /// Description of the conflict.
        message: String,
    },

    /// A task row is malformed (e.g. payload missing its id field).
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// The client has been shut down.
    #[error("sync client is shut down")]
    Shutdown,
}

impl SyncError {
    /// Creates a codec error.
    pub fn codec(message: impl ToString) -> Self {
        Self::Codec(message.to_string())
    }

    /// Creates an invalid task error.
    pub fn invalid_task(message: impl Into<String>) -> Self {
        Self::InvalidTask(message.into())
    }

    /// Creates an unknown entity type error.
    pub fn unknown_entity_type(entity_type: impl Into<String>) -> Self {
        Self::UnknownEntityType {
            entity_type: entity_type.into(),
        }
    }

    /// Returns true if the failed unit of work can be retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Storage(_) => true,
            SyncError::Remote(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_display_joins_chain() {
        let err = SyncError::CircularDependency {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency: a -> b -> a");
    }

    #[test]
    fn retryable_classification() {
        let storage = SyncError::Storage(tether_store::StorageError::unavailable("down"));
        assert!(storage.is_retryable());

        let remote = SyncError::Remote(RemoteError::network("reset"));
        assert!(remote.is_retryable());

        let validation = SyncError::Remote(RemoteError::validation("bad field"));
        assert!(!validation.is_retryable());

        assert!(!SyncError::unknown_entity_type("ghosts").is_retryable());
    }
}
