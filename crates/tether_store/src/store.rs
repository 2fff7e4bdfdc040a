//! Record store trait definition.

use crate::error::StoreResult;
use std::sync::mpsc::Receiver;

/// A single buffered mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert or replace the row at (collection, key).
    Put {
        /// Collection name.
        collection: String,
        /// Row key.
        key: String,
        /// Row payload.
        payload: Vec<u8>,
    },
    /// Remove the row at (collection, key). Removing an absent row is a no-op.
    Delete {
        /// Collection name.
        collection: String,
        /// Row key.
        key: String,
    },
}

/// An ordered set of mutations applied all-or-nothing.
///
/// A batch is the transaction primitive of the record store: either every
/// mutation in it becomes visible, or none does. Mutations are applied in
/// insertion order, so a later put to the same key wins.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a put.
    pub fn put(&mut self, collection: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) {
        self.mutations.push(Mutation::Put {
            collection: collection.into(),
            key: key.into(),
            payload,
        });
    }

    /// Buffers a delete.
    pub fn delete(&mut self, collection: impl Into<String>, key: impl Into<String>) {
        self.mutations.push(Mutation::Delete {
            collection: collection.into(),
            key: key.into(),
        });
    }

    /// Returns the buffered mutations in insertion order.
    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Returns true if the batch holds no mutations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Returns the number of buffered mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Consumes the batch, returning its mutations.
    #[must_use]
    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// A committed mutation, delivered to `watch` subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Collection name.
    pub collection: String,
    /// Row key.
    pub key: String,
    /// New payload, or `None` for a delete.
    pub payload: Option<Vec<u8>>,
}

/// A durable record store for Tether.
///
/// Record stores are **opaque row stores**. They map (collection, key)
/// pairs to byte payloads; Tether owns all payload interpretation -
/// stores do not understand tasks, entities, or sync state.
///
/// # Invariants
///
/// - `get` returns exactly the payload most recently committed for its key
/// - `apply` commits a batch atomically: concurrent readers observe either
///   none or all of its mutations
/// - `watch` delivers committed mutations in commit order
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryStore`] - in-memory, for tests and ephemeral use
pub trait RecordStore: Send + Sync {
    /// Reads the row at (collection, key).
    ///
    /// Returns `None` if no such row exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the row is
    /// unreadable.
    fn get(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Returns true if a row exists at (collection, key).
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn contains(&self, collection: &str, key: &str) -> StoreResult<bool> {
        Ok(self.get(collection, key)?.is_some())
    }

    /// Returns every row in a collection, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn list(&self, collection: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Applies a batch of mutations atomically.
    ///
    /// After this returns successfully, every mutation in the batch is
    /// committed and durable to the extent the backing medium allows.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be committed; in that case
    /// none of its mutations are visible.
    fn apply(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Subscribes to committed mutations.
    ///
    /// Returns a receiver that observes every mutation committed after the
    /// subscription, in commit order. The receiver should be drained
    /// regularly to avoid unbounded buffering.
    fn watch(&self) -> Receiver<StoreEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_preserves_order() {
        let mut batch = WriteBatch::new();
        batch.put("a", "k", vec![1]);
        batch.delete("a", "k");
        batch.put("a", "k", vec![2]);

        assert_eq!(batch.len(), 3);
        match &batch.mutations()[2] {
            Mutation::Put { payload, .. } => assert_eq!(payload, &vec![2]),
            other => panic!("unexpected mutation: {other:?}"),
        }
    }

    #[test]
    fn empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }
}
