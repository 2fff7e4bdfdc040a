//! In-memory record store.

use crate::error::StoreResult;
use crate::store::{Mutation, RecordStore, StoreEvent, WriteBatch};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, Sender};

/// An in-memory record store.
///
/// This store keeps all rows in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral deployments that don't need persistence
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use tether_store::{MemoryStore, RecordStore, WriteBatch};
///
/// let store = MemoryStore::new();
/// let mut batch = WriteBatch::new();
/// batch.put("todos", "t1", b"payload".to_vec());
/// store.apply(batch).unwrap();
/// assert!(store.contains("todos", "t1").unwrap());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    watchers: RwLock<Vec<Sender<StoreEvent>>>,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of rows in a collection.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Removes every row from every collection.
    pub fn clear(&self) {
        self.collections.write().clear();
    }

    fn notify(&self, events: Vec<StoreEvent>) {
        let mut watchers = self.watchers.write();
        for event in events {
            watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|rows| rows.get(key).cloned()))
    }

    fn list(&self, collection: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut events = Vec::with_capacity(batch.len());
        {
            let mut collections = self.collections.write();
            for mutation in batch.into_mutations() {
                match mutation {
                    Mutation::Put {
                        collection,
                        key,
                        payload,
                    } => {
                        collections
                            .entry(collection.clone())
                            .or_default()
                            .insert(key.clone(), payload.clone());
                        events.push(StoreEvent {
                            collection,
                            key,
                            payload: Some(payload),
                        });
                    }
                    Mutation::Delete { collection, key } => {
                        if let Some(rows) = collections.get_mut(&collection) {
                            rows.remove(&key);
                        }
                        events.push(StoreEvent {
                            collection,
                            key,
                            payload: None,
                        });
                    }
                }
            }
        }
        self.notify(events);
        Ok(())
    }

    fn watch(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        self.watchers.write().push(tx);
        rx
    }
}
