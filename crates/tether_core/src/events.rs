//! Change feed for observing sync activity.
//!
//! The feed emits events for entity mutations, sync-status transitions,
//! and id changes, enabling:
//! - Reactive UI updates
//! - Cache and relationship-loader invalidation
//! - Surfacing task failures without polling

use crate::task::SyncStatus;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// What happened to an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityChange {
    /// Entity was created.
    Created,
    /// Entity was updated.
    Updated,
    /// Entity was deleted.
    Deleted,
    /// A sync task for the entity failed terminally.
    Errored {
        /// Description of the failure.
        message: String,
    },
}

/// A single event from the sync feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    /// Feed-assigned sequence number, strictly increasing.
    pub sequence: u64,
    /// The event payload.
    pub kind: EventKind,
}

/// Event payloads emitted by the sync core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// An entity changed.
    Entity {
        /// Entity type name.
        entity_type: String,
        /// Entity id.
        entity_id: String,
        /// What happened.
        change: EntityChange,
    },
    /// An entity's sync-status projection changed.
    StatusChanged {
        /// Entity type name.
        entity_type: String,
        /// Entity id.
        entity_id: String,
        /// The new status.
        status: SyncStatus,
    },
    /// The remote store assigned a different id than the temporary one.
    IdChanged {
        /// Entity type name.
        entity_type: String,
        /// The client-generated temporary id.
        old_id: String,
        /// The server-assigned id.
        new_id: String,
    },
}

impl EventKind {
    /// Returns the entity type the event concerns.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        match self {
            EventKind::Entity { entity_type, .. }
            | EventKind::StatusChanged { entity_type, .. }
            | EventKind::IdChanged { entity_type, .. } => entity_type,
        }
    }

    /// Returns the entity id the event concerns. Id-changed events match
    /// both the old and the new id for per-entity subscribers.
    fn concerns_id(&self, id: &str) -> bool {
        match self {
            EventKind::Entity { entity_id, .. } | EventKind::StatusChanged { entity_id, .. } => {
                entity_id == id
            }
            EventKind::IdChanged { old_id, new_id, .. } => old_id == id || new_id == id,
        }
    }
}

struct Subscriber {
    tx: Sender<SyncEvent>,
    /// Restrict delivery to one entity type; `None` means everything.
    entity_type: Option<String>,
    /// Additionally restrict delivery to one entity id.
    entity_id: Option<String>,
}

/// A feed that distributes sync events to subscribers.
///
/// The feed:
/// - Preserves emission order
/// - Supports multiple subscribers, optionally filtered by entity type
/// - Keeps a bounded history for cursor-based catch-up
/// - Is thread-safe
pub struct SyncFeed {
    subscribers: RwLock<Vec<Subscriber>>,
    history: RwLock<Vec<SyncEvent>>,
    next_sequence: AtomicU64,
    max_history: usize,
}

impl SyncFeed {
    /// Creates a new feed.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(10000)
    }

    /// Creates a feed with a specific history limit.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
            max_history,
        }
    }

    /// Subscribes to every event.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        self.subscribe_inner(None, None)
    }

    /// Subscribes to events for one entity type.
    pub fn subscribe_type(&self, entity_type: impl Into<String>) -> Receiver<SyncEvent> {
        self.subscribe_inner(Some(entity_type.into()), None)
    }

    /// Subscribes to events for one entity.
    pub fn subscribe_entity(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Receiver<SyncEvent> {
        self.subscribe_inner(Some(entity_type.into()), Some(entity_id.into()))
    }

    fn subscribe_inner(
        &self,
        entity_type: Option<String>,
        entity_id: Option<String>,
    ) -> Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(Subscriber {
            tx,
            entity_type,
            entity_id,
        });
        rx
    }

    /// Emits an event to all matching subscribers.
    pub fn emit(&self, kind: EventKind) {
        let event = SyncEvent {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            kind,
        };

        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let to_remove = history.len() - self.max_history;
                history.drain(0..to_remove);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sub| {
            let type_match = sub
                .entity_type
                .as_deref()
                .map(|t| t == event.kind.entity_type())
                .unwrap_or(true);
            let id_match = sub
                .entity_id
                .as_deref()
                .map(|id| event.kind.concerns_id(id))
                .unwrap_or(true);
            if !(type_match && id_match) {
                // Keep the subscriber; drop only on disconnect.
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Polls events with sequence > cursor, up to limit.
    ///
    /// Useful for catch-up after a subscriber reconnects.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<SyncEvent> {
        let history = self.history.read();
        history
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest sequence number in history.
    pub fn latest_sequence(&self) -> u64 {
        self.history.read().last().map(|e| e.sequence).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for SyncFeed {
    fn default() -> Self {
        Self::new()
    }
}
