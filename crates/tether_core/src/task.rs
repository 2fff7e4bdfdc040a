//! Durable sync task rows and derived status types.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the identifier field inside entity payloads.
pub(crate) const ID_FIELD: &str = "id";

/// Unique identifier for a sync task.
///
/// Task ids are assigned by the task queue and are monotonically
/// increasing within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Creates a new task ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the store key for this task, zero-padded so lexicographic
    /// key order matches numeric order.
    #[must_use]
    pub(crate) fn store_key(self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// The remote operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOp {
    /// Create the entity remotely.
    Create,
    /// Partially update the entity remotely.
    Update,
    /// Replace the entity remotely.
    Replace,
    /// Delete the entity remotely.
    Delete,
}

impl TaskOp {
    /// Returns the lowercase wire name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOp::Create => "create",
            TaskOp::Update => "update",
            TaskOp::Replace => "replace",
            TaskOp::Delete => "delete",
        }
    }
}

impl fmt::Display for TaskOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be picked up (possibly not before `next_retry_at`).
    Pending,
    /// Currently executing against the remote store.
    Processing,
    /// Retries exhausted or failure was structural; requires manual
    /// intervention.
    Dead,
    /// Parked by id negotiation awaiting manual resolution.
    Conflict,
}

impl TaskStatus {
    /// Returns true if the task still counts as outstanding work.
    #[must_use]
    pub fn is_outstanding(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }
}

/// Which logical queue a task drains through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Interactive queue: low latency, higher concurrency.
    #[default]
    Foreground,
    /// Battery-conscious queue: single worker, longer retry floors.
    Background,
}

impl QueueKind {
    /// Returns the queue name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Foreground => "foreground",
            QueueKind::Background => "background",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived per-entity sync state, projected from the entity's task rows.
///
/// This is a read-side projection maintained in the same atomic batch as
/// every task mutation, not a separate source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No outstanding or dead tasks.
    #[default]
    Synced,
    /// At least one pending or processing task.
    Pending,
    /// At least one dead task. Dead wins over pending while both exist.
    Dead,
}

/// A pending remote operation, durably recorded in the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    /// Store-assigned task id.
    pub id: TaskId,
    /// Entity type name.
    pub entity_type: String,
    /// Entity id (may be a client-generated temporary id).
    pub entity_id: String,
    /// The remote operation to perform.
    pub op: TaskOp,
    /// Entity snapshot taken at enqueue time.
    pub payload: serde_json::Value,
    /// Number of attempts already made.
    pub attempt_count: u32,
    /// Message from the most recent failure.
    pub last_error: Option<String>,
    /// Earliest time the task is eligible again; `None` means eligible now.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Stable key identifying the logical operation across retries.
    pub idempotency_key: Option<String>,
    /// Opaque request headers, preserved verbatim across retries.
    pub headers: serde_json::Map<String, serde_json::Value>,
    /// Opaque adapter metadata, preserved verbatim across retries.
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Logical queue affinity.
    pub queue: QueueKind,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
}

impl SyncTask {
    /// Returns true if the task is pending and past its retry floor.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.next_retry_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Returns the (entity type, entity id) pair this task mutates.
    #[must_use]
    pub fn entity_key(&self) -> (String, String) {
        (self.entity_type.clone(), self.entity_id.clone())
    }

    /// Encodes the row for the record store.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        encode(self)
    }

    /// Decodes a row from the record store.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        decode(bytes)
    }
}

/// Encodes any serde value with the at-rest codec (canonical CBOR).
pub(crate) fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(SyncError::codec)?;
    Ok(buf)
}

/// Decodes any serde value with the at-rest codec.
pub(crate) fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::de::from_reader(bytes).map_err(SyncError::codec)
}
