//! Abstract remote operation interface.
//!
//! The queue runner never talks to a network directly; it executes tasks
//! against a [`RemoteAdapter`] registered per entity type. This keeps URL
//! construction, authentication, and marshaling in host applications and
//! allows tests to script the remote side completely.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Opaque request metadata maps (headers, adapter extras).
pub type JsonMap = serde_json::Map<String, Value>;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors a remote operation can return.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The resource does not exist remotely.
    #[error("not found")]
    NotFound,

    /// The resource has been permanently removed remotely (410 semantics).
    ///
    /// Authoritative: the local copy and its queued tasks are deleted,
    /// never retried.
    #[error("gone")]
    Gone,

    /// The server rejected the payload.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Authentication or authorization failed.
    #[error("auth failed: {0}")]
    Auth(String),

    /// The server reported a conflicting concurrent change.
    #[error("remote conflict: {0}")]
    Conflict(String),

    /// The server failed (5xx semantics).
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP-like status code.
        status: u16,
        /// Server-provided message.
        message: String,
    },

    /// The network failed before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The operation exceeded its bounded timeout.
    #[error("operation timed out")]
    Timeout,
}

impl RemoteError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates a server error.
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Returns true for failures worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::Server { .. }
        )
    }

    /// Returns true for the authoritative "permanently removed" signal.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, RemoteError::Gone)
    }
}

/// How the runner should treat a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reschedule with backoff (or mark dead once attempts are exhausted).
    Transient,
    /// Mark the task dead immediately; retrying will not help.
    Fatal,
    /// Delete the local entity and its tasks; the remote store is
    /// authoritative.
    Gone,
}

impl From<&RemoteError> for Disposition {
    fn from(error: &RemoteError) -> Self {
        if error.is_gone() {
            Disposition::Gone
        } else if error.is_transient() {
            Disposition::Transient
        } else {
            Disposition::Fatal
        }
    }
}

/// Remote operations for one entity type.
///
/// Implementations wrap whatever transport the host application uses.
/// All calls receive the task's preserved headers and extra metadata.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Creates the entity remotely; returns the server's snapshot, which
    /// may carry a different id than the submitted payload.
    async fn create(&self, payload: Value, headers: &JsonMap, extra: &JsonMap)
        -> RemoteResult<Value>;

    /// Updates the entity remotely; returns the server's snapshot.
    async fn update(&self, payload: Value, headers: &JsonMap, extra: &JsonMap)
        -> RemoteResult<Value>;

    /// Replaces the entity remotely; returns the server's snapshot.
    async fn replace(
        &self,
        payload: Value,
        headers: &JsonMap,
        extra: &JsonMap,
    ) -> RemoteResult<Value>;

    /// Deletes the entity remotely.
    async fn delete(&self, id: &str, headers: &JsonMap, extra: &JsonMap) -> RemoteResult<()>;

    /// Fetches one entity. Returns `Ok(None)` for NotFound; `Gone` is
    /// returned as an error so callers can purge the local copy.
    async fn find_one(&self, id: &str) -> RemoteResult<Option<Value>>;

    /// Fetches every entity of this type.
    async fn find_all(&self) -> RemoteResult<Vec<Value>>;

    /// Classifies a failure for the runner.
    ///
    /// The default follows the error taxonomy; adapters may override to
    /// declare specific structural failures recoverable.
    fn classify(&self, error: &RemoteError) -> Disposition {
        Disposition::from(error)
    }
}

/// Registry mapping entity type names to their adapters.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn RemoteAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter for an entity type, replacing any existing one.
    pub fn insert(&mut self, entity_type: impl Into<String>, adapter: Arc<dyn RemoteAdapter>) {
        self.adapters.insert(entity_type.into(), adapter);
    }

    /// Looks up the adapter for an entity type.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownEntityType`] if none is registered.
    pub fn get(&self, entity_type: &str) -> SyncResult<Arc<dyn RemoteAdapter>> {
        self.adapters
            .get(entity_type)
            .cloned()
            .ok_or_else(|| SyncError::unknown_entity_type(entity_type))
    }

    /// Returns the registered entity type names.
    pub fn entity_types(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}

/// One recorded call against a [`MockAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Operation name ("create", "update", "replace", "delete",
    /// "find_one", "find_all").
    pub op: &'static str,
    /// Entity id the call targeted, when the operation carries one.
    pub entity_id: Option<String>,
}

/// A scripted remote adapter for tests.
///
/// By default every write echoes the submitted payload back as the server
/// snapshot. Scripted responses are consumed front-to-back per operation,
/// so a sequence of failures followed by a success models a flaky remote.
#[derive(Default)]
pub struct MockAdapter {
    create_responses: Mutex<VecDeque<RemoteResult<Value>>>,
    update_responses: Mutex<VecDeque<RemoteResult<Value>>>,
    replace_responses: Mutex<VecDeque<RemoteResult<Value>>>,
    delete_responses: Mutex<VecDeque<RemoteResult<()>>>,
    find_one_responses: Mutex<VecDeque<RemoteResult<Option<Value>>>>,
    find_all_responses: Mutex<VecDeque<RemoteResult<Vec<Value>>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockAdapter {
    /// Creates a mock that echoes payloads back on success.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next create response.
    pub fn push_create(&self, response: RemoteResult<Value>) {
        self.create_responses.lock().push_back(response);
    }

    /// Scripts the next update response.
    pub fn push_update(&self, response: RemoteResult<Value>) {
        self.update_responses.lock().push_back(response);
    }

    /// Scripts the next replace response.
    pub fn push_replace(&self, response: RemoteResult<Value>) {
        self.replace_responses.lock().push_back(response);
    }

    /// Scripts the next delete response.
    pub fn push_delete(&self, response: RemoteResult<()>) {
        self.delete_responses.lock().push_back(response);
    }

    /// Scripts the next find_one response.
    pub fn push_find_one(&self, response: RemoteResult<Option<Value>>) {
        self.find_one_responses.lock().push_back(response);
    }

    /// Scripts the next find_all response.
    pub fn push_find_all(&self, response: RemoteResult<Vec<Value>>) {
        self.find_all_responses.lock().push_back(response);
    }

    /// Returns every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Returns how many calls hit the given operation.
    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    fn record(&self, op: &'static str, entity_id: Option<String>) {
        self.calls.lock().push(MockCall { op, entity_id });
    }

    fn id_of(payload: &Value) -> Option<String> {
        payload
            .get(crate::task::ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl RemoteAdapter for MockAdapter {
    async fn create(
        &self,
        payload: Value,
        _headers: &JsonMap,
        _extra: &JsonMap,
    ) -> RemoteResult<Value> {
        self.record("create", Self::id_of(&payload));
        match self.create_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(payload),
        }
    }

    async fn update(
        &self,
        payload: Value,
        _headers: &JsonMap,
        _extra: &JsonMap,
    ) -> RemoteResult<Value> {
        self.record("update", Self::id_of(&payload));
        match self.update_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(payload),
        }
    }

    async fn replace(
        &self,
        payload: Value,
        _headers: &JsonMap,
        _extra: &JsonMap,
    ) -> RemoteResult<Value> {
        self.record("replace", Self::id_of(&payload));
        match self.replace_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(payload),
        }
    }

    async fn delete(&self, id: &str, _headers: &JsonMap, _extra: &JsonMap) -> RemoteResult<()> {
        self.record("delete", Some(id.to_string()));
        match self.delete_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(()),
        }
    }

    async fn find_one(&self, id: &str) -> RemoteResult<Option<Value>> {
        self.record("find_one", Some(id.to_string()));
        match self.find_one_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> RemoteResult<Vec<Value>> {
        self.record("find_all", None);
        match self.find_all_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(Vec::new()),
        }
    }
}
