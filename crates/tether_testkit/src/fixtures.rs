//! Test fixtures and sync-client helpers.
//!
//! Provides a ready-made client over an in-memory store with scripted
//! mock adapters and a canonical pair of related record types.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tether_core::{
    MockAdapter, QueueKind, Record, RemoteAdapter, RetryConfig, SyncClient, SyncConfig, SyncStatus,
};
use tether_store::MemoryStore;

/// A user record; the parent type in the canonical test schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestUser {
    /// Entity id.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl Record for TestUser {
    fn entity_type() -> &'static str {
        "users"
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// A todo record; depends on [`TestUser`] via `user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestTodo {
    /// Entity id.
    pub id: String,
    /// Owning user's id.
    pub user_id: String,
    /// Title text.
    pub title: String,
    /// Completion flag.
    #[serde(default)]
    pub done: bool,
}

impl Record for TestTodo {
    fn entity_type() -> &'static str {
        "todos"
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// A sync client over an in-memory store with mock adapters for the
/// canonical `users` / `todos` schema (todos depend on users).
pub struct TestHarness {
    /// The sync client.
    pub client: SyncClient,
    /// The shared in-memory store.
    pub store: Arc<MemoryStore>,
    /// Scripted adapter for `users`.
    pub users: Arc<MockAdapter>,
    /// Scripted adapter for `todos`.
    pub todos: Arc<MockAdapter>,
}

impl TestHarness {
    /// Creates a harness with fast test-friendly timings and no jitter:
    /// retries become due within milliseconds.
    pub fn new() -> Self {
        Self::with_config(
            SyncConfig::default()
                .with_retry(
                    RetryConfig::new(3)
                        .without_jitter()
                        .with_initial_delay(std::time::Duration::from_millis(5))
                        .with_max_delay(std::time::Duration::from_millis(50)),
                )
                .with_poll_intervals(
                    std::time::Duration::from_millis(10),
                    std::time::Duration::from_millis(50),
                ),
        )
    }

    /// Creates a harness with a specific configuration.
    pub fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let users = Arc::new(MockAdapter::new());
        let todos = Arc::new(MockAdapter::new());

        let client = SyncClient::builder(Arc::clone(&store) as Arc<dyn tether_store::RecordStore>)
            .config(config)
            .relation("todos", "user_id", "users")
            .expect("acyclic test schema")
            .adapter("users", Arc::clone(&users) as Arc<dyn RemoteAdapter>)
            .adapter("todos", Arc::clone(&todos) as Arc<dyn RemoteAdapter>)
            .build()
            .expect("harness build");

        Self {
            client,
            store,
            users,
            todos,
        }
    }

    /// Drains the foreground queue until idle.
    pub async fn drain(&self) -> u64 {
        self.client
            .drain_once(QueueKind::Foreground)
            .await
            .expect("foreground drain")
    }

    /// Drains the background queue until idle.
    pub async fn drain_background(&self) -> u64 {
        self.client
            .drain_once(QueueKind::Background)
            .await
            .expect("background drain")
    }

    /// Asserts an entity's sync-status projection.
    pub fn assert_status(&self, entity_type: &str, entity_id: &str, expected: SyncStatus) {
        let actual = self
            .client
            .status_of(entity_type, entity_id)
            .expect("status lookup");
        assert_eq!(
            actual, expected,
            "sync status mismatch for {entity_type}/{entity_id}"
        );
    }

    /// Returns the number of task rows still queued.
    pub fn queued_tasks(&self) -> usize {
        self.client.task_queue().len().expect("task count")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a user with the given id.
pub fn user(id: &str, name: &str) -> TestUser {
    TestUser {
        id: id.into(),
        name: name.into(),
    }
}

/// Builds a todo owned by a user.
pub fn todo(id: &str, user_id: &str, title: &str) -> TestTodo {
    TestTodo {
        id: id.into(),
        user_id: user_id.into(),
        title: title.into(),
        done: false,
    }
}
