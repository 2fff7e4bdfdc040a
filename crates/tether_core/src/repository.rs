//! Per-entity-type repository facade.
//!
//! Repositories are the write path of the sync layer: a save or delete
//! commits to the local record store and enqueues the remote work, per
//! the chosen policy. They are the only component that enqueues tasks.

use crate::error::{SyncError, SyncResult};
use crate::events::{EntityChange, EventKind, SyncEvent, SyncFeed};
use crate::queue::{NewTask, TaskQueue};
use crate::remote::{AdapterRegistry, JsonMap, RemoteError};
use crate::task::{self, QueueKind, SyncStatus, TaskOp, ID_FIELD};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tether_store::{RecordStore, WriteBatch};
use tracing::debug;

/// A locally-mastered, remotely-mirrored entity type.
///
/// Implementations are plain serde structs; the id is a string so
/// client-generated temporary ids and server-assigned ids interchange
/// freely.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The entity type name (the collection this type lives in).
    fn entity_type() -> &'static str;

    /// The entity's identifier; empty means not yet assigned.
    fn id(&self) -> &str;

    /// Replaces the entity's identifier.
    fn set_id(&mut self, id: String);
}

/// How a save or delete propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    /// Commit locally, enqueue a task, return immediately. Failures
    /// surface later through the change stream and the dead-task state.
    #[default]
    LocalFirst,
    /// Attempt the remote operation synchronously; on failure the call
    /// fails and nothing is written or enqueued.
    RemoteFirst,
}

/// How a read resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Local store only.
    #[default]
    LocalOnly,
    /// Return local immediately, refresh from remote asynchronously.
    LocalThenRemote,
    /// Try remote, fall back to local on failure.
    RemoteFirst,
}

/// Options for a save or delete.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Propagation policy.
    pub policy: SavePolicy,
    /// Queue affinity for the enqueued task.
    pub queue: QueueKind,
    /// Opaque request headers forwarded to the adapter.
    pub headers: JsonMap,
    /// Opaque adapter metadata.
    pub extra: JsonMap,
    /// Stable idempotency key; generated when absent.
    pub idempotency_key: Option<String>,
}

impl SaveOptions {
    /// Local-first on the foreground queue (the default).
    #[must_use]
    pub fn local_first() -> Self {
        Self::default()
    }

    /// Remote-first: fail the call rather than queue on failure.
    #[must_use]
    pub fn remote_first() -> Self {
        Self {
            policy: SavePolicy::RemoteFirst,
            ..Self::default()
        }
    }

    /// Sets the queue affinity.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: JsonMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the adapter metadata.
    #[must_use]
    pub fn with_extra(mut self, extra: JsonMap) -> Self {
        self.extra = extra;
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Typed access to one entity type.
///
/// Cheap to clone; all clones share the same underlying stores.
pub struct Repository<T: Record> {
    store: Arc<dyn RecordStore>,
    queue: Arc<TaskQueue>,
    adapters: Arc<AdapterRegistry>,
    feed: Arc<SyncFeed>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            adapters: Arc::clone(&self.adapters),
            feed: Arc::clone(&self.feed),
            _marker: PhantomData,
        }
    }
}

impl<T: Record> Repository<T> {
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<TaskQueue>,
        adapters: Arc<AdapterRegistry>,
        feed: Arc<SyncFeed>,
    ) -> Self {
        Self {
            store,
            queue,
            adapters,
            feed,
            _marker: PhantomData,
        }
    }

    /// Saves an entity.
    ///
    /// Entities without an id get a generated temporary one; the remote
    /// store may later assign a different id, which id negotiation
    /// propagates everywhere. Returns the entity as written locally.
    pub async fn save(&self, entity: T, options: SaveOptions) -> SyncResult<T> {
        self.save_with_op(entity, options, None).await
    }

    /// Saves an entity, forcing a full replace on the remote side.
    pub async fn replace(&self, entity: T, options: SaveOptions) -> SyncResult<T> {
        self.save_with_op(entity, options, Some(TaskOp::Replace)).await
    }

    async fn save_with_op(
        &self,
        mut entity: T,
        options: SaveOptions,
        forced_op: Option<TaskOp>,
    ) -> SyncResult<T> {
        if entity.id().is_empty() {
            entity.set_id(uuid::Uuid::new_v4().to_string());
        }
        let id = entity.id().to_string();
        let value = serde_json::to_value(&entity).map_err(SyncError::codec)?;

        let existed = self.store.contains(T::entity_type(), &id)?;
        let op = forced_op.unwrap_or(if existed { TaskOp::Update } else { TaskOp::Create });

        match options.policy {
            SavePolicy::LocalFirst => {
                self.write_local(&id, &value)?;
                self.emit(&id, local_change(op, existed));
                let task = NewTask::new(T::entity_type(), &id, op, value)
                    .with_queue(options.queue)
                    .with_headers(options.headers)
                    .with_extra(options.extra);
                let task = match options.idempotency_key {
                    Some(key) => task.with_idempotency_key(key),
                    None => task,
                };
                self.queue.enqueue(task)?;
                Ok(entity)
            }
            SavePolicy::RemoteFirst => {
                let adapter = self.adapters.get(T::entity_type())?;
                let snapshot = match op {
                    TaskOp::Create => {
                        adapter
                            .create(value, &options.headers, &options.extra)
                            .await?
                    }
                    TaskOp::Replace => {
                        adapter
                            .replace(value, &options.headers, &options.extra)
                            .await?
                    }
                    _ => {
                        adapter
                            .update(value, &options.headers, &options.extra)
                            .await?
                    }
                };
                // The server snapshot is authoritative here; adopt its id.
                let final_id = snapshot
                    .get(ID_FIELD)
                    .and_then(Value::as_str)
                    .unwrap_or(&id)
                    .to_string();
                self.write_local(&final_id, &snapshot)?;
                self.emit(&final_id, local_change(op, existed));
                serde_json::from_value(snapshot).map_err(SyncError::codec)
            }
        }
    }

    /// Deletes an entity by id. Returns true if a local record existed.
    pub async fn delete(&self, id: &str, options: SaveOptions) -> SyncResult<bool> {
        let existing = self.store.get(T::entity_type(), id)?;
        let snapshot = match &existing {
            Some(bytes) => task::decode(bytes)?,
            None => serde_json::json!({ ID_FIELD: id }),
        };

        match options.policy {
            SavePolicy::LocalFirst => {
                let mut batch = WriteBatch::new();
                batch.delete(T::entity_type(), id);
                self.queue.apply_staged(batch)?;
                self.emit(id, EntityChange::Deleted);
                let task = NewTask::new(T::entity_type(), id, TaskOp::Delete, snapshot)
                    .with_queue(options.queue)
                    .with_headers(options.headers)
                    .with_extra(options.extra);
                self.queue.enqueue(task)?;
                Ok(existing.is_some())
            }
            SavePolicy::RemoteFirst => {
                let adapter = self.adapters.get(T::entity_type())?;
                match adapter.delete(id, &options.headers, &options.extra).await {
                    Ok(()) | Err(RemoteError::Gone) => {}
                    Err(e) => return Err(e.into()),
                }
                self.queue.purge_entity(T::entity_type(), id)?;
                self.emit(id, EntityChange::Deleted);
                Ok(existing.is_some())
            }
        }
    }

    /// Fetches one entity.
    ///
    /// A remote gone response deletes the local copy and its queued tasks
    /// and resolves to `Ok(None)` - gone is never surfaced as a failure.
    pub async fn find_one(&self, id: &str, policy: LoadPolicy) -> SyncResult<Option<T>> {
        match policy {
            LoadPolicy::LocalOnly => self.read_local(id),
            LoadPolicy::LocalThenRemote => {
                let local = self.read_local(id)?;
                self.spawn_refresh_one(id.to_string());
                Ok(local)
            }
            LoadPolicy::RemoteFirst => {
                let adapter = self.adapters.get(T::entity_type())?;
                match adapter.find_one(id).await {
                    Ok(Some(snapshot)) => {
                        if self.has_outstanding(id)? {
                            // A pending local change is never clobbered.
                            return self.read_local(id);
                        }
                        self.write_local(id, &snapshot)?;
                        serde_json::from_value(snapshot)
                            .map(Some)
                            .map_err(SyncError::codec)
                    }
                    Ok(None) => self.read_local(id),
                    Err(RemoteError::Gone) => {
                        self.queue.purge_entity(T::entity_type(), id)?;
                        self.emit(id, EntityChange::Deleted);
                        Ok(None)
                    }
                    Err(e) => {
                        debug!(entity_type = T::entity_type(), id, error = %e, "remote load failed, falling back to local");
                        self.read_local(id)
                    }
                }
            }
        }
    }

    /// Fetches every entity of this type.
    pub async fn find_all(&self, policy: LoadPolicy) -> SyncResult<Vec<T>> {
        match policy {
            LoadPolicy::LocalOnly => self.read_all_local(),
            LoadPolicy::LocalThenRemote => {
                let local = self.read_all_local()?;
                self.spawn_refresh_all();
                Ok(local)
            }
            LoadPolicy::RemoteFirst => {
                let adapter = self.adapters.get(T::entity_type())?;
                match adapter.find_all().await {
                    Ok(snapshots) => {
                        self.apply_remote_snapshots(&snapshots)?;
                        self.read_all_local()
                    }
                    Err(e) => {
                        debug!(entity_type = T::entity_type(), error = %e, "remote list failed, falling back to local");
                        self.read_all_local()
                    }
                }
            }
        }
    }

    /// Subscribes to this entity type's change events.
    pub fn watch(&self) -> Receiver<SyncEvent> {
        self.feed.subscribe_type(T::entity_type())
    }

    /// Subscribes to one entity's change events. Id-changed events for
    /// the watched id are delivered too, so watchers can follow a
    /// renegotiated entity to its new id.
    pub fn watch_one(&self, id: impl Into<String>) -> Receiver<SyncEvent> {
        self.feed.subscribe_entity(T::entity_type(), id)
    }

    /// Returns the entity's sync-status projection.
    pub fn status(&self, id: &str) -> SyncResult<SyncStatus> {
        self.queue.status_of(T::entity_type(), id)
    }

    /// Returns this entity's dead or conflicted tasks to pending.
    pub fn requeue_dead(&self, id: &str) -> SyncResult<usize> {
        self.queue.requeue_dead(T::entity_type(), id)
    }

    fn read_local(&self, id: &str) -> SyncResult<Option<T>> {
        match self.store.get(T::entity_type(), id)? {
            Some(bytes) => {
                let value: Value = task::decode(&bytes)?;
                serde_json::from_value(value).map(Some).map_err(SyncError::codec)
            }
            None => Ok(None),
        }
    }

    fn read_all_local(&self) -> SyncResult<Vec<T>> {
        self.store
            .list(T::entity_type())?
            .iter()
            .map(|(_, bytes)| {
                let value: Value = task::decode(bytes)?;
                serde_json::from_value(value).map_err(SyncError::codec)
            })
            .collect()
    }

    fn write_local(&self, id: &str, value: &Value) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(T::entity_type(), id, task::encode(value)?);
        self.queue.apply_staged(batch)?;
        Ok(())
    }

    fn has_outstanding(&self, id: &str) -> SyncResult<bool> {
        Ok(self
            .queue
            .tasks_for_entity(T::entity_type(), id)?
            .iter()
            .any(|t| t.status.is_outstanding()))
    }

    /// Writes remote snapshots over local rows, skipping any entity with
    /// outstanding tasks.
    fn apply_remote_snapshots(&self, snapshots: &[Value]) -> SyncResult<()> {
        for snapshot in snapshots {
            let Some(id) = snapshot.get(ID_FIELD).and_then(Value::as_str) else {
                continue;
            };
            if self.has_outstanding(id)? {
                continue;
            }
            self.write_local(id, snapshot)?;
        }
        Ok(())
    }

    fn emit(&self, id: &str, change: EntityChange) {
        self.feed.emit(EventKind::Entity {
            entity_type: T::entity_type().to_string(),
            entity_id: id.to_string(),
            change,
        });
    }

    fn spawn_refresh_one(&self, id: String) {
        let repo = self.clone();
        tokio::spawn(async move {
            let Ok(adapter) = repo.adapters.get(T::entity_type()) else {
                return;
            };
            match adapter.find_one(&id).await {
                Ok(Some(snapshot)) => {
                    let outstanding = repo.has_outstanding(&id).unwrap_or(true);
                    if !outstanding && repo.write_local(&id, &snapshot).is_ok() {
                        repo.emit(&id, EntityChange::Updated);
                    }
                }
                Err(RemoteError::Gone) => {
                    if repo.queue.purge_entity(T::entity_type(), &id).is_ok() {
                        repo.emit(&id, EntityChange::Deleted);
                    }
                }
                Ok(None) | Err(_) => {}
            }
        });
    }

    fn spawn_refresh_all(&self) {
        let repo = self.clone();
        tokio::spawn(async move {
            let Ok(adapter) = repo.adapters.get(T::entity_type()) else {
                return;
            };
            if let Ok(snapshots) = adapter.find_all().await {
                let _ = repo.apply_remote_snapshots(&snapshots);
            }
        });
    }
}

impl<T: Record> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity_type", &T::entity_type())
            .finish_non_exhaustive()
    }
}

fn local_change(op: TaskOp, existed: bool) -> EntityChange {
    match op {
        TaskOp::Create => EntityChange::Created,
        TaskOp::Update | TaskOp::Replace => {
            if existed {
                EntityChange::Updated
            } else {
                EntityChange::Created
            }
        }
        TaskOp::Delete => EntityChange::Deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncFeed;
    use crate::graph::DependencyGraph;
    use crate::remote::MockAdapter;
    use serde::Deserialize;
    use serde_json::json;
    use tether_store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Todo {
        id: String,
        title: String,
        #[serde(default)]
        done: bool,
    }

    impl Record for Todo {
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

    struct Harness {
        repo: Repository<Todo>,
        queue: Arc<TaskQueue>,
        mock: Arc<MockAdapter>,
        store: Arc<dyn RecordStore>,
    }

    fn harness() -> Harness {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let graph = Arc::new(DependencyGraph::new());
        let feed = Arc::new(SyncFeed::new());
        let queue = Arc::new(
            TaskQueue::open(Arc::clone(&store), graph, Arc::clone(&feed)).unwrap(),
        );
        let mock = Arc::new(MockAdapter::new());
        let mut adapters = AdapterRegistry::new();
        adapters.insert("todos", Arc::clone(&mock) as Arc<dyn crate::remote::RemoteAdapter>);

        let repo = Repository::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::new(adapters),
            feed,
        );
        Harness {
            repo,
            queue,
            mock,
            store,
        }
    }

    fn todo(id: &str, title: &str) -> Todo {
        Todo {
            id: id.into(),
            title: title.into(),
            done: false,
        }
    }

    #[tokio::test]
    async fn local_first_save_commits_and_enqueues() {
        let h = harness();
        let saved = h
            .repo
            .save(todo("t1", "buy milk"), SaveOptions::local_first())
            .await
            .unwrap();

        assert_eq!(saved.id, "t1");
        assert!(h.store.contains("todos", "t1").unwrap());
        assert_eq!(h.queue.len().unwrap(), 1);
        assert_eq!(h.repo.status("t1").unwrap(), SyncStatus::Pending);
        // Nothing touched the network.
        assert!(h.mock.calls().is_empty());

        let tasks = h.queue.tasks_for_entity("todos", "t1").unwrap();
        assert_eq!(tasks[0].op, TaskOp::Create);
    }

    #[tokio::test]
    async fn second_save_enqueues_update() {
        let h = harness();
        h.repo
            .save(todo("t1", "v1"), SaveOptions::local_first())
            .await
            .unwrap();
        h.repo
            .save(todo("t1", "v2"), SaveOptions::local_first())
            .await
            .unwrap();

        let tasks = h.queue.tasks_for_entity("todos", "t1").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].op, TaskOp::Create);
        assert_eq!(tasks[1].op, TaskOp::Update);
    }

    #[tokio::test]
    async fn empty_id_gets_generated() {
        let h = harness();
        let saved = h
            .repo
            .save(todo("", "untitled"), SaveOptions::local_first())
            .await
            .unwrap();

        assert!(!saved.id.is_empty());
        assert!(h.store.contains("todos", &saved.id).unwrap());
    }

    #[tokio::test]
    async fn remote_first_save_does_not_enqueue() {
        let h = harness();
        let saved = h
            .repo
            .save(todo("t1", "direct"), SaveOptions::remote_first())
            .await
            .unwrap();

        assert_eq!(saved.id, "t1");
        assert_eq!(h.queue.len().unwrap(), 0);
        assert_eq!(h.mock.call_count("create"), 1);
        assert!(h.store.contains("todos", "t1").unwrap());
        assert_eq!(h.repo.status("t1").unwrap(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn remote_first_save_failure_writes_nothing() {
        let h = harness();
        h.mock.push_create(Err(RemoteError::network("offline")));

        let result = h
            .repo
            .save(todo("t1", "doomed"), SaveOptions::remote_first())
            .await;

        assert!(result.is_err());
        assert!(!h.store.contains("todos", "t1").unwrap());
        assert_eq!(h.queue.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn remote_first_save_adopts_server_id() {
        let h = harness();
        h.mock
            .push_create(Ok(json!({"id": "server_9", "title": "direct", "done": false})));

        let saved = h
            .repo
            .save(todo("c1", "direct"), SaveOptions::remote_first())
            .await
            .unwrap();

        assert_eq!(saved.id, "server_9");
        assert!(h.store.contains("todos", "server_9").unwrap());
    }

    #[tokio::test]
    async fn local_first_delete_enqueues_task() {
        let h = harness();
        h.repo
            .save(todo("t1", "bye"), SaveOptions::local_first())
            .await
            .unwrap();

        let existed = h
            .repo
            .delete("t1", SaveOptions::local_first())
            .await
            .unwrap();

        assert!(existed);
        assert!(!h.store.contains("todos", "t1").unwrap());
        let tasks = h.queue.tasks_for_entity("todos", "t1").unwrap();
        assert_eq!(tasks.last().unwrap().op, TaskOp::Delete);
        // The delete payload keeps the last snapshot for the adapter.
        assert_eq!(tasks.last().unwrap().payload["title"], "bye");
    }

    #[tokio::test]
    async fn remote_first_delete_purges() {
        let h = harness();
        h.repo
            .save(todo("t1", "bye"), SaveOptions::local_first())
            .await
            .unwrap();

        h.repo
            .delete("t1", SaveOptions::remote_first())
            .await
            .unwrap();

        assert!(!h.store.contains("todos", "t1").unwrap());
        assert_eq!(h.queue.len().unwrap(), 0);
        assert_eq!(h.mock.call_count("delete"), 1);
    }

    #[tokio::test]
    async fn find_one_local_only() {
        let h = harness();
        h.repo
            .save(todo("t1", "here"), SaveOptions::local_first())
            .await
            .unwrap();

        let found = h.repo.find_one("t1", LoadPolicy::LocalOnly).await.unwrap();
        assert_eq!(found.unwrap().title, "here");
        assert!(h.mock.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_first_find_overwrites_settled_entity() {
        let h = harness();
        h.repo
            .save(todo("t1", "local"), SaveOptions::remote_first())
            .await
            .unwrap();
        h.mock
            .push_find_one(Ok(Some(json!({"id": "t1", "title": "remote", "done": true}))));

        let found = h
            .repo
            .find_one("t1", LoadPolicy::RemoteFirst)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.title, "remote");

        let local = h.repo.find_one("t1", LoadPolicy::LocalOnly).await.unwrap();
        assert_eq!(local.unwrap().title, "remote");
    }

    #[tokio::test]
    async fn remote_first_find_never_clobbers_pending() {
        let h = harness();
        h.repo
            .save(todo("t1", "local-edit"), SaveOptions::local_first())
            .await
            .unwrap();
        h.mock
            .push_find_one(Ok(Some(json!({"id": "t1", "title": "remote", "done": true}))));

        let found = h
            .repo
            .find_one("t1", LoadPolicy::RemoteFirst)
            .await
            .unwrap()
            .unwrap();

        // The pending local edit wins.
        assert_eq!(found.title, "local-edit");
    }

    #[tokio::test]
    async fn remote_first_find_falls_back_on_network_error() {
        let h = harness();
        h.repo
            .save(todo("t1", "cached"), SaveOptions::remote_first())
            .await
            .unwrap();
        h.mock.push_find_one(Err(RemoteError::network("offline")));

        let found = h
            .repo
            .find_one("t1", LoadPolicy::RemoteFirst)
            .await
            .unwrap();
        assert_eq!(found.unwrap().title, "cached");
    }

    #[tokio::test]
    async fn gone_on_find_purges_and_returns_none() {
        let h = harness();
        h.repo
            .save(todo("t1", "doomed"), SaveOptions::local_first())
            .await
            .unwrap();
        h.mock.push_find_one(Err(RemoteError::Gone));

        let found = h.repo.find_one("t1", LoadPolicy::RemoteFirst).await.unwrap();

        assert!(found.is_none());
        assert!(!h.store.contains("todos", "t1").unwrap());
        assert_eq!(h.queue.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn local_then_remote_returns_local_and_refreshes() {
        let h = harness();
        h.repo
            .save(todo("t1", "stale"), SaveOptions::remote_first())
            .await
            .unwrap();
        h.mock
            .push_find_one(Ok(Some(json!({"id": "t1", "title": "fresh", "done": false}))));

        let immediate = h
            .repo
            .find_one("t1", LoadPolicy::LocalThenRemote)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(immediate.title, "stale");

        // Give the background refresh a moment to land.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let after = h.repo.find_one("t1", LoadPolicy::LocalOnly).await.unwrap();
        assert_eq!(after.unwrap().title, "fresh");
    }

    #[tokio::test]
    async fn find_all_remote_first_skips_pending_entities() {
        let h = harness();
        h.repo
            .save(todo("t1", "pending-edit"), SaveOptions::local_first())
            .await
            .unwrap();
        h.repo
            .save(todo("t2", "settled"), SaveOptions::remote_first())
            .await
            .unwrap();
        h.mock.push_find_all(Ok(vec![
            json!({"id": "t1", "title": "remote-1", "done": false}),
            json!({"id": "t2", "title": "remote-2", "done": false}),
        ]));

        let all = h.repo.find_all(LoadPolicy::RemoteFirst).await.unwrap();
        let by_id: std::collections::HashMap<_, _> =
            all.into_iter().map(|t| (t.id.clone(), t)).collect();

        assert_eq!(by_id["t1"].title, "pending-edit");
        assert_eq!(by_id["t2"].title, "remote-2");
    }

    #[tokio::test]
    async fn watch_sees_local_commits() {
        let h = harness();
        let rx = h.repo.watch();

        h.repo
            .save(todo("t1", "observed"), SaveOptions::local_first())
            .await
            .unwrap();

        let event = rx.recv_timeout(std::time::Duration::from_millis(100)).unwrap();
        match event.kind {
            EventKind::Entity { change, entity_id, .. } => {
                assert_eq!(change, EntityChange::Created);
                assert_eq!(entity_id, "t1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
