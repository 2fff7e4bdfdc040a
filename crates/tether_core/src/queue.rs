//! Durable task store.
//!
//! Pending remote operations are persisted as rows in reserved
//! collections of the local record store, so the queue survives process
//! restarts independently of any in-memory scheduling state. Every
//! mutation commits the task row and the owning entity's sync-status
//! projection in one atomic batch - there is no observable state where a
//! task is gone but the projection still says pending.

use crate::error::SyncResult;
use crate::events::{EventKind, SyncFeed};
use crate::graph::DependencyGraph;
use crate::task::{self, QueueKind, SyncStatus, SyncTask, TaskId, TaskOp, TaskStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_store::{RecordStore, WriteBatch};
use tokio::sync::Notify;
use tracing::debug;

/// Reserved collection holding task rows.
pub(crate) const TASKS_COLLECTION: &str = "__tether/tasks";
/// Reserved collection holding per-entity sync-status rows.
pub(crate) const STATUS_COLLECTION: &str = "__tether/status";

fn status_key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}/{entity_id}")
}

/// Parameters for enqueueing a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Entity type name.
    pub entity_type: String,
    /// Entity id.
    pub entity_id: String,
    /// Remote operation to perform.
    pub op: TaskOp,
    /// Entity snapshot at enqueue time.
    pub payload: serde_json::Value,
    /// Stable key across retries; generated when absent.
    pub idempotency_key: Option<String>,
    /// Opaque request headers.
    pub headers: serde_json::Map<String, serde_json::Value>,
    /// Opaque adapter metadata.
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Logical queue affinity.
    pub queue: QueueKind,
}

impl NewTask {
    /// Creates an enqueue request with empty metadata on the foreground
    /// queue.
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        op: TaskOp,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            op,
            payload,
            idempotency_key: None,
            headers: serde_json::Map::new(),
            extra: serde_json::Map::new(),
            queue: QueueKind::Foreground,
        }
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the queue affinity.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: serde_json::Map<String, serde_json::Value>) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the adapter metadata.
    #[must_use]
    pub fn with_extra(mut self, extra: serde_json::Map<String, serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }
}

/// The durable task store.
///
/// Owns every task row (single-writer discipline: all mutations funnel
/// through one internal lock) and the derived per-entity sync-status
/// projection.
pub struct TaskQueue {
    store: Arc<dyn RecordStore>,
    graph: Arc<DependencyGraph>,
    feed: Arc<SyncFeed>,
    next_task_id: AtomicU64,
    write_lock: Mutex<()>,
    foreground_wake: Arc<Notify>,
    background_wake: Arc<Notify>,
}

impl TaskQueue {
    /// Opens the task store, seeding the id counter from existing rows.
    pub fn open(
        store: Arc<dyn RecordStore>,
        graph: Arc<DependencyGraph>,
        feed: Arc<SyncFeed>,
    ) -> SyncResult<Self> {
        let max_id = store
            .list(TASKS_COLLECTION)?
            .iter()
            .map(|(_, bytes)| SyncTask::decode(bytes).map(|t| t.id.as_u64()))
            .collect::<SyncResult<Vec<u64>>>()?
            .into_iter()
            .max()
            .unwrap_or(0);

        Ok(Self {
            store,
            graph,
            feed,
            next_task_id: AtomicU64::new(max_id + 1),
            write_lock: Mutex::new(()),
            foreground_wake: Arc::new(Notify::new()),
            background_wake: Arc::new(Notify::new()),
        })
    }

    /// Returns the wake handle for a queue's runner.
    #[must_use]
    pub fn wake_handle(&self, kind: QueueKind) -> Arc<Notify> {
        match kind {
            QueueKind::Foreground => Arc::clone(&self.foreground_wake),
            QueueKind::Background => Arc::clone(&self.background_wake),
        }
    }

    fn wake(&self, kind: QueueKind) {
        match kind {
            QueueKind::Foreground => self.foreground_wake.notify_one(),
            QueueKind::Background => self.background_wake.notify_one(),
        }
    }

    /// Returns tasks found in the processing state to pending.
    ///
    /// Called once at startup: a processing row can only be a leftover
    /// from a crash, since no worker survives a restart.
    pub fn recover(&self) -> SyncResult<usize> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::new();
        let mut recovered = 0;

        for task in self.all_tasks()? {
            if task.status == TaskStatus::Processing {
                let mut task = task;
                task.status = TaskStatus::Pending;
                task.next_retry_at = None;
                batch.put(TASKS_COLLECTION, task.id.store_key(), task.encode()?);
                recovered += 1;
            }
        }

        if recovered > 0 {
            self.store.apply(batch)?;
            debug!(recovered, "recovered interrupted tasks");
            self.wake(QueueKind::Foreground);
            self.wake(QueueKind::Background);
        }
        Ok(recovered)
    }

    /// Inserts a new pending task and moves the owning entity's status to
    /// pending (or leaves it dead: dead wins while both exist), atomically.
    pub fn enqueue(&self, new_task: NewTask) -> SyncResult<TaskId> {
        let _guard = self.write_lock.lock();
        let id = TaskId::new(self.next_task_id.fetch_add(1, Ordering::SeqCst));

        let task = SyncTask {
            id,
            entity_type: new_task.entity_type,
            entity_id: new_task.entity_id,
            op: new_task.op,
            payload: new_task.payload,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            idempotency_key: new_task
                .idempotency_key
                .or_else(|| Some(uuid::Uuid::new_v4().to_string())),
            headers: new_task.headers,
            extra: new_task.extra,
            status: TaskStatus::Pending,
            queue: new_task.queue,
            created_at: Utc::now(),
        };

        let before = self.status_of(&task.entity_type, &task.entity_id)?;
        let mut siblings = self.tasks_for_entity(&task.entity_type, &task.entity_id)?;
        siblings.push(task.clone());

        let mut batch = WriteBatch::new();
        batch.put(TASKS_COLLECTION, id.store_key(), task.encode()?);
        self.stage_projection(&mut batch, &task.entity_type, &task.entity_id, &siblings)?;
        self.store.apply(batch)?;
        self.emit_projection(&task.entity_type, &task.entity_id, &siblings, before);

        debug!(task = %id, entity = %task.entity_id, op = %task.op, "enqueued");
        self.wake(task.queue);
        Ok(id)
    }

    /// Returns due pending tasks for one queue, ordered by dependency
    /// level (parents first), then enqueue time, then id.
    ///
    /// Per-entity FIFO is enforced here: an entity contributes only its
    /// earliest outstanding task, and only when that task is due on the
    /// requested queue. An entity with a processing task contributes
    /// nothing.
    pub fn due_tasks(
        &self,
        now: DateTime<Utc>,
        kind: QueueKind,
        limit: usize,
    ) -> SyncResult<Vec<SyncTask>> {
        let mut heads: HashMap<(String, String), SyncTask> = HashMap::new();
        for task in self.all_tasks()? {
            if !task.status.is_outstanding() {
                continue;
            }
            let key = task.entity_key();
            match heads.get(&key) {
                Some(head) if (head.created_at, head.id) <= (task.created_at, task.id) => {}
                _ => {
                    heads.insert(key, task);
                }
            }
        }

        let mut due: Vec<SyncTask> = heads
            .into_values()
            .filter(|t| t.queue == kind && t.is_due(now))
            .collect();
        due.sort_by(|a, b| {
            let la = self.graph.level(&a.entity_type);
            let lb = self.graph.level(&b.entity_type);
            la.cmp(&lb)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    /// Fetches a task row by id.
    pub fn get(&self, id: TaskId) -> SyncResult<Option<SyncTask>> {
        match self.store.get(TASKS_COLLECTION, &id.store_key())? {
            Some(bytes) => Ok(Some(SyncTask::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Claims a pending task for execution.
    ///
    /// Returns false if the row is gone or no longer pending, in which
    /// case the caller must not execute it.
    pub fn mark_processing(&self, id: TaskId) -> SyncResult<bool> {
        let _guard = self.write_lock.lock();
        let Some(mut task) = self.get(id)? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::Processing;

        let mut batch = WriteBatch::new();
        batch.put(TASKS_COLLECTION, id.store_key(), task.encode()?);
        self.store.apply(batch)?;
        Ok(true)
    }

    /// Returns a failed task to pending with an updated attempt count,
    /// error message, and retry floor.
    pub fn reschedule(
        &self,
        id: TaskId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        let Some(mut task) = self.get(id)? else {
            return Ok(());
        };
        task.status = TaskStatus::Pending;
        task.attempt_count += 1;
        task.last_error = Some(error.to_string());
        task.next_retry_at = Some(next_retry_at);

        let mut batch = WriteBatch::new();
        batch.put(TASKS_COLLECTION, id.store_key(), task.encode()?);
        self.store.apply(batch)?;
        debug!(task = %id, attempts = task.attempt_count, "rescheduled");
        Ok(())
    }

    /// Marks a task dead. Terminal: the row stays for inspection and the
    /// entity's projection flips to dead.
    pub fn mark_dead(&self, id: TaskId, error: &str) -> SyncResult<()> {
        self.finalize_failure(id, TaskStatus::Dead, error)
    }

    /// Parks a task in the conflict state for manual resolution.
    pub fn mark_conflict(&self, id: TaskId, error: &str) -> SyncResult<()> {
        self.finalize_failure(id, TaskStatus::Conflict, error)
    }

    fn finalize_failure(&self, id: TaskId, status: TaskStatus, error: &str) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        let Some(mut task) = self.get(id)? else {
            return Ok(());
        };
        task.status = status;
        task.attempt_count += 1;
        task.last_error = Some(error.to_string());
        task.next_retry_at = None;

        let before = self.status_of(&task.entity_type, &task.entity_id)?;
        let mut siblings = self.tasks_for_entity(&task.entity_type, &task.entity_id)?;
        if let Some(row) = siblings.iter_mut().find(|t| t.id == id) {
            *row = task.clone();
        }

        let mut batch = WriteBatch::new();
        batch.put(TASKS_COLLECTION, id.store_key(), task.encode()?);
        self.stage_projection(&mut batch, &task.entity_type, &task.entity_id, &siblings)?;
        self.store.apply(batch)?;
        self.emit_projection(&task.entity_type, &task.entity_id, &siblings, before);
        Ok(())
    }

    /// Deletes a completed task and recomputes the entity's projection.
    ///
    /// Idempotent: completing an unknown or already-completed id is a
    /// no-op.
    pub fn complete(&self, id: TaskId) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        let Some(task) = self.get(id)? else {
            return Ok(());
        };

        let before = self.status_of(&task.entity_type, &task.entity_id)?;
        let siblings: Vec<SyncTask> = self
            .tasks_for_entity(&task.entity_type, &task.entity_id)?
            .into_iter()
            .filter(|t| t.id != id)
            .collect();

        let mut batch = WriteBatch::new();
        batch.delete(TASKS_COLLECTION, id.store_key());
        self.stage_projection(&mut batch, &task.entity_type, &task.entity_id, &siblings)?;
        self.store.apply(batch)?;
        self.emit_projection(&task.entity_type, &task.entity_id, &siblings, before);
        Ok(())
    }

    /// Returns every task for an entity in creation order.
    pub fn tasks_for_entity(&self, entity_type: &str, entity_id: &str) -> SyncResult<Vec<SyncTask>> {
        let mut tasks: Vec<SyncTask> = self
            .all_tasks()?
            .into_iter()
            .filter(|t| t.entity_type == entity_type && t.entity_id == entity_id)
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    /// Returns the entity's sync-status projection.
    pub fn status_of(&self, entity_type: &str, entity_id: &str) -> SyncResult<SyncStatus> {
        match self
            .store
            .get(STATUS_COLLECTION, &status_key(entity_type, entity_id))?
        {
            Some(bytes) => task::decode(&bytes),
            None => Ok(SyncStatus::Synced),
        }
    }

    /// Returns dead and conflicted tasks for an entity to pending with
    /// reset attempt counts. The explicit manual-intervention surface:
    /// dead tasks are never retried automatically.
    pub fn requeue_dead(&self, entity_type: &str, entity_id: &str) -> SyncResult<usize> {
        let _guard = self.write_lock.lock();
        let before = self.status_of(entity_type, entity_id)?;
        let mut siblings = self.tasks_for_entity(entity_type, entity_id)?;
        let mut batch = WriteBatch::new();
        let mut requeued = 0;
        let mut queues = Vec::new();

        for task in siblings.iter_mut() {
            if matches!(task.status, TaskStatus::Dead | TaskStatus::Conflict) {
                task.status = TaskStatus::Pending;
                task.attempt_count = 0;
                task.last_error = None;
                task.next_retry_at = None;
                batch.put(TASKS_COLLECTION, task.id.store_key(), task.encode()?);
                queues.push(task.queue);
                requeued += 1;
            }
        }

        if requeued > 0 {
            self.stage_projection(&mut batch, entity_type, entity_id, &siblings)?;
            self.store.apply(batch)?;
            self.emit_projection(entity_type, entity_id, &siblings, before);
            for queue in queues {
                self.wake(queue);
            }
        }
        Ok(requeued)
    }

    /// Deletes an entity's local record, all of its tasks, and its status
    /// row in one atomic batch. Used when the remote store reports the
    /// entity permanently gone.
    pub fn purge_entity(&self, entity_type: &str, entity_id: &str) -> SyncResult<usize> {
        let _guard = self.write_lock.lock();
        let tasks = self.tasks_for_entity(entity_type, entity_id)?;

        let mut batch = WriteBatch::new();
        for task in &tasks {
            batch.delete(TASKS_COLLECTION, task.id.store_key());
        }
        batch.delete(STATUS_COLLECTION, status_key(entity_type, entity_id));
        batch.delete(entity_type, entity_id);
        self.store.apply(batch)?;
        Ok(tasks.len())
    }

    /// Returns the number of task rows.
    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.store.list(TASKS_COLLECTION)?.len())
    }

    /// Returns true if no task rows exist.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Decodes every task row.
    pub(crate) fn all_tasks(&self) -> SyncResult<Vec<SyncTask>> {
        self.store
            .list(TASKS_COLLECTION)?
            .iter()
            .map(|(_, bytes)| SyncTask::decode(bytes))
            .collect()
    }

    /// Computes the projection from an entity's task rows.
    ///
    /// Dead (or conflicted) wins over pending while both exist; an entity
    /// with no rows is synced.
    fn project(tasks: &[SyncTask]) -> SyncStatus {
        if tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Dead | TaskStatus::Conflict))
        {
            SyncStatus::Dead
        } else if tasks.iter().any(|t| t.status.is_outstanding()) {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        }
    }

    /// Stages the projection row for an entity into a batch. A synced
    /// entity has its row removed rather than stored.
    fn stage_projection(
        &self,
        batch: &mut WriteBatch,
        entity_type: &str,
        entity_id: &str,
        tasks: &[SyncTask],
    ) -> SyncResult<()> {
        let key = status_key(entity_type, entity_id);
        match Self::project(tasks) {
            SyncStatus::Synced => batch.delete(STATUS_COLLECTION, key),
            status => batch.put(STATUS_COLLECTION, key, task::encode(&status)?),
        }
        Ok(())
    }

    /// Emits a status event when the projection actually changed. Called
    /// after the batch committed.
    fn emit_projection(
        &self,
        entity_type: &str,
        entity_id: &str,
        tasks: &[SyncTask],
        before: SyncStatus,
    ) {
        let after = Self::project(tasks);
        if after == before {
            return;
        }
        self.feed.emit(EventKind::StatusChanged {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            status: after,
        });
    }

    // Staging helpers for multi-row rewrites (id negotiation). These only
    // build batch entries; the caller owns atomicity and event emission.

    pub(crate) fn stage_task(&self, batch: &mut WriteBatch, task: &SyncTask) -> SyncResult<()> {
        batch.put(TASKS_COLLECTION, task.id.store_key(), task.encode()?);
        Ok(())
    }

    pub(crate) fn stage_status_move(
        &self,
        batch: &mut WriteBatch,
        entity_type: &str,
        old_id: &str,
        new_id: &str,
    ) -> SyncResult<()> {
        if let Some(bytes) = self
            .store
            .get(STATUS_COLLECTION, &status_key(entity_type, old_id))?
        {
            batch.delete(STATUS_COLLECTION, status_key(entity_type, old_id));
            batch.put(STATUS_COLLECTION, status_key(entity_type, new_id), bytes);
        }
        Ok(())
    }

    /// Applies a staged batch under the store's single-writer lock.
    pub(crate) fn apply_staged(&self, batch: WriteBatch) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        self.store.apply(batch)?;
        Ok(())
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("next_task_id", &self.next_task_id.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_store::MemoryStore;

    fn make_queue() -> TaskQueue {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let mut graph = DependencyGraph::new();
        graph.register("todos", "user_id", "users").unwrap();
        TaskQueue::open(store, Arc::new(graph), Arc::new(SyncFeed::new())).unwrap()
    }

    fn create_task(entity_type: &str, entity_id: &str) -> NewTask {
        NewTask::new(
            entity_type,
            entity_id,
            TaskOp::Create,
            json!({"id": entity_id}),
        )
    }

    #[test]
    fn enqueue_sets_projection_pending() {
        let queue = make_queue();
        queue.enqueue(create_task("users", "u1")).unwrap();

        assert_eq!(queue.status_of("users", "u1").unwrap(), SyncStatus::Pending);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn task_ids_are_monotonic() {
        let queue = make_queue();
        let a = queue.enqueue(create_task("users", "u1")).unwrap();
        let b = queue.enqueue(create_task("users", "u2")).unwrap();
        assert!(b > a);
    }

    #[test]
    fn due_tasks_order_parents_first() {
        let queue = make_queue();
        queue.enqueue(create_task("todos", "t1")).unwrap();
        queue.enqueue(create_task("users", "u1")).unwrap();

        let due = queue
            .due_tasks(Utc::now(), QueueKind::Foreground, 10)
            .unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].entity_type, "users");
        assert_eq!(due[1].entity_type, "todos");
    }

    #[test]
    fn due_tasks_fifo_within_level() {
        let queue = make_queue();
        queue.enqueue(create_task("users", "u1")).unwrap();
        queue.enqueue(create_task("users", "u2")).unwrap();

        let due = queue
            .due_tasks(Utc::now(), QueueKind::Foreground, 10)
            .unwrap();
        assert_eq!(due[0].entity_id, "u1");
        assert_eq!(due[1].entity_id, "u2");
    }

    #[test]
    fn one_head_per_entity() {
        let queue = make_queue();
        for _ in 0..5 {
            queue
                .enqueue(NewTask::new(
                    "users",
                    "u1",
                    TaskOp::Update,
                    json!({"id": "u1"}),
                ))
                .unwrap();
        }

        let due = queue
            .due_tasks(Utc::now(), QueueKind::Foreground, 10)
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn processing_entity_contributes_nothing() {
        let queue = make_queue();
        let first = queue.enqueue(create_task("users", "u1")).unwrap();
        queue
            .enqueue(NewTask::new(
                "users",
                "u1",
                TaskOp::Update,
                json!({"id": "u1"}),
            ))
            .unwrap();

        assert!(queue.mark_processing(first).unwrap());
        let due = queue
            .due_tasks(Utc::now(), QueueKind::Foreground, 10)
            .unwrap();
        assert!(due.is_empty());
    }

    #[test]
    fn queue_partition_respected() {
        let queue = make_queue();
        queue
            .enqueue(create_task("users", "u1").with_queue(QueueKind::Background))
            .unwrap();

        assert!(queue
            .due_tasks(Utc::now(), QueueKind::Foreground, 10)
            .unwrap()
            .is_empty());
        assert_eq!(
            queue
                .due_tasks(Utc::now(), QueueKind::Background, 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn mark_processing_claims_once() {
        let queue = make_queue();
        let id = queue.enqueue(create_task("users", "u1")).unwrap();

        assert!(queue.mark_processing(id).unwrap());
        assert!(!queue.mark_processing(id).unwrap());
        assert!(!queue.mark_processing(TaskId::new(999)).unwrap());
    }

    #[test]
    fn reschedule_updates_attempts_and_floor() {
        let queue = make_queue();
        let id = queue.enqueue(create_task("users", "u1")).unwrap();
        queue.mark_processing(id).unwrap();

        let floor = Utc::now() + chrono::Duration::seconds(60);
        queue.reschedule(id, "connection reset", floor).unwrap();

        let task = queue.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("connection reset"));
        assert!(!task.is_due(Utc::now()));
        assert!(task.is_due(floor + chrono::Duration::seconds(1)));
    }

    #[test]
    fn complete_removes_row_and_settles_projection() {
        let queue = make_queue();
        let id = queue.enqueue(create_task("users", "u1")).unwrap();
        queue.complete(id).unwrap();

        assert_eq!(queue.len().unwrap(), 0);
        assert_eq!(queue.status_of("users", "u1").unwrap(), SyncStatus::Synced);
    }

    #[test]
    fn complete_is_idempotent() {
        let queue = make_queue();
        let id = queue.enqueue(create_task("users", "u1")).unwrap();
        queue.complete(id).unwrap();
        queue.complete(id).unwrap();
        queue.complete(TaskId::new(424242)).unwrap();

        assert_eq!(queue.status_of("users", "u1").unwrap(), SyncStatus::Synced);
    }

    #[test]
    fn dead_wins_over_pending() {
        let queue = make_queue();
        let dead = queue.enqueue(create_task("users", "u1")).unwrap();
        queue
            .enqueue(NewTask::new(
                "users",
                "u1",
                TaskOp::Update,
                json!({"id": "u1"}),
            ))
            .unwrap();

        queue.mark_dead(dead, "validation failed").unwrap();
        assert_eq!(queue.status_of("users", "u1").unwrap(), SyncStatus::Dead);
    }

    #[test]
    fn dead_does_not_block_new_enqueues() {
        let queue = make_queue();
        let dead = queue.enqueue(create_task("users", "u1")).unwrap();
        queue.mark_dead(dead, "boom").unwrap();

        queue
            .enqueue(NewTask::new(
                "users",
                "u1",
                TaskOp::Update,
                json!({"id": "u1"}),
            ))
            .unwrap();
        // Dead still wins the projection; the new task is schedulable.
        assert_eq!(queue.status_of("users", "u1").unwrap(), SyncStatus::Dead);
        let due = queue
            .due_tasks(Utc::now(), QueueKind::Foreground, 10)
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].op, TaskOp::Update);
    }

    #[test]
    fn requeue_dead_resets_attempts() {
        let queue = make_queue();
        let id = queue.enqueue(create_task("users", "u1")).unwrap();
        queue.mark_dead(id, "boom").unwrap();
        assert_eq!(queue.status_of("users", "u1").unwrap(), SyncStatus::Dead);

        let requeued = queue.requeue_dead("users", "u1").unwrap();
        assert_eq!(requeued, 1);

        let task = queue.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.last_error.is_none());
        assert_eq!(queue.status_of("users", "u1").unwrap(), SyncStatus::Pending);
    }

    #[test]
    fn purge_removes_tasks_status_and_entity() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let queue = TaskQueue::open(
            Arc::clone(&store),
            Arc::new(DependencyGraph::new()),
            Arc::new(SyncFeed::new()),
        )
        .unwrap();

        let mut batch = WriteBatch::new();
        batch.put("users", "u1", vec![1, 2, 3]);
        store.apply(batch).unwrap();

        queue.enqueue(create_task("users", "u1")).unwrap();
        queue
            .enqueue(NewTask::new(
                "users",
                "u1",
                TaskOp::Update,
                json!({"id": "u1"}),
            ))
            .unwrap();

        let purged = queue.purge_entity("users", "u1").unwrap();
        assert_eq!(purged, 2);
        assert_eq!(queue.len().unwrap(), 0);
        assert_eq!(store.get("users", "u1").unwrap(), None);
        assert_eq!(queue.status_of("users", "u1").unwrap(), SyncStatus::Synced);
    }

    #[test]
    fn recover_returns_processing_to_pending() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let graph = Arc::new(DependencyGraph::new());
        let feed = Arc::new(SyncFeed::new());
        let queue =
            TaskQueue::open(Arc::clone(&store), Arc::clone(&graph), Arc::clone(&feed)).unwrap();

        let id = queue.enqueue(create_task("users", "u1")).unwrap();
        queue.mark_processing(id).unwrap();

        // Simulate a restart over the same store.
        let reopened = TaskQueue::open(store, graph, feed).unwrap();
        let recovered = reopened.recover().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(
            reopened.get(id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn id_counter_survives_reopen() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let graph = Arc::new(DependencyGraph::new());
        let feed = Arc::new(SyncFeed::new());
        let queue =
            TaskQueue::open(Arc::clone(&store), Arc::clone(&graph), Arc::clone(&feed)).unwrap();
        let first = queue.enqueue(create_task("users", "u1")).unwrap();

        let reopened = TaskQueue::open(store, graph, feed).unwrap();
        let second = reopened.enqueue(create_task("users", "u2")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn status_events_emitted() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let feed = Arc::new(SyncFeed::new());
        let queue = TaskQueue::open(
            store,
            Arc::new(DependencyGraph::new()),
            Arc::clone(&feed),
        )
        .unwrap();
        let rx = feed.subscribe();

        let id = queue.enqueue(create_task("users", "u1")).unwrap();
        queue.complete(id).unwrap();

        let first = rx.recv().unwrap();
        assert!(matches!(
            first.kind,
            EventKind::StatusChanged {
                status: SyncStatus::Pending,
                ..
            }
        ));
        let second = rx.recv().unwrap();
        assert!(matches!(
            second.kind,
            EventKind::StatusChanged {
                status: SyncStatus::Synced,
                ..
            }
        ));
    }

    #[test]
    fn idempotency_key_generated_when_absent() {
        let queue = make_queue();
        let id = queue.enqueue(create_task("users", "u1")).unwrap();
        let task = queue.get(id).unwrap().unwrap();
        assert!(task.idempotency_key.is_some());
    }

    #[test]
    fn idempotency_key_preserved() {
        let queue = make_queue();
        let id = queue
            .enqueue(create_task("users", "u1").with_idempotency_key("stable-key"))
            .unwrap();
        let task = queue.get(id).unwrap().unwrap();
        assert_eq!(task.idempotency_key.as_deref(), Some("stable-key"));
    }
}
