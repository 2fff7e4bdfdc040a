//! Queue runner: concurrency-bounded drain loop for one logical queue.
//!
//! Two runners exist per client, one for the foreground queue and one for
//! the background queue. Each pulls due tasks from the shared durable
//! store in dependency order, executes them against the registered remote
//! adapters, and finalizes task and entity state. Per-entity mutual
//! exclusion spans both runners.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::events::{EntityChange, EventKind, SyncFeed};
use crate::graph::DependencyGraph;
use crate::negotiate::{IdNegotiator, NegotiationOutcome};
use crate::queue::TaskQueue;
use crate::remote::{AdapterRegistry, Disposition, RemoteAdapter, RemoteError};
use crate::task::{self, QueueKind, SyncTask, TaskOp};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Entities currently executing a task, shared across both runners.
///
/// Guards the at-most-one-in-flight-per-entity invariant and lets id
/// negotiation detect that a contested record is being worked on.
#[derive(Default)]
pub(crate) struct InFlight {
    entities: Mutex<HashSet<(String, String)>>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn try_claim(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entities
            .lock()
            .insert((entity_type.to_string(), entity_id.to_string()))
    }

    pub(crate) fn release(&self, entity_type: &str, entity_id: &str) {
        self.entities
            .lock()
            .remove(&(entity_type.to_string(), entity_id.to_string()));
    }

    pub(crate) fn contains(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entities
            .lock()
            .contains(&(entity_type.to_string(), entity_id.to_string()))
    }
}

/// Mutable scheduling limits of a runner.
///
/// Swapped atomically on mode switches; in-flight operations are never
/// affected, only future admissions.
#[derive(Debug, Clone)]
pub(crate) struct RunnerLimits {
    pub(crate) concurrency: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) retry_floor: Duration,
}

impl RunnerLimits {
    fn from_config(config: &SyncConfig, kind: QueueKind) -> Self {
        Self {
            concurrency: config.concurrency_for(kind),
            poll_interval: config.poll_interval_for(kind),
            timeout: config.timeout_for(kind),
            retry_floor: config.retry_floor_for(kind),
        }
    }
}

/// Statistics about one runner's activity.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Drain cycles completed.
    pub cycles: u64,
    /// Tasks admitted for execution.
    pub admitted: u64,
    /// Tasks completed successfully.
    pub completed: u64,
    /// Tasks rescheduled after a transient failure.
    pub retried: u64,
    /// Tasks marked dead.
    pub dead: u64,
    /// Tasks parked in the conflict state.
    pub conflicts: u64,
    /// Entities deleted after a gone response.
    pub gone: u64,
    /// Last cycle-level error message.
    pub last_error: Option<String>,
    /// Completion time of the last drain cycle.
    pub last_cycle_at: Option<Instant>,
}

struct RunnerInner {
    kind: QueueKind,
    queue: Arc<TaskQueue>,
    graph: Arc<DependencyGraph>,
    adapters: Arc<AdapterRegistry>,
    negotiator: Arc<IdNegotiator>,
    feed: Arc<SyncFeed>,
    retry: crate::retry::RetryConfig,
    limits: RwLock<RunnerLimits>,
    in_flight: Arc<InFlight>,
    active: AtomicUsize,
    stopping: AtomicBool,
    wake: Arc<Notify>,
    idle: Notify,
    stats: RwLock<SyncStats>,
}

/// Control handle for a running queue runner.
#[derive(Clone)]
pub struct RunnerHandle {
    inner: Arc<RunnerInner>,
}

impl RunnerHandle {
    /// Requests a stop: no new tasks are admitted; in-flight operations
    /// finish. [`QueueRunner::run`] returns once the pool is idle.
    pub fn request_stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Returns true once a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Swaps the runner's scheduling profile to another queue's. Safe at
    /// any time; affects only future admissions.
    pub fn apply_profile(&self, config: &SyncConfig, profile: QueueKind) {
        *self.inner.limits.write() = RunnerLimits::from_config(config, profile);
        self.inner.wake.notify_one();
    }

    /// Returns a snapshot of the runner's statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Number of tasks currently executing.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

/// A concurrency-bounded worker pool draining one logical queue.
pub struct QueueRunner {
    inner: Arc<RunnerInner>,
}

impl QueueRunner {
    /// Creates a runner for one logical queue.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: QueueKind,
        config: &SyncConfig,
        queue: Arc<TaskQueue>,
        graph: Arc<DependencyGraph>,
        adapters: Arc<AdapterRegistry>,
        negotiator: Arc<IdNegotiator>,
        feed: Arc<SyncFeed>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        let wake = queue.wake_handle(kind);
        Self {
            inner: Arc::new(RunnerInner {
                kind,
                queue,
                graph,
                adapters,
                negotiator,
                feed,
                retry: config.retry.clone(),
                limits: RwLock::new(RunnerLimits::from_config(config, kind)),
                in_flight,
                active: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                wake,
                idle: Notify::new(),
                stats: RwLock::new(SyncStats::default()),
            }),
        }
    }

    /// Returns the control handle.
    #[must_use]
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Runs the drain loop until a stop is requested, then waits for
    /// in-flight operations to finish.
    pub async fn run(self) {
        let inner = self.inner;
        while !inner.stopping.load(Ordering::SeqCst) {
            match Self::drain_cycle(&inner).await {
                Ok(_admitted) => {
                    let mut stats = inner.stats.write();
                    stats.cycles += 1;
                    stats.last_cycle_at = Some(Instant::now());
                }
                Err(e) => {
                    // Without the store no task state can change safely;
                    // drop the cycle and retry on the next tick.
                    warn!(queue = %inner.kind, error = %e, "drain cycle aborted");
                    inner.stats.write().last_error = Some(e.to_string());
                }
            }

            let poll = inner.limits.read().poll_interval;
            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }

        Self::await_idle(&inner).await;
    }

    /// Drains currently-due work and waits for it to finish. Scheduled
    /// retries that are not yet due are left alone. For worker-process
    /// deployments that wake up, flush, and exit.
    pub async fn drain_until_idle(&self) -> SyncResult<u64> {
        let inner = &self.inner;
        let mut total = 0;
        loop {
            let admitted = Self::drain_cycle(inner).await?;
            total += admitted;
            if admitted == 0 && inner.active.load(Ordering::SeqCst) == 0 {
                return Ok(total);
            }
            // Let in-flight work settle before looking again.
            tokio::select! {
                _ = inner.idle.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    async fn await_idle(inner: &Arc<RunnerInner>) {
        while inner.active.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                _ = inner.idle.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// One admission pass. Returns the number of tasks spawned.
    async fn drain_cycle(inner: &Arc<RunnerInner>) -> SyncResult<u64> {
        let limits = inner.limits.read().clone();
        let due = inner
            .queue
            .due_tasks(Utc::now(), inner.kind, limits.concurrency.max(1) * 8)?;
        let mut admitted = 0;

        for task in due {
            if inner.stopping.load(Ordering::SeqCst) {
                break;
            }
            // Lower-level tasks come first in the due list; once slots run
            // out nothing later (higher level or younger) may jump ahead.
            if inner.active.load(Ordering::SeqCst) >= limits.concurrency {
                break;
            }
            if Self::parent_outstanding(inner, &task)? {
                debug!(task = %task.id, "deferred behind parent task");
                continue;
            }
            if !inner.in_flight.try_claim(&task.entity_type, &task.entity_id) {
                continue;
            }
            match inner.queue.mark_processing(task.id) {
                Ok(true) => {}
                Ok(false) => {
                    inner.in_flight.release(&task.entity_type, &task.entity_id);
                    continue;
                }
                Err(e) => {
                    inner.in_flight.release(&task.entity_type, &task.entity_id);
                    return Err(e);
                }
            }

            inner.active.fetch_add(1, Ordering::SeqCst);
            inner.stats.write().admitted += 1;
            admitted += 1;

            let inner_clone = Arc::clone(inner);
            tokio::spawn(async move {
                Self::execute(&inner_clone, task).await;
                inner_clone.active.fetch_sub(1, Ordering::SeqCst);
                inner_clone.idle.notify_waiters();
                // A finished parent may unblock children right away.
                inner_clone.wake.notify_one();
            });
        }
        Ok(admitted)
    }

    /// Returns true when a direct parent of this task's entity still has
    /// an outstanding create/update task. Checked per task, not just per
    /// level: level numbers are coarser than an exact dependency edge.
    fn parent_outstanding(inner: &Arc<RunnerInner>, task: &SyncTask) -> SyncResult<bool> {
        for relation in inner.graph.relations_of(&task.entity_type) {
            let Some(parent_id) = task.payload.get(&relation.fk_field).and_then(|v| v.as_str())
            else {
                continue;
            };
            let blocking = inner
                .queue
                .tasks_for_entity(&relation.parent, parent_id)?
                .iter()
                .any(|p| {
                    p.status.is_outstanding()
                        && matches!(p.op, TaskOp::Create | TaskOp::Update)
                });
            if blocking {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Executes one claimed task and finalizes its row.
    async fn execute(inner: &Arc<RunnerInner>, task: SyncTask) {
        let result = Self::invoke(inner, &task).await;
        if let Err(e) = Self::settle(inner, &task, result).await {
            // The store went away mid-settlement; the row stays in the
            // processing state and startup recovery will reissue it.
            warn!(task = %task.id, error = %e, "failed to settle task");
            inner.stats.write().last_error = Some(e.to_string());
        }
        inner.in_flight.release(&task.entity_type, &task.entity_id);
    }

    /// Invokes the remote operation with a bounded timeout.
    async fn invoke(
        inner: &Arc<RunnerInner>,
        task: &SyncTask,
    ) -> Result<Option<serde_json::Value>, RemoteError> {
        let adapter = match inner.adapters.get(&task.entity_type) {
            Ok(adapter) => adapter,
            Err(_) => {
                return Err(RemoteError::validation(format!(
                    "no adapter for entity type {}",
                    task.entity_type
                )))
            }
        };
        let timeout = inner.limits.read().timeout;
        let call = Self::dispatch(adapter, task);

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    async fn dispatch(
        adapter: Arc<dyn RemoteAdapter>,
        task: &SyncTask,
    ) -> Result<Option<serde_json::Value>, RemoteError> {
        let payload = task.payload.clone();
        match task.op {
            TaskOp::Create => adapter
                .create(payload, &task.headers, &task.extra)
                .await
                .map(Some),
            TaskOp::Update => adapter
                .update(payload, &task.headers, &task.extra)
                .await
                .map(Some),
            TaskOp::Replace => adapter
                .replace(payload, &task.headers, &task.extra)
                .await
                .map(Some),
            TaskOp::Delete => adapter
                .delete(&task.entity_id, &task.headers, &task.extra)
                .await
                .map(|()| None),
        }
    }

    /// Applies the outcome table: complete, negotiate, purge, reschedule,
    /// or mark dead.
    async fn settle(
        inner: &Arc<RunnerInner>,
        task: &SyncTask,
        result: Result<Option<serde_json::Value>, RemoteError>,
    ) -> SyncResult<()> {
        match result {
            Ok(snapshot) => Self::settle_success(inner, task, snapshot).await,
            Err(error) => Self::settle_failure(inner, task, error).await,
        }
    }

    async fn settle_success(
        inner: &Arc<RunnerInner>,
        task: &SyncTask,
        snapshot: Option<serde_json::Value>,
    ) -> SyncResult<()> {
        let mut final_id = task.entity_id.clone();

        if task.op == TaskOp::Create {
            let server_id = snapshot
                .as_ref()
                .and_then(|s| s.get(task::ID_FIELD))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(server_id) = server_id {
                if server_id != task.entity_id {
                    let snapshot = snapshot.clone().unwrap_or(serde_json::Value::Null);
                    match inner
                        .negotiator
                        .negotiate(&task.entity_type, &task.entity_id, snapshot)
                        .await?
                    {
                        NegotiationOutcome::Finalized { final_id: id } => final_id = id,
                        NegotiationOutcome::Conflict { message } => {
                            inner.queue.mark_conflict(task.id, &message)?;
                            inner.stats.write().conflicts += 1;
                            inner.feed.emit(EventKind::Entity {
                                entity_type: task.entity_type.clone(),
                                entity_id: task.entity_id.clone(),
                                change: EntityChange::Errored { message },
                            });
                            return Ok(());
                        }
                    }
                }
            }
        }

        inner.queue.complete(task.id)?;
        Self::refresh_if_settled(inner, task, &final_id, snapshot)?;
        inner.stats.write().completed += 1;
        Ok(())
    }

    /// Writes the server snapshot over the local record, but only when no
    /// further tasks are pending for the entity - a pending local change
    /// is never clobbered by remote state.
    fn refresh_if_settled(
        inner: &Arc<RunnerInner>,
        task: &SyncTask,
        final_id: &str,
        snapshot: Option<serde_json::Value>,
    ) -> SyncResult<()> {
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        if task.op == TaskOp::Delete {
            return Ok(());
        }
        let remaining = inner.queue.tasks_for_entity(&task.entity_type, final_id)?;
        if remaining.iter().any(|t| t.status.is_outstanding()) {
            return Ok(());
        }
        let mut batch = tether_store::WriteBatch::new();
        batch.put(&task.entity_type, final_id, task::encode(&snapshot)?);
        inner.queue.apply_staged(batch)?;
        inner.feed.emit(EventKind::Entity {
            entity_type: task.entity_type.clone(),
            entity_id: final_id.to_string(),
            change: EntityChange::Updated,
        });
        Ok(())
    }

    async fn settle_failure(
        inner: &Arc<RunnerInner>,
        task: &SyncTask,
        error: RemoteError,
    ) -> SyncResult<()> {
        let disposition = match inner.adapters.get(&task.entity_type) {
            Ok(adapter) => adapter.classify(&error),
            Err(_) => Disposition::Fatal,
        };

        match disposition {
            Disposition::Gone => {
                debug!(task = %task.id, entity = %task.entity_id, "entity gone upstream");
                inner
                    .queue
                    .purge_entity(&task.entity_type, &task.entity_id)?;
                inner.stats.write().gone += 1;
                inner.feed.emit(EventKind::Entity {
                    entity_type: task.entity_type.clone(),
                    entity_id: task.entity_id.clone(),
                    change: EntityChange::Deleted,
                });
            }
            Disposition::Transient => {
                // The delay index is the attempt that just failed, so the
                // first retry waits the initial delay.
                if task.attempt_count + 1 >= inner.retry.max_attempts {
                    Self::kill(inner, task, &error)?;
                } else {
                    let delay = inner
                        .retry
                        .delay_for_attempt(task.attempt_count)
                        .max(inner.limits.read().retry_floor);
                    let next = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    inner.queue.reschedule(task.id, &error.to_string(), next)?;
                    inner.stats.write().retried += 1;
                }
            }
            Disposition::Fatal => {
                Self::kill(inner, task, &error)?;
            }
        }
        Ok(())
    }

    fn kill(inner: &Arc<RunnerInner>, task: &SyncTask, error: &RemoteError) -> SyncResult<()> {
        inner.queue.mark_dead(task.id, &error.to_string())?;
        inner.stats.write().dead += 1;
        inner.feed.emit(EventKind::Entity {
            entity_type: task.entity_type.clone(),
            entity_id: task.entity_id.clone(),
            change: EntityChange::Errored {
                message: error.to_string(),
            },
        });
        Ok(())
    }
}

impl std::fmt::Debug for QueueRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRunner")
            .field("kind", &self.inner.kind)
            .field("active", &self.inner.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
