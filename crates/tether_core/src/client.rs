//! The sync client: composition root and process-wide handle.
//!
//! A client owns the record store handle, the durable task queue, the
//! frozen dependency graph, the adapter registry, the change feed, and
//! the two queue runners. Construction happens through
//! [`SyncClientBuilder`]: relationships and adapters are registered up
//! front, the graph is validated, interrupted tasks are recovered, and
//! only then does the client exist.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::events::{SyncEvent, SyncFeed};
use crate::graph::DependencyGraph;
use crate::negotiate::IdNegotiator;
use crate::queue::TaskQueue;
use crate::remote::{AdapterRegistry, RemoteAdapter};
use crate::repository::{Record, Repository};
use crate::runner::{InFlight, QueueRunner, RunnerHandle, SyncStats};
use crate::task::{QueueKind, SyncStatus};
use parking_lot::Mutex;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tether_store::RecordStore;
use tokio::task::JoinHandle;
use tracing::info;

/// Builder for [`SyncClient`].
///
/// The registration phase: every many-to-one relationship and every
/// remote adapter is declared here, before any task can run.
pub struct SyncClientBuilder {
    store: Arc<dyn RecordStore>,
    config: SyncConfig,
    graph: DependencyGraph,
    adapters: AdapterRegistry,
}

impl SyncClientBuilder {
    /// Starts a builder over a record store.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            config: SyncConfig::default(),
            graph: DependencyGraph::new(),
            adapters: AdapterRegistry::new(),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Declares a many-to-one relationship: `child` rows carry
    /// `fk_field` referencing `parent`.
    ///
    /// # Errors
    ///
    /// Fails fast with [`crate::SyncError::CircularDependency`] if the
    /// edge would close a cycle.
    pub fn relation(
        mut self,
        child: impl Into<String>,
        fk_field: impl Into<String>,
        parent: impl Into<String>,
    ) -> SyncResult<Self> {
        self.graph.register(child, fk_field, parent)?;
        Ok(self)
    }

    /// Registers the remote adapter for an entity type.
    #[must_use]
    pub fn adapter(
        mut self,
        entity_type: impl Into<String>,
        adapter: Arc<dyn RemoteAdapter>,
    ) -> Self {
        self.adapters.insert(entity_type, adapter);
        self
    }

    /// Builds the client: freezes the graph, opens the task queue, and
    /// recovers tasks interrupted by a previous crash.
    pub fn build(self) -> SyncResult<SyncClient> {
        let graph = Arc::new(self.graph);
        let feed = Arc::new(SyncFeed::new());
        let adapters = Arc::new(self.adapters);
        let queue = Arc::new(TaskQueue::open(
            Arc::clone(&self.store),
            Arc::clone(&graph),
            Arc::clone(&feed),
        )?);

        let recovered = queue.recover()?;
        if recovered > 0 {
            info!(recovered, "requeued tasks interrupted by restart");
        }

        let in_flight = Arc::new(InFlight::new());
        let negotiator = Arc::new(IdNegotiator::new(
            Arc::clone(&self.store),
            Arc::clone(&queue),
            Arc::clone(&graph),
            Arc::clone(&feed),
            Arc::clone(&in_flight),
        ));

        Ok(SyncClient {
            inner: Arc::new(ClientInner {
                store: self.store,
                config: self.config,
                graph,
                feed,
                adapters,
                queue,
                negotiator,
                in_flight,
                running: Mutex::new(None),
            }),
        })
    }
}

struct RunningQueues {
    foreground: (RunnerHandle, JoinHandle<()>),
    background: (RunnerHandle, JoinHandle<()>),
}

struct ClientInner {
    store: Arc<dyn RecordStore>,
    config: SyncConfig,
    graph: Arc<DependencyGraph>,
    feed: Arc<SyncFeed>,
    adapters: Arc<AdapterRegistry>,
    queue: Arc<TaskQueue>,
    negotiator: Arc<IdNegotiator>,
    in_flight: Arc<InFlight>,
    running: Mutex<Option<RunningQueues>>,
}

/// Handle to the sync layer. Cheap to clone.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Starts a builder over a record store.
    #[must_use]
    pub fn builder(store: Arc<dyn RecordStore>) -> SyncClientBuilder {
        SyncClientBuilder::new(store)
    }

    fn make_runner(&self, kind: QueueKind) -> QueueRunner {
        QueueRunner::new(
            kind,
            &self.inner.config,
            Arc::clone(&self.inner.queue),
            Arc::clone(&self.inner.graph),
            Arc::clone(&self.inner.adapters),
            Arc::clone(&self.inner.negotiator),
            Arc::clone(&self.inner.feed),
            Arc::clone(&self.inner.in_flight),
        )
    }

    /// Spawns both queue runners. Idempotent; must be called from within
    /// a tokio runtime.
    pub fn start(&self) {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return;
        }

        let foreground = self.make_runner(QueueKind::Foreground);
        let background = self.make_runner(QueueKind::Background);
        let fg_handle = foreground.handle();
        let bg_handle = background.handle();
        let fg_join = tokio::spawn(foreground.run());
        let bg_join = tokio::spawn(background.run());

        *running = Some(RunningQueues {
            foreground: (fg_handle, fg_join),
            background: (bg_handle, bg_join),
        });
        info!("sync runners started");
    }

    /// Returns true while the runners are spawned.
    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Stops both runners: no new admissions, in-flight operations
    /// finish, then the runner tasks exit.
    pub async fn shutdown(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };
        running.foreground.0.request_stop();
        running.background.0.request_stop();
        let _ = running.foreground.1.await;
        let _ = running.background.1.await;
        info!("sync runners stopped");
    }

    /// Switches both runners to the given activity profile. Safe at any
    /// time: only future admission rate, concurrency, and timeouts
    /// change; in-flight tasks are unaffected.
    pub fn set_mode(&self, mode: QueueKind) {
        let running = self.inner.running.lock();
        if let Some(running) = running.as_ref() {
            running.foreground.0.apply_profile(&self.inner.config, mode);
            // The background runner keeps its own profile; it is already
            // the battery-conscious one.
            if mode == QueueKind::Foreground {
                running
                    .background
                    .0
                    .apply_profile(&self.inner.config, QueueKind::Background);
            }
        }
    }

    /// Runs one bounded drain of a queue and returns once every admitted
    /// task finished. For worker-process deployments (wake, flush, exit);
    /// does not require [`SyncClient::start`].
    pub async fn drain_once(&self, kind: QueueKind) -> SyncResult<u64> {
        let runner = self.make_runner(kind);
        runner.drain_until_idle().await
    }

    /// Returns a typed repository for an entity type.
    #[must_use]
    pub fn repository<T: Record>(&self) -> Repository<T> {
        Repository::new(
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.queue),
            Arc::clone(&self.inner.adapters),
            Arc::clone(&self.inner.feed),
        )
    }

    /// Subscribes to every sync event.
    pub fn changes(&self) -> Receiver<SyncEvent> {
        self.inner.feed.subscribe()
    }

    /// Returns the sync-status projection of an entity.
    pub fn status_of(&self, entity_type: &str, entity_id: &str) -> SyncResult<SyncStatus> {
        self.inner.queue.status_of(entity_type, entity_id)
    }

    /// Returns an entity's dead or conflicted tasks to pending.
    pub fn requeue_dead(&self, entity_type: &str, entity_id: &str) -> SyncResult<usize> {
        self.inner.queue.requeue_dead(entity_type, entity_id)
    }

    /// Returns a runner's statistics, if it is running.
    pub fn stats(&self, kind: QueueKind) -> Option<SyncStats> {
        let running = self.inner.running.lock();
        running.as_ref().map(|r| match kind {
            QueueKind::Foreground => r.foreground.0.stats(),
            QueueKind::Background => r.background.0.stats(),
        })
    }

    /// The durable task queue, for inspection.
    #[must_use]
    pub fn task_queue(&self) -> &Arc<TaskQueue> {
        &self.inner.queue
    }

    /// The dependency graph, for inspection.
    #[must_use]
    pub fn dependency_graph(&self) -> &Arc<DependencyGraph> {
        &self.inner.graph
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
