//! Server id negotiation.
//!
//! A create executed with a client-generated temporary id may come back
//! with a server-assigned id. The negotiator reconciles the two: it
//! detects collisions with existing local records, merges or discards the
//! temporary record, and rewrites the id everywhere it appears - the
//! entity's own row, every dependent foreign key, and every queued task -
//! in one atomic batch, so no dependent is ever left pointing at an id
//! that no longer exists.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventKind, SyncFeed};
use crate::graph::DependencyGraph;
use crate::queue::TaskQueue;
use crate::retry::RetryConfig;
use crate::runner::InFlight;
use crate::task::{self, TaskStatus, ID_FIELD};
use serde_json::Value;
use std::sync::Arc;
use tether_store::{RecordStore, WriteBatch};
use tracing::{debug, warn};

/// Payload field names consulted when comparing record creation times.
const CREATED_AT_FIELDS: [&str; 2] = ["created_at", "createdAt"];

/// Result of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// The id was rewritten (or adopted); sync can finalize.
    Finalized {
        /// The id the entity now carries everywhere.
        final_id: String,
    },
    /// Automatic resolution failed; the task must be parked in the
    /// conflict state for manual resolution.
    Conflict {
        /// Why resolution failed.
        message: String,
    },
}

/// Reconciles server-assigned ids with local temporary ids.
pub struct IdNegotiator {
    store: Arc<dyn RecordStore>,
    queue: Arc<TaskQueue>,
    graph: Arc<DependencyGraph>,
    feed: Arc<SyncFeed>,
    in_flight: Arc<InFlight>,
    backoff: RetryConfig,
}

impl IdNegotiator {
    /// Creates a negotiator.
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<TaskQueue>,
        graph: Arc<DependencyGraph>,
        feed: Arc<SyncFeed>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            store,
            queue,
            graph,
            feed,
            in_flight,
            backoff: RetryConfig::negotiation(),
        }
    }

    /// Reconciles `temp_id` with the id carried by `server_snapshot`.
    ///
    /// Called by the runner after a create succeeded with a different id
    /// than submitted. On `Finalized`, every local reference to the
    /// temporary id has been rewritten atomically and an id-changed event
    /// has been emitted.
    pub async fn negotiate(
        &self,
        entity_type: &str,
        temp_id: &str,
        server_snapshot: Value,
    ) -> SyncResult<NegotiationOutcome> {
        let server_id = server_snapshot
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                SyncError::invalid_task(format!(
                    "server snapshot for {entity_type} has no {ID_FIELD} field"
                ))
            })?;

        if server_id == temp_id {
            return Ok(NegotiationOutcome::Finalized { final_id: server_id });
        }

        let colliding = self.store.get(entity_type, &server_id)?;
        let Some(existing_bytes) = colliding else {
            // Common case: the server id is unused locally.
            self.rewrite(entity_type, temp_id, &server_id, server_snapshot)?;
            return Ok(NegotiationOutcome::Finalized { final_id: server_id });
        };

        let existing: Value = task::decode(&existing_bytes)?;
        let temp: Option<Value> = match self.store.get(entity_type, temp_id)? {
            Some(bytes) => Some(task::decode(&bytes)?),
            None => None,
        };

        let Some(temp) = temp else {
            // The temporary record vanished locally; adopt the existing
            // one and retarget whatever still points at the temp id.
            self.rewrite(entity_type, temp_id, &server_id, existing)?;
            return Ok(NegotiationOutcome::Finalized { final_id: server_id });
        };

        if non_id_fields(&temp) == non_id_fields(&existing) {
            // Same record under two ids; keep the existing one.
            debug!(entity_type, temp_id, server_id = %server_id, "discarding identical temporary record");
            self.rewrite(entity_type, temp_id, &server_id, existing)?;
            return Ok(NegotiationOutcome::Finalized { final_id: server_id });
        }

        // The records differ. If another operation holds the existing
        // record, wait briefly for it to settle before deciding.
        let mut attempt = 0;
        while self.in_flight.contains(entity_type, &server_id) {
            if attempt >= self.backoff.max_attempts {
                warn!(entity_type, temp_id, server_id = %server_id, "id negotiation gave up");
                return Ok(NegotiationOutcome::Conflict {
                    message: format!(
                        "record {server_id} is held by another in-flight operation"
                    ),
                });
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }

        let merged = if temp_is_newer(&temp, &existing) {
            merge_fields(existing, &temp)
        } else {
            existing
        };
        self.rewrite(entity_type, temp_id, &server_id, merged)?;
        Ok(NegotiationOutcome::Finalized { final_id: server_id })
    }

    /// Rewrites the entity's id everywhere, all-or-nothing:
    /// its own row, every dependent foreign-key field, every
    /// not-yet-processed task row, and the status projection row.
    fn rewrite(
        &self,
        entity_type: &str,
        old_id: &str,
        new_id: &str,
        mut final_payload: Value,
    ) -> SyncResult<()> {
        if let Some(map) = final_payload.as_object_mut() {
            map.insert(ID_FIELD.to_string(), Value::String(new_id.to_string()));
        }

        let mut batch = WriteBatch::new();
        batch.delete(entity_type, old_id);
        batch.put(entity_type, new_id, task::encode(&final_payload)?);

        // Dependent foreign keys.
        for (child_type, fk_field) in self.graph.dependents_of(entity_type) {
            for (key, bytes) in self.store.list(child_type)? {
                let mut child: Value = task::decode(&bytes)?;
                if child.get(fk_field).and_then(Value::as_str) == Some(old_id) {
                    if let Some(map) = child.as_object_mut() {
                        map.insert(fk_field.clone(), Value::String(new_id.to_string()));
                    }
                    batch.put(child_type.clone(), key, task::encode(&child)?);
                }
            }
        }

        // Queued tasks that still reference the temporary id.
        for mut queued in self.queue.all_tasks()? {
            if queued.status != TaskStatus::Pending {
                continue;
            }
            let mut touched = false;

            if queued.entity_type == entity_type && queued.entity_id == old_id {
                queued.entity_id = new_id.to_string();
                if let Some(map) = queued.payload.as_object_mut() {
                    map.insert(ID_FIELD.to_string(), Value::String(new_id.to_string()));
                }
                touched = true;
            }

            for (child_type, fk_field) in self.graph.dependents_of(entity_type) {
                if &queued.entity_type == child_type
                    && queued.payload.get(fk_field).and_then(Value::as_str) == Some(old_id)
                {
                    if let Some(map) = queued.payload.as_object_mut() {
                        map.insert(fk_field.clone(), Value::String(new_id.to_string()));
                    }
                    touched = true;
                }
            }

            if touched {
                self.queue.stage_task(&mut batch, &queued)?;
            }
        }

        self.queue
            .stage_status_move(&mut batch, entity_type, old_id, new_id)?;
        self.queue.apply_staged(batch)?;

        debug!(entity_type, old_id, new_id, "rewrote entity id");
        self.feed.emit(EventKind::IdChanged {
            entity_type: entity_type.to_string(),
            old_id: old_id.to_string(),
            new_id: new_id.to_string(),
        });
        Ok(())
    }
}

/// Returns the payload's fields minus the identifier, for same-record
/// comparison.
fn non_id_fields(payload: &Value) -> serde_json::Map<String, Value> {
    payload
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(k, _)| k.as_str() != ID_FIELD)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Compares record creation times from payload fields.
///
/// When neither record carries a usable timestamp the temporary record
/// wins: it holds the most recent local intent.
fn temp_is_newer(temp: &Value, existing: &Value) -> bool {
    match (creation_time(temp), creation_time(existing)) {
        (Some(t), Some(e)) => t >= e,
        _ => true,
    }
}

fn creation_time(payload: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    for field in CREATED_AT_FIELDS {
        match payload.get(field) {
            Some(Value::String(s)) => {
                if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(s) {
                    return Some(parsed.with_timezone(&chrono::Utc));
                }
            }
            Some(Value::Number(n)) => {
                if let Some(millis) = n.as_i64() {
                    return chrono::DateTime::from_timestamp_millis(millis);
                }
            }
            _ => {}
        }
    }
    None
}

/// Overlays the temporary record's fields onto the existing record.
fn merge_fields(existing: Value, temp: &Value) -> Value {
    let mut merged = existing;
    if let (Some(target), Some(source)) = (merged.as_object_mut(), temp.as_object()) {
        for (key, value) in source {
            if key != ID_FIELD {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NewTask;
    use crate::task::TaskOp;
    use serde_json::json;
    use tether_store::MemoryStore;

    struct Harness {
        store: Arc<dyn RecordStore>,
        queue: Arc<TaskQueue>,
        negotiator: IdNegotiator,
        in_flight: Arc<InFlight>,
        feed: Arc<SyncFeed>,
    }

    fn harness() -> Harness {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let mut graph = DependencyGraph::new();
        graph.register("todos", "user_id", "users").unwrap();
        let graph = Arc::new(graph);
        let feed = Arc::new(SyncFeed::new());
        let queue = Arc::new(
            TaskQueue::open(Arc::clone(&store), Arc::clone(&graph), Arc::clone(&feed)).unwrap(),
        );
        let in_flight = Arc::new(InFlight::new());
        let negotiator = IdNegotiator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            graph,
            Arc::clone(&feed),
            Arc::clone(&in_flight),
        );
        Harness {
            store,
            queue,
            negotiator,
            in_flight,
            feed,
        }
    }

    fn put_record(h: &Harness, collection: &str, id: &str, value: Value) {
        let mut batch = WriteBatch::new();
        batch.put(collection, id, task::encode(&value).unwrap());
        h.store.apply(batch).unwrap();
    }

    fn get_record(h: &Harness, collection: &str, id: &str) -> Option<Value> {
        h.store
            .get(collection, id)
            .unwrap()
            .map(|bytes| task::decode(&bytes).unwrap())
    }

    #[tokio::test]
    async fn plain_rewrite_moves_record_and_fks() {
        let h = harness();
        put_record(&h, "users", "cuid_x", json!({"id": "cuid_x", "name": "alice"}));
        put_record(
            &h,
            "todos",
            "t1",
            json!({"id": "t1", "user_id": "cuid_x", "title": "a"}),
        );
        put_record(
            &h,
            "todos",
            "t2",
            json!({"id": "t2", "user_id": "other", "title": "b"}),
        );

        let outcome = h
            .negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1", "name": "alice"}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            NegotiationOutcome::Finalized {
                final_id: "server_1".into()
            }
        );

        assert!(get_record(&h, "users", "cuid_x").is_none());
        assert_eq!(get_record(&h, "users", "server_1").unwrap()["name"], "alice");
        assert_eq!(
            get_record(&h, "todos", "t1").unwrap()["user_id"],
            "server_1"
        );
        assert_eq!(get_record(&h, "todos", "t2").unwrap()["user_id"], "other");
    }

    #[tokio::test]
    async fn rewrite_updates_pending_tasks() {
        let h = harness();
        put_record(&h, "users", "cuid_x", json!({"id": "cuid_x"}));

        h.queue
            .enqueue(NewTask::new(
                "users",
                "cuid_x",
                TaskOp::Update,
                json!({"id": "cuid_x", "name": "renamed"}),
            ))
            .unwrap();
        h.queue
            .enqueue(NewTask::new(
                "todos",
                "t1",
                TaskOp::Create,
                json!({"id": "t1", "user_id": "cuid_x"}),
            ))
            .unwrap();

        h.negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1"}))
            .await
            .unwrap();

        for task in h.queue.all_tasks().unwrap() {
            assert_ne!(task.entity_id, "cuid_x");
            let text = task.payload.to_string();
            assert!(!text.contains("cuid_x"), "task still references temp id: {text}");
        }
        let user_tasks = h.queue.tasks_for_entity("users", "server_1").unwrap();
        assert_eq!(user_tasks.len(), 1);
        assert_eq!(user_tasks[0].payload["name"], "renamed");
    }

    #[tokio::test]
    async fn identical_collision_discards_temp() {
        let h = harness();
        put_record(&h, "users", "cuid_x", json!({"id": "cuid_x", "name": "alice"}));
        put_record(&h, "users", "server_1", json!({"id": "server_1", "name": "alice"}));

        let outcome = h
            .negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1", "name": "alice"}))
            .await
            .unwrap();

        assert!(matches!(outcome, NegotiationOutcome::Finalized { .. }));
        assert!(get_record(&h, "users", "cuid_x").is_none());
        assert_eq!(get_record(&h, "users", "server_1").unwrap()["name"], "alice");
    }

    #[tokio::test]
    async fn newer_temp_merges_over_existing() {
        let h = harness();
        put_record(
            &h,
            "users",
            "cuid_x",
            json!({"id": "cuid_x", "name": "new-name", "created_at": "2026-02-01T00:00:00Z"}),
        );
        put_record(
            &h,
            "users",
            "server_1",
            json!({"id": "server_1", "name": "old-name", "email": "a@b.c", "created_at": "2026-01-01T00:00:00Z"}),
        );

        h.negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1"}))
            .await
            .unwrap();

        let merged = get_record(&h, "users", "server_1").unwrap();
        assert_eq!(merged["name"], "new-name");
        assert_eq!(merged["email"], "a@b.c");
        assert!(get_record(&h, "users", "cuid_x").is_none());
    }

    #[tokio::test]
    async fn older_temp_is_discarded() {
        let h = harness();
        put_record(
            &h,
            "users",
            "cuid_x",
            json!({"id": "cuid_x", "name": "stale", "created_at": "2026-01-01T00:00:00Z"}),
        );
        put_record(
            &h,
            "users",
            "server_1",
            json!({"id": "server_1", "name": "fresh", "created_at": "2026-02-01T00:00:00Z"}),
        );

        h.negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1"}))
            .await
            .unwrap();

        let kept = get_record(&h, "users", "server_1").unwrap();
        assert_eq!(kept["name"], "fresh");
    }

    #[tokio::test]
    async fn held_record_yields_conflict() {
        let mut h = harness();
        put_record(&h, "users", "cuid_x", json!({"id": "cuid_x", "name": "a"}));
        put_record(&h, "users", "server_1", json!({"id": "server_1", "name": "b"}));
        h.in_flight.try_claim("users", "server_1");

        // Shrink the waits so the test stays fast.
        h.negotiator.backoff = RetryConfig::negotiation()
            .with_initial_delay(std::time::Duration::from_millis(1))
            .with_max_delay(std::time::Duration::from_millis(4));

        let outcome = h
            .negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1"}))
            .await
            .unwrap();
        assert!(matches!(outcome, NegotiationOutcome::Conflict { .. }));

        // Nothing was rewritten.
        assert!(get_record(&h, "users", "cuid_x").is_some());
    }

    #[tokio::test]
    async fn held_record_retries_after_release() {
        let h = harness();
        put_record(&h, "users", "cuid_x", json!({"id": "cuid_x", "name": "a"}));
        put_record(&h, "users", "server_1", json!({"id": "server_1", "name": "b"}));
        h.in_flight.try_claim("users", "server_1");

        let mut negotiator = h.negotiator;
        negotiator.backoff = RetryConfig::negotiation()
            .with_initial_delay(std::time::Duration::from_millis(20))
            .with_max_delay(std::time::Duration::from_millis(80));

        let in_flight = Arc::clone(&h.in_flight);
        let release = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            in_flight.release("users", "server_1");
        });

        let outcome = negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1"}))
            .await
            .unwrap();
        release.await.unwrap();
        assert!(matches!(outcome, NegotiationOutcome::Finalized { .. }));
    }

    #[tokio::test]
    async fn emits_id_changed_event() {
        let h = harness();
        put_record(&h, "users", "cuid_x", json!({"id": "cuid_x"}));
        let rx = h.feed.subscribe();

        h.negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1"}))
            .await
            .unwrap();

        let event = rx.recv().unwrap();
        match event.kind {
            EventKind::IdChanged {
                old_id, new_id, ..
            } => {
                assert_eq!(old_id, "cuid_x");
                assert_eq!(new_id, "server_1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_row_follows_the_id() {
        let h = harness();
        put_record(&h, "users", "cuid_x", json!({"id": "cuid_x"}));
        h.queue
            .enqueue(NewTask::new(
                "users",
                "cuid_x",
                TaskOp::Update,
                json!({"id": "cuid_x"}),
            ))
            .unwrap();
        assert_eq!(
            h.queue.status_of("users", "cuid_x").unwrap(),
            crate::task::SyncStatus::Pending
        );

        h.negotiator
            .negotiate("users", "cuid_x", json!({"id": "server_1"}))
            .await
            .unwrap();

        assert_eq!(
            h.queue.status_of("users", "server_1").unwrap(),
            crate::task::SyncStatus::Pending
        );
        assert_eq!(
            h.queue.status_of("users", "cuid_x").unwrap(),
            crate::task::SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn missing_server_id_is_an_error() {
        let h = harness();
        let result = h
            .negotiator
            .negotiate("users", "cuid_x", json!({"name": "no id"}))
            .await;
        assert!(matches!(result, Err(SyncError::InvalidTask(_))));
    }
}
