//! End-to-end scenario tests driving the full sync pipeline.
//!
//! Each test exercises repository, queue, runner, and negotiation
//! together over an in-memory store and scripted remote adapters.

#![cfg(test)]

use crate::fixtures::{todo, user, TestHarness, TestTodo, TestUser};
use serde_json::json;
use tether_core::{
    EntityChange, EventKind, LoadPolicy, QueueKind, RemoteError, SaveOptions, SyncStatus,
};

#[tokio::test]
async fn create_round_trip_with_server_id() {
    let h = TestHarness::new();
    h.users.push_create(Ok(json!({"id": "s1", "name": "u-one"})));

    let repo = h.client.repository::<TestUser>();
    repo.save(user("c1", "u-one"), SaveOptions::local_first())
        .await
        .unwrap();
    h.assert_status("users", "c1", SyncStatus::Pending);

    h.drain().await;

    // Task row removed, entity re-keyed to the server id, synced.
    assert_eq!(h.queued_tasks(), 0);
    let found = repo.find_one("s1", LoadPolicy::LocalOnly).await.unwrap();
    assert_eq!(found.unwrap().id, "s1");
    assert!(repo
        .find_one("c1", LoadPolicy::LocalOnly)
        .await
        .unwrap()
        .is_none());
    h.assert_status("users", "s1", SyncStatus::Synced);
}

#[tokio::test]
async fn negotiation_rewrites_dependents_and_tasks() {
    let h = TestHarness::new();
    h.users
        .push_create(Ok(json!({"id": "server_1", "name": "alice"})));

    let users = h.client.repository::<TestUser>();
    let todos = h.client.repository::<TestTodo>();

    users
        .save(user("cuid_x", "alice"), SaveOptions::local_first())
        .await
        .unwrap();
    todos
        .save(todo("t1", "cuid_x", "first"), SaveOptions::local_first())
        .await
        .unwrap();
    todos
        .save(todo("t2", "other-user", "unrelated"), SaveOptions::local_first())
        .await
        .unwrap();

    h.drain().await;

    // Every reference to the temporary id is gone.
    let t1 = todos.find_one("t1", LoadPolicy::LocalOnly).await.unwrap().unwrap();
    assert_eq!(t1.user_id, "server_1");
    let t2 = todos.find_one("t2", LoadPolicy::LocalOnly).await.unwrap().unwrap();
    assert_eq!(t2.user_id, "other-user");
    assert_eq!(h.queued_tasks(), 0);
}

#[tokio::test]
async fn dependency_order_user_before_todo() {
    let h = TestHarness::new();
    let users = h.client.repository::<TestUser>();
    let todos = h.client.repository::<TestTodo>();

    // Enqueue child first to prove ordering is by dependency, not FIFO.
    todos
        .save(todo("t1", "u1", "needs parent"), SaveOptions::local_first())
        .await
        .unwrap();
    users
        .save(user("u1", "parent"), SaveOptions::local_first())
        .await
        .unwrap();

    h.drain().await;

    assert_eq!(h.queued_tasks(), 0);
    assert_eq!(h.users.call_count("create"), 1);
    assert_eq!(h.todos.call_count("create"), 1);
}

#[tokio::test]
async fn transient_failures_exhaust_to_dead() {
    let h = TestHarness::new();
    for _ in 0..3 {
        h.users.push_create(Err(RemoteError::network("flaky")));
    }

    let repo = h.client.repository::<TestUser>();
    repo.save(user("u1", "doomed"), SaveOptions::local_first())
        .await
        .unwrap();

    // The harness retry delays are a few milliseconds; three drains with
    // short waits let the task fail, retry twice, and die.
    h.drain().await;
    for _ in 0..2 {
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        h.drain().await;
    }

    h.assert_status("users", "u1", SyncStatus::Dead);
    assert_eq!(h.users.call_count("create"), 3);

    // A fourth drain never touches the dead task.
    h.drain().await;
    assert_eq!(h.users.call_count("create"), 3);
}

#[tokio::test]
async fn gone_deletes_locally_without_error() {
    let h = TestHarness::new();
    let repo = h.client.repository::<TestUser>();

    repo.save(user("u1", "ghost"), SaveOptions::local_first())
        .await
        .unwrap();
    h.drain().await;
    h.assert_status("users", "u1", SyncStatus::Synced);

    // The next sync finds the entity permanently gone upstream.
    h.users.push_update(Err(RemoteError::Gone));
    repo.save(user("u1", "ghost-edit"), SaveOptions::local_first())
        .await
        .unwrap();
    h.drain().await;

    assert!(repo
        .find_one("u1", LoadPolicy::LocalOnly)
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.queued_tasks(), 0);
    h.assert_status("users", "u1", SyncStatus::Synced);
}

#[tokio::test]
async fn background_queue_keeps_foreground_unaffected() {
    let h = TestHarness::new();
    let repo = h.client.repository::<TestUser>();

    repo.save(
        user("u-bg", "batch"),
        SaveOptions::local_first().with_queue(QueueKind::Background),
    )
    .await
    .unwrap();
    repo.save(user("u-fg", "interactive"), SaveOptions::local_first())
        .await
        .unwrap();

    assert_eq!(h.drain().await, 1);
    h.assert_status("users", "u-fg", SyncStatus::Synced);
    h.assert_status("users", "u-bg", SyncStatus::Pending);

    assert_eq!(h.drain_background().await, 1);
    h.assert_status("users", "u-bg", SyncStatus::Synced);
}

#[tokio::test]
async fn id_change_event_reaches_subscribers() {
    let h = TestHarness::new();
    h.users.push_create(Ok(json!({"id": "s1", "name": "n"})));
    let rx = h.client.changes();

    let repo = h.client.repository::<TestUser>();
    repo.save(user("c1", "n"), SaveOptions::local_first())
        .await
        .unwrap();
    h.drain().await;

    let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    let id_changed = events.iter().find_map(|e| match &e.kind {
        EventKind::IdChanged { old_id, new_id, .. } => Some((old_id.clone(), new_id.clone())),
        _ => None,
    });
    assert_eq!(id_changed, Some(("c1".into(), "s1".into())));
}

#[tokio::test]
async fn local_reads_unaffected_by_dead_task() {
    let h = TestHarness::new();
    h.users
        .push_create(Err(RemoteError::validation("rejected")));

    let repo = h.client.repository::<TestUser>();
    repo.save(user("u1", "still-readable"), SaveOptions::local_first())
        .await
        .unwrap();
    h.drain().await;

    h.assert_status("users", "u1", SyncStatus::Dead);
    // The entity remains usable locally; it is only flagged.
    let found = repo.find_one("u1", LoadPolicy::LocalOnly).await.unwrap();
    assert_eq!(found.unwrap().name, "still-readable");
}

#[tokio::test]
async fn watch_filters_by_entity_type() {
    let h = TestHarness::new();
    let users = h.client.repository::<TestUser>();
    let todos = h.client.repository::<TestTodo>();
    let rx = todos.watch();

    users
        .save(user("u1", "noise"), SaveOptions::local_first())
        .await
        .unwrap();
    todos
        .save(todo("t1", "u1", "signal"), SaveOptions::local_first())
        .await
        .unwrap();

    let event = rx
        .recv_timeout(std::time::Duration::from_millis(100))
        .unwrap();
    match event.kind {
        EventKind::Entity {
            entity_type,
            change,
            ..
        } => {
            assert_eq!(entity_type, "todos");
            assert_eq!(change, EntityChange::Created);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
