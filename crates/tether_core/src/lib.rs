//! # Tether Core
//!
//! Sync task queue and dependency-ordered scheduler for Tether.
//!
//! This crate provides:
//! - Durable task queue over a local record store
//! - Entity-type dependency graph with level-ordered draining
//! - Retry with bounded exponential backoff
//! - Concurrency-bounded queue runners (foreground and background)
//! - Server id negotiation with foreign-key rewriting
//! - Per-entity-type repositories with save/load policies
//!
//! ## Architecture
//!
//! Local writes commit to the record store synchronously; every mutation
//! that must reach the remote store enqueues a durable task. Queue runners
//! drain due tasks in dependency order (parents before children), execute
//! them against an abstract remote adapter, and finalize task and entity
//! state in one atomic batch.
//!
//! ## Key Invariants
//!
//! - Local writes are durable before any network traffic
//! - At most one task per entity is in flight at a time
//! - Tasks for one entity execute in creation order
//! - A child create never runs while its parent's create is outstanding
//! - Task state and the per-entity sync status change atomically

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod events;
mod graph;
mod negotiate;
mod queue;
mod remote;
mod repository;
mod retry;
mod runner;
mod task;

pub use client::{SyncClient, SyncClientBuilder};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use events::{EntityChange, EventKind, SyncEvent, SyncFeed};
pub use graph::{DependencyGraph, Relation};
pub use negotiate::{IdNegotiator, NegotiationOutcome};
pub use queue::{NewTask, TaskQueue};
pub use remote::{
    AdapterRegistry, Disposition, JsonMap, MockAdapter, MockCall, RemoteAdapter, RemoteError,
    RemoteResult,
};
pub use repository::{LoadPolicy, Record, Repository, SaveOptions, SavePolicy};
pub use retry::RetryConfig;
pub use runner::{QueueRunner, RunnerHandle, SyncStats};
pub use task::{QueueKind, SyncStatus, SyncTask, TaskId, TaskOp, TaskStatus};
