//! # Tether Store
//!
//! Record store trait and implementations for Tether.
//!
//! This crate provides the local persistence abstraction the sync layer
//! sits on. Record stores are **opaque row stores** - they map
//! (collection, key) pairs to byte payloads and do not interpret the
//! payloads they hold.
//!
//! ## Design Principles
//!
//! - Stores hold committed rows only; buffering happens in [`WriteBatch`]
//! - A batch is applied all-or-nothing - this is the transaction primitive
//! - Must be `Send + Sync` for concurrent access
//! - Tether owns all row format interpretation
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral deployments
//!
//! Persistent stores (SQLite, LMDB, platform key/value services) live in
//! host applications and implement [`RecordStore`] there.
//!
//! ## Example
//!
//! ```rust
//! use tether_store::{MemoryStore, RecordStore, WriteBatch};
//!
//! let store = MemoryStore::new();
//! let mut batch = WriteBatch::new();
//! batch.put("users", "u1", vec![1, 2, 3]);
//! store.apply(batch).unwrap();
//! assert_eq!(store.get("users", "u1").unwrap(), Some(vec![1, 2, 3]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod store;

pub use error::{StorageError, StoreResult};
pub use memory::MemoryStore;
pub use store::{Mutation, RecordStore, StoreEvent, WriteBatch};
