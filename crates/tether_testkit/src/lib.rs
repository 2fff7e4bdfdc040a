//! # Tether Testkit
//!
//! Test utilities for Tether.
//!
//! This crate provides:
//! - Fixtures bundling a sync client with scripted mock adapters
//! - Sample record types with registered relationships
//! - Property-based test generators using proptest
//! - End-to-end scenario tests for the sync pipeline
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs_a_user() {
//!     let h = TestHarness::new();
//!     let repo = h.client.repository::<TestUser>();
//!     // ... drive the sync layer
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
mod scenarios;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
