//! # vaultsync testkit
//!
//! Test utilities for the vaultsync engine.
//!
//! This crate provides:
//! - Fixtures wiring a [`SyncEngine`](vaultsync_engine::SyncEngine) to
//!   in-memory mocks and a manual clock
//! - Temporary on-disk stores
//! - Property-based generators for mutation sequences
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vaultsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs() {
//!     let env = TestEngine::new();
//!     env.seed_linked_items(VaultId(1), 3);
//!     env.engine.request_manual_sync(VaultId(1)).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use vaultsync_engine::*;
}

pub use fixtures::*;
pub use generators::*;
