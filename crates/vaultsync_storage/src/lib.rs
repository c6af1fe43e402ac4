//! # vaultsync storage
//!
//! Byte-level persistence for the vaultsync engine.
//!
//! The engine keeps its durable state (pending operations, conflict records,
//! per-vault flags) as keyed tables. Each table is persisted as a
//! [`RecordLog`]: an append-only sequence of checksummed frames on top of a
//! [`StorageBackend`]. This crate knows nothing about what the records mean.
//!
//! ## Frame layout
//!
//! ```text
//! +-----------+-----------+------------------+
//! | len (u32) | crc (u32) | payload (len B)  |
//! +-----------+-----------+------------------+
//! ```
//!
//! Both header fields are little-endian. The CRC covers the payload as stored,
//! i.e. after sealing when a [`RecordSealer`] is in use.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and ephemeral stores
//! - [`FileBackend`] - persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use vaultsync_storage::{InMemoryBackend, RecordLog};
//!
//! let (mut log, replayed) = RecordLog::open(Box::new(InMemoryBackend::new()), None).unwrap();
//! assert!(replayed.records.is_empty());
//! log.append(b"first").unwrap();
//! assert_eq!(log.frame_count(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod log;
mod memory;
mod seal;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use log::{compute_crc32, RecordLog, Replay, FRAME_HEADER_SIZE, MAX_RECORD_SIZE};
pub use memory::InMemoryBackend;
pub use seal::{RecordSealer, SealingKey, KEY_SIZE, NONCE_SIZE};
