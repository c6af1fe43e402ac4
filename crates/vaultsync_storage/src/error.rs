//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing persisted records.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A record is larger than a single frame may hold.
    #[error("record of {len} bytes exceeds the frame limit of {max} bytes")]
    RecordTooLarge {
        /// Size of the rejected record.
        len: usize,
        /// Maximum payload size.
        max: usize,
    },

    /// The stored data is corrupted beyond what recovery can repair.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Sealing or unsealing a record failed.
    #[error("sealing error: {0}")]
    Seal(String),
}

impl StorageError {
    /// Creates an I/O error with the given kind and message.
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::Io(io::Error::new(io::ErrorKind::InvalidInput, message.into()))
    }
}
