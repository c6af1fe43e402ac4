//! Error types for the sync engine.

use thiserror::Error;
use vaultsync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Broad classes of failure, used to pick how a sync run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity failure or timeout. Retryable.
    Network,
    /// The remote service failed (5xx, 429). Retryable.
    Server,
    /// Credentials rejected or missing.
    Auth,
    /// The account may not perform the request.
    Permission,
    /// The remote object changed underneath the request.
    Conflict,
    /// The request or stored data is malformed.
    Data,
    /// Local failure: storage, codec or crypto.
    Internal,
}

/// Errors that can occur in the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The network request failed or timed out.
    #[error("network error: {0}")]
    Network(String),

    /// The remote service answered with an error status.
    #[error("server error ({status}): {message}")]
    Server {
        /// HTTP-like status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Authentication failed or no session is available.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The account is not allowed to perform the request.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The remote object was changed concurrently.
    #[error("remote conflict: {0}")]
    Conflict(String),

    /// The request or its payload is invalid.
    #[error("invalid data: {0}")]
    Data(String),

    /// The remote object does not exist.
    #[error("remote cipher not found: {0}")]
    RemoteNotFound(String),

    /// Persisted state could not be read or written.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Directory or lock file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Encryption, decryption or key handling failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// An encrypted string is not in `<type>.<iv>|<data>|<mac>` form.
    #[error("invalid cipher string: {0}")]
    InvalidCipherString(String),

    /// Another process holds the store.
    #[error("sync store locked: another process has exclusive access")]
    StoreLocked,

    /// No queued operation has the given id.
    #[error("pending operation not found: {0}")]
    OperationNotFound(String),
}

impl SyncError {
    /// Creates a server error.
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Creates a crypto error.
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Maps the error onto the retry taxonomy.
    ///
    /// A 401/403 reported as a server status is treated as auth/permission,
    /// anything else below 500 (except 408 and 429) as a data error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::Server { status, .. } => match status {
                401 => ErrorKind::Auth,
                403 => ErrorKind::Permission,
                409 => ErrorKind::Conflict,
                408 | 429 => ErrorKind::Server,
                s if *s >= 500 => ErrorKind::Server,
                _ => ErrorKind::Data,
            },
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Permission(_) => ErrorKind::Permission,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::Data(_) | SyncError::RemoteNotFound(_) | SyncError::InvalidCipherString(_) => {
                ErrorKind::Data
            }
            SyncError::Storage(_)
            | SyncError::Io(_)
            | SyncError::Codec(_)
            | SyncError::Crypto(_)
            | SyncError::StoreLocked
            | SyncError::OperationNotFound(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the failed work may be retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Server)
    }

    /// Returns true if the failure needs the user before anything is retried.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Auth | ErrorKind::Permission | ErrorKind::Conflict | ErrorKind::Data
        )
    }
}
