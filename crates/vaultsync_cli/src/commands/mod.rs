//! CLI command implementations.

pub mod conflicts;
pub mod maintain;
pub mod queue;
pub mod stats;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::ValueEnum;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vaultsync_engine::{
    ConflictConfig, ConflictLog, EmptyVaultGuard, GuardConfig, OperationStatus, PendingQueue, QueueConfig,
    SealingKey, StoreConfig, SyncStore, SystemClock,
};

/// Result type of every command.
pub type CommandResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Where the store lives and how it is sealed.
pub struct StoreArgs {
    /// Store directory.
    pub path: PathBuf,
    /// Base64 sealing key.
    pub key: Option<String>,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// Human-readable.
    Text,
    /// Pretty JSON on stdout.
    Json,
}

impl Output {
    /// Prints `value` as JSON, or runs `text` for the text format.
    pub fn emit<T: Serialize>(self, value: &T, text: impl FnOnce(&T)) -> CommandResult {
        match self {
            Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
            Output::Text => text(value),
        }
        Ok(())
    }
}

/// `--status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    /// Waiting to be sent.
    Pending,
    /// Being sent.
    InProgress,
    /// Last attempt failed.
    Failed,
    /// Failed and waiting for the user.
    NeedsAttention,
    /// Applied, kept for retention.
    Completed,
}

impl StatusFilter {
    /// Whether an operation in `status` passes the filter.
    pub fn matches(self, status: OperationStatus, needs_attention: bool) -> bool {
        match self {
            StatusFilter::Pending => status == OperationStatus::Pending,
            StatusFilter::InProgress => status == OperationStatus::InProgress,
            StatusFilter::Failed => status == OperationStatus::Failed && !needs_attention,
            StatusFilter::NeedsAttention => status == OperationStatus::Failed && needs_attention,
            StatusFilter::Completed => status == OperationStatus::Completed,
        }
    }
}

/// Tables of an opened store.
pub struct Opened {
    /// Pending operation queue.
    pub queue: PendingQueue,
    /// Conflict log.
    pub conflicts: ConflictLog,
    /// Empty-vault guard state.
    pub guard: EmptyVaultGuard,
}

/// Decodes a base64 sealing key.
pub fn parse_key(encoded: &str) -> CommandResult<SealingKey> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(SealingKey::from_bytes(&bytes)?)
}

/// Opens the store with `queue` settings.
pub fn open(args: &StoreArgs, queue: QueueConfig) -> CommandResult<Opened> {
    if !args.path.is_dir() {
        return Err(format!("No store found at {}", args.path.display()).into());
    }
    let key = args.key.as_deref().map(parse_key).transpose()?;
    let store = SyncStore::open(&args.path, key, StoreConfig::default())?;
    let clock = Arc::new(SystemClock);
    Ok(Opened {
        queue: PendingQueue::open(&store, queue, clock.clone())?,
        conflicts: ConflictLog::open(&store, ConflictConfig::default(), clock)?,
        guard: EmptyVaultGuard::open(&store, GuardConfig::default())?,
    })
}

/// Opens the store with default settings.
pub fn open_default(args: &StoreArgs) -> CommandResult<Opened> {
    open(args, QueueConfig::default())
}

/// Renders a millisecond timestamp for text output.
pub fn format_timestamp(at: Option<i64>) -> String {
    match at {
        Some(ms) => format!("{ms} ms"),
        None => "never".to_string(),
    }
}

/// Store path as shown to the user.
pub fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::StoreArgs;
    use std::sync::Arc;
    use tempfile::TempDir;
    use vaultsync_engine::{
        EmptyVaultGuard, GuardConfig, ItemId, ItemSnapshot, ItemType, OperationKind, PendingQueue, QueueConfig,
        StoreConfig, SyncStore, SystemClock, VaultId,
    };

    /// A store with two queued operations in vault 1 and a synced vault 2.
    pub(crate) fn seeded_store() -> (TempDir, StoreArgs) {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SyncStore::open(dir.path(), None, StoreConfig::default()).unwrap();
            let queue = PendingQueue::open(&store, QueueConfig::default(), Arc::new(SystemClock)).unwrap();
            for (item, kind, remote) in [("a", OperationKind::Create, None), ("b", OperationKind::Update, Some("c-b"))] {
                queue
                    .enqueue(
                        VaultId(1),
                        ItemId::new(item),
                        ItemType::Login,
                        kind,
                        remote.map(str::to_string),
                        ItemSnapshot::login(item, "user", "pw", 0),
                    )
                    .unwrap();
            }
            let guard = EmptyVaultGuard::open(&store, GuardConfig::default()).unwrap();
            guard.mark_synced(VaultId(2), 42).unwrap();
        }
        let args = StoreArgs {
            path: dir.path().to_path_buf(),
            key: None,
        };
        (dir, args)
    }
}
