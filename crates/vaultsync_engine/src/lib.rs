//! # vaultsync engine
//!
//! Offline-first synchronization of password vaults with a remote vault
//! service.
//!
//! This crate provides:
//! - Pending operation queue with per-item coalescing and durable storage
//! - Sync execution unit (push, pull, guard, reconcile)
//! - Empty-vault protection with one-shot user confirmation
//! - Per-vault trigger orchestration: debounce, throttle, priority merge,
//!   retry with exponential backoff
//! - Conflict records for edits that cannot be ordered automatically
//! - Type 2 encrypted strings (`2.<iv>|<data>|<mac>`)
//!
//! ## Architecture
//!
//! Local edits never wait for the network. They are recorded in the
//! [`PendingQueue`] and a sync is requested from the [`SyncOrchestrator`],
//! which decides when the [`SyncExecutor`] runs:
//! 1. Resolve the session and check the network gate
//! 2. Drain queued operations (failures do not stop the pull)
//! 3. Pull the remote cipher list
//! 4. Let the [`EmptyVaultGuard`] veto an empty pull
//! 5. Reconcile local items, filing conflicts instead of overwriting
//!
//! The host application plugs in through [`SessionProvider`], [`ItemStore`]
//! and [`RemoteVault`].
//!
//! ## Key Invariants
//!
//! - At most one active queued operation per item
//! - At most one run per vault at a time; vaults are independent
//! - Local pending work is never silently discarded
//! - An empty remote never erases linked local data without confirmation

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cipher;
mod config;
mod conflict;
mod engine;
mod error;
mod executor;
mod guard;
mod item;
mod network;
mod orchestrator;
mod queue;
mod remote;
mod scheduler;
mod session;
mod status;
mod store;
mod types;

pub use cipher::{EncString, SymmetricKey, ENC_TYPE_AES_CBC_256_HMAC_SHA256, IV_SIZE, KEY_HALF_SIZE, MAC_SIZE};
pub use config::{
    BackoffConfig, ConflictConfig, EngineConfig, GuardConfig, OrchestratorConfig, QueueConfig, StoreConfig,
};
pub use conflict::{ConflictId, ConflictLog, ConflictReason, ConflictRecord};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use executor::{is_remote_newer, SyncCounters, SyncExecution, SyncExecutor, SyncOutcome};
pub use guard::{check, is_significant_data_loss, EmptyVaultGuard, GuardDecision, GuardEvent, VaultState};
pub use item::{ItemSnapshot, ItemStore, ItemType, LocalItem, MemoryItemStore};
pub use network::{NetworkGate, NetworkState, NetworkTransport};
pub use orchestrator::{RequestDisposition, SyncOrchestrator};
pub use queue::{
    coalesce, Coalesced, DrainReport, EnqueueOutcome, FollowUp, OperationKind, OperationProcessor,
    OperationStatus, PendingOperation, PendingQueue, ProcessResult, QueueStats,
};
pub use remote::{CipherRequest, LoginRequest, MockRemoteVault, RemoteCall, RemoteCipher, RemoteVault, UriRequest};
pub use scheduler::{KnownVaults, PeriodicScheduler, SchedulerHandle, VaultDirectory, DEFAULT_PERIODIC_INTERVAL};
pub use session::{Session, SessionProvider, StaticSessionProvider, REFRESH_LEEWAY};
pub use status::{StatusBoard, SyncStatus, VaultPhase, VaultStatusWatcher};
pub use store::SyncStore;
pub use types::{
    duration_millis, BlockReason, Clock, ItemId, ManualClock, OperationId, SystemClock, Timestamp, TriggerReason,
    VaultId,
};
pub use vaultsync_storage::SealingKey;
