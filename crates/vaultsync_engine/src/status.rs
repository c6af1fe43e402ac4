//! Observable per-vault sync status.

use crate::types::{BlockReason, Timestamp, TriggerReason, VaultId};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::watch;

/// Where a vault is in the orchestrator's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VaultPhase {
    /// Nothing scheduled.
    Idle,
    /// A run is waiting (debounce timer or behind a running sync).
    Queued(TriggerReason),
    /// A run is in flight.
    Running,
    /// The last request could not proceed.
    Blocked(BlockReason),
    /// A retry timer is armed.
    RetryScheduled {
        /// When the retry fires.
        at: Timestamp,
    },
    /// Retries are exhausted or the failure needs the user.
    Failed,
}

/// Snapshot of one vault's sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// State machine position.
    pub phase: VaultPhase,
    /// A run is in flight.
    pub is_running: bool,
    /// Reason that will run next.
    pub queued_reason: Option<TriggerReason>,
    /// Reason of the last run started.
    pub last_trigger_reason: Option<TriggerReason>,
    /// Why the vault is blocked, if it is.
    pub blocked_reason: Option<BlockReason>,
    /// Last failure shown to the user.
    pub last_error: Option<String>,
    /// Last successful run.
    pub last_success_at: Option<Timestamp>,
    /// When the armed retry fires.
    pub next_retry_at: Option<Timestamp>,
    /// Consecutive retryable failures.
    pub retry_attempt: u32,
    /// Operations waiting to be sent.
    pub pending_count: usize,
    /// Operations whose last attempt failed.
    pub failed_count: usize,
    /// Conflict records for the vault.
    pub conflict_count: usize,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: VaultPhase::Idle,
            is_running: false,
            queued_reason: None,
            last_trigger_reason: None,
            blocked_reason: None,
            last_error: None,
            last_success_at: None,
            next_retry_at: None,
            retry_attempt: 0,
            pending_count: 0,
            failed_count: 0,
            conflict_count: 0,
        }
    }
}

/// Published status of every known vault.
#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<HashMap<VaultId, SyncStatus>>,
}

impl StatusBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HashMap::new());
        Self { tx }
    }

    /// Status of one vault.
    #[must_use]
    pub fn get(&self, vault: VaultId) -> Option<SyncStatus> {
        self.tx.borrow().get(&vault).cloned()
    }

    /// Status of every vault.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<VaultId, SyncStatus> {
        self.tx.borrow().clone()
    }

    /// Edits a vault's status, creating it if needed. Observers are woken
    /// only if something changed.
    pub fn update(&self, vault: VaultId, edit: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_if_modified(|map| {
            let entry = map.entry(vault).or_default();
            let before = entry.clone();
            edit(entry);
            *entry != before
        });
    }

    /// Drops a vault's status.
    pub fn remove(&self, vault: VaultId) {
        self.tx.send_if_modified(|map| map.remove(&vault).is_some());
    }

    /// Subscribes to the whole board.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HashMap<VaultId, SyncStatus>> {
        self.tx.subscribe()
    }

    /// Subscribes to one vault.
    #[must_use]
    pub fn watch_vault(&self, vault: VaultId) -> VaultStatusWatcher {
        let rx = self.tx.subscribe();
        let last = rx.borrow().get(&vault).cloned();
        VaultStatusWatcher { rx, vault, last }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Status stream of a single vault.
#[derive(Debug)]
pub struct VaultStatusWatcher {
    rx: watch::Receiver<HashMap<VaultId, SyncStatus>>,
    vault: VaultId,
    last: Option<SyncStatus>,
}

impl VaultStatusWatcher {
    /// The most recent status seen.
    #[must_use]
    pub fn current(&self) -> Option<&SyncStatus> {
        self.last.as_ref()
    }

    /// Waits until the vault's status differs from the last one seen.
    /// Returns `None` once the board is gone; a removed vault reports
    /// `Some(None)`.
    pub async fn changed(&mut self) -> Option<Option<SyncStatus>> {
        loop {
            self.rx.changed().await.ok()?;
            let next = self.rx.borrow_and_update().get(&self.vault).cloned();
            if next != self.last {
                self.last.clone_from(&next);
                return Some(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_updates_do_not_notify() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        board.update(VaultId(1), |s| s.retry_attempt = 2);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        board.update(VaultId(1), |s| s.retry_attempt = 2);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(board.get(VaultId(1)).unwrap().retry_attempt, 2);
    }

    #[tokio::test]
    async fn vault_watcher_ignores_other_vaults() {
        let board = StatusBoard::new();
        let mut watcher = board.watch_vault(VaultId(1));
        assert!(watcher.current().is_none());

        board.update(VaultId(2), |s| s.is_running = true);
        board.update(VaultId(1), |s| s.phase = VaultPhase::Running);

        let seen = watcher.changed().await.unwrap().unwrap();
        assert_eq!(seen.phase, VaultPhase::Running);

        board.remove(VaultId(1));
        assert_eq!(watcher.changed().await, Some(None));
    }
}
