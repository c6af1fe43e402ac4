//! Empty-vault safety guard.
//!
//! A pull that returns no ciphers while the vault still has linked items
//! locally looks exactly like an upstream outage or an account mixup.
//! Applying it would unlink every local item, so it is refused until the
//! user confirms. The confirmation is one-shot: it is consumed by the next
//! sync that gets applied.

use crate::config::GuardConfig;
use crate::error::SyncResult;
use crate::store::{Keyed, SyncStore, Table, VAULTS_TABLE};
use crate::types::{Timestamp, VaultId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 64;

/// Result of the guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// The pull may be applied.
    Allowed,
    /// First sync of the vault; an empty remote is legitimate.
    FirstSyncAllowed,
    /// The pull must not be applied.
    Blocked {
        /// Linked local items.
        local_count: usize,
        /// Ciphers returned by the pull.
        server_count: usize,
        /// Human-readable explanation.
        reason: String,
    },
}

impl GuardDecision {
    /// Whether the pull may be applied.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, GuardDecision::Blocked { .. })
    }
}

/// Decides whether a pull result may be applied.
///
/// Rules in priority order: a first sync is always allowed; a non-empty
/// remote is allowed; both sides empty is allowed; an empty remote against
/// linked local items is blocked.
#[must_use]
pub fn check(local_linked_count: usize, server_count: usize, is_first_sync: bool) -> GuardDecision {
    if is_first_sync {
        return GuardDecision::FirstSyncAllowed;
    }
    if server_count > 0 || local_linked_count == 0 {
        return GuardDecision::Allowed;
    }
    GuardDecision::Blocked {
        local_count: local_linked_count,
        server_count,
        reason: format!(
            "remote vault returned no items while {local_linked_count} local items are linked"
        ),
    }
}

/// Whether going from `local` to `server` items loses more than `threshold`
/// of the vault.
#[must_use]
pub fn is_significant_data_loss(local: usize, server: usize, threshold: f64) -> bool {
    if local == 0 || server >= local {
        return false;
    }
    let lost = (local - server) as f64 / local as f64;
    lost > threshold
}

/// Notifications for the confirmation UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    /// A pull was refused.
    EmptyVaultDetected {
        /// Vault.
        vault: VaultId,
        /// Linked local items.
        local_count: usize,
        /// Ciphers returned by the pull.
        server_count: usize,
    },
    /// The user allowed the next empty pull to be applied.
    UserConfirmedClear {
        /// Vault.
        vault: VaultId,
    },
    /// The user declined.
    UserCancelledSync {
        /// Vault.
        vault: VaultId,
    },
}

/// Persisted per-vault sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultState {
    /// Vault.
    pub vault_id: VaultId,
    /// Last time a pull was applied.
    pub last_sync_at: Option<Timestamp>,
    /// One-shot confirmation to apply an empty pull.
    pub clear_confirmed: bool,
}

impl VaultState {
    fn new(vault_id: VaultId) -> Self {
        Self {
            vault_id,
            last_sync_at: None,
            clear_confirmed: false,
        }
    }
}

impl Keyed for VaultState {
    type Key = VaultId;

    fn key(&self) -> VaultId {
        self.vault_id
    }
}

/// The guard together with the per-vault state it depends on.
pub struct EmptyVaultGuard {
    table: Mutex<Table<VaultState>>,
    events: broadcast::Sender<GuardEvent>,
    config: GuardConfig,
}

impl EmptyVaultGuard {
    /// Opens the per-vault state in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn open(store: &SyncStore, config: GuardConfig) -> SyncResult<Self> {
        let table = store.open_table::<VaultState>(VAULTS_TABLE)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            table: Mutex::new(table),
            events,
            config,
        })
    }

    /// Subscribes to guard events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.events.subscribe()
    }

    /// Stored state of a vault.
    #[must_use]
    pub fn state(&self, vault: VaultId) -> VaultState {
        self.table
            .lock()
            .get(&vault)
            .cloned()
            .unwrap_or_else(|| VaultState::new(vault))
    }

    /// Every stored vault state, by vault.
    #[must_use]
    pub fn states(&self) -> Vec<VaultState> {
        let mut states: Vec<_> = self.table.lock().values().cloned().collect();
        states.sort_by_key(|s| s.vault_id);
        states
    }

    /// Whether no pull has ever been applied for the vault.
    #[must_use]
    pub fn is_first_sync(&self, vault: VaultId) -> bool {
        self.state(vault).last_sync_at.is_none()
    }

    /// Checks a pull result for `vault`, honouring a pending confirmation.
    #[must_use]
    pub fn evaluate(&self, vault: VaultId, local_linked_count: usize, server_count: usize) -> GuardDecision {
        let state = self.state(vault);
        let decision = check(local_linked_count, server_count, state.last_sync_at.is_none());

        match &decision {
            GuardDecision::Blocked { .. } if state.clear_confirmed => {
                info!(%vault, local_linked_count, "empty remote vault applied after user confirmation");
                GuardDecision::Allowed
            }
            GuardDecision::Blocked { .. } => {
                warn!(%vault, local_linked_count, server_count, "refusing to apply empty remote vault");
                let _ = self.events.send(GuardEvent::EmptyVaultDetected {
                    vault,
                    local_count: local_linked_count,
                    server_count,
                });
                decision
            }
            GuardDecision::Allowed
                if is_significant_data_loss(
                    local_linked_count,
                    server_count,
                    self.config.significant_loss_threshold,
                ) =>
            {
                warn!(
                    %vault,
                    local_linked_count,
                    server_count,
                    "remote vault lost a large share of linked items"
                );
                decision
            }
            _ => decision,
        }
    }

    /// Allows the next empty pull of `vault` to be applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn confirm_clear_local_data(&self, vault: VaultId) -> SyncResult<()> {
        self.update(vault, |state| state.clear_confirmed = true)?;
        info!(%vault, "user confirmed applying empty remote vault");
        let _ = self.events.send(GuardEvent::UserConfirmedClear { vault });
        Ok(())
    }

    /// Withdraws a confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn cancel_sync(&self, vault: VaultId) -> SyncResult<()> {
        self.update(vault, |state| state.clear_confirmed = false)?;
        let _ = self.events.send(GuardEvent::UserCancelledSync { vault });
        Ok(())
    }

    /// Withdraws every confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn clear_confirmations(&self) -> SyncResult<()> {
        let mut table = self.table.lock();
        let confirmed: Vec<VaultState> = table
            .values()
            .filter(|s| s.clear_confirmed)
            .cloned()
            .collect();
        for mut state in confirmed {
            state.clear_confirmed = false;
            table.put(state)?;
        }
        Ok(())
    }

    /// Records that a pull was applied, consuming any confirmation.
    /// Returns whether a confirmation was consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn mark_synced(&self, vault: VaultId, at: Timestamp) -> SyncResult<bool> {
        let mut consumed = false;
        self.update(vault, |state| {
            consumed = state.clear_confirmed;
            state.clear_confirmed = false;
            state.last_sync_at = Some(at);
        })?;
        Ok(consumed)
    }

    /// Records that a pull was applied without consuming a confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn record_pull(&self, vault: VaultId, at: Timestamp) -> SyncResult<()> {
        self.update(vault, |state| state.last_sync_at = Some(at))
    }

    /// Forgets a vault.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn remove_vault(&self, vault: VaultId) -> SyncResult<()> {
        self.table.lock().remove(&vault)?;
        Ok(())
    }

    fn update(&self, vault: VaultId, apply: impl FnOnce(&mut VaultState)) -> SyncResult<()> {
        let mut table = self.table.lock();
        let mut state = table
            .get(&vault)
            .cloned()
            .unwrap_or_else(|| VaultState::new(vault));
        apply(&mut state);
        table.put(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_rules() {
        assert!(matches!(
            check(50, 0, false),
            GuardDecision::Blocked {
                local_count: 50,
                server_count: 0,
                ..
            }
        ));
        assert_eq!(check(0, 0, false), GuardDecision::Allowed);
        assert_eq!(check(5, 0, true), GuardDecision::FirstSyncAllowed);
        assert_eq!(check(5, 3, false), GuardDecision::Allowed);
    }

    #[test]
    fn significant_loss() {
        assert!(!is_significant_data_loss(0, 0, 0.5));
        assert!(!is_significant_data_loss(10, 10, 0.5));
        assert!(!is_significant_data_loss(10, 5, 0.5));
        assert!(is_significant_data_loss(10, 4, 0.5));
    }

    #[test]
    fn confirmation_is_one_shot() {
        let guard = EmptyVaultGuard::open(&SyncStore::in_memory(), GuardConfig::default()).unwrap();
        let vault = VaultId(9);
        assert_eq!(guard.evaluate(vault, 3, 0), GuardDecision::FirstSyncAllowed);
        assert!(!guard.mark_synced(vault, 10).unwrap());
        assert!(!guard.is_first_sync(vault));

        assert!(!guard.evaluate(vault, 3, 0).is_allowed());
        guard.confirm_clear_local_data(vault).unwrap();
        assert_eq!(guard.evaluate(vault, 3, 0), GuardDecision::Allowed);
        assert!(guard.mark_synced(vault, 20).unwrap());

        assert!(!guard.evaluate(vault, 3, 0).is_allowed());
        assert_eq!(guard.state(vault).last_sync_at, Some(20));
    }

    #[test]
    fn record_pull_keeps_the_confirmation() {
        let guard = EmptyVaultGuard::open(&SyncStore::in_memory(), GuardConfig::default()).unwrap();
        let vault = VaultId(3);
        guard.mark_synced(vault, 5).unwrap();
        guard.confirm_clear_local_data(vault).unwrap();

        guard.record_pull(vault, 8).unwrap();
        let state = guard.state(vault);
        assert_eq!(state.last_sync_at, Some(8));
        assert!(state.clear_confirmed);
    }

    #[test]
    fn cancel_and_clear_withdraw_confirmations() {
        let guard = EmptyVaultGuard::open(&SyncStore::in_memory(), GuardConfig::default()).unwrap();
        guard.confirm_clear_local_data(VaultId(1)).unwrap();
        guard.confirm_clear_local_data(VaultId(2)).unwrap();
        guard.cancel_sync(VaultId(1)).unwrap();
        assert!(!guard.state(VaultId(1)).clear_confirmed);
        guard.clear_confirmations().unwrap();
        assert!(!guard.state(VaultId(2)).clear_confirmed);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let guard = EmptyVaultGuard::open(&SyncStore::in_memory(), GuardConfig::default()).unwrap();
        let mut events = guard.subscribe();
        guard.mark_synced(VaultId(1), 1).unwrap();

        let _ = guard.evaluate(VaultId(1), 4, 0);
        guard.confirm_clear_local_data(VaultId(1)).unwrap();
        guard.cancel_sync(VaultId(1)).unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            GuardEvent::EmptyVaultDetected {
                vault: VaultId(1),
                local_count: 4,
                server_count: 0
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            GuardEvent::UserConfirmedClear { vault: VaultId(1) }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            GuardEvent::UserCancelledSync { vault: VaultId(1) }
        );
    }
}
