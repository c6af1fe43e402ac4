//! Sync execution unit: one full push/pull pass for one vault.
//!
//! A run resolves the session, checks the network gate, drains the pending
//! queue, pulls the remote cipher list, lets the empty-vault guard veto the
//! result and finally reconciles local items against it. The caller (the
//! orchestrator) guarantees at most one run per vault at a time.

use crate::conflict::ConflictLog;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::guard::{EmptyVaultGuard, GuardDecision};
use crate::item::{ItemStore, LocalItem};
use crate::network::NetworkGate;
use crate::queue::{OperationKind, OperationProcessor, PendingOperation, PendingQueue, ProcessResult};
use crate::remote::{CipherRequest, RemoteCipher, RemoteVault};
use crate::session::{Session, SessionProvider};
use crate::types::{duration_millis, BlockReason, Clock, ItemId, Timestamp, TriggerReason, VaultId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The pull was applied.
    Success {
        /// Ciphers returned by the pull.
        synced_count: usize,
        /// Conflicts filed during this run.
        conflict_count: usize,
    },
    /// A transient failure; the run should be retried later.
    RetryableError {
        /// What failed.
        message: String,
    },
    /// The run did not start or its result was not applied.
    Blocked {
        /// Why.
        reason: BlockReason,
        /// Details.
        message: Option<String>,
    },
    /// A failure that needs the user.
    FatalError {
        /// What failed.
        message: String,
    },
}

impl SyncOutcome {
    fn blocked(reason: BlockReason) -> Self {
        SyncOutcome::Blocked {
            reason,
            message: None,
        }
    }

    /// Classifies a failure that ended the run.
    fn from_error(error: &SyncError) -> Self {
        match error.kind() {
            ErrorKind::Network | ErrorKind::Server => SyncOutcome::RetryableError {
                message: error.to_string(),
            },
            ErrorKind::Auth => SyncOutcome::Blocked {
                reason: BlockReason::AuthRequired,
                message: Some(error.to_string()),
            },
            _ => SyncOutcome::FatalError {
                message: error.to_string(),
            },
        }
    }

    /// Whether the pull was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. })
    }
}

/// Per-vault counters shown alongside the sync status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    /// Operations waiting to be sent.
    pub pending: usize,
    /// Operations whose last attempt failed.
    pub failed: usize,
    /// Conflict records kept for the vault.
    pub conflicts: usize,
}

/// What the orchestrator needs from an execution unit.
#[async_trait]
pub trait SyncExecution: Send + Sync {
    /// Runs one full sync of `vault`.
    async fn run_sync(&self, vault: VaultId, trigger: TriggerReason, silent: bool) -> SyncOutcome;

    /// Whether the vault's keys are available.
    fn is_unlocked(&self, vault: VaultId) -> bool;

    /// Current counters of the vault.
    fn counters(&self, vault: VaultId) -> SyncCounters;
}

/// Whether a remote revision supersedes the state a pending local edit was
/// made against.
///
/// The last revision seen from the server is compared directly. Without one
/// the local edit time stands in, and `skew_ms` absorbs the difference
/// between the two clocks.
#[must_use]
pub fn is_remote_newer(
    known_revision: Option<Timestamp>,
    local_updated_at: Timestamp,
    remote_revision: Timestamp,
    skew_ms: i64,
) -> bool {
    match known_revision {
        Some(known) => remote_revision > known,
        None => remote_revision > local_updated_at.saturating_add(skew_ms),
    }
}

/// The production [`SyncExecution`].
pub struct SyncExecutor {
    sessions: Arc<dyn SessionProvider>,
    items: Arc<dyn ItemStore>,
    remote: Arc<dyn RemoteVault>,
    queue: Arc<PendingQueue>,
    conflicts: Arc<ConflictLog>,
    guard: Arc<EmptyVaultGuard>,
    gate: Arc<NetworkGate>,
    clock: Arc<dyn Clock>,
}

impl SyncExecutor {
    /// Wires an execution unit.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        items: Arc<dyn ItemStore>,
        remote: Arc<dyn RemoteVault>,
        queue: Arc<PendingQueue>,
        conflicts: Arc<ConflictLog>,
        guard: Arc<EmptyVaultGuard>,
        gate: Arc<NetworkGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            items,
            remote,
            queue,
            conflicts,
            guard,
            gate,
            clock,
        }
    }

    async fn execute(&self, vault: VaultId) -> SyncResult<SyncOutcome> {
        let now = self.clock.now_millis();

        // 1. session
        let session = match self.sessions.get_or_refresh_session(vault, now).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(SyncOutcome::blocked(BlockReason::AuthRequired)),
            Err(error) => return Ok(SyncOutcome::from_error(&error)),
        };

        // 2. network
        if let Err(reason) = self.gate.permit() {
            return Ok(SyncOutcome::blocked(reason));
        }

        // 3. push
        let processor = RunProcessor {
            remote: self.remote.as_ref(),
            vault,
            session: &session,
            applied: Mutex::new(Vec::new()),
        };
        let report = self
            .queue
            .drain(vault, &self.gate, self.gate.wifi_only(), &processor)
            .await?;
        self.apply_bindings(vault, processor.applied.into_inner()).await?;
        if report.halted_offline {
            let reason = self
                .gate
                .permit()
                .err()
                .unwrap_or(BlockReason::NetworkUnavailable);
            return Ok(SyncOutcome::blocked(reason));
        }

        // 4. pull
        let pulled = match self.remote.pull(vault, &session).await {
            Ok(pulled) => pulled,
            Err(error) => return Ok(SyncOutcome::from_error(&error)),
        };

        // 5. guard
        let mut local = self.items.load_items(vault).await?;
        let linked = local.iter().filter(|item| item.is_bound()).count();
        if let GuardDecision::Blocked {
            local_count,
            server_count,
            reason,
        } = self.guard.evaluate(vault, linked, pulled.len())
        {
            debug!(%vault, local_count, server_count, "pull withheld");
            return Ok(SyncOutcome::Blocked {
                reason: BlockReason::EmptyVaultProtection,
                message: Some(reason),
            });
        }

        // 6. reconcile
        let conflict_count = self.reconcile(vault, &mut local, &pulled).await?;
        let synced_at = self.clock.now_millis();

        // 7. outcome
        if let Some(error) = report.first_error {
            // The pull was applied but the run failed: keep any confirmation.
            self.guard.record_pull(vault, synced_at)?;
            return Ok(if error.is_retryable() {
                SyncOutcome::RetryableError {
                    message: error.to_string(),
                }
            } else {
                SyncOutcome::FatalError {
                    message: error.to_string(),
                }
            });
        }
        if self.guard.mark_synced(vault, synced_at)? {
            info!(%vault, "empty-vault confirmation consumed");
        }
        Ok(SyncOutcome::Success {
            synced_count: pulled.len(),
            conflict_count,
        })
    }

    /// Binds created items and refreshes revisions returned by the push.
    async fn apply_bindings(&self, vault: VaultId, applied: Vec<(ItemId, RemoteCipher)>) -> SyncResult<()> {
        if applied.is_empty() {
            return Ok(());
        }
        let latest: HashMap<ItemId, RemoteCipher> = applied.into_iter().collect();
        let changed: Vec<LocalItem> = self
            .items
            .load_items(vault)
            .await?
            .into_iter()
            .filter_map(|mut item| {
                let cipher = latest.get(&item.id)?;
                item.remote_id = Some(cipher.id.clone());
                item.remote_revision = Some(cipher.revision_date);
                Some(item)
            })
            .collect();
        self.items.save_items(changed).await
    }

    /// Mirrors the pulled state into local items. Returns the number of
    /// conflicts filed.
    async fn reconcile(&self, vault: VaultId, local: &mut [LocalItem], pulled: &[RemoteCipher]) -> SyncResult<usize> {
        let remote_by_id: HashMap<&str, &RemoteCipher> =
            pulled.iter().map(|cipher| (cipher.id.as_str(), cipher)).collect();
        let skew_ms = duration_millis(self.conflicts.config().skew_tolerance);

        let mut changed = Vec::new();
        let mut conflicts = 0;
        let mut unbound = 0;

        for item in local.iter_mut() {
            let Some(remote_id) = item.remote_id.clone() else {
                continue;
            };
            let pending = self.queue.active_for_item(&item.id);

            let Some(remote) = remote_by_id.get(remote_id.as_str()) else {
                if pending.is_none() {
                    item.unbind();
                    unbound += 1;
                    changed.push(item.clone());
                }
                continue;
            };

            match pending {
                None => {
                    let deleted = remote.deleted_date.is_some();
                    if item.is_deleted != deleted || item.remote_revision != Some(remote.revision_date) {
                        item.is_deleted = deleted;
                        item.remote_revision = Some(remote.revision_date);
                        changed.push(item.clone());
                    }
                }
                Some(op) => {
                    if is_remote_newer(
                        item.remote_revision,
                        op.payload.updated_at,
                        remote.revision_date,
                        skew_ms,
                    ) && self.conflicts.record(vault, &item.id, &op.payload, remote)?.is_some()
                    {
                        conflicts += 1;
                    }
                }
            }
        }

        if unbound > 0 {
            info!(%vault, unbound, "unlinked items missing from the remote vault");
        }
        if !changed.is_empty() {
            debug!(%vault, changed = changed.len(), "applying remote state to local items");
            self.items.save_items(changed).await?;
        }
        Ok(conflicts)
    }
}

#[async_trait]
impl SyncExecution for SyncExecutor {
    async fn run_sync(&self, vault: VaultId, trigger: TriggerReason, silent: bool) -> SyncOutcome {
        debug!(%vault, %trigger, silent, "sync run starting");
        let outcome = match self.execute(vault).await {
            Ok(outcome) => outcome,
            Err(error) => SyncOutcome::from_error(&error),
        };

        match &outcome {
            SyncOutcome::Success {
                synced_count,
                conflict_count,
            } => info!(%vault, %trigger, synced_count, conflict_count, "sync complete"),
            SyncOutcome::Blocked { reason, .. } if silent => debug!(%vault, %trigger, %reason, "sync blocked"),
            SyncOutcome::Blocked { reason, .. } => info!(%vault, %trigger, %reason, "sync blocked"),
            SyncOutcome::RetryableError { message } | SyncOutcome::FatalError { message } if silent => {
                debug!(%vault, %trigger, %message, "background sync failed");
            }
            SyncOutcome::RetryableError { message } | SyncOutcome::FatalError { message } => {
                warn!(%vault, %trigger, %message, "sync failed");
            }
        }
        outcome
    }

    fn is_unlocked(&self, vault: VaultId) -> bool {
        self.sessions.is_unlocked(vault)
    }

    fn counters(&self, vault: VaultId) -> SyncCounters {
        let stats = self.queue.stats(vault);
        SyncCounters {
            pending: stats.pending + stats.in_progress,
            failed: stats.failed + stats.needs_attention,
            conflicts: self.conflicts.count(vault),
        }
    }
}

/// Sends queued operations with the session of one run.
struct RunProcessor<'a> {
    remote: &'a dyn RemoteVault,
    vault: VaultId,
    session: &'a Session,
    applied: Mutex<Vec<(ItemId, RemoteCipher)>>,
}

impl RunProcessor<'_> {
    async fn send(&self, op: &PendingOperation) -> SyncResult<Option<RemoteCipher>> {
        let (vault, session) = (self.vault, self.session);
        let encrypt = || CipherRequest::encrypt(op.item_type, &op.payload, session);

        let cipher = match (op.kind, op.remote_id.as_deref()) {
            (OperationKind::Create | OperationKind::Update | OperationKind::Restore, None) => {
                self.remote.create_cipher(vault, session, &encrypt()?).await?
            }
            (OperationKind::Create | OperationKind::Update, Some(remote_id)) => {
                self.remote.update_cipher(vault, session, remote_id, &encrypt()?).await?
            }
            (OperationKind::Restore, Some(remote_id)) => {
                self.remote.restore_cipher(vault, session, remote_id).await?;
                self.remote.update_cipher(vault, session, remote_id, &encrypt()?).await?
            }
            (OperationKind::Delete, Some(remote_id)) => {
                self.remote.soft_delete_cipher(vault, session, remote_id).await?;
                return Ok(None);
            }
            (OperationKind::Purge, Some(remote_id)) => {
                self.remote.purge_cipher(vault, session, remote_id).await?;
                return Ok(None);
            }
            (OperationKind::Delete | OperationKind::Purge, None) => return Ok(None),
        };
        self.applied.lock().push((op.item_id.clone(), cipher.clone()));
        Ok(Some(cipher))
    }
}

#[async_trait]
impl OperationProcessor for RunProcessor<'_> {
    async fn process(&self, op: &PendingOperation) -> ProcessResult {
        if matches!(op.kind, OperationKind::Delete | OperationKind::Purge) && op.remote_id.is_none() {
            return ProcessResult::Cancelled("item was never created remotely".into());
        }
        match self.send(op).await {
            Ok(cipher) => ProcessResult::Completed(cipher),
            Err(SyncError::RemoteNotFound(id))
                if matches!(op.kind, OperationKind::Delete | OperationKind::Purge) =>
            {
                debug!(op = %op.id, remote = %id, "remote cipher already gone");
                ProcessResult::Completed(None)
            }
            Err(error) => ProcessResult::Failed(error),
        }
    }
}
