//! Pending operation queue.
//!
//! Local mutations are recorded here and drained against the remote vault
//! by the execution unit. Each item has at most one *active* operation
//! (pending, in progress or failed); later mutations of the same item are
//! folded into it by [`coalesce`].
//!
//! ## Invariants
//!
//! - Never more than one active operation per item id
//! - Nothing is sent for an item whose remote counterpart never existed
//! - A row is only modified under the queue's lock, so concurrent recorders
//!   and the drain loop cannot lose each other's updates
//! - Work interrupted by a crash (`InProgress` at open) is re-queued

use crate::config::QueueConfig;
use crate::error::{SyncError, SyncResult};
use crate::item::{ItemSnapshot, ItemType};
use crate::network::NetworkGate;
use crate::remote::RemoteCipher;
use crate::store::{Keyed, SyncStore, Table, OPERATIONS_TABLE};
use crate::types::{duration_millis, Clock, ItemId, OperationId, Timestamp, VaultId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a queued operation does to the remote cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create a new cipher.
    Create,
    /// Replace the cipher's content.
    Update,
    /// Move the cipher to the trash.
    Delete,
    /// Take the cipher out of the trash (and refresh its content).
    Restore,
    /// Delete the cipher permanently.
    Purge,
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Waiting to be sent.
    Pending,
    /// Being sent right now.
    InProgress,
    /// Last attempt failed.
    Failed,
    /// Withdrawn before it was applied.
    Cancelled,
    /// Applied remotely.
    Completed,
}

impl OperationStatus {
    /// Pending, in progress or failed.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            OperationStatus::Pending | OperationStatus::InProgress | OperationStatus::Failed
        )
    }
}

/// A mutation that arrived while the item's operation was in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    /// Net intent of everything that arrived during the flight.
    pub kind: OperationKind,
    /// Latest snapshot.
    pub payload: ItemSnapshot,
}

/// A not-yet-applied local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Stable id.
    pub id: OperationId,
    /// Owning vault.
    pub vault_id: VaultId,
    /// Local item the operation is about.
    pub item_id: ItemId,
    /// Item kind.
    pub item_type: ItemType,
    /// Intent.
    pub kind: OperationKind,
    /// Remote cipher id, once one exists.
    pub remote_id: Option<String>,
    /// Copy of the item taken when the mutation was recorded.
    pub payload: ItemSnapshot,
    /// Lifecycle state.
    pub status: OperationStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Message of the last failure.
    pub last_error: Option<String>,
    /// Not retried automatically until [`PendingQueue::retry_failed`].
    pub needs_attention: bool,
    /// Mutation recorded while this operation was in flight.
    pub follow_up: Option<FollowUp>,
    /// When the operation was first recorded.
    pub created_at: Timestamp,
    /// Last change of any field.
    pub updated_at: Timestamp,
    /// When it reached a terminal state.
    pub completed_at: Option<Timestamp>,
}

impl Keyed for PendingOperation {
    type Key = OperationId;

    fn key(&self) -> OperationId {
        self.id
    }
}

/// Result of applying the coalescing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesced {
    /// No active operation: enqueue the incoming one.
    Enqueue,
    /// Nothing to do.
    Drop,
    /// Rewrite the existing operation to `kind` with the incoming payload.
    Replace(OperationKind),
    /// Withdraw the existing operation; nothing remains queued.
    CancelExisting,
}

/// Folds an incoming mutation into the item's active operation.
///
/// `bound` says whether a remote counterpart is known for the item. Removing
/// an item that has none cancels whatever is queued for it, since there is
/// nothing to remove remotely.
#[must_use]
pub fn coalesce(existing: Option<OperationKind>, incoming: OperationKind, bound: bool) -> Coalesced {
    use OperationKind::*;

    let revive = if bound { Restore } else { Update };
    match (existing, incoming) {
        (None, Delete | Purge) if !bound => Coalesced::Drop,
        (None, _) => Coalesced::Enqueue,

        (Some(Create), Delete | Purge) => Coalesced::CancelExisting,
        (Some(_), Delete | Purge) if !bound => Coalesced::CancelExisting,
        (Some(Create), _) => Coalesced::Replace(Create),

        (Some(Update), Update | Create) => Coalesced::Replace(Update),
        (Some(Update), Restore) => Coalesced::Replace(revive),

        (Some(Delete), Delete) => Coalesced::Replace(Delete),
        (Some(Delete | Purge), Update | Create | Restore) => Coalesced::Replace(revive),
        (Some(Purge), Delete) => Coalesced::Replace(Purge),

        (Some(Restore), Update | Create | Restore) => Coalesced::Replace(Restore),

        (Some(Update | Delete | Purge | Restore), Delete | Purge) => Coalesced::Replace(incoming),
    }
}

/// What [`PendingQueue::enqueue`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new operation was queued.
    Enqueued(OperationId),
    /// Folded into the item's active operation.
    Coalesced(OperationId),
    /// Held until the item's in-flight operation resolves.
    Deferred(OperationId),
    /// Cancelled the item's unsent operation; nothing remains queued.
    Cancelled(OperationId),
    /// Nothing to do.
    Dropped,
}

impl EnqueueOutcome {
    /// Id of the operation that now carries the mutation.
    #[must_use]
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            EnqueueOutcome::Enqueued(id)
            | EnqueueOutcome::Coalesced(id)
            | EnqueueOutcome::Deferred(id) => Some(*id),
            EnqueueOutcome::Cancelled(_) | EnqueueOutcome::Dropped => None,
        }
    }
}

/// Outcome of sending one operation.
#[derive(Debug)]
pub enum ProcessResult {
    /// Applied. Carries the cipher returned by create/update/restore.
    Completed(Option<RemoteCipher>),
    /// The attempt failed.
    Failed(SyncError),
    /// The operation no longer makes sense and is withdrawn.
    Cancelled(String),
}

/// Sends operations to the remote vault.
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    /// Applies `op` remotely.
    async fn process(&self, op: &PendingOperation) -> ProcessResult;
}

/// Summary of one drain pass.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Operations sent.
    pub attempted: usize,
    /// Operations applied.
    pub completed: usize,
    /// Operations that failed.
    pub failed: usize,
    /// Operations withdrawn by the processor.
    pub cancelled: usize,
    /// First failure of the pass.
    pub first_error: Option<SyncError>,
    /// The pass stopped because the network gate closed.
    pub halted_offline: bool,
}

/// Counters for one vault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting to be sent.
    pub pending: usize,
    /// Being sent.
    pub in_progress: usize,
    /// Failed, automatic retry still possible.
    pub failed: usize,
    /// Failed, waiting for the user.
    pub needs_attention: usize,
    /// Completed rows kept for retention.
    pub completed: usize,
}

impl QueueStats {
    /// Operations not yet applied.
    #[must_use]
    pub fn active(&self) -> usize {
        self.pending + self.in_progress + self.failed + self.needs_attention
    }
}

/// Durable queue of pending operations.
pub struct PendingQueue {
    table: Mutex<Table<PendingOperation>>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl PendingQueue {
    /// Opens the queue in `store`, re-queuing operations a crash left in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read or repaired.
    pub fn open(store: &SyncStore, config: QueueConfig, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let mut table = store.open_table::<PendingOperation>(OPERATIONS_TABLE)?;

        let interrupted: Vec<PendingOperation> = table
            .values()
            .filter(|op| op.status == OperationStatus::InProgress)
            .cloned()
            .collect();
        for mut op in interrupted {
            warn!(op = %op.id, item = %op.item_id, "re-queuing operation interrupted by restart");
            op.status = OperationStatus::Pending;
            table.put(op)?;
        }

        Ok(Self {
            table: Mutex::new(table),
            config,
            clock,
        })
    }

    /// The queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Records a local mutation, folding it into the item's active operation.
    ///
    /// A mutation that turns out to be a no-op succeeds with
    /// [`EnqueueOutcome::Dropped`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue could not be written; the queue is
    /// left unchanged in that case.
    pub fn enqueue(
        &self,
        vault_id: VaultId,
        item_id: ItemId,
        item_type: ItemType,
        kind: OperationKind,
        remote_id: Option<String>,
        payload: ItemSnapshot,
    ) -> SyncResult<EnqueueOutcome> {
        let now = self.clock.now_millis();
        let mut table = self.table.lock();

        let existing = table
            .values()
            .find(|op| op.item_id == item_id && op.status.is_active())
            .cloned();

        let Some(mut op) = existing else {
            return match coalesce(None, kind, remote_id.is_some()) {
                Coalesced::Drop => {
                    debug!(item = %item_id, ?kind, "dropping removal of never-synced item");
                    Ok(EnqueueOutcome::Dropped)
                }
                _ => {
                    let op = PendingOperation {
                        id: OperationId::generate(),
                        vault_id,
                        item_id,
                        item_type,
                        kind,
                        remote_id,
                        payload,
                        status: OperationStatus::Pending,
                        retry_count: 0,
                        last_error: None,
                        needs_attention: false,
                        follow_up: None,
                        created_at: now,
                        updated_at: now,
                        completed_at: None,
                    };
                    let id = op.id;
                    debug!(op = %id, item = %op.item_id, ?kind, "queued operation");
                    table.put(op)?;
                    Ok(EnqueueOutcome::Enqueued(id))
                }
            };
        };

        if op.remote_id.is_none() {
            op.remote_id = remote_id;
        }
        op.item_type = item_type;
        op.updated_at = now;

        if op.status == OperationStatus::InProgress {
            // The in-flight call will create or keep the remote binding.
            let incoming = match kind {
                OperationKind::Create => OperationKind::Update,
                other => other,
            };
            let merged = match op.follow_up.as_ref().map(|f| f.kind) {
                None => incoming,
                Some(pending) => match coalesce(Some(pending), incoming, true) {
                    Coalesced::Replace(kind) => kind,
                    _ => incoming,
                },
            };
            op.follow_up = Some(FollowUp {
                kind: merged,
                payload,
            });
            let id = op.id;
            debug!(op = %id, ?merged, "deferred mutation behind in-flight operation");
            table.put(op)?;
            return Ok(EnqueueOutcome::Deferred(id));
        }

        let bound = op.remote_id.is_some();
        match coalesce(Some(op.kind), kind, bound) {
            Coalesced::CancelExisting => {
                let id = op.id;
                debug!(op = %id, item = %op.item_id, "cancelled unsent create");
                table.remove(&id)?;
                Ok(EnqueueOutcome::Cancelled(id))
            }
            Coalesced::Replace(next) => {
                let id = op.id;
                debug!(op = %id, from = ?op.kind, to = ?next, "coalesced mutation");
                op.kind = next;
                op.payload = payload;
                op.status = OperationStatus::Pending;
                op.needs_attention = false;
                op.retry_count = 0;
                op.last_error = None;
                table.put(op)?;
                Ok(EnqueueOutcome::Coalesced(id))
            }
            Coalesced::Enqueue | Coalesced::Drop => Ok(EnqueueOutcome::Dropped),
        }
    }

    /// Looks up an operation.
    #[must_use]
    pub fn get(&self, id: OperationId) -> Option<PendingOperation> {
        self.table.lock().get(&id).cloned()
    }

    /// The active operation of an item.
    #[must_use]
    pub fn active_for_item(&self, item_id: &ItemId) -> Option<PendingOperation> {
        self.table
            .lock()
            .values()
            .find(|op| &op.item_id == item_id && op.status.is_active())
            .cloned()
    }

    /// Item ids of a vault that have an active operation.
    #[must_use]
    pub fn active_item_ids(&self, vault: VaultId) -> HashSet<ItemId> {
        self.table
            .lock()
            .values()
            .filter(|op| op.vault_id == vault && op.status.is_active())
            .map(|op| op.item_id.clone())
            .collect()
    }

    /// Operations of a vault, oldest `updated_at` first.
    #[must_use]
    pub fn operations(&self, vault: VaultId) -> Vec<PendingOperation> {
        let mut ops: Vec<_> = self
            .table
            .lock()
            .values()
            .filter(|op| op.vault_id == vault)
            .cloned()
            .collect();
        ops.sort_by_key(|op| (op.updated_at, op.created_at));
        ops
    }

    /// Every vault with rows in the queue.
    #[must_use]
    pub fn vaults(&self) -> Vec<VaultId> {
        let mut vaults: Vec<_> = self.table.lock().values().map(|op| op.vault_id).collect();
        vaults.sort();
        vaults.dedup();
        vaults
    }

    /// Counters for a vault.
    #[must_use]
    pub fn stats(&self, vault: VaultId) -> QueueStats {
        let table = self.table.lock();
        let mut stats = QueueStats::default();
        for op in table.values().filter(|op| op.vault_id == vault) {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::InProgress => stats.in_progress += 1,
                OperationStatus::Failed if op.needs_attention => stats.needs_attention += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Cancelled => {}
            }
        }
        stats
    }

    /// Whether `op` may be sent at `now`.
    fn is_due(&self, op: &PendingOperation, now: Timestamp) -> bool {
        match op.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed if !op.needs_attention => {
                let wait = duration_millis(self.config.backoff.delay_for_attempt(op.retry_count));
                op.updated_at.saturating_add(wait) <= now
            }
            _ => false,
        }
    }

    /// Ids of due operations, oldest first, skipping `exclude`.
    fn due_ids(&self, vault: VaultId, exclude: &HashSet<OperationId>, limit: usize) -> Vec<OperationId> {
        let now = self.clock.now_millis();
        let table = self.table.lock();
        let mut due: Vec<&PendingOperation> = table
            .values()
            .filter(|op| op.vault_id == vault && !exclude.contains(&op.id) && self.is_due(op, now))
            .collect();
        due.sort_by_key(|op| (op.updated_at, op.created_at));
        due.into_iter().take(limit).map(|op| op.id).collect()
    }

    /// Marks a due operation in progress and returns the current copy.
    fn claim(&self, id: OperationId) -> SyncResult<Option<PendingOperation>> {
        let now = self.clock.now_millis();
        let mut table = self.table.lock();
        let Some(mut op) = table.get(&id).cloned() else {
            return Ok(None);
        };
        if !self.is_due(&op, now) {
            return Ok(None);
        }
        op.status = OperationStatus::InProgress;
        op.updated_at = now;
        table.put(op.clone())?;
        Ok(Some(op))
    }

    /// Applies the outcome of sending operation `id`.
    fn settle(&self, id: OperationId, result: &ProcessResult) -> SyncResult<()> {
        let now = self.clock.now_millis();
        let mut table = self.table.lock();
        let Some(mut op) = table.get(&id).cloned() else {
            return Ok(());
        };
        op.updated_at = now;

        match result {
            ProcessResult::Completed(remote) => {
                if let Some(remote) = remote {
                    op.remote_id = Some(remote.id.clone());
                }
                if let Some(follow_up) = op.follow_up.take() {
                    let bound = op.remote_id.is_some();
                    if coalesce(None, follow_up.kind, bound) == Coalesced::Drop {
                        table.remove(&id)?;
                        return Ok(());
                    }
                    debug!(op = %id, kind = ?follow_up.kind, "promoting deferred mutation");
                    op.kind = follow_up.kind;
                    op.payload = follow_up.payload;
                    op.status = OperationStatus::Pending;
                    op.retry_count = 0;
                    op.last_error = None;
                    table.put(op)?;
                } else if self.config.retain_completed {
                    op.status = OperationStatus::Completed;
                    op.completed_at = Some(now);
                    table.put(op)?;
                } else {
                    table.remove(&id)?;
                }
            }
            ProcessResult::Failed(error) => {
                op.retry_count += 1;
                op.last_error = Some(error.to_string());
                op.status = OperationStatus::Failed;
                op.needs_attention =
                    !error.is_retryable() || op.retry_count >= self.config.max_retries;
                if op.needs_attention {
                    warn!(op = %id, item = %op.item_id, retries = op.retry_count, %error, "operation needs attention");
                }

                if let Some(follow_up) = op.follow_up.take() {
                    match coalesce(Some(op.kind), follow_up.kind, op.remote_id.is_some()) {
                        Coalesced::CancelExisting => {
                            table.remove(&id)?;
                            return Ok(());
                        }
                        Coalesced::Replace(kind) => {
                            op.kind = kind;
                            op.payload = follow_up.payload;
                        }
                        Coalesced::Enqueue | Coalesced::Drop => {}
                    }
                }
                table.put(op)?;
            }
            ProcessResult::Cancelled(reason) => {
                debug!(op = %id, %reason, "operation withdrawn");
                table.remove(&id)?;
            }
        }
        Ok(())
    }

    /// Sends due operations of `vault` in batches until none are left.
    ///
    /// Stops as soon as the network gate closes; unsent work stays queued.
    /// Each operation is attempted at most once per pass.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself cannot be written. Remote
    /// failures are recorded on the operations and in the report.
    pub async fn drain(
        &self,
        vault: VaultId,
        gate: &NetworkGate,
        wifi_only: bool,
        processor: &dyn OperationProcessor,
    ) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        let mut seen = HashSet::new();

        'batches: loop {
            let batch = self.due_ids(vault, &seen, self.config.batch_size);
            if batch.is_empty() {
                break;
            }

            for id in batch {
                seen.insert(id);
                if !gate.is_sync_permitted(wifi_only) {
                    info!(%vault, "network gate closed, pausing queue");
                    report.halted_offline = true;
                    break 'batches;
                }
                let Some(op) = self.claim(id)? else {
                    continue;
                };

                report.attempted += 1;
                let result = processor.process(&op).await;
                match &result {
                    ProcessResult::Completed(_) => report.completed += 1,
                    ProcessResult::Cancelled(_) => report.cancelled += 1,
                    ProcessResult::Failed(_) => report.failed += 1,
                }
                self.settle(id, &result)?;
                if let ProcessResult::Failed(error) = result {
                    debug!(op = %id, %error, "operation failed");
                    report.first_error.get_or_insert(error);
                }
            }

            if !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        if report.attempted > 0 {
            info!(
                %vault,
                attempted = report.attempted,
                completed = report.completed,
                failed = report.failed,
                "drained pending operations"
            );
        }
        Ok(report)
    }

    /// Resets a failed operation so it is sent on the next drain.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::OperationNotFound`] for unknown ids.
    pub fn retry_failed(&self, id: OperationId) -> SyncResult<bool> {
        let mut table = self.table.lock();
        let mut op = table
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))?;
        if op.status != OperationStatus::Failed {
            return Ok(false);
        }
        op.status = OperationStatus::Pending;
        op.retry_count = 0;
        op.last_error = None;
        op.needs_attention = false;
        op.updated_at = self.clock.now_millis();
        table.put(op)?;
        Ok(true)
    }

    /// Resets every failed operation of a vault. Returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn retry_all_failed(&self, vault: VaultId) -> SyncResult<usize> {
        let failed: Vec<OperationId> = self
            .table
            .lock()
            .values()
            .filter(|op| op.vault_id == vault && op.status == OperationStatus::Failed)
            .map(|op| op.id)
            .collect();
        let mut reset = 0;
        for id in failed {
            if self.retry_failed(id)? {
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Withdraws an operation that is not in flight.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::OperationNotFound`] for unknown ids.
    pub fn cancel_operation(&self, id: OperationId) -> SyncResult<bool> {
        let mut table = self.table.lock();
        let op = table
            .get(&id)
            .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))?;
        if op.status == OperationStatus::InProgress {
            return Ok(false);
        }
        table.remove(&id)?;
        Ok(true)
    }

    /// Withdraws every operation of an item that is not in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn cancel_operations_for_item(&self, item_id: &ItemId) -> SyncResult<usize> {
        let mut table = self.table.lock();
        let ids: Vec<OperationId> = table
            .values()
            .filter(|op| &op.item_id == item_id && op.status != OperationStatus::InProgress)
            .map(|op| op.id)
            .collect();
        for id in &ids {
            table.remove(id)?;
        }
        Ok(ids.len())
    }

    /// Deletes terminal rows older than the retention period.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn cleanup_completed(&self) -> SyncResult<usize> {
        let cutoff = self.clock.now_millis() - duration_millis(self.config.retention);
        let mut table = self.table.lock();
        let expired: Vec<OperationId> = table
            .values()
            .filter(|op| !op.status.is_active())
            .filter(|op| op.completed_at.unwrap_or(op.updated_at) < cutoff)
            .map(|op| op.id)
            .collect();
        for id in &expired {
            table.remove(id)?;
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "cleaned up finished operations");
        }
        Ok(expired.len())
    }

    /// Deletes every row of a vault.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn remove_vault(&self, vault: VaultId) -> SyncResult<usize> {
        let mut table = self.table.lock();
        let ids: Vec<OperationId> = table
            .values()
            .filter(|op| op.vault_id == vault)
            .map(|op| op.id)
            .collect();
        for id in &ids {
            table.remove(id)?;
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::network::NetworkState;
    use crate::types::ManualClock;
    use std::time::Duration;
    use OperationKind::*;

    const VAULT: VaultId = VaultId(1);

    fn snapshot(name: &str) -> ItemSnapshot {
        ItemSnapshot::login(name, "user", "pw", 0)
    }

    fn queue_with(config: QueueConfig) -> (PendingQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let queue = PendingQueue::open(&SyncStore::in_memory(), config, clock.clone()).unwrap();
        (queue, clock)
    }

    fn queue() -> (PendingQueue, Arc<ManualClock>) {
        queue_with(QueueConfig::default().with_batch_delay(Duration::ZERO))
    }

    fn record(queue: &PendingQueue, item: &str, kind: OperationKind, remote: Option<&str>) -> EnqueueOutcome {
        queue
            .enqueue(
                VAULT,
                ItemId::new(item),
                ItemType::Login,
                kind,
                remote.map(str::to_string),
                snapshot(item),
            )
            .unwrap()
    }

    struct Scripted(Mutex<Vec<ProcessResult>>);

    #[async_trait]
    impl OperationProcessor for Scripted {
        async fn process(&self, _op: &PendingOperation) -> ProcessResult {
            let mut script = self.0.lock();
            if script.is_empty() {
                ProcessResult::Completed(None)
            } else {
                script.remove(0)
            }
        }
    }

    #[test]
    fn coalescing_table() {
        assert_eq!(coalesce(None, Delete, false), Coalesced::Drop);
        assert_eq!(coalesce(None, Purge, false), Coalesced::Drop);
        assert_eq!(coalesce(None, Delete, true), Coalesced::Enqueue);
        assert_eq!(coalesce(None, Update, false), Coalesced::Enqueue);
        assert_eq!(coalesce(Some(Create), Update, false), Coalesced::Replace(Create));
        assert_eq!(coalesce(Some(Create), Delete, false), Coalesced::CancelExisting);
        assert_eq!(coalesce(Some(Update), Delete, true), Coalesced::Replace(Delete));
        assert_eq!(coalesce(Some(Update), Delete, false), Coalesced::CancelExisting);
        assert_eq!(coalesce(Some(Update), Update, true), Coalesced::Replace(Update));
        assert_eq!(coalesce(Some(Delete), Restore, false), Coalesced::Replace(Update));
        assert_eq!(coalesce(Some(Purge), Restore, true), Coalesced::Replace(Restore));
        assert_eq!(coalesce(Some(Delete), Update, true), Coalesced::Replace(Restore));
        assert_eq!(coalesce(Some(Delete), Update, false), Coalesced::Replace(Update));
        assert_eq!(coalesce(Some(Delete), Purge, true), Coalesced::Replace(Purge));
        assert_eq!(coalesce(Some(Restore), Delete, true), Coalesced::Replace(Delete));
    }

    #[test]
    fn create_then_delete_leaves_queue_empty() {
        let (queue, _) = queue();
        let created = record(&queue, "a", Create, None);
        assert!(matches!(created, EnqueueOutcome::Enqueued(_)));
        let deleted = record(&queue, "a", Delete, None);
        assert!(matches!(deleted, EnqueueOutcome::Cancelled(_)));
        assert!(queue.operations(VAULT).is_empty());
    }

    #[test]
    fn delete_of_unsynced_item_is_dropped() {
        let (queue, _) = queue();
        assert_eq!(record(&queue, "a", Delete, None), EnqueueOutcome::Dropped);
        assert!(queue.operations(VAULT).is_empty());
    }

    #[test]
    fn updates_fold_into_one_operation() {
        let (queue, clock) = queue();
        let first = record(&queue, "a", Update, Some("c-1")).operation_id().unwrap();
        clock.advance(Duration::from_secs(1));
        let mut newer = snapshot("renamed");
        newer.updated_at = 7;
        let second = queue
            .enqueue(VAULT, ItemId::new("a"), ItemType::Login, Update, None, newer)
            .unwrap();

        assert_eq!(second, EnqueueOutcome::Coalesced(first));
        let ops = queue.operations(VAULT);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].payload.name, "renamed");
        assert_eq!(ops[0].remote_id.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn drain_completes_and_removes() {
        let (queue, _) = queue();
        record(&queue, "a", Create, None);
        record(&queue, "b", Update, Some("c-2"));
        let gate = NetworkGate::new(NetworkState::wifi());

        let report = queue
            .drain(VAULT, &gate, false, &Scripted(Mutex::new(Vec::new())))
            .await
            .unwrap();
        assert_eq!(report.completed, 2);
        assert!(report.first_error.is_none());
        assert!(queue.operations(VAULT).is_empty());
    }

    #[tokio::test]
    async fn failures_back_off_and_surface_after_max_retries() {
        let config = QueueConfig::default()
            .with_batch_delay(Duration::ZERO)
            .with_max_retries(2)
            .with_backoff(BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60)));
        let (queue, clock) = queue_with(config);
        let id = record(&queue, "a", Update, Some("c-1")).operation_id().unwrap();
        let gate = NetworkGate::new(NetworkState::wifi());
        let failing = || {
            Scripted(Mutex::new(vec![ProcessResult::Failed(SyncError::Network(
                "reset".into(),
            ))]))
        };

        let report = queue.drain(VAULT, &gate, false, &failing()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.first_error.unwrap().is_retryable());
        let op = queue.get(id).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 1);
        assert!(!op.needs_attention);

        // Inside the backoff window nothing is sent.
        let report = queue.drain(VAULT, &gate, false, &failing()).await.unwrap();
        assert_eq!(report.attempted, 0);

        clock.advance(Duration::from_secs(1));
        queue.drain(VAULT, &gate, false, &failing()).await.unwrap();
        let op = queue.get(id).unwrap();
        assert_eq!(op.retry_count, 2);
        assert!(op.needs_attention);
        assert_eq!(queue.stats(VAULT).needs_attention, 1);

        clock.advance(Duration::from_secs(3600));
        let report = queue.drain(VAULT, &gate, false, &failing()).await.unwrap();
        assert_eq!(report.attempted, 0);

        assert!(queue.retry_failed(id).unwrap());
        let report = queue
            .drain(VAULT, &gate, false, &Scripted(Mutex::new(Vec::new())))
            .await
            .unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn new_edit_restarts_the_retry_budget() {
        let config = QueueConfig::default()
            .with_batch_delay(Duration::ZERO)
            .with_max_retries(2)
            .with_backoff(BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60)));
        let (queue, clock) = queue_with(config);
        let id = record(&queue, "a", Update, Some("c-1")).operation_id().unwrap();
        let gate = NetworkGate::new(NetworkState::wifi());
        let failing = || {
            Scripted(Mutex::new(vec![ProcessResult::Failed(SyncError::Server {
                status: 503,
                message: "unavailable".into(),
            })]))
        };

        queue.drain(VAULT, &gate, false, &failing()).await.unwrap();
        clock.advance(Duration::from_secs(1));
        queue.drain(VAULT, &gate, false, &failing()).await.unwrap();
        assert!(queue.get(id).unwrap().needs_attention);

        assert_eq!(record(&queue, "a", Update, Some("c-1")), EnqueueOutcome::Coalesced(id));
        let op = queue.get(id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert!(op.last_error.is_none());
        assert!(!op.needs_attention);

        queue.drain(VAULT, &gate, false, &failing()).await.unwrap();
        let op = queue.get(id).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 1);
        assert!(!op.needs_attention);
    }

    #[tokio::test]
    async fn fatal_errors_need_attention_immediately() {
        let (queue, _) = queue();
        let id = record(&queue, "a", Update, Some("c-1")).operation_id().unwrap();
        let gate = NetworkGate::new(NetworkState::wifi());
        let script = Scripted(Mutex::new(vec![ProcessResult::Failed(SyncError::Permission(
            "read-only".into(),
        ))]));
        queue.drain(VAULT, &gate, false, &script).await.unwrap();
        let op = queue.get(id).unwrap();
        assert!(op.needs_attention);
        assert_eq!(op.retry_count, 1);
    }

    #[tokio::test]
    async fn closed_gate_stops_without_discarding() {
        let (queue, _) = queue();
        record(&queue, "a", Update, Some("c-1"));
        let gate = NetworkGate::new(NetworkState::offline());
        let report = queue
            .drain(VAULT, &gate, false, &Scripted(Mutex::new(Vec::new())))
            .await
            .unwrap();
        assert!(report.halted_offline);
        assert_eq!(report.attempted, 0);
        assert_eq!(queue.stats(VAULT).pending, 1);
    }

    #[tokio::test]
    async fn mutation_during_flight_becomes_follow_up() {
        struct Interleaving<'a> {
            queue: &'a PendingQueue,
        }

        #[async_trait]
        impl OperationProcessor for Interleaving<'_> {
            async fn process(&self, op: &PendingOperation) -> ProcessResult {
                let outcome = self
                    .queue
                    .enqueue(op.vault_id, op.item_id.clone(), op.item_type, Delete, None, op.payload.clone())
                    .unwrap();
                assert!(matches!(outcome, EnqueueOutcome::Deferred(_)));
                ProcessResult::Completed(Some(RemoteCipher {
                    id: "c-new".into(),
                    revision_date: 5,
                    deleted_date: None,
                }))
            }
        }

        let (queue, _) = queue();
        let id = record(&queue, "a", Create, None).operation_id().unwrap();
        let gate = NetworkGate::new(NetworkState::wifi());
        queue
            .drain(VAULT, &gate, false, &Interleaving { queue: &queue })
            .await
            .unwrap();

        let op = queue.get(id).unwrap();
        assert_eq!(op.kind, Delete);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.remote_id.as_deref(), Some("c-new"));
        assert_eq!(queue.operations(VAULT).len(), 1);
    }

    #[test]
    fn interrupted_operations_are_requeued_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store_config = crate::config::StoreConfig::default();
        {
            let store = SyncStore::open(dir.path(), None, store_config.clone()).unwrap();
            let queue = PendingQueue::open(&store, QueueConfig::default(), clock.clone()).unwrap();
            let id = record(&queue, "a", Update, Some("c-1")).operation_id().unwrap();
            assert!(queue.claim(id).unwrap().is_some());
        }

        let store = SyncStore::open(dir.path(), None, store_config).unwrap();
        let queue = PendingQueue::open(&store, QueueConfig::default(), clock).unwrap();
        let ops = queue.operations(VAULT);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, OperationStatus::Pending);
    }

    #[test]
    fn cancel_and_cleanup() {
        let config = QueueConfig::default().with_retention(Duration::from_secs(10));
        let (queue, clock) = queue_with(config);
        let a = record(&queue, "a", Update, Some("c-1")).operation_id().unwrap();
        record(&queue, "b", Update, Some("c-2"));
        assert!(queue.cancel_operation(a).unwrap());
        assert!(matches!(queue.cancel_operation(a), Err(SyncError::OperationNotFound(_))));
        assert_eq!(queue.cancel_operations_for_item(&ItemId::new("b")).unwrap(), 1);

        assert!(queue.active_for_item(&ItemId::new("c")).is_none());
        record(&queue, "c", Update, Some("c-3"));
        let mut done = queue.active_for_item(&ItemId::new("c")).unwrap();
        done.status = OperationStatus::Completed;
        done.completed_at = Some(clock.now_millis());
        queue.table.lock().put(done).unwrap();

        assert_eq!(queue.cleanup_completed().unwrap(), 0);
        clock.advance(Duration::from_secs(11));
        assert_eq!(queue.cleanup_completed().unwrap(), 1);
        assert!(queue.operations(VAULT).is_empty());
    }
}
