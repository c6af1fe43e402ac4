//! Conflict records: both sides of an edit that could not be ordered.
//!
//! Records are append-only and never resolved automatically. The log keeps
//! the most recent `max_records` entries and evicts the oldest first.

use crate::config::ConflictConfig;
use crate::error::SyncResult;
use crate::item::ItemSnapshot;
use crate::remote::RemoteCipher;
use crate::store::{Keyed, SyncStore, Table, CONFLICTS_TABLE};
use crate::types::{Clock, ItemId, Timestamp, VaultId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier of a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(pub Uuid);

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a conflict was filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    /// The remote cipher changed after the local edit that is still queued.
    RemoteNewerThanPending,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::RemoteNewerThanPending => {
                f.write_str("remote revision newer than an outstanding local pending operation")
            }
        }
    }
}

/// Preserved local and remote state of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Record id.
    pub id: ConflictId,
    /// Owning vault.
    pub vault_id: VaultId,
    /// Local item.
    pub item_id: ItemId,
    /// Remote cipher.
    pub remote_id: String,
    /// Why the record exists.
    pub reason: ConflictReason,
    /// Content of the pending local change.
    pub local_snapshot: ItemSnapshot,
    /// Remote state as pulled.
    pub remote_snapshot: RemoteCipher,
    /// When the conflict was detected.
    pub created_at: Timestamp,
    /// Insertion order, for eviction.
    pub seq: u64,
}

impl Keyed for ConflictRecord {
    type Key = ConflictId;

    fn key(&self) -> ConflictId {
        self.id
    }
}

/// Durable, capped list of conflict records.
pub struct ConflictLog {
    table: Mutex<Table<ConflictRecord>>,
    config: ConflictConfig,
    clock: Arc<dyn Clock>,
}

impl ConflictLog {
    /// Opens the conflict log in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn open(store: &SyncStore, config: ConflictConfig, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let table = store.open_table::<ConflictRecord>(CONFLICTS_TABLE)?;
        Ok(Self {
            table: Mutex::new(table),
            config,
            clock,
        })
    }

    /// The log configuration.
    #[must_use]
    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    /// Files a conflict unless one already exists for this item at this
    /// remote revision. Returns the new record.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    pub fn record(
        &self,
        vault_id: VaultId,
        item_id: &ItemId,
        local_snapshot: &ItemSnapshot,
        remote: &RemoteCipher,
    ) -> SyncResult<Option<ConflictRecord>> {
        let mut table = self.table.lock();

        let duplicate = table.values().any(|r| {
            r.item_id == *item_id
                && r.remote_id == remote.id
                && r.remote_snapshot.revision_date == remote.revision_date
        });
        if duplicate {
            debug!(item = %item_id, revision = remote.revision_date, "conflict already recorded");
            return Ok(None);
        }

        let seq = table.values().map(|r| r.seq + 1).max().unwrap_or(0);
        let record = ConflictRecord {
            id: ConflictId(Uuid::new_v4()),
            vault_id,
            item_id: item_id.clone(),
            remote_id: remote.id.clone(),
            reason: ConflictReason::RemoteNewerThanPending,
            local_snapshot: local_snapshot.clone(),
            remote_snapshot: remote.clone(),
            created_at: self.clock.now_millis(),
            seq,
        };
        warn!(%vault_id, item = %item_id, remote = %remote.id, "conflict recorded, local change kept");
        table.put(record.clone())?;

        while table.len() > self.config.max_records {
            let Some(oldest) = table.values().min_by_key(|r| r.seq).map(|r| r.id) else {
                break;
            };
            table.remove(&oldest)?;
        }
        Ok(Some(record))
    }

    /// Every record, newest first.
    #[must_use]
    pub fn load_conflict_backups(&self) -> Vec<ConflictRecord> {
        let mut records: Vec<_> = self.table.lock().values().cloned().collect();
        records.sort_by(|a, b| b.seq.cmp(&a.seq));
        records
    }

    /// Records of one vault, newest first.
    #[must_use]
    pub fn for_vault(&self, vault: VaultId) -> Vec<ConflictRecord> {
        let mut records = self.load_conflict_backups();
        records.retain(|r| r.vault_id == vault);
        records
    }

    /// Number of records of one vault.
    #[must_use]
    pub fn count(&self, vault: VaultId) -> usize {
        self.table.lock().values().filter(|r| r.vault_id == vault).count()
    }

    /// Removes a record after the user has dealt with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    pub fn dismiss(&self, id: ConflictId) -> SyncResult<bool> {
        Ok(self.table.lock().remove(&id)?.is_some())
    }

    /// Removes every record of a vault.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    pub fn remove_vault(&self, vault: VaultId) -> SyncResult<usize> {
        let mut table = self.table.lock();
        let ids: Vec<ConflictId> = table
            .values()
            .filter(|r| r.vault_id == vault)
            .map(|r| r.id)
            .collect();
        for id in &ids {
            table.remove(id)?;
        }
        Ok(ids.len())
    }
}
