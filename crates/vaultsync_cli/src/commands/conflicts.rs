//! Conflicts command implementation.

use super::{open_default, CommandResult, Output, StoreArgs};
use serde::Serialize;
use vaultsync_engine::{ConflictId, ConflictReason, ConflictRecord, ItemId, VaultId};

/// A conflict record without the local snapshot's secrets.
#[derive(Debug, Serialize)]
pub struct ConflictRow {
    /// Record id.
    pub id: ConflictId,
    /// Vault.
    pub vault_id: VaultId,
    /// Local item.
    pub item_id: ItemId,
    /// Name of the local snapshot.
    pub local_name: String,
    /// Local edit time.
    pub local_updated_at: i64,
    /// Remote cipher.
    pub remote_id: String,
    /// Remote revision that conflicted.
    pub remote_revision: i64,
    /// Why the record was filed.
    pub reason: ConflictReason,
    /// When it was filed.
    pub created_at: i64,
}

impl From<&ConflictRecord> for ConflictRow {
    fn from(record: &ConflictRecord) -> Self {
        Self {
            id: record.id,
            vault_id: record.vault_id,
            item_id: record.item_id.clone(),
            local_name: record.local_snapshot.name.clone(),
            local_updated_at: record.local_snapshot.updated_at,
            remote_id: record.remote_id.clone(),
            remote_revision: record.remote_snapshot.revision_date,
            reason: record.reason,
            created_at: record.created_at,
        }
    }
}

/// Runs the conflicts command.
pub fn run(args: &StoreArgs, vault: Option<VaultId>, output: Output) -> CommandResult {
    let opened = open_default(args)?;
    let records = match vault {
        Some(vault) => opened.conflicts.for_vault(vault),
        None => opened.conflicts.load_conflict_backups(),
    };
    let rows: Vec<ConflictRow> = records.iter().map(ConflictRow::from).collect();

    output.emit(&rows, |rows| {
        if rows.is_empty() {
            println!("No conflicts recorded.");
            return;
        }
        for row in rows {
            println!("[{}] {} item {} \"{}\"", row.id, row.vault_id, row.item_id, row.local_name);
            println!(
                "    local edit {} vs remote {} revision {} ({})",
                row.local_updated_at, row.remote_id, row.remote_revision, row.reason
            );
        }
    })
}
