//! Queue command implementation.

use super::{open_default, CommandResult, Output, StatusFilter, StoreArgs};
use serde::Serialize;
use vaultsync_engine::{ItemId, OperationId, OperationKind, OperationStatus, PendingOperation, VaultId};

/// A queued operation without its payload.
#[derive(Debug, Serialize)]
pub struct OperationRow {
    /// Operation id.
    pub id: OperationId,
    /// Vault.
    pub vault_id: VaultId,
    /// Local item.
    pub item_id: ItemId,
    /// Intent.
    pub kind: OperationKind,
    /// Lifecycle state.
    pub status: OperationStatus,
    /// Remote cipher id, if known.
    pub remote_id: Option<String>,
    /// Failed attempts.
    pub retry_count: u32,
    /// Held back until retried by hand.
    pub needs_attention: bool,
    /// Last failure.
    pub last_error: Option<String>,
    /// First recorded.
    pub created_at: i64,
}

impl From<&PendingOperation> for OperationRow {
    fn from(op: &PendingOperation) -> Self {
        Self {
            id: op.id,
            vault_id: op.vault_id,
            item_id: op.item_id.clone(),
            kind: op.kind,
            status: op.status,
            remote_id: op.remote_id.clone(),
            retry_count: op.retry_count,
            needs_attention: op.needs_attention,
            last_error: op.last_error.clone(),
            created_at: op.created_at,
        }
    }
}

/// Runs the queue command. Payloads are never printed.
pub fn run(args: &StoreArgs, vault: Option<VaultId>, status: Option<StatusFilter>, output: Output) -> CommandResult {
    let rows = collect(args, vault, status)?;
    output.emit(&rows, |rows| {
        if rows.is_empty() {
            println!("No queued operations.");
            return;
        }
        for row in rows {
            let attention = if row.needs_attention { " (needs attention)" } else { "" };
            println!(
                "{} {} {:?} {:?}{} retries={}",
                row.vault_id, row.item_id, row.kind, row.status, attention, row.retry_count
            );
            if let Some(error) = &row.last_error {
                println!("    last error: {error}");
            }
        }
    })
}

/// Queued operations of `vault` (or every vault) that pass `status`.
pub fn collect(
    args: &StoreArgs,
    vault: Option<VaultId>,
    status: Option<StatusFilter>,
) -> CommandResult<Vec<OperationRow>> {
    let opened = open_default(args)?;
    let vaults = match vault {
        Some(vault) => vec![vault],
        None => opened.queue.vaults(),
    };

    let rows: Vec<OperationRow> = vaults
        .into_iter()
        .flat_map(|vault| opened.queue.operations(vault))
        .filter(|op| status.map_or(true, |f| f.matches(op.status, op.needs_attention)))
        .map(|op| OperationRow::from(&op))
        .collect();
    Ok(rows)
}
