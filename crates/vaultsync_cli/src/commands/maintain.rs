//! Maintenance commands: retry, cleanup, empty-vault confirmation.

use super::{open, open_default, CommandResult, Output, StoreArgs};
use serde::Serialize;
use std::time::Duration;
use vaultsync_engine::{QueueConfig, VaultId};

/// Outcome of a maintenance command.
#[derive(Debug, Serialize)]
pub struct MaintainResult {
    /// What was done.
    pub action: &'static str,
    /// Affected vault, if the command targets one.
    pub vault_id: Option<VaultId>,
    /// Rows changed.
    pub affected: usize,
}

fn report(output: Output, result: &MaintainResult) -> CommandResult {
    output.emit(result, |r| match r.vault_id {
        Some(vault) => println!("{}: {} ({})", r.action, r.affected, vault),
        None => println!("{}: {}", r.action, r.affected),
    })
}

/// Resets every failed operation of `vault` to pending.
pub fn retry_failed(args: &StoreArgs, vault: VaultId, output: Output) -> CommandResult {
    let opened = open_default(args)?;
    let affected = opened.queue.retry_all_failed(vault)?;
    report(
        output,
        &MaintainResult {
            action: "operations reset",
            vault_id: Some(vault),
            affected,
        },
    )
}

/// Removes finished operations older than `retention_days`.
pub fn cleanup(args: &StoreArgs, retention_days: u64, output: Output) -> CommandResult {
    let retention = Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60));
    let opened = open(args, QueueConfig::default().with_retention(retention))?;
    let affected = opened.queue.cleanup_completed()?;
    report(
        output,
        &MaintainResult {
            action: "operations removed",
            vault_id: None,
            affected,
        },
    )
}

/// Records consent to apply an empty remote vault on the next sync.
pub fn confirm_clear(args: &StoreArgs, vault: VaultId, output: Output) -> CommandResult {
    let opened = open_default(args)?;
    opened.guard.confirm_clear_local_data(vault)?;
    report(
        output,
        &MaintainResult {
            action: "empty-vault clear confirmed",
            vault_id: Some(vault),
            affected: 1,
        },
    )
}
