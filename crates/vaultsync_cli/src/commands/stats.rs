//! Stats command implementation.

use super::{display_path, format_timestamp, open_default, CommandResult, Output, StoreArgs};
use serde::Serialize;
use std::collections::BTreeSet;
use vaultsync_engine::{QueueStats, VaultId};

/// Counters of one vault.
#[derive(Debug, Serialize)]
pub struct VaultStats {
    /// Vault.
    pub vault_id: VaultId,
    /// Queue counters.
    pub queue: QueueStats,
    /// Conflict records.
    pub conflicts: usize,
    /// Last applied pull.
    pub last_sync_at: Option<i64>,
    /// An empty-vault confirmation is waiting to be used.
    pub clear_confirmed: bool,
}

/// Store statistics.
#[derive(Debug, Serialize)]
pub struct StatsResult {
    /// Store path.
    pub path: String,
    /// Per-vault counters.
    pub vaults: Vec<VaultStats>,
}

/// Runs the stats command.
pub fn run(args: &StoreArgs, output: Output) -> CommandResult {
    let result = collect(args)?;
    output.emit(&result, print_text_output)
}

/// Gathers per-vault counters from the store.
pub fn collect(args: &StoreArgs) -> CommandResult<StatsResult> {
    let opened = open_default(args)?;

    let mut vaults: BTreeSet<VaultId> = opened.queue.vaults().into_iter().collect();
    vaults.extend(opened.conflicts.load_conflict_backups().iter().map(|r| r.vault_id));
    vaults.extend(opened.guard.states().iter().map(|s| s.vault_id));

    let result = StatsResult {
        path: display_path(&args.path),
        vaults: vaults
            .into_iter()
            .map(|vault| {
                let state = opened.guard.state(vault);
                VaultStats {
                    vault_id: vault,
                    queue: opened.queue.stats(vault),
                    conflicts: opened.conflicts.count(vault),
                    last_sync_at: state.last_sync_at,
                    clear_confirmed: state.clear_confirmed,
                }
            })
            .collect(),
    };
    Ok(result)
}

fn print_text_output(result: &StatsResult) {
    println!("vaultsync store statistics");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);

    if result.vaults.is_empty() {
        println!();
        println!("No vaults recorded.");
        return;
    }

    for vault in &result.vaults {
        println!();
        println!("{}:", vault.vault_id);
        println!("  Pending:         {}", vault.queue.pending);
        println!("  In progress:     {}", vault.queue.in_progress);
        println!("  Failed:          {}", vault.queue.failed);
        println!("  Needs attention: {}", vault.queue.needs_attention);
        println!("  Completed:       {}", vault.queue.completed);
        println!("  Conflicts:       {}", vault.conflicts);
        println!("  Last sync:       {}", format_timestamp(vault.last_sync_at));
        if vault.clear_confirmed {
            println!("  Empty-vault clear confirmed, applies on next sync");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::seeded_store;

    #[test]
    fn counts_every_recorded_vault() {
        let (_dir, args) = seeded_store();
        let result = collect(&args).unwrap();

        let ids: Vec<VaultId> = result.vaults.iter().map(|v| v.vault_id).collect();
        assert_eq!(ids, vec![VaultId(1), VaultId(2)]);
        assert_eq!(result.vaults[0].queue.pending, 2);
        assert_eq!(result.vaults[0].last_sync_at, None);
        assert_eq!(result.vaults[1].queue.pending, 0);
        assert_eq!(result.vaults[1].last_sync_at, Some(42));
    }
}
