//! vaultsync CLI
//!
//! Command-line tools for a persisted sync store.
//!
//! # Commands
//!
//! - `stats` - Queue, conflict and guard counters per vault
//! - `queue` - List queued operations
//! - `conflicts` - List conflict records
//! - `retry-failed` - Make failed operations eligible again
//! - `cleanup` - Remove finished operations past retention
//! - `confirm-clear` - Accept an empty remote vault on the next sync

mod commands;

use clap::{Parser, Subcommand};
use commands::{Output, StatusFilter, StoreArgs};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vaultsync_engine::VaultId;

/// vaultsync store maintenance tools.
#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    store: Option<PathBuf>,

    /// Base64 sealing key of an encrypted store
    #[arg(global = true, short, long)]
    key: Option<String>,

    /// Print JSON instead of text
    #[arg(global = true, long)]
    json: bool,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show counters for every vault in the store
    Stats,

    /// List queued operations
    Queue {
        /// Only this vault
        #[arg(long)]
        vault: Option<u64>,

        /// Only operations in this state
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },

    /// List conflict records, newest first
    Conflicts {
        /// Only this vault
        #[arg(long)]
        vault: Option<u64>,
    },

    /// Reset failed operations of a vault to pending
    RetryFailed {
        /// Vault to reset
        #[arg(long)]
        vault: u64,
    },

    /// Remove finished operations older than the retention period
    Cleanup {
        /// Retention in days
        #[arg(long, default_value = "7")]
        retention_days: u64,
    },

    /// Let the next sync of a vault apply an empty remote vault
    ConfirmClear {
        /// Vault to confirm
        #[arg(long)]
        vault: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = cli.store.ok_or("Store path required (--store)")?;
    let args = StoreArgs {
        path,
        key: cli.key,
    };
    let output = if cli.json { Output::Json } else { Output::Text };

    match cli.command {
        Commands::Stats => commands::stats::run(&args, output)?,
        Commands::Queue { vault, status } => {
            commands::queue::run(&args, vault.map(VaultId), status, output)?;
        }
        Commands::Conflicts { vault } => commands::conflicts::run(&args, vault.map(VaultId), output)?,
        Commands::RetryFailed { vault } => commands::maintain::retry_failed(&args, VaultId(vault), output)?,
        Commands::Cleanup { retention_days } => commands::maintain::cleanup(&args, retention_days, output)?,
        Commands::ConfirmClear { vault } => commands::maintain::confirm_clear(&args, VaultId(vault), output)?,
    }

    Ok(())
}
