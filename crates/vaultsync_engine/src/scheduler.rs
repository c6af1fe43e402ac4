//! Background periodic sync.

use crate::orchestrator::SyncOrchestrator;
use crate::queue::PendingQueue;
use crate::types::{TriggerReason, VaultId};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Default spacing between periodic syncs.
pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Lists the vaults the periodic scheduler visits.
pub trait VaultDirectory: Send + Sync {
    /// Vaults to sync.
    fn vaults(&self) -> Vec<VaultId>;
}

/// A registry of signed-in vaults.
#[derive(Debug, Default)]
pub struct KnownVaults {
    vaults: RwLock<BTreeSet<VaultId>>,
}

impl KnownVaults {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a vault. Returns false if it was already known.
    pub fn register(&self, vault: VaultId) -> bool {
        self.vaults.write().insert(vault)
    }

    /// Removes a vault. Returns false if it was unknown.
    pub fn unregister(&self, vault: VaultId) -> bool {
        self.vaults.write().remove(&vault)
    }
}

impl VaultDirectory for KnownVaults {
    fn vaults(&self) -> Vec<VaultId> {
        self.vaults.read().iter().copied().collect()
    }
}

/// Fires `PERIODIC` for every known vault and prunes finished queue rows.
pub struct PeriodicScheduler {
    orchestrator: SyncOrchestrator,
    directory: Arc<dyn VaultDirectory>,
    queue: Arc<PendingQueue>,
    interval: Duration,
}

impl PeriodicScheduler {
    /// Creates a scheduler with the default interval.
    pub fn new(orchestrator: SyncOrchestrator, directory: Arc<dyn VaultDirectory>, queue: Arc<PendingQueue>) -> Self {
        Self {
            orchestrator,
            directory,
            queue,
            interval: DEFAULT_PERIODIC_INTERVAL,
        }
    }

    /// Sets the interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Starts ticking. The first tick fires one interval from now.
    #[must_use = "dropping the handle stops the scheduler"]
    pub fn start(self) -> SchedulerHandle {
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                self.tick().await;
            }
        });
        SchedulerHandle { handle: Some(handle) }
    }

    async fn tick(&self) {
        if let Err(error) = self.queue.cleanup_completed() {
            warn!(%error, "queue cleanup failed");
        }
        // One task per vault so a slow vault does not hold up the others.
        for vault in self.directory.vaults() {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                let disposition = orchestrator
                    .request_sync(vault, TriggerReason::Periodic, false)
                    .await;
                debug!(%vault, ?disposition, "periodic trigger handled");
            });
        }
    }
}

/// Stops the scheduler on [`SchedulerHandle::shutdown`] or drop.
#[derive(Debug)]
pub struct SchedulerHandle {
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stops the scheduler and waits for the task to end.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
