//! Wiring of the engine's parts behind one handle.

use crate::config::EngineConfig;
use crate::conflict::{ConflictLog, ConflictRecord};
use crate::error::SyncResult;
use crate::executor::SyncExecutor;
use crate::guard::EmptyVaultGuard;
use crate::item::{ItemStore, LocalItem};
use crate::network::NetworkGate;
use crate::orchestrator::{RequestDisposition, SyncOrchestrator};
use crate::queue::{EnqueueOutcome, OperationKind, PendingQueue};
use crate::remote::RemoteVault;
use crate::scheduler::{KnownVaults, PeriodicScheduler, SchedulerHandle, DEFAULT_PERIODIC_INTERVAL};
use crate::session::SessionProvider;
use crate::store::SyncStore;
use crate::types::{Clock, SystemClock, TriggerReason, VaultId};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    sessions: Arc<dyn SessionProvider>,
    items: Arc<dyn ItemStore>,
    remote: Arc<dyn RemoteVault>,
    config: EngineConfig,
    store: Option<SyncStore>,
    gate: Option<Arc<NetworkGate>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SyncEngineBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Persists state in `store` instead of memory.
    #[must_use]
    pub fn with_store(mut self, store: SyncStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Shares an existing network gate.
    #[must_use]
    pub fn with_network_gate(mut self, gate: Arc<NetworkGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Replaces the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Opens the persisted state and wires the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let config = self.config;
        let store = self.store.unwrap_or_else(SyncStore::in_memory);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let gate = self.gate.unwrap_or_default();

        let queue = Arc::new(PendingQueue::open(&store, config.queue.clone(), clock.clone())?);
        let conflicts = Arc::new(ConflictLog::open(&store, config.conflicts.clone(), clock.clone())?);
        let guard = Arc::new(EmptyVaultGuard::open(&store, config.guard.clone())?);

        let executor = Arc::new(SyncExecutor::new(
            self.sessions,
            self.items,
            self.remote,
            queue.clone(),
            conflicts.clone(),
            guard.clone(),
            gate.clone(),
            clock.clone(),
        ));
        let orchestrator = SyncOrchestrator::new(
            config.orchestrator.clone(),
            executor,
            gate.clone(),
            guard.clone(),
            clock,
        );

        let vaults = Arc::new(KnownVaults::new());
        for vault in queue.vaults() {
            vaults.register(vault);
        }
        info!(persistent = store.path().is_some(), sealed = store.is_sealed(), "sync engine ready");

        Ok(SyncEngine {
            store,
            queue,
            conflicts,
            guard,
            gate,
            orchestrator,
            vaults,
        })
    }
}

/// The sync engine: queue, conflict log, guard and orchestrator sharing one
/// store.
pub struct SyncEngine {
    store: SyncStore,
    queue: Arc<PendingQueue>,
    conflicts: Arc<ConflictLog>,
    guard: Arc<EmptyVaultGuard>,
    gate: Arc<NetworkGate>,
    orchestrator: SyncOrchestrator,
    vaults: Arc<KnownVaults>,
}

impl SyncEngine {
    /// Starts building an engine around the host's session provider, item
    /// store and remote vault.
    pub fn builder(
        sessions: Arc<dyn SessionProvider>,
        items: Arc<dyn ItemStore>,
        remote: Arc<dyn RemoteVault>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            sessions,
            items,
            remote,
            config: EngineConfig::default(),
            store: None,
            gate: None,
            clock: None,
        }
    }

    /// Makes `vault` visible to periodic sync.
    pub fn register_vault(&self, vault: VaultId) {
        self.vaults.register(vault);
    }

    /// Records a local change to `item` and schedules a debounced sync.
    ///
    /// A change that cancels out (for example deleting an item that never
    /// reached the server) succeeds without queuing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub async fn record_mutation(&self, item: &LocalItem, kind: OperationKind) -> SyncResult<EnqueueOutcome> {
        let outcome = self.queue.enqueue(
            item.vault_id,
            item.id.clone(),
            item.item_type,
            kind,
            item.remote_id.clone(),
            item.data.clone(),
        )?;
        self.vaults.register(item.vault_id);
        if outcome != EnqueueOutcome::Dropped {
            self.orchestrator
                .request_sync(item.vault_id, TriggerReason::LocalMutation, false)
                .await;
        }
        Ok(outcome)
    }

    /// Runs a user-initiated sync.
    pub async fn request_manual_sync(&self, vault: VaultId) -> RequestDisposition {
        self.vaults.register(vault);
        self.orchestrator.request_manual_sync(vault).await
    }

    /// Every conflict record, newest first.
    #[must_use]
    pub fn load_conflict_backups(&self) -> Vec<ConflictRecord> {
        self.conflicts.load_conflict_backups()
    }

    /// Forgets everything about a vault: timers, status, queued operations,
    /// conflicts and guard state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn remove_vault(&self, vault: VaultId) -> SyncResult<()> {
        self.vaults.unregister(vault);
        self.orchestrator.clear_vault(vault).await;
        let operations = self.queue.remove_vault(vault)?;
        let conflicts = self.conflicts.remove_vault(vault)?;
        self.guard.remove_vault(vault)?;
        info!(%vault, operations, conflicts, "vault removed from sync");
        Ok(())
    }

    /// Starts the periodic scheduler. `None` uses the default interval.
    #[must_use = "dropping the handle stops the scheduler"]
    pub fn start_periodic_sync(&self, interval: Option<Duration>) -> SchedulerHandle {
        PeriodicScheduler::new(self.orchestrator.clone(), self.vaults.clone(), self.queue.clone())
            .with_interval(interval.unwrap_or(DEFAULT_PERIODIC_INTERVAL))
            .start()
    }

    /// The trigger orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    /// The pending operation queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// The conflict log.
    #[must_use]
    pub fn conflicts(&self) -> &Arc<ConflictLog> {
        &self.conflicts
    }

    /// The empty-vault guard.
    #[must_use]
    pub fn guard(&self) -> &Arc<EmptyVaultGuard> {
        &self.guard
    }

    /// The network gate fed by the platform layer.
    #[must_use]
    pub fn network(&self) -> &Arc<NetworkGate> {
        &self.gate
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &SyncStore {
        &self.store
    }
}
