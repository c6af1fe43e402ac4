//! Engine fixtures.
//!
//! [`TestEngine`] wires a [`SyncEngine`] to in-memory collaborators so tests
//! can script the remote side and move the clock by hand.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vaultsync_engine::{
    EngineConfig, ItemId, ItemSnapshot, ItemType, LocalItem, ManualClock, MemoryItemStore, MockRemoteVault,
    NetworkGate, NetworkState, QueueConfig, RemoteCipher, Session, StaticSessionProvider, StoreConfig,
    SymmetricKey, SyncEngine, SyncStore, Timestamp, VaultId,
};

/// Clock reading at fixture start.
pub const TEST_EPOCH: Timestamp = 1_700_000_000_000;

/// Engine settings with the queue's inter-batch pause removed.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_queue(QueueConfig::default().with_batch_delay(Duration::ZERO))
}

/// A login item of `vault`, edited at [`TEST_EPOCH`].
pub fn login_item(vault: VaultId, id: &str) -> LocalItem {
    LocalItem::new(
        ItemId::new(id),
        vault,
        ItemType::Login,
        ItemSnapshot::login(id, format!("{id}@example.com"), "hunter2", TEST_EPOCH),
    )
}

/// A remote cipher at `revision`.
pub fn remote_cipher(id: impl Into<String>, revision: Timestamp) -> RemoteCipher {
    RemoteCipher {
        id: id.into(),
        revision_date: revision,
        deleted_date: None,
    }
}

/// A temporary directory store, deleted on drop.
pub struct TestStoreDir {
    dir: TempDir,
}

impl TestStoreDir {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Opens the store. Only one open store may exist at a time.
    pub fn open(&self) -> SyncStore {
        SyncStore::open(self.dir.path(), None, StoreConfig::default()).expect("Failed to open store")
    }
}

impl Default for TestStoreDir {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`SyncEngine`] on mocks.
pub struct TestEngine {
    /// The engine.
    pub engine: SyncEngine,
    /// Scriptable remote vault.
    pub remote: Arc<MockRemoteVault>,
    /// Local items.
    pub items: Arc<MemoryItemStore>,
    /// Sessions; every vault touched through the fixture is signed in.
    pub sessions: Arc<StaticSessionProvider>,
    /// Manual clock.
    pub clock: Arc<ManualClock>,
    /// Network gate, initially on Wi-Fi.
    pub gate: Arc<NetworkGate>,
}

impl TestEngine {
    /// An in-memory engine with [`fast_config`].
    pub fn new() -> Self {
        Self::build(fast_config(), None)
    }

    /// An in-memory engine with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// An engine persisting into `store`.
    pub fn with_store(store: SyncStore) -> Self {
        Self::build(fast_config(), Some(store))
    }

    fn build(config: EngineConfig, store: Option<SyncStore>) -> Self {
        let remote = Arc::new(MockRemoteVault::new());
        let items = Arc::new(MemoryItemStore::new());
        let sessions = Arc::new(StaticSessionProvider::new());
        let clock = Arc::new(ManualClock::new(TEST_EPOCH));
        let gate = Arc::new(NetworkGate::new(NetworkState::wifi()));

        let mut builder = SyncEngine::builder(sessions.clone(), items.clone(), remote.clone())
            .with_config(config)
            .with_clock(clock.clone())
            .with_network_gate(gate.clone());
        if let Some(store) = store {
            builder = builder.with_store(store);
        }
        let engine = builder.build().expect("Failed to build engine");

        Self {
            engine,
            remote,
            items,
            sessions,
            clock,
            gate,
        }
    }

    /// Signs `vault` in with a long-lived session.
    pub fn sign_in(&self, vault: VaultId) {
        self.sessions
            .set_session(vault, Session::new("test-token", SymmetricKey::generate(), i64::MAX));
    }

    /// Creates `count` items of `vault` that are linked to remote ciphers,
    /// and signs the vault in. Returns the local items.
    pub fn seed_linked_items(&self, vault: VaultId, count: usize) -> Vec<LocalItem> {
        self.sign_in(vault);
        (0..count)
            .map(|n| {
                let remote_id = format!("seed-{}-{n}", vault.0);
                let revision = TEST_EPOCH - 60_000;
                self.remote.put_cipher(vault, remote_cipher(remote_id.clone(), revision));
                let item = login_item(vault, &format!("item-{}-{n}", vault.0)).bound_to(remote_id, revision);
                self.items.insert(item.clone());
                item
            })
            .collect()
    }

    /// Local items of `vault` that are linked to a remote cipher.
    pub async fn linked_count(&self, vault: VaultId) -> usize {
        use vaultsync_engine::ItemStore;
        self.items
            .load_items(vault)
            .await
            .expect("Failed to load items")
            .iter()
            .filter(|item| item.is_bound())
            .count()
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `test` against a fresh [`TestEngine`].
pub async fn with_test_engine<F, Fut>(test: F)
where
    F: FnOnce(TestEngine) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    test(TestEngine::new()).await;
}
