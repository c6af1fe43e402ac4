//! Local credential store seam and item model.

use crate::error::SyncResult;
use crate::types::{ItemId, Timestamp, VaultId};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Kind of credential item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    /// Username/password login.
    Login,
    /// Free-form secure note.
    SecureNote,
}

/// Plaintext content of an item at a point in time.
///
/// Queued operations hold their own copy so later edits to the live item
/// cannot leak into an operation that is already waiting to be sent.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemSnapshot {
    /// Display name.
    pub name: String,
    /// Login username.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Associated URIs.
    pub uris: Vec<String>,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Local modification time.
    pub updated_at: Timestamp,
}

impl ItemSnapshot {
    /// A login snapshot.
    pub fn login(
        name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            name: name.into(),
            username: Some(username.into()),
            password: Some(password.into()),
            uris: Vec::new(),
            notes: None,
            updated_at,
        }
    }

    /// Whether the snapshot carries login fields.
    #[must_use]
    pub fn has_login(&self) -> bool {
        self.username.is_some() || self.password.is_some() || !self.uris.is_empty()
    }
}

impl fmt::Debug for ItemSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemSnapshot")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("uris", &self.uris.len())
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// A credential as stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalItem {
    /// Stable local id.
    pub id: ItemId,
    /// Owning vault.
    pub vault_id: VaultId,
    /// Kind of item.
    pub item_type: ItemType,
    /// Current content.
    pub data: ItemSnapshot,
    /// Id of the remote cipher, once one exists.
    pub remote_id: Option<String>,
    /// Remote revision last seen for the bound cipher.
    pub remote_revision: Option<Timestamp>,
    /// Soft-deleted (in trash).
    pub is_deleted: bool,
}

impl LocalItem {
    /// An unbound, live item.
    pub fn new(id: ItemId, vault_id: VaultId, item_type: ItemType, data: ItemSnapshot) -> Self {
        Self {
            id,
            vault_id,
            item_type,
            data,
            remote_id: None,
            remote_revision: None,
            is_deleted: false,
        }
    }

    /// Binds the item to a remote cipher.
    #[must_use]
    pub fn bound_to(mut self, remote_id: impl Into<String>, revision: Timestamp) -> Self {
        self.remote_id = Some(remote_id.into());
        self.remote_revision = Some(revision);
        self
    }

    /// Whether a remote counterpart is known.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Clears the remote binding, keeping the content.
    pub fn unbind(&mut self) {
        self.remote_id = None;
        self.remote_revision = None;
    }
}

/// The host application's credential store.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// All items of `vault`, including soft-deleted ones.
    async fn load_items(&self, vault: VaultId) -> SyncResult<Vec<LocalItem>>;

    /// Upserts `items` by id.
    async fn save_items(&self, items: Vec<LocalItem>) -> SyncResult<()>;
}

/// In-memory [`ItemStore`].
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: RwLock<BTreeMap<ItemId, LocalItem>>,
    saves: AtomicUsize,
}

impl MemoryItemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an item.
    pub fn insert(&self, item: LocalItem) {
        self.items.write().insert(item.id.clone(), item);
    }

    /// Returns a copy of an item.
    #[must_use]
    pub fn get(&self, id: &ItemId) -> Option<LocalItem> {
        self.items.read().get(id).cloned()
    }

    /// Number of non-empty `save_items` calls.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn load_items(&self, vault: VaultId) -> SyncResult<Vec<LocalItem>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| item.vault_id == vault)
            .cloned()
            .collect())
    }

    async fn save_items(&self, items: Vec<LocalItem>) -> SyncResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.items.write();
        for item in items {
            stored.insert(item.id.clone(), item);
        }
        Ok(())
    }
}
