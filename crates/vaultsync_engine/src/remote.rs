//! Remote vault service seam.
//!
//! The HTTP protocol itself belongs to the host application. The engine
//! only needs the cipher upsert/delete/restore/purge calls and the bulk pull,
//! expressed by [`RemoteVault`].

use crate::cipher::EncString;
use crate::error::{SyncError, SyncResult};
use crate::item::{ItemSnapshot, ItemType};
use crate::session::Session;
use crate::types::{Timestamp, VaultId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// A cipher as returned by the bulk pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCipher {
    /// Remote id.
    pub id: String,
    /// Last modification on the server.
    pub revision_date: Timestamp,
    /// Set while the cipher is in the remote trash.
    pub deleted_date: Option<Timestamp>,
}

/// Encrypted body of a cipher create/update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CipherRequest {
    /// Remote cipher type: 1 login, 2 secure note.
    #[serde(rename = "Type")]
    pub cipher_type: u8,
    /// Encrypted name.
    pub name: EncString,
    /// Encrypted login fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginRequest>,
    /// Encrypted notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<EncString>,
}

/// Encrypted login fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoginRequest {
    /// Encrypted username.
    pub username: Option<EncString>,
    /// Encrypted password.
    pub password: Option<EncString>,
    /// Encrypted URIs.
    pub uris: Vec<UriRequest>,
}

/// One encrypted URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UriRequest {
    /// Encrypted URI.
    pub uri: EncString,
}

impl CipherRequest {
    /// Encrypts every field of `snapshot` under the session keys.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Crypto`] if encryption fails.
    pub fn encrypt(item_type: ItemType, snapshot: &ItemSnapshot, session: &Session) -> SyncResult<Self> {
        let key = &session.keys;
        let seal = |value: &Option<String>| -> SyncResult<Option<EncString>> {
            value
                .as_deref()
                .map(|text| EncString::encrypt_str(text, key))
                .transpose()
        };

        let login = match item_type {
            ItemType::Login => Some(LoginRequest {
                username: seal(&snapshot.username)?,
                password: seal(&snapshot.password)?,
                uris: snapshot
                    .uris
                    .iter()
                    .map(|uri| {
                        Ok(UriRequest {
                            uri: EncString::encrypt_str(uri, key)?,
                        })
                    })
                    .collect::<SyncResult<_>>()?,
            }),
            ItemType::SecureNote => None,
        };

        Ok(Self {
            cipher_type: match item_type {
                ItemType::Login => 1,
                ItemType::SecureNote => 2,
            },
            name: EncString::encrypt_str(&snapshot.name, key)?,
            login,
            notes: seal(&snapshot.notes)?,
        })
    }
}

/// Calls into the remote vault service.
///
/// Implementations report failures with the [`SyncError`] variant that best
/// explains them; a missing cipher is [`SyncError::RemoteNotFound`].
#[async_trait]
pub trait RemoteVault: Send + Sync {
    /// Creates a cipher and returns it.
    async fn create_cipher(
        &self,
        vault: VaultId,
        session: &Session,
        request: &CipherRequest,
    ) -> SyncResult<RemoteCipher>;

    /// Replaces the content of a cipher.
    async fn update_cipher(
        &self,
        vault: VaultId,
        session: &Session,
        remote_id: &str,
        request: &CipherRequest,
    ) -> SyncResult<RemoteCipher>;

    /// Moves a cipher to the remote trash.
    async fn soft_delete_cipher(&self, vault: VaultId, session: &Session, remote_id: &str) -> SyncResult<()>;

    /// Takes a cipher out of the remote trash.
    async fn restore_cipher(
        &self,
        vault: VaultId,
        session: &Session,
        remote_id: &str,
    ) -> SyncResult<RemoteCipher>;

    /// Deletes a cipher permanently.
    async fn purge_cipher(&self, vault: VaultId, session: &Session, remote_id: &str) -> SyncResult<()>;

    /// Lists every cipher of the vault, trashed ones included.
    async fn pull(&self, vault: VaultId, session: &Session) -> SyncResult<Vec<RemoteCipher>>;
}

/// Remote call kinds, for failure injection and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    /// `create_cipher`
    Create,
    /// `update_cipher`
    Update,
    /// `soft_delete_cipher`
    SoftDelete,
    /// `restore_cipher`
    Restore,
    /// `purge_cipher`
    Purge,
    /// `pull`
    Pull,
}

#[derive(Default)]
struct MockState {
    ciphers: BTreeMap<VaultId, BTreeMap<String, RemoteCipher>>,
    requests: BTreeMap<String, CipherRequest>,
    failures: VecDeque<(RemoteCall, SyncError)>,
    offline: bool,
    calls: Vec<(RemoteCall, VaultId)>,
    next_id: u64,
    revision: Timestamp,
    pull_delay: Option<Duration>,
}

/// In-memory [`RemoteVault`] with failure injection.
///
/// Revisions come from an internal counter that advances by one second per
/// write, starting at `1_000_000`.
#[derive(Default)]
pub struct MockRemoteVault {
    state: Mutex<MockState>,
}

impl MockRemoteVault {
    /// Creates an empty remote.
    #[must_use]
    pub fn new() -> Self {
        let remote = Self::default();
        remote.state.lock().revision = 1_000_000;
        remote
    }

    /// Makes the next call of `kind` fail with `error`.
    pub fn fail_next(&self, kind: RemoteCall, error: SyncError) {
        self.state.lock().failures.push_back((kind, error));
    }

    /// Makes every call fail with a network error until reset.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Delays every pull, keeping a run in flight.
    pub fn set_pull_delay(&self, delay: Option<Duration>) {
        self.state.lock().pull_delay = delay;
    }

    /// Inserts or replaces a cipher.
    pub fn put_cipher(&self, vault: VaultId, cipher: RemoteCipher) {
        self.state
            .lock()
            .ciphers
            .entry(vault)
            .or_default()
            .insert(cipher.id.clone(), cipher);
    }

    /// Removes every cipher of a vault, as an outage or account mixup would.
    pub fn clear_vault(&self, vault: VaultId) {
        self.state.lock().ciphers.remove(&vault);
    }

    /// Current ciphers of a vault.
    #[must_use]
    pub fn ciphers(&self, vault: VaultId) -> Vec<RemoteCipher> {
        self.state
            .lock()
            .ciphers
            .get(&vault)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Last request body stored for a cipher.
    #[must_use]
    pub fn last_request(&self, remote_id: &str) -> Option<CipherRequest> {
        self.state.lock().requests.get(remote_id).cloned()
    }

    /// Number of calls of `kind` so far.
    #[must_use]
    pub fn call_count(&self, kind: RemoteCall) -> usize {
        self.state.lock().calls.iter().filter(|(k, _)| *k == kind).count()
    }

    fn begin(&self, kind: RemoteCall, vault: VaultId) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.calls.push((kind, vault));
        if state.offline {
            return Err(SyncError::Network("connection refused".into()));
        }
        if let Some(pos) = state.failures.iter().position(|(k, _)| *k == kind) {
            if let Some((_, error)) = state.failures.remove(pos) {
                return Err(error);
            }
        }
        Ok(())
    }

    fn with_cipher(
        &self,
        vault: VaultId,
        remote_id: &str,
        apply: impl FnOnce(&mut RemoteCipher, Timestamp),
    ) -> SyncResult<RemoteCipher> {
        let mut state = self.state.lock();
        state.revision += 1_000;
        let revision = state.revision;
        let cipher = state
            .ciphers
            .get_mut(&vault)
            .and_then(|m| m.get_mut(remote_id))
            .ok_or_else(|| SyncError::RemoteNotFound(remote_id.to_string()))?;
        apply(cipher, revision);
        cipher.revision_date = revision;
        Ok(cipher.clone())
    }
}

#[async_trait]
impl RemoteVault for MockRemoteVault {
    async fn create_cipher(
        &self,
        vault: VaultId,
        _session: &Session,
        request: &CipherRequest,
    ) -> SyncResult<RemoteCipher> {
        self.begin(RemoteCall::Create, vault)?;
        let mut state = self.state.lock();
        state.next_id += 1;
        state.revision += 1_000;
        let cipher = RemoteCipher {
            id: format!("cipher-{}", state.next_id),
            revision_date: state.revision,
            deleted_date: None,
        };
        state.requests.insert(cipher.id.clone(), request.clone());
        state
            .ciphers
            .entry(vault)
            .or_default()
            .insert(cipher.id.clone(), cipher.clone());
        Ok(cipher)
    }

    async fn update_cipher(
        &self,
        vault: VaultId,
        _session: &Session,
        remote_id: &str,
        request: &CipherRequest,
    ) -> SyncResult<RemoteCipher> {
        self.begin(RemoteCall::Update, vault)?;
        let cipher = self.with_cipher(vault, remote_id, |_, _| {})?;
        self.state
            .lock()
            .requests
            .insert(remote_id.to_string(), request.clone());
        Ok(cipher)
    }

    async fn soft_delete_cipher(&self, vault: VaultId, _session: &Session, remote_id: &str) -> SyncResult<()> {
        self.begin(RemoteCall::SoftDelete, vault)?;
        self.with_cipher(vault, remote_id, |cipher, now| cipher.deleted_date = Some(now))?;
        Ok(())
    }

    async fn restore_cipher(
        &self,
        vault: VaultId,
        _session: &Session,
        remote_id: &str,
    ) -> SyncResult<RemoteCipher> {
        self.begin(RemoteCall::Restore, vault)?;
        self.with_cipher(vault, remote_id, |cipher, _| cipher.deleted_date = None)
    }

    async fn purge_cipher(&self, vault: VaultId, _session: &Session, remote_id: &str) -> SyncResult<()> {
        self.begin(RemoteCall::Purge, vault)?;
        let mut state = self.state.lock();
        state
            .ciphers
            .get_mut(&vault)
            .and_then(|m| m.remove(remote_id))
            .map(|_| ())
            .ok_or_else(|| SyncError::RemoteNotFound(remote_id.to_string()))
    }

    async fn pull(&self, vault: VaultId, _session: &Session) -> SyncResult<Vec<RemoteCipher>> {
        self.begin(RemoteCall::Pull, vault)?;
        let delay = self.state.lock().pull_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.ciphers(vault))
    }
}
