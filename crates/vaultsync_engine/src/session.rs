//! Session provider seam.
//!
//! The engine never authenticates on its own. It asks the host application
//! for a bearer token and the vault's symmetric keys right before talking to
//! the remote service.

use crate::cipher::SymmetricKey;
use crate::error::SyncResult;
use crate::types::{duration_millis, Timestamp, VaultId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Sessions expiring within this window are refreshed before use.
pub const REFRESH_LEEWAY: Duration = Duration::from_secs(5 * 60);

/// Credentials for one vault.
#[derive(Clone)]
pub struct Session {
    /// Bearer token for the remote service.
    pub access_token: String,
    /// Key pair that encrypts outgoing fields.
    pub keys: SymmetricKey,
    /// Token expiry.
    pub expires_at: Timestamp,
}

impl Session {
    /// Creates a session.
    pub fn new(access_token: impl Into<String>, keys: SymmetricKey, expires_at: Timestamp) -> Self {
        Self {
            access_token: access_token.into(),
            keys,
            expires_at,
        }
    }

    /// Whether the token expires within `leeway` of `now`.
    #[must_use]
    pub fn expires_within(&self, now: Timestamp, leeway: Duration) -> bool {
        self.expires_at.saturating_sub(now) <= duration_millis(leeway)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Supplies sessions for vaults.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The stored session for `vault`, if the user is signed in.
    async fn get_session(&self, vault: VaultId) -> SyncResult<Option<Session>>;

    /// Exchanges `session` for a fresh one. `None` means re-authentication is
    /// required.
    async fn refresh(&self, vault: VaultId, session: &Session) -> SyncResult<Option<Session>>;

    /// Whether the vault's key material is available. Checked before a run
    /// is started, so it must be cheap.
    fn is_unlocked(&self, vault: VaultId) -> bool;

    /// Returns a session valid for at least [`REFRESH_LEEWAY`], refreshing if
    /// needed.
    async fn get_or_refresh_session(
        &self,
        vault: VaultId,
        now: Timestamp,
    ) -> SyncResult<Option<Session>> {
        let Some(session) = self.get_session(vault).await? else {
            return Ok(None);
        };
        if !session.expires_within(now, REFRESH_LEEWAY) {
            return Ok(Some(session));
        }
        self.refresh(vault, &session).await
    }
}

/// In-memory [`SessionProvider`] for tests and tools.
#[derive(Debug, Default)]
pub struct StaticSessionProvider {
    sessions: Mutex<HashMap<VaultId, Session>>,
    locked: Mutex<HashSet<VaultId>>,
    refresh_lifetime: Mutex<Option<Duration>>,
    refreshes: AtomicUsize,
}

impl StaticSessionProvider {
    /// Creates a provider with no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a session for `vault`.
    pub fn set_session(&self, vault: VaultId, session: Session) {
        self.sessions.lock().insert(vault, session);
    }

    /// Signs `vault` out.
    pub fn remove_session(&self, vault: VaultId) {
        self.sessions.lock().remove(&vault);
    }

    /// Locks or unlocks the vault's keys.
    pub fn set_locked(&self, vault: VaultId, locked: bool) {
        let mut set = self.locked.lock();
        if locked {
            set.insert(vault);
        } else {
            set.remove(&vault);
        }
    }

    /// Makes `refresh` succeed with a token valid for `lifetime` past the old
    /// expiry. By default refresh fails.
    pub fn refresh_with_lifetime(&self, lifetime: Duration) {
        *self.refresh_lifetime.lock() = Some(lifetime);
    }

    /// Number of refresh calls seen.
    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn get_session(&self, vault: VaultId) -> SyncResult<Option<Session>> {
        Ok(self.sessions.lock().get(&vault).cloned())
    }

    async fn refresh(&self, vault: VaultId, session: &Session) -> SyncResult<Option<Session>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let Some(lifetime) = *self.refresh_lifetime.lock() else {
            return Ok(None);
        };
        let mut fresh = session.clone();
        fresh.access_token = format!("{}+", session.access_token);
        fresh.expires_at = session.expires_at.saturating_add(duration_millis(lifetime));
        self.sessions.lock().insert(vault, fresh.clone());
        Ok(Some(fresh))
    }

    fn is_unlocked(&self, vault: VaultId) -> bool {
        !self.locked.lock().contains(&vault)
    }
}
