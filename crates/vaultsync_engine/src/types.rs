//! Identifiers, trigger/block reasons and the engine clock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Identifier of a vault (one remote account).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultId(pub u64);

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vault:{}", self.0)
    }
}

/// Stable local identifier of a credential item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub String);

impl ItemId {
    /// Creates an item id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a queued operation. Survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Generates a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What caused a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerReason {
    /// A vault screen was opened.
    PageEnter,
    /// An item was created, edited or deleted locally.
    LocalMutation,
    /// The application returned to the foreground.
    AppResume,
    /// The user asked for a sync.
    Manual,
    /// Background timer.
    Periodic,
    /// A scheduled retry of a failed run.
    Retry,
}

impl TriggerReason {
    /// Rank in the merge order; the higher reason wins.
    ///
    /// `MANUAL > LOCAL_MUTATION > RETRY > APP_RESUME > PAGE_ENTER > PERIODIC`
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            TriggerReason::Manual => 6,
            TriggerReason::LocalMutation => 5,
            TriggerReason::Retry => 4,
            TriggerReason::AppResume => 3,
            TriggerReason::PageEnter => 2,
            TriggerReason::Periodic => 1,
        }
    }

    /// Merges a newly arrived reason into a waiting one. Ties go to `incoming`.
    #[must_use]
    pub fn merge(current: Option<Self>, incoming: Self) -> Self {
        match current {
            Some(current) if current.priority() > incoming.priority() => current,
            _ => incoming,
        }
    }

    /// Whether repeated requests for this reason are throttled.
    #[must_use]
    pub const fn is_throttled(self) -> bool {
        matches!(self, TriggerReason::PageEnter | TriggerReason::AppResume)
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerReason::PageEnter => "PAGE_ENTER",
            TriggerReason::LocalMutation => "LOCAL_MUTATION",
            TriggerReason::AppResume => "APP_RESUME",
            TriggerReason::Manual => "MANUAL",
            TriggerReason::Periodic => "PERIODIC",
            TriggerReason::Retry => "RETRY",
        };
        f.write_str(name)
    }
}

/// Why a sync did not start or did not apply its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    /// Automatic syncing is switched off.
    AutoSyncDisabled,
    /// No connectivity.
    NetworkUnavailable,
    /// Only a metered connection is available and Wi-Fi is required.
    WifiRequired,
    /// The vault's key material is not unlocked.
    VaultLocked,
    /// No valid session could be obtained.
    AuthRequired,
    /// The remote returned an empty vault against populated local data.
    EmptyVaultProtection,
}

impl BlockReason {
    /// Whether the block lifts by itself once connectivity returns.
    #[must_use]
    pub const fn is_connectivity(self) -> bool {
        matches!(
            self,
            BlockReason::NetworkUnavailable | BlockReason::WifiRequired
        )
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BlockReason::AutoSyncDisabled => "automatic sync is disabled",
            BlockReason::NetworkUnavailable => "network unavailable",
            BlockReason::WifiRequired => "waiting for Wi-Fi",
            BlockReason::VaultLocked => "vault is locked",
            BlockReason::AuthRequired => "sign-in required",
            BlockReason::EmptyVaultProtection => "remote vault is empty; confirmation required",
        };
        f.write_str(text)
    }
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> Timestamp;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    /// Sets the clock.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Converts a duration to whole milliseconds, saturating.
#[must_use]
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
