//! Configuration for the sync engine.
//!
//! Every knob has a default matching the shipped client. Tests usually shrink
//! the delays with the `with_*` builders.

use std::time::Duration;

/// Exponential backoff: `min(max, base × 2^(attempt−1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl BackoffConfig {
    /// Creates a backoff policy.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 is immediate.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// Trigger orchestration settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Minimum spacing between two `PAGE_ENTER` syncs of one vault.
    pub page_enter_throttle: Duration,
    /// Minimum spacing between two `APP_RESUME` syncs of one vault.
    pub app_resume_throttle: Duration,
    /// Quiet period that folds a burst of local edits into one sync.
    pub local_mutation_debounce: Duration,
    /// Backoff between whole-run retries.
    pub retry: BackoffConfig,
    /// Retries before a failing vault is surfaced to the user.
    pub max_retry_attempts: u32,
    /// Whether non-manual triggers may start a sync at all.
    pub auto_sync_enabled: bool,
    /// Refuse to sync over metered connections.
    pub wifi_only: bool,
}

impl OrchestratorConfig {
    /// Sets the `PAGE_ENTER` throttle window.
    #[must_use]
    pub fn with_page_enter_throttle(mut self, window: Duration) -> Self {
        self.page_enter_throttle = window;
        self
    }

    /// Sets the `APP_RESUME` throttle window.
    #[must_use]
    pub fn with_app_resume_throttle(mut self, window: Duration) -> Self {
        self.app_resume_throttle = window;
        self
    }

    /// Sets the local-mutation debounce delay.
    #[must_use]
    pub fn with_local_mutation_debounce(mut self, delay: Duration) -> Self {
        self.local_mutation_debounce = delay;
        self
    }

    /// Sets the retry backoff.
    #[must_use]
    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the number of automatic retries.
    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Enables or disables automatic syncing.
    #[must_use]
    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync_enabled = enabled;
        self
    }

    /// Restricts syncing to unmetered connections.
    #[must_use]
    pub fn with_wifi_only(mut self, wifi_only: bool) -> Self {
        self.wifi_only = wifi_only;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_enter_throttle: Duration::from_secs(45),
            app_resume_throttle: Duration::from_secs(60),
            local_mutation_debounce: Duration::from_secs(2),
            retry: BackoffConfig::new(Duration::from_secs(5), Duration::from_secs(15 * 60)),
            max_retry_attempts: 5,
            auto_sync_enabled: true,
            wifi_only: false,
        }
    }
}

/// Pending operation queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Operations sent per batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Per-operation backoff after a failed attempt.
    pub backoff: BackoffConfig,
    /// Failed attempts after which an operation waits for the user.
    pub max_retries: u32,
    /// Age after which terminal operations are deleted.
    pub retention: Duration,
    /// Keep completed rows until retention cleanup instead of deleting them.
    pub retain_completed: bool,
}

impl QueueConfig {
    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the pause between batches.
    #[must_use]
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Sets the per-operation backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the retention period for terminal operations.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Keeps completed rows around until [`QueueConfig::retention`] expires.
    #[must_use]
    pub fn with_retain_completed(mut self, retain: bool) -> Self {
        self.retain_completed = retain;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay: Duration::from_millis(500),
            backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(5 * 60)),
            max_retries: 5,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            retain_completed: false,
        }
    }
}

/// Conflict log settings.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Records kept; the oldest are evicted first.
    pub max_records: usize,
    /// Slack granted when a remote revision is compared with a client clock.
    pub skew_tolerance: Duration,
}

impl ConflictConfig {
    /// Sets the record cap.
    #[must_use]
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    /// Sets the clock skew tolerance.
    #[must_use]
    pub fn with_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.skew_tolerance = tolerance;
        self
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            max_records: 100,
            skew_tolerance: Duration::ZERO,
        }
    }
}

/// Empty-vault guard settings.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Fraction of linked items a pull may lose before a warning is logged.
    pub significant_loss_threshold: f64,
}

impl GuardConfig {
    /// Sets the data-loss warning threshold.
    #[must_use]
    pub fn with_significant_loss_threshold(mut self, threshold: f64) -> Self {
        self.significant_loss_threshold = threshold.clamp(0.0, 1.0);
        self
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            significant_loss_threshold: 0.5,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Sync the log to disk after every write.
    pub sync_on_write: bool,
    /// Dead log entries tolerated before a table is compacted.
    pub compact_after: u64,
}

impl StoreConfig {
    /// Sets whether each write is synced.
    #[must_use]
    pub const fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub const fn with_compact_after(mut self, dead_entries: u64) -> Self {
        self.compact_after = dead_entries;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            compact_after: 512,
        }
    }
}

/// All engine settings.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Trigger orchestration.
    pub orchestrator: OrchestratorConfig,
    /// Pending operation queue.
    pub queue: QueueConfig,
    /// Conflict log.
    pub conflicts: ConflictConfig,
    /// Empty-vault guard.
    pub guard: GuardConfig,
    /// Persistence.
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Sets the orchestrator configuration.
    #[must_use]
    pub fn with_orchestrator(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator = config;
        self
    }

    /// Sets the queue configuration.
    #[must_use]
    pub fn with_queue(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// Sets the conflict log configuration.
    #[must_use]
    pub fn with_conflicts(mut self, config: ConflictConfig) -> Self {
        self.conflicts = config;
        self
    }

    /// Sets the guard configuration.
    #[must_use]
    pub fn with_guard(mut self, config: GuardConfig) -> Self {
        self.guard = config;
        self
    }

    /// Sets the persistence configuration.
    #[must_use]
    pub fn with_store(mut self, config: StoreConfig) -> Self {
        self.store = config;
        self
    }
}
