//! Trigger orchestrator: decides when a vault syncs.
//!
//! Every trigger funnels into [`SyncOrchestrator::request_sync`]. Requests
//! are evaluated under the vault's lock; the run itself happens outside it,
//! so reasons arriving mid-run are merged and replayed instead of waiting.
//!
//! ## Invariants
//!
//! - At most one run per vault is in flight
//! - A reason that arrives while a run is in flight is never lost: the
//!   highest-priority one is replayed when the run finishes
//! - Arming a debounce or retry timer replaces the previous one
//! - Vaults are fully independent

use crate::config::OrchestratorConfig;
use crate::error::SyncResult;
use crate::executor::{SyncExecution, SyncOutcome};
use crate::guard::EmptyVaultGuard;
use crate::network::NetworkGate;
use crate::status::{StatusBoard, SyncStatus, VaultPhase, VaultStatusWatcher};
use crate::types::{duration_millis, BlockReason, Clock, Timestamp, TriggerReason, VaultId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What happened to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDisposition {
    /// A debounce timer was (re)armed.
    Debounced,
    /// A run is in flight; the reason will be replayed after it.
    Merged,
    /// Inside the throttle window of its reason.
    Throttled,
    /// Refused before running.
    Blocked(BlockReason),
    /// A run was executed.
    Ran(SyncOutcome),
}

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    fn cancel(self) {
        self.handle.abort();
    }
}

#[derive(Default)]
struct VaultRuntime {
    is_running: bool,
    pending_reason: Option<TriggerReason>,
    retry_attempt: u32,
    last_page_enter_at: Option<Timestamp>,
    last_app_resume_at: Option<Timestamp>,
    debounce: Option<Timer>,
    retry: Option<Timer>,
}

impl VaultRuntime {
    /// Records a throttled trigger; false if it falls inside its window.
    fn pass_throttle(&mut self, reason: TriggerReason, now: Timestamp, config: &OrchestratorConfig) -> bool {
        let (last, window) = match reason {
            TriggerReason::PageEnter => (&mut self.last_page_enter_at, config.page_enter_throttle),
            TriggerReason::AppResume => (&mut self.last_app_resume_at, config.app_resume_throttle),
            _ => return true,
        };
        if let Some(at) = *last {
            if now.saturating_sub(at) < duration_millis(window) {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.cancel();
        }
        if let Some(timer) = self.retry.take() {
            timer.cancel();
        }
    }
}

#[derive(Clone, Copy)]
enum TimerSlot {
    Debounce,
    Retry,
}

struct Inner {
    config: OrchestratorConfig,
    auto_sync: AtomicBool,
    executor: Arc<dyn SyncExecution>,
    gate: Arc<NetworkGate>,
    guard: Arc<EmptyVaultGuard>,
    clock: Arc<dyn Clock>,
    runtimes: Mutex<HashMap<VaultId, Arc<AsyncMutex<VaultRuntime>>>>,
    status: StatusBoard,
    next_timer: AtomicU64,
}

type BoxedRequest = Pin<Box<dyn Future<Output = RequestDisposition> + Send>>;

impl Inner {
    fn runtime(&self, vault: VaultId) -> Arc<AsyncMutex<VaultRuntime>> {
        self.runtimes.lock().entry(vault).or_default().clone()
    }

    fn request_boxed(self: Arc<Self>, vault: VaultId, reason: TriggerReason, force: bool) -> BoxedRequest {
        Box::pin(async move { self.request(vault, reason, force).await })
    }

    /// Handles the request on its own task so that a run, once started,
    /// settles and replays even if the caller stops waiting.
    async fn request(self: &Arc<Self>, vault: VaultId, reason: TriggerReason, force: bool) -> RequestDisposition {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.drive(vault, reason, force).await });
        match task.await {
            Ok(disposition) => disposition,
            Err(error) => {
                warn!(%vault, %reason, %error, "sync request task failed");
                RequestDisposition::Ran(SyncOutcome::FatalError {
                    message: error.to_string(),
                })
            }
        }
    }

    async fn drive(self: &Arc<Self>, vault: VaultId, reason: TriggerReason, force: bool) -> RequestDisposition {
        let (disposition, mut replay) = self.process(vault, reason, force).await;
        while let Some(next) = replay {
            debug!(%vault, reason = %next, "replaying merged trigger");
            replay = self.process(vault, next, true).await.1;
        }
        disposition
    }

    async fn process(
        self: &Arc<Self>,
        vault: VaultId,
        reason: TriggerReason,
        force: bool,
    ) -> (RequestDisposition, Option<TriggerReason>) {
        let runtime = self.runtime(vault);
        let now = self.clock.now_millis();

        {
            let mut rt = runtime.lock().await;

            if reason == TriggerReason::LocalMutation && !force {
                let delay = self.config.local_mutation_debounce;
                self.arm_timer(&mut rt, vault, TimerSlot::Debounce, delay, TriggerReason::LocalMutation);
                let running = rt.is_running;
                self.status.update(vault, |s| {
                    s.queued_reason = Some(reason);
                    s.blocked_reason = None;
                    if !running {
                        s.phase = VaultPhase::Queued(reason);
                    }
                });
                return (RequestDisposition::Debounced, None);
            }

            if rt.is_running {
                let merged = TriggerReason::merge(rt.pending_reason, reason);
                rt.pending_reason = Some(merged);
                self.status.update(vault, |s| s.queued_reason = Some(merged));
                debug!(%vault, %reason, %merged, "run in flight, trigger merged");
                return (RequestDisposition::Merged, None);
            }

            if !force && reason.is_throttled() && !rt.pass_throttle(reason, now, &self.config) {
                debug!(%vault, %reason, "trigger throttled");
                return (RequestDisposition::Throttled, None);
            }

            let blocked = if reason != TriggerReason::Manual && !self.auto_sync.load(Ordering::Relaxed) {
                Some(BlockReason::AutoSyncDisabled)
            } else if let Err(block) = self.gate.permit() {
                Some(block)
            } else if !self.executor.is_unlocked(vault) {
                Some(BlockReason::VaultLocked)
            } else {
                None
            };
            if let Some(block) = blocked {
                let queued = rt.pending_reason;
                self.status.update(vault, |s| {
                    s.phase = VaultPhase::Blocked(block);
                    s.is_running = false;
                    s.blocked_reason = Some(block);
                    s.last_error = Some(block.to_string());
                    s.queued_reason = queued;
                });
                debug!(%vault, %reason, %block, "sync blocked");
                return (RequestDisposition::Blocked(block), None);
            }

            if matches!(reason, TriggerReason::Manual | TriggerReason::LocalMutation)
                && rt.retry_attempt >= self.config.max_retry_attempts
            {
                info!(%vault, %reason, "restarting retry cycle");
                rt.retry_attempt = 0;
            }
            if let Some(timer) = rt.retry.take() {
                timer.cancel();
            }
            rt.is_running = true;
            self.status.update(vault, |s| {
                s.phase = VaultPhase::Running;
                s.is_running = true;
                s.queued_reason = None;
                s.last_trigger_reason = Some(reason);
                s.blocked_reason = None;
                s.next_retry_at = None;
            });
        }

        info!(%vault, %reason, "sync starting");
        let outcome = self
            .executor
            .run_sync(vault, reason, reason != TriggerReason::Manual)
            .await;

        let mut rt = runtime.lock().await;
        rt.is_running = false;
        self.settle(vault, &mut rt, &outcome);
        let counters = self.executor.counters(vault);
        let replay = rt.pending_reason.take();
        self.status.update(vault, |s| {
            s.pending_count = counters.pending;
            s.failed_count = counters.failed;
            s.conflict_count = counters.conflicts;
            s.queued_reason = replay;
        });
        (RequestDisposition::Ran(outcome), replay)
    }

    /// Moves the vault out of `Running` according to the run's outcome.
    fn settle(self: &Arc<Self>, vault: VaultId, rt: &mut VaultRuntime, outcome: &SyncOutcome) {
        let now = self.clock.now_millis();
        match outcome {
            SyncOutcome::Success { .. } => {
                rt.retry_attempt = 0;
                self.status.update(vault, |s| {
                    s.phase = VaultPhase::Idle;
                    s.is_running = false;
                    s.blocked_reason = None;
                    s.last_error = None;
                    s.last_success_at = Some(now);
                    s.retry_attempt = 0;
                    s.next_retry_at = None;
                });
            }
            SyncOutcome::Blocked { reason, message } => {
                let message = message.clone().unwrap_or_else(|| reason.to_string());
                self.status.update(vault, |s| {
                    s.phase = VaultPhase::Blocked(*reason);
                    s.is_running = false;
                    s.blocked_reason = Some(*reason);
                    s.last_error = Some(message);
                });
            }
            SyncOutcome::RetryableError { message } => {
                if rt.retry_attempt < self.config.max_retry_attempts {
                    rt.retry_attempt += 1;
                    let delay = self.config.retry.delay_for_attempt(rt.retry_attempt);
                    let at = now.saturating_add(duration_millis(delay));
                    self.arm_timer(rt, vault, TimerSlot::Retry, delay, TriggerReason::Retry);
                    let attempt = rt.retry_attempt;
                    debug!(%vault, attempt, delay_ms = duration_millis(delay), "retry scheduled");
                    self.status.update(vault, |s| {
                        s.phase = VaultPhase::RetryScheduled { at };
                        s.is_running = false;
                        s.last_error = Some(message.clone());
                        s.next_retry_at = Some(at);
                        s.retry_attempt = attempt;
                    });
                } else {
                    warn!(%vault, attempts = rt.retry_attempt, %message, "retries exhausted");
                    let attempt = rt.retry_attempt;
                    self.status.update(vault, |s| {
                        s.phase = VaultPhase::Failed;
                        s.is_running = false;
                        s.last_error = Some(message.clone());
                        s.next_retry_at = None;
                        s.retry_attempt = attempt;
                    });
                }
            }
            SyncOutcome::FatalError { message } => {
                rt.retry_attempt = 0;
                self.status.update(vault, |s| {
                    s.phase = VaultPhase::Failed;
                    s.is_running = false;
                    s.blocked_reason = None;
                    s.last_error = Some(message.clone());
                    s.retry_attempt = 0;
                    s.next_retry_at = None;
                });
            }
        }
    }

    /// Arms a timer that re-requests `reason` (forced) after `delay`,
    /// replacing the slot's previous timer.
    fn arm_timer(
        self: &Arc<Self>,
        rt: &mut VaultRuntime,
        vault: VaultId,
        slot: TimerSlot,
        delay: Duration,
        reason: TriggerReason,
    ) {
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                // Detach from the slot so a later request cannot abort this
                // task while it is running the sync.
                let runtime = inner.runtime(vault);
                let mut rt = runtime.lock().await;
                let timer = match slot {
                    TimerSlot::Debounce => &mut rt.debounce,
                    TimerSlot::Retry => &mut rt.retry,
                };
                if timer.as_ref().map(|t| t.id) == Some(id) {
                    *timer = None;
                }
            }
            inner.request_boxed(vault, reason, true).await;
        });

        let timer = Timer { id, handle };
        let previous = match slot {
            TimerSlot::Debounce => rt.debounce.replace(timer),
            TimerSlot::Retry => rt.retry.replace(timer),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

/// Per-vault sync scheduling on top of a [`SyncExecution`].
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<dyn SyncExecution>,
        gate: Arc<NetworkGate>,
        guard: Arc<EmptyVaultGuard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        gate.set_wifi_only(config.wifi_only);
        Self {
            inner: Arc::new(Inner {
                auto_sync: AtomicBool::new(config.auto_sync_enabled),
                config,
                executor,
                gate,
                guard,
                clock,
                runtimes: Mutex::new(HashMap::new()),
                status: StatusBoard::new(),
                next_timer: AtomicU64::new(0),
            }),
        }
    }

    /// Submits a trigger for `vault`.
    ///
    /// A non-forced `LOCAL_MUTATION` only arms the debounce timer; `force`
    /// also bypasses the throttle windows. Returns once the request, and any
    /// trigger merged into it while it ran, has been handled.
    pub async fn request_sync(&self, vault: VaultId, reason: TriggerReason, force: bool) -> RequestDisposition {
        self.inner.request(vault, reason, force).await
    }

    /// Runs a user-initiated sync.
    pub async fn request_manual_sync(&self, vault: VaultId) -> RequestDisposition {
        self.request_sync(vault, TriggerReason::Manual, false).await
    }

    /// Records the user's consent to apply an empty remote vault and syncs.
    ///
    /// # Errors
    ///
    /// Returns an error if the confirmation cannot be stored.
    pub async fn confirm_clear_local_data(&self, vault: VaultId) -> SyncResult<RequestDisposition> {
        self.inner.guard.confirm_clear_local_data(vault)?;
        Ok(self.request_manual_sync(vault).await)
    }

    /// Declines applying an empty remote vault.
    ///
    /// # Errors
    ///
    /// Returns an error if the decision cannot be stored.
    pub fn cancel_sync(&self, vault: VaultId) -> SyncResult<()> {
        self.inner.guard.cancel_sync(vault)?;
        self.inner.status.update(vault, |s| {
            if s.blocked_reason == Some(BlockReason::EmptyVaultProtection) {
                s.phase = VaultPhase::Idle;
                s.blocked_reason = None;
            }
        });
        Ok(())
    }

    /// Forgets a vault: cancels its timers and drops its status.
    pub async fn clear_vault(&self, vault: VaultId) {
        let runtime = self.inner.runtimes.lock().remove(&vault);
        if let Some(runtime) = runtime {
            runtime.lock().await.cancel_timers();
        }
        self.inner.status.remove(vault);
    }

    /// Switches automatic syncing on or off.
    pub fn set_auto_sync_enabled(&self, enabled: bool) {
        self.inner.auto_sync.store(enabled, Ordering::Relaxed);
    }

    /// Whether automatic syncing is on.
    #[must_use]
    pub fn is_auto_sync_enabled(&self) -> bool {
        self.inner.auto_sync.load(Ordering::Relaxed)
    }

    /// Refuses or allows metered connections.
    pub fn set_wifi_only(&self, wifi_only: bool) {
        self.inner.gate.set_wifi_only(wifi_only);
    }

    /// Status of one vault.
    #[must_use]
    pub fn status(&self, vault: VaultId) -> Option<SyncStatus> {
        self.inner.status.get(vault)
    }

    /// Status of every vault.
    #[must_use]
    pub fn statuses(&self) -> HashMap<VaultId, SyncStatus> {
        self.inner.status.snapshot()
    }

    /// Subscribes to every vault's status.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HashMap<VaultId, SyncStatus>> {
        self.inner.status.subscribe()
    }

    /// Subscribes to one vault's status.
    #[must_use]
    pub fn watch_vault(&self, vault: VaultId) -> VaultStatusWatcher {
        self.inner.status.watch_vault(vault)
    }

    /// Re-requests vaults blocked on connectivity whenever the gate opens.
    ///
    /// The task ends when the orchestrator or the gate is dropped.
    pub fn spawn_network_watch(&self) -> JoinHandle<()> {
        let mut rx = self.inner.gate.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.gate.permit().is_err() {
                    continue;
                }
                let waiting: Vec<VaultId> = inner
                    .status
                    .snapshot()
                    .into_iter()
                    .filter(|(_, s)| s.blocked_reason.is_some_and(BlockReason::is_connectivity))
                    .map(|(vault, _)| vault)
                    .collect();
                for vault in waiting {
                    info!(%vault, "network available, resuming sync");
                    inner.clone().request_boxed(vault, TriggerReason::Retry, false).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, GuardConfig};
    use crate::executor::SyncCounters;
    use crate::network::NetworkState;
    use crate::store::SyncStore;
    use crate::types::ManualClock;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    const VAULT: VaultId = VaultId(1);

    /// Scripted execution unit.
    #[derive(Default)]
    struct FakeExecution {
        outcomes: parking_lot::Mutex<VecDeque<SyncOutcome>>,
        runs: parking_lot::Mutex<Vec<TriggerReason>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        locked: AtomicBool,
        run_time: parking_lot::Mutex<Duration>,
    }

    impl FakeExecution {
        fn push(&self, outcome: SyncOutcome) {
            self.outcomes.lock().push_back(outcome);
        }

        fn runs(&self) -> Vec<TriggerReason> {
            self.runs.lock().clone()
        }
    }

    #[async_trait]
    impl SyncExecution for FakeExecution {
        async fn run_sync(&self, _vault: VaultId, trigger: TriggerReason, _silent: bool) -> SyncOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.runs.lock().push(trigger);
            let run_time = *self.run_time.lock();
            if !run_time.is_zero() {
                tokio::time::sleep(run_time).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.outcomes.lock().pop_front().unwrap_or(SyncOutcome::Success {
                synced_count: 0,
                conflict_count: 0,
            })
        }

        fn is_unlocked(&self, _vault: VaultId) -> bool {
            !self.locked.load(Ordering::SeqCst)
        }

        fn counters(&self, _vault: VaultId) -> SyncCounters {
            SyncCounters::default()
        }
    }

    fn setup(config: OrchestratorConfig) -> (SyncOrchestrator, Arc<FakeExecution>, Arc<NetworkGate>, Arc<ManualClock>) {
        let exec = Arc::new(FakeExecution::default());
        let gate = Arc::new(NetworkGate::new(NetworkState::wifi()));
        let guard = Arc::new(EmptyVaultGuard::open(&SyncStore::in_memory(), GuardConfig::default()).unwrap());
        let clock = Arc::new(ManualClock::new(10_000_000));
        let orchestrator = SyncOrchestrator::new(config, exec.clone(), gate.clone(), guard, clock.clone());
        (orchestrator, exec, gate, clock)
    }

    fn retryable() -> SyncOutcome {
        SyncOutcome::RetryableError {
            message: "timeout".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn page_enter_is_throttled() {
        let (orch, exec, _, clock) = setup(OrchestratorConfig::default());
        assert!(matches!(
            orch.request_sync(VAULT, TriggerReason::PageEnter, false).await,
            RequestDisposition::Ran(_)
        ));
        assert_eq!(
            orch.request_sync(VAULT, TriggerReason::PageEnter, false).await,
            RequestDisposition::Throttled
        );
        assert_eq!(exec.runs().len(), 1);

        clock.advance(Duration::from_secs(46));
        orch.request_sync(VAULT, TriggerReason::PageEnter, false).await;
        assert_eq!(exec.runs().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn local_mutations_are_debounced() {
        let (orch, exec, _, _) = setup(OrchestratorConfig::default());
        for _ in 0..5 {
            assert_eq!(
                orch.request_sync(VAULT, TriggerReason::LocalMutation, false).await,
                RequestDisposition::Debounced
            );
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(exec.runs().is_empty());
        assert_eq!(orch.status(VAULT).unwrap().phase, VaultPhase::Queued(TriggerReason::LocalMutation));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(exec.runs(), vec![TriggerReason::LocalMutation]);
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_during_a_run_are_merged_and_replayed() {
        let (orch, exec, _, _) = setup(OrchestratorConfig::default());
        *exec.run_time.lock() = Duration::from_secs(1);

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.request_sync(VAULT, TriggerReason::PageEnter, false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(orch.status(VAULT).unwrap().is_running);

        assert_eq!(
            orch.request_sync(VAULT, TriggerReason::Periodic, false).await,
            RequestDisposition::Merged
        );
        assert_eq!(
            orch.request_sync(VAULT, TriggerReason::Manual, false).await,
            RequestDisposition::Merged
        );
        assert_eq!(
            orch.request_sync(VAULT, TriggerReason::AppResume, false).await,
            RequestDisposition::Merged
        );
        assert_eq!(orch.status(VAULT).unwrap().queued_reason, Some(TriggerReason::Manual));

        first.await.unwrap();
        assert_eq!(exec.runs(), vec![TriggerReason::PageEnter, TriggerReason::Manual]);
        assert_eq!(exec.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_still_settles_the_run() {
        let (orch, exec, _, _) = setup(OrchestratorConfig::default());
        *exec.run_time.lock() = Duration::from_secs(5);

        let caller = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.request_manual_sync(VAULT).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(orch.status(VAULT).unwrap().is_running);
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = orch.status(VAULT).unwrap();
        assert!(!status.is_running);
        assert_eq!(status.phase, VaultPhase::Idle);

        *exec.run_time.lock() = Duration::ZERO;
        assert!(matches!(orch.request_manual_sync(VAULT).await, RequestDisposition::Ran(_)));
        assert_eq!(exec.runs(), vec![TriggerReason::Manual, TriggerReason::Manual]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_never_overlap() {
        let (orch, exec, _, _) = setup(OrchestratorConfig::default());
        *exec.run_time.lock() = Duration::from_millis(200);

        let mut tasks = Vec::new();
        for n in 0..20 {
            let orch = orch.clone();
            let reason = if n % 2 == 0 { TriggerReason::Manual } else { TriggerReason::Periodic };
            tasks.push(tokio::spawn(async move { orch.request_sync(VAULT, reason, true).await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(exec.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(exec.runs().len() >= 2);
        assert!(!orch.status(VAULT).unwrap().is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_are_reported_in_order() {
        let (orch, exec, gate, _) = setup(OrchestratorConfig::default().with_auto_sync(false));
        assert_eq!(
            orch.request_sync(VAULT, TriggerReason::Periodic, true).await,
            RequestDisposition::Blocked(BlockReason::AutoSyncDisabled)
        );

        gate.update(NetworkState::offline());
        assert_eq!(
            orch.request_manual_sync(VAULT).await,
            RequestDisposition::Blocked(BlockReason::NetworkUnavailable)
        );

        gate.update(NetworkState::cellular());
        orch.set_wifi_only(true);
        assert_eq!(
            orch.request_manual_sync(VAULT).await,
            RequestDisposition::Blocked(BlockReason::WifiRequired)
        );

        orch.set_wifi_only(false);
        exec.locked.store(true, Ordering::SeqCst);
        assert_eq!(
            orch.request_manual_sync(VAULT).await,
            RequestDisposition::Blocked(BlockReason::VaultLocked)
        );
        assert_eq!(
            orch.status(VAULT).unwrap().phase,
            VaultPhase::Blocked(BlockReason::VaultLocked)
        );
        assert!(exec.runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_back_off_then_surface() {
        let config = OrchestratorConfig::default()
            .with_retry(BackoffConfig::new(Duration::from_secs(5), Duration::from_secs(60)))
            .with_max_retry_attempts(2);
        let (orch, exec, _, clock) = setup(config);
        for _ in 0..3 {
            exec.push(retryable());
        }

        orch.request_manual_sync(VAULT).await;
        let status = orch.status(VAULT).unwrap();
        assert_eq!(status.retry_attempt, 1);
        assert_eq!(status.next_retry_at, Some(clock.now_millis() + 5_000));

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(exec.runs().len(), 2);
        assert_eq!(orch.status(VAULT).unwrap().retry_attempt, 2);

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(exec.runs(), vec![TriggerReason::Manual, TriggerReason::Retry, TriggerReason::Retry]);
        let status = orch.status(VAULT).unwrap();
        assert_eq!(status.phase, VaultPhase::Failed);
        assert_eq!(status.next_retry_at, None);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(exec.runs().len(), 3);

        orch.request_manual_sync(VAULT).await;
        let status = orch.status(VAULT).unwrap();
        assert_eq!(status.phase, VaultPhase::Idle);
        assert_eq!(status.retry_attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_cancels_armed_retry() {
        let (orch, exec, _, _) = setup(OrchestratorConfig::default());
        exec.push(retryable());
        orch.request_manual_sync(VAULT).await;
        assert!(orch.status(VAULT).unwrap().next_retry_at.is_some());

        orch.request_manual_sync(VAULT).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(exec.runs(), vec![TriggerReason::Manual, TriggerReason::Manual]);
        assert!(orch.status(VAULT).unwrap().last_success_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn network_watch_resumes_blocked_vaults() {
        let (orch, exec, gate, _) = setup(OrchestratorConfig::default());
        gate.update(NetworkState::offline());
        orch.request_sync(VAULT, TriggerReason::AppResume, false).await;
        let _watch = orch.spawn_network_watch();

        gate.update(NetworkState::wifi());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exec.runs(), vec![TriggerReason::Retry]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_vault_cancels_timers() {
        let (orch, exec, _, _) = setup(OrchestratorConfig::default());
        orch.request_sync(VAULT, TriggerReason::LocalMutation, false).await;
        orch.clear_vault(VAULT).await;
        assert!(orch.status(VAULT).is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(exec.runs().is_empty());
    }
}
