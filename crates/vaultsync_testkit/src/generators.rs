//! Property-based test generators using proptest.

use proptest::prelude::*;
use vaultsync_engine::{ItemSnapshot, OperationKind, TriggerReason};

/// Strategy for operation kinds.
pub fn operation_kind_strategy() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Create),
        Just(OperationKind::Update),
        Just(OperationKind::Delete),
        Just(OperationKind::Restore),
        Just(OperationKind::Purge),
    ]
}

/// Strategy for trigger reasons.
pub fn trigger_reason_strategy() -> impl Strategy<Value = TriggerReason> {
    prop_oneof![
        Just(TriggerReason::PageEnter),
        Just(TriggerReason::LocalMutation),
        Just(TriggerReason::AppResume),
        Just(TriggerReason::Manual),
        Just(TriggerReason::Periodic),
        Just(TriggerReason::Retry),
    ]
}

/// Strategy for login snapshots.
pub fn snapshot_strategy() -> impl Strategy<Value = ItemSnapshot> {
    (
        "[a-zA-Z0-9 ]{1,24}",
        "[a-z]{1,12}",
        "[ -~]{0,32}",
        0i64..1_000_000,
    )
        .prop_map(|(name, username, password, updated_at)| {
            ItemSnapshot::login(name, username, password, updated_at)
        })
}

/// A pool of items and a sequence of local changes to them.
#[derive(Debug, Clone)]
pub struct MutationScript {
    /// Whether each item of the pool is linked to a remote cipher.
    pub bound: Vec<bool>,
    /// `(item index, change)` in order.
    pub steps: Vec<(usize, OperationKind)>,
}

/// Strategy for scripts over up to `items` items and `max_len` steps.
pub fn mutation_script_strategy(items: usize, max_len: usize) -> impl Strategy<Value = MutationScript> {
    let items = items.max(1);
    (
        prop::collection::vec(any::<bool>(), items),
        prop::collection::vec((0..items, operation_kind_strategy()), 0..max_len),
    )
        .prop_map(|(bound, steps)| MutationScript { bound, steps })
}
