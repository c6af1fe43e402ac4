//! Queue invariants over arbitrary mutation sequences.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use vaultsync_testkit::prelude::*;

const VAULT: VaultId = VaultId(7);

/// The queue state the coalescing table predicts for one item.
fn model(existing: Option<OperationKind>, kind: OperationKind, bound: bool) -> Option<OperationKind> {
    match coalesce(existing, kind, bound) {
        Coalesced::Enqueue => Some(kind),
        Coalesced::Replace(next) => Some(next),
        Coalesced::CancelExisting => None,
        Coalesced::Drop => existing,
    }
}

fn item_id(n: usize) -> ItemId {
    ItemId::new(format!("item-{n}"))
}

proptest! {
    #[test]
    fn at_most_one_active_operation_per_item(script in mutation_script_strategy(4, 40)) {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH));
        let queue = PendingQueue::open(&SyncStore::in_memory(), QueueConfig::default(), clock).unwrap();
        let mut expected: HashMap<usize, Option<OperationKind>> = HashMap::new();

        for (n, kind) in &script.steps {
            let bound = script.bound[*n];
            let remote_id = bound.then(|| format!("remote-{n}"));
            queue
                .enqueue(VAULT, item_id(*n), ItemType::Login, *kind, remote_id, ItemSnapshot::default())
                .unwrap();
            let slot = expected.entry(*n).or_insert(None);
            *slot = model(*slot, *kind, bound);
        }

        let ops = queue.operations(VAULT);
        for n in 0..script.bound.len() {
            let active: Vec<_> = ops
                .iter()
                .filter(|op| op.item_id == item_id(n) && op.status.is_active())
                .collect();
            prop_assert!(active.len() <= 1);
            let want = expected.get(&n).copied().flatten();
            prop_assert_eq!(active.first().map(|op| op.kind), want);
        }
    }

    #[test]
    fn unbound_items_never_queue_removals(kinds in prop::collection::vec(operation_kind_strategy(), 1..20)) {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH));
        let queue = PendingQueue::open(&SyncStore::in_memory(), QueueConfig::default(), clock).unwrap();
        for kind in kinds {
            queue
                .enqueue(VAULT, item_id(0), ItemType::Login, kind, None, ItemSnapshot::default())
                .unwrap();
            if let Some(op) = queue.active_for_item(&item_id(0)) {
                prop_assert!(!matches!(op.kind, OperationKind::Delete | OperationKind::Purge));
            }
        }
    }

    #[test]
    fn queued_payload_is_the_latest_edit(snapshots in prop::collection::vec(snapshot_strategy(), 1..10)) {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH));
        let queue = PendingQueue::open(&SyncStore::in_memory(), QueueConfig::default(), clock).unwrap();
        for snapshot in &snapshots {
            queue
                .enqueue(VAULT, item_id(0), ItemType::Login, OperationKind::Update, Some("remote-0".into()), snapshot.clone())
                .unwrap();
        }
        let op = queue.active_for_item(&item_id(0)).unwrap();
        prop_assert_eq!(op.kind, OperationKind::Update);
        prop_assert_eq!(&op.payload, snapshots.last().unwrap());
        prop_assert_eq!(queue.operations(VAULT).len(), 1);
    }

    #[test]
    fn merged_trigger_keeps_the_highest_priority(reasons in prop::collection::vec(trigger_reason_strategy(), 1..12)) {
        let merged = reasons
            .iter()
            .fold(None, |current, reason| Some(TriggerReason::merge(current, *reason)));
        let top = reasons.iter().map(|r| r.priority()).max().unwrap();
        prop_assert_eq!(merged.map(TriggerReason::priority), Some(top));
    }
}

#[test]
fn create_then_delete_before_send_leaves_nothing() {
    let clock = Arc::new(ManualClock::new(TEST_EPOCH));
    let queue = PendingQueue::open(&SyncStore::in_memory(), QueueConfig::default(), clock).unwrap();
    let item = login_item(VAULT, "fresh");

    let created = queue
        .enqueue(VAULT, item.id.clone(), item.item_type, OperationKind::Create, None, item.data.clone())
        .unwrap();
    assert!(matches!(created, EnqueueOutcome::Enqueued(_)));

    let deleted = queue
        .enqueue(VAULT, item.id.clone(), item.item_type, OperationKind::Delete, None, item.data)
        .unwrap();
    assert!(matches!(deleted, EnqueueOutcome::Cancelled(_)));
    assert!(queue.operations(VAULT).is_empty());
    assert_eq!(queue.stats(VAULT).active(), 0);
}
