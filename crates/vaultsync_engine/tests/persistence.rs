//! State that must survive a restart.

use vaultsync_testkit::prelude::*;

const VAULT: VaultId = VaultId(4);

#[tokio::test(start_paused = true)]
async fn queued_work_and_confirmations_survive_restart() {
    let dir = TestStoreDir::new();
    let item = login_item(VAULT, "draft");

    {
        let env = TestEngine::with_store(dir.open());
        env.gate.update(NetworkState::offline());
        let outcome = env.engine.record_mutation(&item, OperationKind::Create).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued(_)));
        env.engine.guard().confirm_clear_local_data(VAULT).unwrap();

        assert!(matches!(
            SyncStore::open(dir.path(), None, StoreConfig::default()),
            Err(SyncError::StoreLocked)
        ));
    }

    let env = TestEngine::with_store(dir.open());
    let ops = env.engine.queue().operations(VAULT);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Create);
    assert_eq!(ops[0].payload.name, "draft");
    assert!(env.engine.guard().state(VAULT).clear_confirmed);

    env.sign_in(VAULT);
    env.items.insert(item.clone());
    let ran = env.engine.request_manual_sync(VAULT).await;
    assert_eq!(
        ran,
        RequestDisposition::Ran(SyncOutcome::Success {
            synced_count: 1,
            conflict_count: 0
        })
    );
    assert_eq!(env.linked_count(VAULT).await, 1);
    assert!(env.engine.queue().operations(VAULT).is_empty());
    assert!(!env.engine.guard().state(VAULT).clear_confirmed);
}

#[tokio::test]
async fn conflict_records_survive_restart() {
    let dir = TestStoreDir::new();
    let snapshot = ItemSnapshot::login("mail", "me", "local-pw", TEST_EPOCH);
    let remote = remote_cipher("c-1", TEST_EPOCH + 10);

    {
        let store = dir.open();
        let log = ConflictLog::open(&store, ConflictConfig::default(), std::sync::Arc::new(ManualClock::new(TEST_EPOCH)))
            .unwrap();
        log.record(VAULT, &ItemId::new("mail"), &snapshot, &remote).unwrap();
    }

    let store = dir.open();
    let log = ConflictLog::open(&store, ConflictConfig::default(), std::sync::Arc::new(ManualClock::new(TEST_EPOCH)))
        .unwrap();
    let records = log.load_conflict_backups();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].local_snapshot, snapshot);
    assert_eq!(records[0].remote_snapshot, remote);
    assert!(log.record(VAULT, &ItemId::new("mail"), &snapshot, &remote).unwrap().is_none());
}

#[tokio::test]
async fn sealed_store_needs_its_key() {
    let dir = TestStoreDir::new();
    let key = SealingKey::generate();
    {
        let store = SyncStore::open(dir.path(), Some(key.clone()), StoreConfig::default()).unwrap();
        let queue = PendingQueue::open(&store, QueueConfig::default(), std::sync::Arc::new(SystemClock)).unwrap();
        queue
            .enqueue(VAULT, ItemId::new("x"), ItemType::SecureNote, OperationKind::Create, None, ItemSnapshot::default())
            .unwrap();
    }

    let store = SyncStore::open(dir.path(), Some(key), StoreConfig::default()).unwrap();
    let queue = PendingQueue::open(&store, QueueConfig::default(), std::sync::Arc::new(SystemClock)).unwrap();
    assert_eq!(queue.stats(VAULT).pending, 1);
    drop(queue);
    drop(store);

    let store = SyncStore::open(dir.path(), Some(SealingKey::generate()), StoreConfig::default()).unwrap();
    assert!(PendingQueue::open(&store, QueueConfig::default(), std::sync::Arc::new(SystemClock)).is_err());
}
