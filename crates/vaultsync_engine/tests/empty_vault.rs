//! Empty-vault protection, end to end.

use vaultsync_testkit::prelude::*;

const VAULT: VaultId = VaultId(1);

fn success(synced_count: usize) -> RequestDisposition {
    RequestDisposition::Ran(SyncOutcome::Success {
        synced_count,
        conflict_count: 0,
    })
}

#[tokio::test(start_paused = true)]
async fn empty_remote_is_held_until_the_user_confirms() {
    let env = TestEngine::new();
    env.seed_linked_items(VAULT, 10);
    let mut events = env.engine.guard().subscribe();

    assert_eq!(env.engine.request_manual_sync(VAULT).await, success(10));

    env.remote.clear_vault(VAULT);
    let blocked = env.engine.request_manual_sync(VAULT).await;
    assert!(matches!(
        blocked,
        RequestDisposition::Ran(SyncOutcome::Blocked {
            reason: BlockReason::EmptyVaultProtection,
            ..
        })
    ));
    assert_eq!(env.linked_count(VAULT).await, 10);
    let status = env.engine.orchestrator().status(VAULT).unwrap();
    assert_eq!(status.phase, VaultPhase::Blocked(BlockReason::EmptyVaultProtection));
    assert_eq!(
        events.recv().await.unwrap(),
        GuardEvent::EmptyVaultDetected {
            vault: VAULT,
            local_count: 10,
            server_count: 0
        }
    );

    // Blocked again on retry: nothing changed.
    assert!(matches!(
        env.engine.request_manual_sync(VAULT).await,
        RequestDisposition::Ran(SyncOutcome::Blocked { .. })
    ));

    let saves = env.items.save_count();
    let confirmed = env.engine.orchestrator().confirm_clear_local_data(VAULT).await.unwrap();
    assert_eq!(confirmed, success(0));
    assert_eq!(env.linked_count(VAULT).await, 0);
    assert_eq!(env.items.save_count(), saves + 1);
    assert!(!env.engine.guard().state(VAULT).clear_confirmed);

    // The item data is kept; only the links are gone.
    let item = env.items.get(&ItemId::new("item-1-0")).unwrap();
    assert_eq!(item.data.username.as_deref(), Some("item-1-0@example.com"));
    assert!(!item.is_deleted);
}

#[tokio::test(start_paused = true)]
async fn confirmation_is_consumed_so_later_anomalies_are_caught() {
    let env = TestEngine::new();
    env.seed_linked_items(VAULT, 2);
    env.engine.request_manual_sync(VAULT).await;

    env.remote.clear_vault(VAULT);
    env.engine.orchestrator().confirm_clear_local_data(VAULT).await.unwrap();
    assert_eq!(env.linked_count(VAULT).await, 0);

    env.seed_linked_items(VAULT, 3);
    assert_eq!(env.engine.request_manual_sync(VAULT).await, success(3));

    env.remote.clear_vault(VAULT);
    assert!(matches!(
        env.engine.request_manual_sync(VAULT).await,
        RequestDisposition::Ran(SyncOutcome::Blocked {
            reason: BlockReason::EmptyVaultProtection,
            ..
        })
    ));
    assert_eq!(env.linked_count(VAULT).await, 3);
}

#[tokio::test(start_paused = true)]
async fn first_sync_accepts_an_empty_remote() {
    let env = TestEngine::new();
    env.seed_linked_items(VAULT, 4);
    env.remote.clear_vault(VAULT);

    assert_eq!(env.engine.request_manual_sync(VAULT).await, success(0));
    assert!(env.engine.guard().state(VAULT).last_sync_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn cancelling_keeps_local_links() {
    let env = TestEngine::new();
    env.seed_linked_items(VAULT, 3);
    env.engine.request_manual_sync(VAULT).await;
    env.remote.clear_vault(VAULT);
    env.engine.request_manual_sync(VAULT).await;

    env.engine.guard().confirm_clear_local_data(VAULT).unwrap();
    env.engine.orchestrator().cancel_sync(VAULT).unwrap();
    assert_eq!(
        env.engine.orchestrator().status(VAULT).unwrap().phase,
        VaultPhase::Idle
    );

    assert!(matches!(
        env.engine.request_manual_sync(VAULT).await,
        RequestDisposition::Ran(SyncOutcome::Blocked { .. })
    ));
    assert_eq!(env.linked_count(VAULT).await, 3);
}

#[tokio::test(start_paused = true)]
async fn failed_push_does_not_consume_the_confirmation() {
    let env = TestEngine::new();
    env.seed_linked_items(VAULT, 2);
    env.engine.request_manual_sync(VAULT).await;
    env.remote.clear_vault(VAULT);

    let fresh = login_item(VAULT, "fresh");
    env.items.insert(fresh.clone());
    env.engine
        .queue()
        .enqueue(VAULT, fresh.id.clone(), fresh.item_type, OperationKind::Create, None, fresh.data.clone())
        .unwrap();
    env.remote
        .fail_next(RemoteCall::Create, SyncError::server(503, "unavailable"));

    let outcome = env.engine.orchestrator().confirm_clear_local_data(VAULT).await.unwrap();
    assert!(matches!(
        outcome,
        RequestDisposition::Ran(SyncOutcome::RetryableError { .. })
    ));
    assert_eq!(env.linked_count(VAULT).await, 0);
    let state = env.engine.guard().state(VAULT);
    assert!(state.clear_confirmed);
    assert!(state.last_sync_at.is_some());

    tokio::time::sleep(std::time::Duration::from_millis(5_100)).await;
    let status = env.engine.orchestrator().status(VAULT).unwrap();
    assert_eq!(status.last_trigger_reason, Some(TriggerReason::Retry));
    assert_eq!(status.phase, VaultPhase::Idle);
    assert!(!env.engine.guard().state(VAULT).clear_confirmed);
}
