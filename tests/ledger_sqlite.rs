//! SQLite ledger store integration tests.
//!
//! Run with: cargo test --test ledger_sqlite --features sqlite
//!
//! Exercises the storage primitives directly, below the services.

mod common;

use chrono::{Duration, Utc};

use common::{seed, sqlite_store, COST, REWARD, USER};
use loyalty::audit::{AuditAction, AuditEntry, AuditStatus};
use loyalty::config::StorageConfig;
use loyalty::model::{Claim, ClaimStatus, IdempotencyRecord, RefundMark, RefundReason};
use loyalty::storage::{LedgerStore, LedgerTx, SqliteLedgerStore, StorageError};

#[tokio::test]
async fn test_init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::at(dir.path().join("ledger.db").to_string_lossy());

    let store = SqliteLedgerStore::connect(&config).await.unwrap();
    store.init().await.unwrap();
    store.init().await.unwrap();

    assert!(store.list_active_rewards().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_balance_upsert_and_override() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 0).await;

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.increment_balance(USER, 70).await.unwrap(), 70);
    assert_eq!(tx.increment_balance(USER, 30).await.unwrap(), 100);
    assert_eq!(tx.set_balance(USER, 5).await.unwrap(), 100);
    tx.commit().await.unwrap();

    assert_eq!(store.balance(USER).await.unwrap(), Some(5));
    assert_eq!(store.balance("nobody").await.unwrap(), None);
}

#[tokio::test]
async fn test_debit_updates_existing_balance() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 500).await;

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.increment_balance(USER, -COST).await.unwrap(), 500 - COST);
    assert_eq!(tx.increment_balance(USER, COST - 500).await.unwrap(), 0);
    tx.commit().await.unwrap();

    assert_eq!(store.balance(USER).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_debit_of_missing_balance_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 500).await;

    let mut tx = store.begin().await.unwrap();
    let err = tx.increment_balance("nobody", -COST).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { entity: "balance", .. }));
    assert!(!err.is_transient());
    tx.rollback().await.unwrap();

    assert_eq!(store.balance("nobody").await.unwrap(), None);
}

#[tokio::test]
async fn test_negative_balance_rejected_by_engine() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 10).await;

    let mut tx = store.begin().await.unwrap();
    let err = tx.increment_balance(USER, -11).await.unwrap_err();
    assert!(!err.is_transient());
    tx.rollback().await.unwrap();

    assert_eq!(store.balance(USER).await.unwrap(), Some(10));
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 10).await;

    let mut tx = store.begin().await.unwrap();
    tx.increment_balance(USER, 90).await.unwrap();
    tx.insert_claim(&Claim::new(USER, REWARD, "key-1"))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(store.balance(USER).await.unwrap(), Some(10));
    assert!(store.list_claims(USER, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 10).await;

    {
        let mut tx = store.begin().await.unwrap();
        tx.increment_balance(USER, 90).await.unwrap();
    }

    // The write lock was released; a new writer gets in.
    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.balance(USER).await.unwrap(), Some(10));
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_one_active_claim_per_user_and_reward() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 1000).await;

    let first = Claim::new(USER, REWARD, "key-1");
    let mut tx = store.begin().await.unwrap();
    tx.insert_claim(&first).await.unwrap();

    let err = tx
        .insert_claim(&Claim::new(USER, REWARD, "key-2"))
        .await
        .unwrap_err();
    assert!(err.is_unique_violation(), "{}", err);

    // The failed insert leaves the transaction usable.
    tx.mark_refunded(
        &first.id,
        &RefundMark {
            reason: RefundReason::AdminAction,
            refunded_at: Utc::now(),
            refunded_by: Some("admin-1".to_string()),
        },
    )
    .await
    .unwrap();
    tx.insert_claim(&Claim::new(USER, REWARD, "key-2"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let active = store
        .list_claims(USER, Some(ClaimStatus::Claimed), 10)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].idempotency_key, "key-2");
}

#[tokio::test]
async fn test_claim_key_unique_per_user() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 1000).await;
    store
        .upsert_reward(&loyalty::model::Reward::new("reward-2", "Muffin", 40))
        .await
        .unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.insert_claim(&Claim::new(USER, REWARD, "key-1"))
        .await
        .unwrap();
    let err = tx
        .insert_claim(&Claim::new(USER, "reward-2", "key-1"))
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_idempotency_record_is_write_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 0).await;

    let record = IdempotencyRecord {
        user_id: USER.to_string(),
        idempotency_key: "key-1".to_string(),
        reward_id: REWARD.to_string(),
        response_body: r#"{"success":true}"#.to_string(),
        status_code: 201,
        created_at: Utc::now(),
    };

    let mut tx = store.begin().await.unwrap();
    tx.insert_idempotency(&record).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let err = tx
        .insert_idempotency(&IdempotencyRecord {
            response_body: "{}".to_string(),
            ..record.clone()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::UniqueViolation { .. }));
    tx.rollback().await.unwrap();

    let stored = store.find_idempotency(USER, "key-1").await.unwrap().unwrap();
    assert_eq!(stored.response_body, record.response_body);
    assert_eq!(stored.status_code, 201);
}

#[tokio::test]
async fn test_reward_active_flag() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 0).await;

    let mut tx = store.begin().await.unwrap();
    let reward = tx.set_reward_active(REWARD, false).await.unwrap().unwrap();
    assert!(!reward.active);
    assert!(tx.set_reward_active("missing", false).await.unwrap().is_none());
    tx.commit().await.unwrap();

    assert!(store.list_active_rewards().await.unwrap().is_empty());
    let reward = store.find_reward(REWARD).await.unwrap().unwrap();
    assert_eq!(reward.cost_points, COST);
    assert!(!reward.active);
}

#[tokio::test]
async fn test_refunded_since_joins_reward_cost() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    seed(store.as_ref(), 0).await;

    let claim = Claim::new(USER, REWARD, "key-1");
    let mut tx = store.begin().await.unwrap();
    tx.insert_claim(&claim).await.unwrap();
    tx.mark_refunded(
        &claim.id,
        &RefundMark {
            reason: RefundReason::SystemError,
            refunded_at: Utc::now(),
            refunded_by: None,
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let refunded = store
        .refunded_since(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(refunded.len(), 1);
    assert_eq!(refunded[0].cost_points, COST);
    assert_eq!(
        refunded[0].claim.refund_reason,
        Some(RefundReason::SystemError)
    );

    assert!(store
        .refunded_since(Utc::now() + Duration::hours(1))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.refund_history(USER, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_mark_refunded_unknown_claim() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;

    let mut tx = store.begin().await.unwrap();
    let err = tx
        .mark_refunded(
            "missing",
            &RefundMark {
                reason: RefundReason::UserRequest,
                refunded_at: Utc::now(),
                refunded_by: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn test_audit_entries_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;

    let entry = AuditEntry::new(
        AuditAction::UpdateReward,
        "admin-1",
        REWARD,
        "reward",
        AuditStatus::Success,
    )
    .with_metadata(serde_json::json!({ "active": false }));

    let mut tx = store.begin().await.unwrap();
    tx.append_audit(&entry).await.unwrap();
    tx.append_audit(&AuditEntry::new(
        AuditAction::UpdateReward,
        "admin-1",
        "other",
        "reward",
        AuditStatus::Failed,
    ))
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let entries = store.audit_entries(REWARD).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, entry.id);
    assert_eq!(entries[0].metadata["active"], false);

    let other = store.audit_entries("other").await.unwrap();
    assert!(other[0].metadata.is_null());
}
