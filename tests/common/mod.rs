//! Shared setup for ledger integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use loyalty::audit::MemoryAuditSink;
use loyalty::config::Config;
use loyalty::model::{Reward, User};
use loyalty::storage::{LedgerStore, LedgerTx};
use loyalty::utils::metrics::ClaimMetrics;
use loyalty::Services;

pub const USER: &str = "user-1";
pub const REWARD: &str = "reward-1";
pub const COST: i64 = 100;

/// Services over `store` with fresh metrics and an in-memory audit trail.
pub fn services(store: Arc<dyn LedgerStore>) -> (Services, Arc<ClaimMetrics>, Arc<MemoryAuditSink>) {
    let metrics = Arc::new(ClaimMetrics::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let services = Services::new(store, Config::for_test())
        .with_metrics(Arc::clone(&metrics))
        .with_audit(audit.clone());
    (services, metrics, audit)
}

/// Seed `USER` with `balance` points and `REWARD` costing `COST`.
pub async fn seed(store: &dyn LedgerStore, balance: i64) {
    store.create_user(&User::new(USER)).await.unwrap();
    store
        .upsert_reward(&Reward::new(REWARD, "Free coffee", COST))
        .await
        .unwrap();
    let mut tx = store.begin().await.unwrap();
    tx.increment_balance(USER, balance).await.unwrap();
    tx.commit().await.unwrap();
}

pub fn new_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Open a fresh SQLite ledger inside `dir`.
#[cfg(feature = "sqlite")]
pub async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<dyn LedgerStore> {
    let path = dir.path().join("loyalty.db");
    let config = loyalty::config::StorageConfig::at(path.to_string_lossy());
    loyalty::storage::init_storage(&config)
        .await
        .expect("Failed to open SQLite ledger")
}
