//! SQLite ledger store.

mod query;
mod tx;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::audit::AuditEntry;
use crate::config::StorageConfig;
use crate::model::{
    Claim, ClaimStatus, IdempotencyRecord, RefundedClaim, Reward, User,
};
use crate::storage::schema::SCHEMA;
use crate::storage::{LedgerStore, LedgerTx, Result};

pub use tx::SqliteLedgerTx;

/// SQLite implementation of LedgerStore.
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Create a store over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database file named by `config`.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(&config.path)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await?;

        Ok(Self::new(pool))
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::raw_sql(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(SqliteLedgerTx::begin(&self.pool).await?))
    }

    async fn find_idempotency(
        &self,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.pool.acquire().await?;
        query::find_idempotency(&mut conn, user_id, idempotency_key).await
    }

    async fn balance(&self, user_id: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        query::balance(&mut conn, user_id).await
    }

    async fn find_reward(&self, reward_id: &str) -> Result<Option<Reward>> {
        let mut conn = self.pool.acquire().await?;
        query::find_reward(&mut conn, reward_id).await
    }

    async fn find_claim(&self, claim_id: &str) -> Result<Option<Claim>> {
        let mut conn = self.pool.acquire().await?;
        query::find_claim(&mut conn, claim_id).await
    }

    async fn list_claims(
        &self,
        user_id: &str,
        status: Option<ClaimStatus>,
        limit: usize,
    ) -> Result<Vec<Claim>> {
        let mut conn = self.pool.acquire().await?;
        query::list_claims(&mut conn, user_id, status, limit).await
    }

    async fn refund_history(&self, user_id: &str, limit: usize) -> Result<Vec<Claim>> {
        let mut conn = self.pool.acquire().await?;
        query::refund_history(&mut conn, user_id, limit).await
    }

    async fn refunded_since(&self, since: DateTime<Utc>) -> Result<Vec<RefundedClaim>> {
        let mut conn = self.pool.acquire().await?;
        query::refunded_since(&mut conn, since).await
    }

    async fn list_active_rewards(&self) -> Result<Vec<Reward>> {
        let mut conn = self.pool.acquire().await?;
        query::list_active_rewards(&mut conn).await
    }

    async fn audit_entries(&self, resource_id: &str) -> Result<Vec<AuditEntry>> {
        let mut conn = self.pool.acquire().await?;
        query::audit_entries(&mut conn, resource_id).await
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        query::insert_user(&mut conn, user).await
    }

    async fn upsert_reward(&self, reward: &Reward) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        query::upsert_reward(&mut conn, reward).await
    }
}
