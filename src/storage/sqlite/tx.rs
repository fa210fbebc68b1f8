//! Write transactions on a dedicated pooled connection.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool};
use tracing::warn;

use crate::audit::AuditEntry;
use crate::model::{Claim, IdempotencyRecord, RefundMark, Reward};
use crate::storage::{LedgerTx, Result};

use super::query;

/// One `BEGIN IMMEDIATE` transaction.
///
/// The write lock is taken up front, so two writers never race to upgrade
/// from a shared lock; the loser waits out `busy_timeout` and then fails
/// with a transient BUSY error.
pub struct SqliteLedgerTx {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl SqliteLedgerTx {
    pub(super) async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn, open: true })
    }

    async fn finish(mut self, statement: &'static str) -> Result<()> {
        self.open = false;
        if let Err(e) = sqlx::query(statement).execute(&mut *self.conn).await {
            // The connection's transaction state is unknown; don't return it to the pool.
            self.conn.close_on_drop();
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for SqliteLedgerTx {
    fn drop(&mut self) {
        if self.open {
            warn!("ledger transaction dropped while open, discarding connection");
            self.conn.close_on_drop();
        }
    }
}

#[async_trait]
impl LedgerTx for SqliteLedgerTx {
    async fn find_idempotency(
        &mut self,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        query::find_idempotency(&mut self.conn, user_id, idempotency_key).await
    }

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<()> {
        query::insert_idempotency(&mut self.conn, record).await
    }

    async fn user_exists(&mut self, user_id: &str) -> Result<bool> {
        query::user_exists(&mut self.conn, user_id).await
    }

    async fn find_reward(&mut self, reward_id: &str) -> Result<Option<Reward>> {
        query::find_reward(&mut self.conn, reward_id).await
    }

    async fn set_reward_active(&mut self, reward_id: &str, active: bool) -> Result<Option<Reward>> {
        query::set_reward_active(&mut self.conn, reward_id, active).await
    }

    async fn balance(&mut self, user_id: &str) -> Result<Option<i64>> {
        query::balance(&mut self.conn, user_id).await
    }

    async fn increment_balance(&mut self, user_id: &str, delta: i64) -> Result<i64> {
        query::increment_balance(&mut self.conn, user_id, delta).await
    }

    async fn set_balance(&mut self, user_id: &str, points: i64) -> Result<i64> {
        query::set_balance(&mut self.conn, user_id, points).await
    }

    async fn insert_claim(&mut self, claim: &Claim) -> Result<()> {
        query::insert_claim(&mut self.conn, claim).await
    }

    async fn find_claim(&mut self, claim_id: &str) -> Result<Option<Claim>> {
        query::find_claim(&mut self.conn, claim_id).await
    }

    async fn mark_refunded(&mut self, claim_id: &str, mark: &RefundMark) -> Result<()> {
        query::mark_refunded(&mut self.conn, claim_id, mark).await
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        query::append_audit(&mut self.conn, entry).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        (*self).finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        (*self).finish("ROLLBACK").await
    }
}
