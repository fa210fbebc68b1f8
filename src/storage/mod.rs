//! Durable ledger storage.
//!
//! The ledger holds users, point balances, rewards, claims, idempotency
//! records and the audit log. Correctness of the claim pipeline is delegated
//! entirely to this layer: transactions provide isolation, and unique
//! constraints decide which of several racing writers wins.
//!
//! # Implementations
//!
//! - `SqliteLedgerStore`: SQLite storage (feature `sqlite`)
//! - `MockLedgerStore`: In-memory store with fault injection for testing

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::audit::AuditEntry;
use crate::model::{
    Claim, ClaimStatus, IdempotencyRecord, RefundMark, RefundedClaim, Reward, User,
};

pub mod helpers;
pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MockLedgerStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedgerStore;

pub use crate::config::StorageConfig;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Storage busy: {0}")]
    Busy(String),

    #[error("Invalid timestamp: {value}")]
    InvalidTimestamp { value: String },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StorageError {
    /// Whether retrying the whole transaction may succeed.
    ///
    /// Only lock-timeout/busy, deadlock and serialization-failure signals
    /// count. Constraint violations and everything else are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Busy(_) => true,
            #[cfg(feature = "sqlite")]
            StorageError::Database(e) => helpers::is_transient_sqlx(e),
            _ => false,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StorageError::UniqueViolation { .. })
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::UniqueViolation {
                constraint: db.message().to_string(),
            },
            _ => StorageError::Database(e),
        }
    }
}

/// One open ledger transaction.
///
/// All reads see the transaction's own writes. Nothing becomes visible to
/// other transactions until `commit`. Dropping an uncommitted transaction
/// rolls it back.
#[async_trait]
pub trait LedgerTx: Send {
    /// Look up the stored response for `(user_id, key)`.
    async fn find_idempotency(
        &mut self,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Bind a terminal response to its key. Fails with `UniqueViolation`
    /// if the key already has one.
    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<()>;

    async fn user_exists(&mut self, user_id: &str) -> Result<bool>;

    async fn find_reward(&mut self, reward_id: &str) -> Result<Option<Reward>>;

    /// Toggle a reward's `active` flag. Returns the updated reward.
    async fn set_reward_active(&mut self, reward_id: &str, active: bool) -> Result<Option<Reward>>;

    /// Current balance, `None` when the user has no balance row yet.
    async fn balance(&mut self, user_id: &str) -> Result<Option<i64>>;

    /// Atomically add `delta` and return the new balance. A credit creates
    /// the row if absent; a debit of a missing row fails with `NotFound`, and
    /// one that would take the balance below zero fails with a constraint
    /// error.
    async fn increment_balance(&mut self, user_id: &str, delta: i64) -> Result<i64>;

    /// Replace the balance unconditionally. Returns the previous balance
    /// (zero if the row did not exist).
    async fn set_balance(&mut self, user_id: &str, points: i64) -> Result<i64>;

    /// Insert an active claim. At most one active claim may exist per
    /// `(user_id, reward_id)`; a second fails with `UniqueViolation`.
    async fn insert_claim(&mut self, claim: &Claim) -> Result<()>;

    async fn find_claim(&mut self, claim_id: &str) -> Result<Option<Claim>>;

    /// Transition a claim to `Refunded`.
    async fn mark_refunded(&mut self, claim_id: &str, mark: &RefundMark) -> Result<()>;

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Interface for ledger persistence.
///
/// Methods outside `begin` are single-statement reads or seeding writes
/// that need no surrounding transaction.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a write transaction.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Non-transactional idempotency lookup (fast replay path).
    async fn find_idempotency(
        &self,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>>;

    async fn balance(&self, user_id: &str) -> Result<Option<i64>>;

    async fn find_reward(&self, reward_id: &str) -> Result<Option<Reward>>;

    async fn find_claim(&self, claim_id: &str) -> Result<Option<Claim>>;

    /// A user's claims, newest first, optionally filtered by status.
    async fn list_claims(
        &self,
        user_id: &str,
        status: Option<ClaimStatus>,
        limit: usize,
    ) -> Result<Vec<Claim>>;

    /// A user's refunded claims, most recently refunded first.
    async fn refund_history(&self, user_id: &str, limit: usize) -> Result<Vec<Claim>>;

    /// All claims refunded at or after `since`, with their reward cost.
    async fn refunded_since(&self, since: DateTime<Utc>) -> Result<Vec<RefundedClaim>>;

    async fn list_active_rewards(&self) -> Result<Vec<Reward>>;

    /// Audit entries for one resource, newest first.
    async fn audit_entries(&self, resource_id: &str) -> Result<Vec<AuditEntry>>;

    async fn create_user(&self, user: &User) -> Result<()>;

    async fn upsert_reward(&self, reward: &Reward) -> Result<()>;
}

/// Initialize storage based on configuration.
#[cfg(feature = "sqlite")]
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn LedgerStore>> {
    info!(path = %config.path, max_connections = config.max_connections, "Storage: sqlite");

    let store = SqliteLedgerStore::connect(config).await?;
    store.init().await?;
    Ok(Arc::new(store))
}

/// Initialize storage based on configuration.
#[cfg(not(feature = "sqlite"))]
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn LedgerStore>> {
    info!(path = %config.path, "Storage: in-memory (sqlite feature disabled)");
    Ok(Arc::new(MockLedgerStore::new()))
}
