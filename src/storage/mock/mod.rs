//! In-memory ledger store for testing.
//!
//! Transactions take an owned lock on the whole ledger, work on a private
//! copy and publish it on commit, which gives serializable isolation. The
//! same unique constraints as the SQL schema are enforced. Transient
//! failures can be injected into `begin`, `commit` and idempotency lookups
//! outside a transaction to exercise retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::audit::AuditEntry;
use crate::model::{
    Claim, ClaimStatus, IdempotencyRecord, RefundMark, RefundedClaim, Reward, User,
};
use crate::storage::{LedgerStore, LedgerTx, Result, StorageError};

/// Key type for idempotency records: (user_id, idempotency_key).
type IdempotencyKey = (String, String);

#[derive(Debug, Clone, Default)]
struct LedgerState {
    users: HashMap<String, User>,
    balances: HashMap<String, i64>,
    rewards: HashMap<String, Reward>,
    claims: HashMap<String, Claim>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
    audit: Vec<AuditEntry>,
}

impl LedgerState {
    fn refunded_claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims
            .values()
            .filter(|c| c.status == ClaimStatus::Refunded)
    }

    fn insert_claim(&mut self, claim: &Claim) -> Result<()> {
        if self.claims.contains_key(&claim.id) {
            return Err(unique("reward_claims.id"));
        }
        let conflict = self.claims.values().find(|c| c.user_id == claim.user_id && {
            c.idempotency_key == claim.idempotency_key
                || (c.reward_id == claim.reward_id && c.is_active() && claim.is_active())
        });
        if let Some(existing) = conflict {
            return Err(if existing.idempotency_key == claim.idempotency_key {
                unique("reward_claims.user_id, reward_claims.idempotency_key")
            } else {
                unique("reward_claims.user_id, reward_claims.reward_id")
            });
        }
        self.claims.insert(claim.id.clone(), claim.clone());
        Ok(())
    }

    fn increment_balance(&mut self, user_id: &str, delta: i64) -> Result<i64> {
        let current = match self.balances.get(user_id) {
            Some(current) => *current,
            None if delta < 0 => {
                return Err(StorageError::NotFound {
                    entity: "balance",
                    id: user_id.to_string(),
                })
            }
            None => 0,
        };
        let updated = current
            .checked_add(delta)
            .ok_or_else(|| StorageError::Constraint("integer overflow: points".to_string()))?;
        if updated < 0 {
            return Err(StorageError::Constraint(
                "CHECK constraint failed: points >= 0".to_string(),
            ));
        }
        self.balances.insert(user_id.to_string(), updated);
        Ok(updated)
    }
}

fn unique(constraint: &str) -> StorageError {
    StorageError::UniqueViolation {
        constraint: constraint.to_string(),
    }
}

fn injected_busy() -> StorageError {
    StorageError::Busy("database is locked (injected)".to_string())
}

/// Pending injected failures, shared with open transactions.
#[derive(Default)]
struct Faults {
    begins: RwLock<u32>,
    commits: RwLock<u32>,
    lookups: RwLock<u32>,
}

impl Faults {
    /// Consume one pending failure from `slot`, if any.
    async fn take(slot: &RwLock<u32>) -> bool {
        let mut remaining = slot.write().await;
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

/// In-memory ledger store.
#[derive(Default)]
pub struct MockLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    faults: Arc<Faults>,
    begins: AtomicU64,
}

impl MockLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls to `begin` with a transient busy error.
    pub async fn fail_next_begins(&self, n: u32) {
        *self.faults.begins.write().await = n;
    }

    /// Fail the next `n` commits with a transient busy error. The failed
    /// transaction's writes are discarded.
    pub async fn fail_next_commits(&self, n: u32) {
        *self.faults.commits.write().await = n;
    }

    /// Fail the next `n` idempotency lookups made outside a transaction with
    /// a transient busy error.
    pub async fn fail_next_lookups(&self, n: u32) {
        *self.faults.lookups.write().await = n;
    }

    /// Number of `begin` calls so far, including failed ones.
    pub fn begin_count(&self) -> u64 {
        self.begins.load(Ordering::SeqCst)
    }

    /// Every claim in the ledger, in no particular order.
    pub async fn all_claims(&self) -> Vec<Claim> {
        self.state.lock().await.claims.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerStore for MockLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        if Faults::take(&self.faults.begins).await {
            return Err(injected_busy());
        }

        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MockLedgerTx {
            guard,
            working,
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn find_idempotency(
        &self,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        if Faults::take(&self.faults.lookups).await {
            return Err(injected_busy());
        }
        let state = self.state.lock().await;
        Ok(state
            .idempotency
            .get(&(user_id.to_string(), idempotency_key.to_string()))
            .cloned())
    }

    async fn balance(&self, user_id: &str) -> Result<Option<i64>> {
        Ok(self.state.lock().await.balances.get(user_id).copied())
    }

    async fn find_reward(&self, reward_id: &str) -> Result<Option<Reward>> {
        Ok(self.state.lock().await.rewards.get(reward_id).cloned())
    }

    async fn find_claim(&self, claim_id: &str) -> Result<Option<Claim>> {
        Ok(self.state.lock().await.claims.get(claim_id).cloned())
    }

    async fn list_claims(
        &self,
        user_id: &str,
        status: Option<ClaimStatus>,
        limit: usize,
    ) -> Result<Vec<Claim>> {
        let state = self.state.lock().await;
        let mut claims: Vec<Claim> = state
            .claims
            .values()
            .filter(|c| c.user_id == user_id)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        claims.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        claims.truncate(limit);
        Ok(claims)
    }

    async fn refund_history(&self, user_id: &str, limit: usize) -> Result<Vec<Claim>> {
        let state = self.state.lock().await;
        let mut claims: Vec<Claim> = state
            .refunded_claims()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        claims.sort_by(|a, b| b.refunded_at.cmp(&a.refunded_at));
        claims.truncate(limit);
        Ok(claims)
    }

    async fn refunded_since(&self, since: DateTime<Utc>) -> Result<Vec<RefundedClaim>> {
        let state = self.state.lock().await;
        Ok(state
            .refunded_claims()
            .filter(|c| c.refunded_at.is_some_and(|at| at >= since))
            .map(|c| RefundedClaim {
                claim: c.clone(),
                cost_points: state
                    .rewards
                    .get(&c.reward_id)
                    .map_or(0, |r| r.cost_points),
            })
            .collect())
    }

    async fn list_active_rewards(&self) -> Result<Vec<Reward>> {
        let state = self.state.lock().await;
        let mut rewards: Vec<Reward> = state.rewards.values().filter(|r| r.active).cloned().collect();
        rewards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rewards)
    }

    async fn audit_entries(&self, resource_id: &str) -> Result<Vec<AuditEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|e| e.resource_id == resource_id)
            .cloned()
            .collect())
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.users.contains_key(&user.id) {
            return Err(unique("users.id"));
        }
        state.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn upsert_reward(&self, reward: &Reward) -> Result<()> {
        let mut state = self.state.lock().await;
        state.rewards.insert(reward.id.clone(), reward.clone());
        Ok(())
    }
}

/// Transaction over a private copy of the ledger.
pub struct MockLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    working: LedgerState,
    faults: Arc<Faults>,
}

#[async_trait]
impl LedgerTx for MockLedgerTx {
    async fn find_idempotency(
        &mut self,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .working
            .idempotency
            .get(&(user_id.to_string(), idempotency_key.to_string()))
            .cloned())
    }

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<()> {
        let key = (record.user_id.clone(), record.idempotency_key.clone());
        if self.working.idempotency.contains_key(&key) {
            return Err(unique(
                "idempotency_records.user_id, idempotency_records.idempotency_key",
            ));
        }
        self.working.idempotency.insert(key, record.clone());
        Ok(())
    }

    async fn user_exists(&mut self, user_id: &str) -> Result<bool> {
        Ok(self.working.users.contains_key(user_id))
    }

    async fn find_reward(&mut self, reward_id: &str) -> Result<Option<Reward>> {
        Ok(self.working.rewards.get(reward_id).cloned())
    }

    async fn set_reward_active(&mut self, reward_id: &str, active: bool) -> Result<Option<Reward>> {
        Ok(self.working.rewards.get_mut(reward_id).map(|reward| {
            reward.active = active;
            reward.clone()
        }))
    }

    async fn balance(&mut self, user_id: &str) -> Result<Option<i64>> {
        Ok(self.working.balances.get(user_id).copied())
    }

    async fn increment_balance(&mut self, user_id: &str, delta: i64) -> Result<i64> {
        self.working.increment_balance(user_id, delta)
    }

    async fn set_balance(&mut self, user_id: &str, points: i64) -> Result<i64> {
        if points < 0 {
            return Err(StorageError::Constraint(
                "CHECK constraint failed: points >= 0".to_string(),
            ));
        }
        Ok(self
            .working
            .balances
            .insert(user_id.to_string(), points)
            .unwrap_or(0))
    }

    async fn insert_claim(&mut self, claim: &Claim) -> Result<()> {
        self.working.insert_claim(claim)
    }

    async fn find_claim(&mut self, claim_id: &str) -> Result<Option<Claim>> {
        Ok(self.working.claims.get(claim_id).cloned())
    }

    async fn mark_refunded(&mut self, claim_id: &str, mark: &RefundMark) -> Result<()> {
        let claim = self
            .working
            .claims
            .get_mut(claim_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "claim",
                id: claim_id.to_string(),
            })?;
        claim.status = ClaimStatus::Refunded;
        claim.refund_reason = Some(mark.reason);
        claim.refunded_at = Some(mark.refunded_at);
        claim.refunded_by = mark.refunded_by.clone();
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        self.working.audit.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MockLedgerTx {
            mut guard,
            working,
            faults,
        } = *self;
        if Faults::take(&faults.commits).await {
            return Err(injected_busy());
        }
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
