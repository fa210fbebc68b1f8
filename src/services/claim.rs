//! Claim orchestrator.
//!
//! `ClaimService::claim` spends a reward exactly once per idempotency key:
//!
//! 1. Fast-path replay: a stored record for `(user, key)` is replayed
//!    verbatim, or rejected with `IDEMPOTENCY_CONFLICT` if it is bound to a
//!    different reward. A transient failure of this read falls through to
//!    step 2, which repeats the lookup.
//! 2. Transactional attempt, retried on transient storage failures:
//!    re-check the record, insert the claim (the engine's unique index on
//!    active `(user, reward)` decides races), deduct the reward cost and
//!    bind the success body to the key, all in one transaction.
//! 3. A unique violation on the claim insert means another transaction
//!    already holds the active claim. If that winner used our key its
//!    record is replayed; otherwise a `DUPLICATE_CLAIM` body is bound to our
//!    key so every retry of it sees the same answer.
//!
//! Every outcome is returned as a `ClaimReply`; nothing escapes unmapped.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::audit::{record_audit, AuditAction, AuditEntry, AuditSink, AuditStatus};
use crate::cache::LedgerCache;
use crate::error::{ErrorKind, LoyaltyError, Result};
use crate::model::{Claim, IdempotencyRecord};
use crate::storage::{LedgerStore, LedgerTx, StorageError};
use crate::utils::metrics::{ClaimMetrics, Counter};
use crate::utils::retry::{with_retry, RetryConfig};
use crate::validation::{validate_id, validate_idempotency_key};

use super::{finish, Services};

/// Status bound to a successful claim.
pub const STATUS_CREATED: u16 = 201;

/// Body used if an error body cannot be serialized.
const FALLBACK_ERROR_BODY: &str =
    r#"{"success":false,"error":"Internal error","code":"TRANSACTION_ERROR"}"#;

/// Caller-facing result of a claim: HTTP-style status and raw JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReply {
    pub status: u16,
    pub body: String,
    /// True when `body` came from a stored idempotency record.
    pub replayed: bool,
}

impl ClaimReply {
    fn replay(record: &IdempotencyRecord) -> Self {
        Self {
            status: record.status_code,
            body: record.response_body.clone(),
            replayed: true,
        }
    }

    fn fresh(status: u16, body: String) -> Self {
        Self {
            status,
            body,
            replayed: false,
        }
    }

    pub(crate) fn from_error(err: &LoyaltyError, expose_detail: bool) -> Self {
        Self::fresh(err.status(), error_body(err, expose_detail))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parsed body.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.body)
    }
}

fn error_body(err: &LoyaltyError, expose_detail: bool) -> String {
    serde_json::to_string(&err.to_body(expose_detail))
        .unwrap_or_else(|_| FALLBACK_ERROR_BODY.to_string())
}

/// What a committed attempt decided.
enum Outcome {
    Created { claim: Claim, reply: ClaimReply },
    Replayed { reply: ClaimReply, after_duplicate: bool },
    Duplicate { reply: ClaimReply },
}

#[derive(Clone)]
pub struct ClaimService {
    store: Arc<dyn LedgerStore>,
    metrics: Arc<ClaimMetrics>,
    audit: Arc<dyn AuditSink>,
    cache: Arc<LedgerCache>,
    retry: RetryConfig,
    expose_detail: bool,
}

impl ClaimService {
    pub fn new(services: &Services) -> Self {
        Self {
            store: Arc::clone(&services.store),
            metrics: Arc::clone(&services.metrics),
            audit: Arc::clone(&services.audit),
            cache: Arc::clone(&services.cache),
            retry: services.config.claims.retry.clone(),
            expose_detail: services.config.errors.expose_detail,
        }
    }

    /// Claim `reward_id` for `user_id` under `idempotency_key`.
    pub async fn claim(&self, user_id: &str, reward_id: &str, idempotency_key: &str) -> ClaimReply {
        let (user_id, reward_id) = match validate_request(user_id, reward_id, idempotency_key) {
            Ok(ids) => ids,
            Err(e) => {
                info!(code = e.code(), "claim rejected");
                return ClaimReply::from_error(&e, self.expose_detail);
            }
        };

        self.metrics.increment(Counter::Attempt);
        info!(user_id = %user_id, reward_id = %reward_id, "claim attempt");

        match self.run(&user_id, &reward_id, idempotency_key).await {
            Ok(reply) => reply,
            Err(e) => self.reject(&user_id, &reward_id, e),
        }
    }

    async fn run(&self, user_id: &str, reward_id: &str, key: &str) -> Result<ClaimReply> {
        match self.store.find_idempotency(user_id, key).await {
            Ok(Some(record)) => {
                let reply = replay_or_conflict(&record, reward_id)?;
                self.metrics.increment(Counter::Replay);
                info!(user_id, reward_id, status = reply.status, "claim replay");
                return Ok(reply);
            }
            Ok(None) => {}
            Err(e) if e.is_transient() => {
                warn!(user_id, reward_id, error = %e, "idempotency lookup failed, using transactional path");
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = with_retry(&self.retry, &self.metrics, "claim", move || {
            self.attempt(user_id, reward_id, key)
        })
        .await?;

        Ok(match outcome {
            Outcome::Created { claim, reply } => {
                self.metrics.increment(Counter::Success);
                info!(user_id, reward_id, claim_id = %claim.id, "claim success");
                self.after_success(&claim).await;
                reply
            }
            Outcome::Replayed {
                reply,
                after_duplicate,
            } => {
                if after_duplicate {
                    self.metrics.increment(Counter::Duplicate);
                }
                self.metrics.increment(Counter::Replay);
                info!(user_id, reward_id, status = reply.status, "claim replay");
                reply
            }
            Outcome::Duplicate { reply } => {
                self.metrics.increment(Counter::Duplicate);
                warn!(user_id, reward_id, "claim duplicate");
                reply
            }
        })
    }

    /// One transactional attempt.
    async fn attempt(&self, user_id: &str, reward_id: &str, key: &str) -> Result<Outcome> {
        let mut tx = self.store.begin().await?;
        let result = self.attempt_in(tx.as_mut(), user_id, reward_id, key).await;
        finish(tx, result).await
    }

    async fn attempt_in(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: &str,
        reward_id: &str,
        key: &str,
    ) -> Result<Outcome> {
        if let Some(record) = tx.find_idempotency(user_id, key).await? {
            return Ok(Outcome::Replayed {
                reply: replay_or_conflict(&record, reward_id)?,
                after_duplicate: false,
            });
        }

        if !tx.user_exists(user_id).await? {
            return Err(LoyaltyError::UserNotFound {
                user_id: user_id.to_string(),
            });
        }
        let reward = tx
            .find_reward(reward_id)
            .await?
            .ok_or_else(|| LoyaltyError::RewardNotFound {
                reward_id: reward_id.to_string(),
            })?;
        if !reward.active {
            return Err(LoyaltyError::RewardInactive {
                reward_id: reward_id.to_string(),
            });
        }

        let claim = Claim::new(user_id, reward_id, key);
        match tx.insert_claim(&claim).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                return self.resolve_duplicate(tx, user_id, reward_id, key).await;
            }
            Err(e) => return Err(e.into()),
        }

        let available = tx.balance(user_id).await?.unwrap_or(0);
        if available < reward.cost_points {
            return Err(LoyaltyError::InsufficientPoints {
                required: reward.cost_points,
                available,
            });
        }
        tx.increment_balance(user_id, -reward.cost_points).await?;

        let data = serde_json::to_value(&claim).map_err(StorageError::from)?;
        let body = json!({ "success": true, "data": data }).to_string();
        tx.insert_idempotency(&IdempotencyRecord {
            user_id: user_id.to_string(),
            idempotency_key: key.to_string(),
            reward_id: reward_id.to_string(),
            response_body: body.clone(),
            status_code: STATUS_CREATED,
            created_at: Utc::now(),
        })
        .await?;

        Ok(Outcome::Created {
            claim,
            reply: ClaimReply::fresh(STATUS_CREATED, body),
        })
    }

    /// The active `(user, reward)` claim already exists. Replay if it was
    /// made under our key, otherwise bind a terminal duplicate to our key.
    async fn resolve_duplicate(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: &str,
        reward_id: &str,
        key: &str,
    ) -> Result<Outcome> {
        if let Some(record) = tx.find_idempotency(user_id, key).await? {
            return Ok(Outcome::Replayed {
                reply: replay_or_conflict(&record, reward_id)?,
                after_duplicate: true,
            });
        }

        let err = LoyaltyError::DuplicateClaim {
            reward_id: reward_id.to_string(),
        };
        let body = error_body(&err, false);
        tx.insert_idempotency(&IdempotencyRecord {
            user_id: user_id.to_string(),
            idempotency_key: key.to_string(),
            reward_id: reward_id.to_string(),
            response_body: body.clone(),
            status_code: err.status(),
            created_at: Utc::now(),
        })
        .await?;

        Ok(Outcome::Duplicate {
            reply: ClaimReply::fresh(err.status(), body),
        })
    }

    async fn after_success(&self, claim: &Claim) {
        record_audit(
            self.audit.as_ref(),
            AuditEntry::new(
                AuditAction::ClaimReward,
                &claim.user_id,
                &claim.id,
                "claim",
                AuditStatus::Success,
            )
            .with_metadata(json!({
                "rewardId": claim.reward_id,
                "idempotencyKey": claim.idempotency_key,
            })),
        )
        .await;
        self.cache
            .invalidate_related("claim", Some(&claim.user_id))
            .await;
    }

    /// Map a non-terminal failure to its reply.
    fn reject(&self, user_id: &str, reward_id: &str, err: LoyaltyError) -> ClaimReply {
        match err.kind() {
            ErrorKind::Transient | ErrorKind::Fatal => {
                self.metrics.increment(Counter::Fatal);
                error!(user_id, reward_id, error = %err, "claim fatal");
            }
            ErrorKind::Conflict => {
                self.metrics.increment(Counter::Conflict);
                warn!(user_id, reward_id, code = err.code(), "claim conflict");
            }
            _ => {
                info!(user_id, reward_id, code = err.code(), "claim rejected");
            }
        }
        ClaimReply::from_error(&err, self.expose_detail)
    }
}

fn validate_request(user_id: &str, reward_id: &str, key: &str) -> Result<(String, String)> {
    validate_idempotency_key(key)?;
    Ok((validate_id("userId", user_id)?, validate_id("rewardId", reward_id)?))
}

/// Replay `record`, unless it is bound to a different reward.
fn replay_or_conflict(record: &IdempotencyRecord, reward_id: &str) -> Result<ClaimReply> {
    if record.reward_id != reward_id {
        return Err(LoyaltyError::IdempotencyConflict {
            bound_reward_id: record.reward_id.clone(),
        });
    }
    Ok(ClaimReply::replay(record))
}
