//! Refund engine.
//!
//! A refund moves an active claim to `Refunded` and credits the reward's
//! cost back, in one transaction. Refunding is strict: a claim is refunded
//! at most once and a repeat fails with `ALREADY_REFUNDED`. Refunding frees
//! the `(user, reward)` pair, so the reward can be claimed again.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{record_audit, AuditAction, AuditEntry, AuditSink, AuditStatus};
use crate::cache::LedgerCache;
use crate::error::{LoyaltyError, Result};
use crate::model::{Claim, ClaimStatus, RefundMark, RefundReason};
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::metrics::ClaimMetrics;
use crate::utils::retry::{with_retry, RetryConfig};
use crate::validation::validate_id;

use super::{finish, Services};

/// Upper bound on claims touched by one bulk refund.
const BULK_REFUND_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub claim_id: String,
    pub user_id: String,
    pub refunded_points: i64,
    pub new_balance: i64,
    pub refunded_at: DateTime<Utc>,
    pub reason: RefundReason,
    pub refunded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRefundEntry {
    pub claim_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded_points: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRefundReport {
    pub results: Vec<BulkRefundEntry>,
    pub refunded_count: usize,
    pub failed_count: usize,
    pub points_restored: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundStatistics {
    pub total_refunds: usize,
    pub total_points_refunded: i64,
    pub average_refund_points: f64,
    /// Most frequent reason, or `"none"` when nothing was refunded.
    pub top_reason: String,
}

#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn LedgerStore>,
    metrics: Arc<ClaimMetrics>,
    audit: Arc<dyn AuditSink>,
    cache: Arc<LedgerCache>,
    retry: RetryConfig,
}

impl RefundService {
    pub fn new(services: &Services) -> Self {
        Self {
            store: Arc::clone(&services.store),
            metrics: Arc::clone(&services.metrics),
            audit: Arc::clone(&services.audit),
            cache: Arc::clone(&services.cache),
            retry: services.config.claims.retry.clone(),
        }
    }

    /// Refund one claim.
    pub async fn refund(
        &self,
        claim_id: &str,
        reason: RefundReason,
        refunded_by: Option<&str>,
    ) -> Result<RefundResult> {
        let claim_id = validate_id("claimId", claim_id)?;
        let refunded_by = refunded_by
            .map(|actor| validate_id("refundedBy", actor))
            .transpose()?;

        let id = claim_id.as_str();
        let actor = refunded_by.as_deref();
        let result = with_retry(&self.retry, &self.metrics, "refund", move || async move {
            let mut tx = self.store.begin().await?;
            let result = refund_in(tx.as_mut(), id, reason, actor).await;
            finish(tx, result).await
        })
        .await;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(claim_id = %claim_id, code = e.code(), "refund failed");
                return Err(e);
            }
        };

        info!(
            claim_id = %result.claim_id,
            user_id = %result.user_id,
            refunded_points = result.refunded_points,
            reason = %reason,
            "claim refunded"
        );
        record_audit(
            self.audit.as_ref(),
            AuditEntry::new(
                AuditAction::RefundClaim,
                result.refunded_by.as_deref().unwrap_or(&result.user_id),
                &result.claim_id,
                "claim",
                AuditStatus::Success,
            )
            .with_metadata(json!({
                "userId": result.user_id,
                "refundedPoints": result.refunded_points,
                "newBalance": result.new_balance,
                "reason": reason,
            })),
        )
        .await;
        self.cache
            .invalidate_related("refund", Some(&result.user_id))
            .await;

        Ok(result)
    }

    /// Refund every active claim of `user_id`, one transaction per claim.
    /// Failures are reported per claim and do not stop the batch.
    pub async fn bulk_refund(
        &self,
        user_id: &str,
        reason: RefundReason,
        refunded_by: Option<&str>,
    ) -> Result<BulkRefundReport> {
        let user_id = validate_id("userId", user_id)?;
        let claims = self
            .store
            .list_claims(&user_id, Some(ClaimStatus::Claimed), BULK_REFUND_LIMIT)
            .await?;

        let mut report = BulkRefundReport::default();
        for claim in claims {
            match self.refund(&claim.id, reason, refunded_by).await {
                Ok(result) => {
                    report.refunded_count += 1;
                    report.points_restored += result.refunded_points;
                    report.results.push(BulkRefundEntry {
                        claim_id: claim.id,
                        success: true,
                        refunded_points: Some(result.refunded_points),
                        error: None,
                    });
                }
                Err(e) => {
                    report.failed_count += 1;
                    report.results.push(BulkRefundEntry {
                        claim_id: claim.id,
                        success: false,
                        refunded_points: None,
                        error: Some(e.public_message()),
                    });
                }
            }
        }

        info!(
            user_id = %user_id,
            refunded_count = report.refunded_count,
            failed_count = report.failed_count,
            points_restored = report.points_restored,
            "bulk refund complete"
        );
        Ok(report)
    }

    /// The user's refunded claims, most recent first.
    pub async fn refund_history(&self, user_id: &str, limit: usize) -> Result<Vec<Claim>> {
        let user_id = validate_id("userId", user_id)?;
        Ok(self.store.refund_history(&user_id, limit).await?)
    }

    /// Aggregate refunds over the trailing `hours`.
    pub async fn refund_statistics(&self, hours: u32) -> Result<RefundStatistics> {
        let since = Utc::now() - Duration::hours(i64::from(hours));
        let refunded = self.store.refunded_since(since).await?;

        let total_refunds = refunded.len();
        let total_points_refunded: i64 = refunded.iter().map(|r| r.cost_points).sum();
        let average_refund_points = if total_refunds == 0 {
            0.0
        } else {
            total_points_refunded as f64 / total_refunds as f64
        };

        let mut counts: HashMap<RefundReason, usize> = HashMap::new();
        for reason in refunded.iter().filter_map(|r| r.claim.refund_reason) {
            *counts.entry(reason).or_default() += 1;
        }
        // Ties resolve to the first reason in declaration order.
        let mut top: Option<(RefundReason, usize)> = None;
        for reason in RefundReason::ALL {
            let count = counts.get(&reason).copied().unwrap_or(0);
            if count > 0 && top.map_or(true, |(_, best)| count > best) {
                top = Some((reason, count));
            }
        }

        Ok(RefundStatistics {
            total_refunds,
            total_points_refunded,
            average_refund_points,
            top_reason: top.map_or("none", |(reason, _)| reason.as_str()).to_string(),
        })
    }
}

async fn refund_in(
    tx: &mut dyn LedgerTx,
    claim_id: &str,
    reason: RefundReason,
    refunded_by: Option<&str>,
) -> Result<RefundResult> {
    let claim = tx
        .find_claim(claim_id)
        .await?
        .ok_or_else(|| LoyaltyError::ClaimNotFound {
            claim_id: claim_id.to_string(),
        })?;
    if !claim.is_active() {
        return Err(LoyaltyError::AlreadyRefunded {
            claim_id: claim_id.to_string(),
        });
    }

    // A reward deleted since the claim refunds nothing.
    let refunded_points = tx
        .find_reward(&claim.reward_id)
        .await?
        .map_or(0, |reward| reward.cost_points);
    let new_balance = tx.increment_balance(&claim.user_id, refunded_points).await?;

    let mark = RefundMark {
        reason,
        refunded_at: Utc::now(),
        refunded_by: refunded_by.map(str::to_string),
    };
    tx.mark_refunded(claim_id, &mark).await?;

    Ok(RefundResult {
        claim_id: claim.id,
        user_id: claim.user_id,
        refunded_points,
        new_balance,
        refunded_at: mark.refunded_at,
        reason,
        refunded_by: mark.refunded_by,
    })
}
