//! Points ledger operations.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{record_audit, AuditAction, AuditEntry, AuditSink, AuditStatus};
use crate::cache::{keys, LedgerCache};
use crate::error::{LoyaltyError, Result};
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::metrics::ClaimMetrics;
use crate::utils::retry::{with_retry, RetryConfig};
use crate::validation::{
    validate_bulk_user_ids, validate_credit, validate_id, validate_override_value,
    validate_points_amount, validate_reason,
};

use super::{finish, Services};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsBalance {
    pub user_id: String,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsOverride {
    pub user_id: String,
    pub previous_points: i64,
    pub new_points: i64,
    pub reason: String,
    pub admin_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPointsOperation {
    pub user_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPointsReport {
    pub success_count: usize,
    pub failure_count: usize,
    pub operations: Vec<BulkPointsOperation>,
}

#[derive(Clone)]
pub struct PointsLedger {
    store: Arc<dyn LedgerStore>,
    metrics: Arc<ClaimMetrics>,
    audit: Arc<dyn AuditSink>,
    cache: Arc<LedgerCache>,
    retry: RetryConfig,
}

impl PointsLedger {
    pub fn new(services: &Services) -> Self {
        Self {
            store: Arc::clone(&services.store),
            metrics: Arc::clone(&services.metrics),
            audit: Arc::clone(&services.audit),
            cache: Arc::clone(&services.cache),
            retry: services.config.claims.retry.clone(),
        }
    }

    /// Grant `amount` points, creating the balance row if absent.
    pub async fn add_points(&self, user_id: &str, amount: i64) -> Result<PointsBalance> {
        let user_id = validate_id("userId", user_id)?;
        let amount = validate_points_amount(amount)?;

        let points = self.increment(&user_id, amount).await?;
        info!(user_id = %user_id, amount, points, "points added");

        record_audit(
            self.audit.as_ref(),
            AuditEntry::new(
                AuditAction::AddPoints,
                &user_id,
                &user_id,
                "user",
                AuditStatus::Success,
            )
            .with_metadata(json!({ "amount": amount, "newBalance": points })),
        )
        .await;
        self.cache.invalidate_related("points", Some(&user_id)).await;

        Ok(PointsBalance { user_id, points })
    }

    /// Current balance; a user without a balance row has zero.
    pub async fn get_balance(&self, user_id: &str) -> Result<PointsBalance> {
        let user_id = validate_id("userId", user_id)?;
        let user = user_id.as_str();
        let points = self
            .cache
            .points
            .get_or_load(&keys::user_points(user), move || async move {
                Ok::<_, LoyaltyError>(self.store.balance(user).await?.unwrap_or(0))
            })
            .await?;
        Ok(PointsBalance { user_id, points })
    }

    /// Replace a balance unconditionally. Audited with before/after values,
    /// including when the override fails.
    pub async fn override_points(
        &self,
        user_id: &str,
        new_points: i64,
        reason: &str,
        admin_id: &str,
    ) -> Result<PointsOverride> {
        let user_id = validate_id("userId", user_id)?;
        let admin_id = validate_id("adminId", admin_id)?;
        let new_points = validate_override_value(new_points)?;
        let reason = validate_reason(reason)?;

        let user = user_id.as_str();
        let result = with_retry(&self.retry, &self.metrics, "points.override", move || async move {
            let mut tx = self.store.begin().await?;
            let result = set_existing(tx.as_mut(), user, new_points).await;
            finish(tx, result).await
        })
        .await;

        let previous_points = match result {
            Ok(previous) => previous,
            Err(e) => {
                warn!(user_id = %user_id, admin_id = %admin_id, error = %e, "points override failed");
                record_audit(
                    self.audit.as_ref(),
                    AuditEntry::new(
                        AuditAction::OverridePoints,
                        &admin_id,
                        &user_id,
                        "user",
                        AuditStatus::Failed,
                    )
                    .with_metadata(json!({ "reason": reason, "error": e.to_string() })),
                )
                .await;
                return Err(e);
            }
        };

        info!(
            user_id = %user_id,
            admin_id = %admin_id,
            previous_points,
            new_points,
            "points overridden"
        );
        record_audit(
            self.audit.as_ref(),
            AuditEntry::new(
                AuditAction::OverridePoints,
                &admin_id,
                &user_id,
                "user",
                AuditStatus::Success,
            )
            .with_metadata(json!({
                "reason": reason,
                "previousPoints": previous_points,
                "newPoints": new_points,
                "difference": new_points - previous_points,
            })),
        )
        .await;
        self.cache.invalidate_related("points", Some(&user_id)).await;

        Ok(PointsOverride {
            user_id,
            previous_points,
            new_points,
            reason,
            admin_id,
        })
    }

    /// Grant `amount` to each user independently. One user's failure does
    /// not affect the others; every outcome is reported and audited.
    pub async fn bulk_add_points(
        &self,
        user_ids: &[String],
        amount: i64,
        reason: &str,
        admin_id: &str,
    ) -> Result<BulkPointsReport> {
        let user_ids = validate_bulk_user_ids(user_ids)?;
        let amount = validate_points_amount(amount)?;
        let reason = validate_reason(reason)?;
        let admin_id = validate_id("adminId", admin_id)?;

        let mut report = BulkPointsReport::default();
        for user_id in user_ids {
            let (status, metadata, message) = match self.increment(&user_id, amount).await {
                Ok(points) => {
                    report.success_count += 1;
                    self.cache.invalidate_related("points", Some(&user_id)).await;
                    (
                        AuditStatus::Success,
                        json!({ "reason": reason, "pointsToAdd": amount, "newBalance": points }),
                        None,
                    )
                }
                Err(e) => {
                    report.failure_count += 1;
                    let message = e.to_string();
                    (
                        AuditStatus::Failed,
                        json!({ "reason": reason, "pointsToAdd": amount, "error": message }),
                        Some(message),
                    )
                }
            };
            record_audit(
                self.audit.as_ref(),
                AuditEntry::new(AuditAction::BulkAddPoints, &admin_id, &user_id, "user", status)
                    .with_metadata(metadata),
            )
            .await;
            report.operations.push(BulkPointsOperation {
                success: message.is_none(),
                user_id,
                message,
            });
        }

        info!(
            admin_id = %admin_id,
            success_count = report.success_count,
            failure_count = report.failure_count,
            total_users = report.operations.len(),
            reason = %reason,
            "bulk points added"
        );
        Ok(report)
    }

    /// Transactional increment for an existing user. Returns the new balance.
    async fn increment(&self, user_id: &str, amount: i64) -> Result<i64> {
        with_retry(&self.retry, &self.metrics, "points.add", move || async move {
            let mut tx = self.store.begin().await?;
            let result = increment_existing(tx.as_mut(), user_id, amount).await;
            finish(tx, result).await
        })
        .await
    }
}

async fn require_user(tx: &mut dyn LedgerTx, user_id: &str) -> Result<()> {
    if !tx.user_exists(user_id).await? {
        return Err(LoyaltyError::UserNotFound {
            user_id: user_id.to_string(),
        });
    }
    Ok(())
}

async fn increment_existing(tx: &mut dyn LedgerTx, user_id: &str, amount: i64) -> Result<i64> {
    require_user(tx, user_id).await?;
    let current = tx.balance(user_id).await?.unwrap_or(0);
    validate_credit(current, amount)?;
    Ok(tx.increment_balance(user_id, amount).await?)
}

async fn set_existing(tx: &mut dyn LedgerTx, user_id: &str, points: i64) -> Result<i64> {
    require_user(tx, user_id).await?;
    Ok(tx.set_balance(user_id, points).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::Config;
    use crate::model::User;
    use crate::storage::MockLedgerStore;
    use crate::validation::limits;

    async fn ledger() -> (PointsLedger, Arc<MockLedgerStore>, Arc<MemoryAuditSink>) {
        let store = Arc::new(MockLedgerStore::new());
        for id in ["user-1", "user-2"] {
            store.create_user(&User::new(id)).await.unwrap();
        }
        let audit = Arc::new(MemoryAuditSink::new());
        let services = Services::new(store.clone(), Config::for_test())
            .with_metrics(Arc::new(ClaimMetrics::new()))
            .with_audit(audit.clone());
        (services.points(), store, audit)
    }

    #[tokio::test]
    async fn test_add_points_creates_then_increments() {
        let (ledger, store, audit) = ledger().await;

        assert_eq!(ledger.add_points("user-1", 100).await.unwrap().points, 100);
        assert_eq!(ledger.add_points("user-1", 50).await.unwrap().points, 150);
        assert_eq!(store.balance("user-1").await.unwrap(), Some(150));

        let entries = audit.entries().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == AuditAction::AddPoints));
    }

    #[tokio::test]
    async fn test_add_negative_points_rejected() {
        let (ledger, store, _) = ledger().await;
        ledger.add_points("user-1", 10).await.unwrap();

        let err = ledger.add_points("user-1", -5).await.unwrap_err();

        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(store.balance("user-1").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_add_points_unknown_user() {
        let (ledger, store, _) = ledger().await;
        let err = ledger.add_points("ghost", 10).await.unwrap_err();
        assert_eq!(err.code(), "USER_NOT_FOUND");
        assert_eq!(store.balance("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_balance_is_cached_and_invalidated() {
        let (ledger, store, _) = ledger().await;
        assert_eq!(ledger.get_balance("user-1").await.unwrap().points, 0);

        // A write behind the ledger's back is hidden by the cache...
        let mut tx = store.begin().await.unwrap();
        tx.increment_balance("user-1", 7).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(ledger.get_balance("user-1").await.unwrap().points, 0);

        // ...until a ledger write invalidates it.
        ledger.add_points("user-1", 3).await.unwrap();
        assert_eq!(ledger.get_balance("user-1").await.unwrap().points, 10);
    }

    #[tokio::test]
    async fn test_override_records_before_and_after() {
        let (ledger, store, audit) = ledger().await;
        ledger.add_points("user-1", 120).await.unwrap();

        let result = ledger
            .override_points("user-1", 30, "manual correction", "admin-1")
            .await
            .unwrap();

        assert_eq!(result.previous_points, 120);
        assert_eq!(result.new_points, 30);
        assert_eq!(store.balance("user-1").await.unwrap(), Some(30));

        let entries = audit.entries().await;
        let last = entries.last().unwrap();
        assert_eq!(last.action, AuditAction::OverridePoints);
        assert_eq!(last.actor_id, "admin-1");
        assert_eq!(last.metadata["previousPoints"], 120);
        assert_eq!(last.metadata["newPoints"], 30);
        assert_eq!(last.metadata["difference"], -90);
    }

    #[tokio::test]
    async fn test_failed_override_is_audited() {
        let (ledger, _, audit) = ledger().await;

        let err = ledger
            .override_points("ghost", 30, "manual correction", "admin-1")
            .await
            .unwrap_err();

        assert_eq!(err.code(), "USER_NOT_FOUND");
        let entries = audit.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Failed);
    }

    #[tokio::test]
    async fn test_override_rejects_negative_and_short_reason() {
        let (ledger, _, _) = ledger().await;
        assert!(ledger
            .override_points("user-1", -1, "manual correction", "admin-1")
            .await
            .is_err());
        assert!(ledger
            .override_points("user-1", 5, "no", "admin-1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_override_above_ceiling_rejected() {
        let (ledger, store, _) = ledger().await;
        ledger.add_points("user-1", 10).await.unwrap();

        let err = ledger
            .override_points("user-1", i64::MAX, "manual correction", "admin-1")
            .await
            .unwrap_err();

        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(store.balance("user-1").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_add_points_at_ceiling_rejected() {
        let (ledger, store, _) = ledger().await;
        ledger
            .override_points("user-1", limits::MAX_BALANCE, "manual correction", "admin-1")
            .await
            .unwrap();

        let err = ledger.add_points("user-1", 1).await.unwrap_err();

        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(store.balance("user-1").await.unwrap(), Some(limits::MAX_BALANCE));
    }

    #[tokio::test]
    async fn test_bulk_add_reports_partial_failure() {
        let (ledger, store, audit) = ledger().await;
        let users = vec![
            "user-1".to_string(),
            "ghost".to_string(),
            "user-2".to_string(),
        ];

        let report = ledger
            .bulk_add_points(&users, 25, "holiday promo", "admin-1")
            .await
            .unwrap();

        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert!(!report.operations[1].success);
        assert!(report.operations[1].message.is_some());
        assert_eq!(store.balance("user-1").await.unwrap(), Some(25));
        assert_eq!(store.balance("user-2").await.unwrap(), Some(25));

        let entries = audit.entries().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].status, AuditStatus::Failed);
    }
}
