//! Inbound boundary for claim and refund requests.
//!
//! Requests are admitted by the rate limiter before anything else runs. A
//! rejected request never reaches storage.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::validation::parse_refund_reason;

use super::claim::{ClaimReply, ClaimService};
use super::refund::{RefundResult, RefundService};
use super::Services;

pub const CLAIM_ENDPOINT: &str = "claim";
pub const REFUND_ENDPOINT: &str = "refund";

#[derive(Clone)]
pub struct ClaimGateway {
    limiter: Arc<RateLimiter>,
    claims: ClaimService,
    refunds: RefundService,
    expose_detail: bool,
}

impl ClaimGateway {
    pub fn new(services: &Services) -> Self {
        Self {
            limiter: Arc::clone(&services.rate_limiter),
            claims: services.claims(),
            refunds: services.refunds(),
            expose_detail: services.config.errors.expose_detail,
        }
    }

    /// `ClaimReward` for `client`. Always produces a reply; a throttled
    /// request gets `429 RATE_LIMIT_EXCEEDED`.
    pub async fn claim_reward(
        &self,
        client: &str,
        user_id: &str,
        reward_id: &str,
        idempotency_key: &str,
    ) -> ClaimReply {
        if let Err(e) = self.limiter.check(client, CLAIM_ENDPOINT).await {
            return ClaimReply::from_error(&e, self.expose_detail);
        }
        debug!(client, "claim admitted");
        self.claims.claim(user_id, reward_id, idempotency_key).await
    }

    /// Refund with the reason in its wire form.
    pub async fn refund_claim(
        &self,
        client: &str,
        claim_id: &str,
        reason: &str,
        refunded_by: Option<&str>,
    ) -> Result<RefundResult> {
        self.limiter.check(client, REFUND_ENDPOINT).await?;
        let reason = parse_refund_reason(reason)?;
        self.refunds.refund(claim_id, reason, refunded_by).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditSink;
    use crate::config::{Config, RateLimitConfig};
    use crate::model::{Reward, User};
    use crate::storage::{LedgerStore, LedgerTx, MockLedgerStore};
    use crate::utils::metrics::{ClaimMetrics, Counter};
    use uuid::Uuid;

    async fn gateway(max_requests: u32) -> (ClaimGateway, Arc<MockLedgerStore>, Arc<ClaimMetrics>) {
        let store = Arc::new(MockLedgerStore::new());
        store.create_user(&User::new("user-1")).await.unwrap();
        store
            .upsert_reward(&Reward::new("reward-1", "Coffee", 100))
            .await
            .unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.increment_balance("user-1", 1000).await.unwrap();
        tx.commit().await.unwrap();

        let mut config = Config::for_test();
        config.rate_limit = RateLimitConfig {
            max_requests,
            window_secs: 60,
        };
        let metrics = Arc::new(ClaimMetrics::new());
        let services = Services::new(store.clone(), config)
            .with_metrics(metrics.clone())
            .with_audit(Arc::new(NoopAuditSink));
        (services.gateway(), store, metrics)
    }

    #[tokio::test]
    async fn test_throttled_claim_never_reaches_storage() {
        let (gateway, store, metrics) = gateway(1).await;
        let key = Uuid::new_v4().to_string();

        let first = gateway.claim_reward("10.0.0.1", "user-1", "reward-1", &key).await;
        assert_eq!(first.status, 201);
        let begins = store.begin_count();

        let second = gateway.claim_reward("10.0.0.1", "user-1", "reward-1", &key).await;
        assert_eq!(second.status, 429);
        assert_eq!(second.json().unwrap()["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(store.begin_count(), begins);
        assert_eq!(metrics.get(Counter::Attempt), 1);

        // Other clients are admitted independently.
        let third = gateway.claim_reward("10.0.0.2", "user-1", "reward-1", &key).await;
        assert_eq!(third.status, 201);
        assert!(third.replayed);
    }

    #[tokio::test]
    async fn test_gateway_validates_after_admission() {
        let (gateway, _, _) = gateway(5).await;
        let reply = gateway
            .claim_reward("10.0.0.1", "user-1", "reward-1", "not-a-uuid")
            .await;
        assert_eq!(reply.status, 400);
        assert_eq!(reply.json().unwrap()["code"], "INVALID_IDEMPOTENCY_KEY");
    }

    #[tokio::test]
    async fn test_refund_claim_parses_reason() {
        let (gateway, _, _) = gateway(5).await;
        let reply = gateway
            .claim_reward("10.0.0.1", "user-1", "reward-1", &Uuid::new_v4().to_string())
            .await;
        let claim_id = reply.json().unwrap()["data"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let err = gateway
            .refund_claim("10.0.0.1", &claim_id, "because", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let result = gateway
            .refund_claim("10.0.0.1", &claim_id, "user_request", Some("admin-1"))
            .await
            .unwrap();
        assert_eq!(result.refunded_points, 100);
        assert_eq!(result.new_balance, 1000);
    }
}
