//! Reward catalog and user registry.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::audit::{record_audit, AuditAction, AuditEntry, AuditSink, AuditStatus};
use crate::cache::{keys, LedgerCache};
use crate::error::{LoyaltyError, Result};
use crate::model::{Claim, Reward, User};
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::metrics::ClaimMetrics;
use crate::utils::retry::{with_retry, RetryConfig};
use crate::validation::{validate_id, validate_points_amount, validate_reason};

use super::{finish, Services};

/// Claims held in a user's cached claim list.
const CACHED_CLAIMS: usize = 50;

#[derive(Clone)]
pub struct RewardCatalog {
    store: Arc<dyn LedgerStore>,
    metrics: Arc<ClaimMetrics>,
    audit: Arc<dyn AuditSink>,
    cache: Arc<LedgerCache>,
    retry: RetryConfig,
}

impl RewardCatalog {
    pub fn new(services: &Services) -> Self {
        Self {
            store: Arc::clone(&services.store),
            metrics: Arc::clone(&services.metrics),
            audit: Arc::clone(&services.audit),
            cache: Arc::clone(&services.cache),
            retry: services.config.claims.retry.clone(),
        }
    }

    pub async fn create_user(&self, user_id: &str) -> Result<User> {
        let user = User::new(validate_id("userId", user_id)?);
        self.store.create_user(&user).await?;
        info!(user_id = %user.id, "user created");
        Ok(user)
    }

    /// Insert or replace a reward definition.
    pub async fn upsert_reward(&self, reward: Reward) -> Result<Reward> {
        let reward = Reward {
            id: validate_id("rewardId", &reward.id)?,
            name: validate_id("name", &reward.name)?,
            cost_points: validate_points_amount(reward.cost_points)?,
            active: reward.active,
        };
        self.store.upsert_reward(&reward).await?;
        self.cache.rewards.invalidate(keys::ACTIVE_REWARDS).await;
        info!(reward_id = %reward.id, cost_points = reward.cost_points, "reward saved");
        Ok(reward)
    }

    pub async fn list_active_rewards(&self) -> Result<Vec<Reward>> {
        let store = &self.store;
        self.cache
            .rewards
            .get_or_load(keys::ACTIVE_REWARDS, move || async move {
                Ok::<_, LoyaltyError>(store.list_active_rewards().await?)
            })
            .await
    }

    /// Enable or disable a reward. Existing claims are untouched; an
    /// inactive reward only stops new claims.
    pub async fn set_reward_active(
        &self,
        reward_id: &str,
        active: bool,
        admin_id: &str,
        reason: &str,
    ) -> Result<Reward> {
        let reward_id = validate_id("rewardId", reward_id)?;
        let admin_id = validate_id("adminId", admin_id)?;
        let reason = validate_reason(reason)?;

        let id = reward_id.as_str();
        let reward = with_retry(&self.retry, &self.metrics, "reward.update", move || async move {
            let mut tx = self.store.begin().await?;
            let result = set_active_in(tx.as_mut(), id, active).await;
            finish(tx, result).await
        })
        .await?;

        info!(reward_id = %reward.id, active, admin_id = %admin_id, "reward updated");
        record_audit(
            self.audit.as_ref(),
            AuditEntry::new(
                AuditAction::UpdateReward,
                &admin_id,
                &reward.id,
                "reward",
                AuditStatus::Success,
            )
            .with_metadata(json!({ "active": active, "reason": reason })),
        )
        .await;
        self.cache.invalidate_related("reward", None).await;

        Ok(reward)
    }

    /// A user's most recent claims, newest first.
    pub async fn claims_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Claim>> {
        let user_id = validate_id("userId", user_id)?;
        let store = &self.store;
        let user = user_id.as_str();
        let mut claims = self
            .cache
            .claims
            .get_or_load(&keys::user_claims(user), move || async move {
                Ok::<_, LoyaltyError>(store.list_claims(user, None, CACHED_CLAIMS).await?)
            })
            .await?;
        claims.truncate(limit);
        Ok(claims)
    }
}

async fn set_active_in(tx: &mut dyn LedgerTx, reward_id: &str, active: bool) -> Result<Reward> {
    tx.set_reward_active(reward_id, active)
        .await?
        .ok_or_else(|| LoyaltyError::RewardNotFound {
            reward_id: reward_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::Config;
    use crate::storage::MockLedgerStore;
    use uuid::Uuid;

    fn catalog() -> (Services, Arc<MockLedgerStore>, Arc<MemoryAuditSink>) {
        let store = Arc::new(MockLedgerStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let services = Services::new(store.clone(), Config::for_test())
            .with_metrics(Arc::new(ClaimMetrics::new()))
            .with_audit(audit.clone());
        (services, store, audit)
    }

    #[tokio::test]
    async fn test_create_user_twice_fails() {
        let (services, _, _) = catalog();
        let rewards = services.rewards();
        rewards.create_user("user-1").await.unwrap();
        assert!(rewards.create_user("user-1").await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_reward_validates_cost() {
        let (services, _, _) = catalog();
        let err = services
            .rewards()
            .upsert_reward(Reward::new("reward-1", "Coffee", 0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_active_list_refreshes_after_upsert() {
        let (services, _, _) = catalog();
        let rewards = services.rewards();
        rewards
            .upsert_reward(Reward::new("reward-1", "Coffee", 100))
            .await
            .unwrap();
        assert_eq!(rewards.list_active_rewards().await.unwrap().len(), 1);

        rewards
            .upsert_reward(Reward::new("reward-2", "Muffin", 40))
            .await
            .unwrap();
        assert_eq!(rewards.list_active_rewards().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deactivate_reward_blocks_new_claims() {
        let (services, store, audit) = catalog();
        let rewards = services.rewards();
        rewards.create_user("user-1").await.unwrap();
        rewards
            .upsert_reward(Reward::new("reward-1", "Coffee", 100))
            .await
            .unwrap();
        services.points().add_points("user-1", 500).await.unwrap();
        assert_eq!(rewards.list_active_rewards().await.unwrap().len(), 1);

        let reward = rewards
            .set_reward_active("reward-1", false, "admin-1", "out of stock")
            .await
            .unwrap();
        assert!(!reward.active);
        assert!(rewards.list_active_rewards().await.unwrap().is_empty());
        assert!(!store.find_reward("reward-1").await.unwrap().unwrap().active);

        let entries = audit.entries().await;
        let last = entries.last().unwrap();
        assert_eq!(last.action, AuditAction::UpdateReward);
        assert_eq!(last.metadata["active"], false);

        let reply = services
            .claims()
            .claim("user-1", "reward-1", &Uuid::new_v4().to_string())
            .await;
        assert_eq!(reply.status, 400);
        assert_eq!(reply.json().unwrap()["code"], "REWARD_INACTIVE");
    }

    #[tokio::test]
    async fn test_set_active_unknown_reward() {
        let (services, _, _) = catalog();
        let err = services
            .rewards()
            .set_reward_active("missing", false, "admin-1", "cleanup")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REWARD_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_claims_for_user_invalidated_by_claim() {
        let (services, _, _) = catalog();
        let rewards = services.rewards();
        rewards.create_user("user-1").await.unwrap();
        rewards
            .upsert_reward(Reward::new("reward-1", "Coffee", 100))
            .await
            .unwrap();
        services.points().add_points("user-1", 500).await.unwrap();
        assert!(rewards.claims_for_user("user-1", 10).await.unwrap().is_empty());

        let reply = services
            .claims()
            .claim("user-1", "reward-1", &Uuid::new_v4().to_string())
            .await;
        assert!(reply.is_success());

        let claims = rewards.claims_for_user("user-1", 10).await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].reward_id, "reward-1");
    }
}
