//! Read caches for balances, claim lists and the active reward list.
//!
//! Caches are never consulted for decisions made inside a transaction; they
//! only serve plain reads. Every balance- or claim-changing commit calls
//! `LedgerCache::invalidate_related`, and entries expire on their own after
//! the configured TTL.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::CacheConfig;
use crate::model::{Claim, Reward};

/// Cache key builders.
pub mod keys {
    pub const ACTIVE_REWARDS: &str = "rewards:active:list";

    pub fn user_points(user_id: &str) -> String {
        format!("points:user:{}", user_id)
    }

    pub fn user_claims(user_id: &str) -> String {
        format!("claims:user:{}", user_id)
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// String-keyed map whose entries expire `ttl` after being set.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`. An expired entry is removed and reads as a miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().await.remove(key);
        debug!(key, "cache entry expired");
        None
    }

    pub async fn set(&self, key: impl Into<String>, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(key.into(), entry);
    }

    /// Drop `key`. Returns whether an entry was present.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Return the cached value or load, store and return a fresh one.
    /// Load errors are passed through and nothing is stored.
    pub async fn get_or_load<E, F, Fut>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = load().await?;
        self.set(key, value.clone()).await;
        Ok(value)
    }
}

/// The ledger's read caches.
pub struct LedgerCache {
    pub points: TtlCache<i64>,
    pub claims: TtlCache<Vec<Claim>>,
    pub rewards: TtlCache<Vec<Reward>>,
}

impl LedgerCache {
    pub fn new(config: &CacheConfig) -> Self {
        let points_ttl = Duration::from_secs(config.points_ttl_secs);
        Self {
            points: TtlCache::new(points_ttl),
            claims: TtlCache::new(points_ttl),
            rewards: TtlCache::new(Duration::from_secs(config.rewards_ttl_secs)),
        }
    }

    /// Invalidation signal after a commit that changed balances or claims.
    ///
    /// Always drops the active reward list; drops the user's points and
    /// claim list when a user is named.
    pub async fn invalidate_related(&self, operation: &str, user_id: Option<&str>) {
        self.rewards.invalidate(keys::ACTIVE_REWARDS).await;
        if let Some(user_id) = user_id {
            self.points.invalidate(&keys::user_points(user_id)).await;
            self.claims.invalidate(&keys::user_claims(user_id)).await;
        }
        debug!(operation, user_id, "cache invalidated");
    }

    pub async fn clear(&self) {
        self.points.clear().await;
        self.claims.clear().await;
        self.rewards.clear().await;
    }

    pub async fn purge_expired(&self) -> usize {
        self.points.purge_expired().await
            + self.claims.purge_expired().await
            + self.rewards.purge_expired().await
    }
}

impl Default for LedgerCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.set("points:user:u1", 10_i64).await;
        assert_eq!(cache.get("points:user:u1").await, Some(10));
        assert_eq!(cache.get("points:user:u2").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = TtlCache::new(Duration::from_millis(5));
        cache.set("k", 1_i64).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = TtlCache::new(Duration::from_millis(5));
        cache.set("a", 1_i64).await;
        cache.set("b", 2_i64).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.purge_expired().await, 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_or_load_caches_success_only() {
        let cache = TtlCache::new(Duration::from_secs(30));

        let err: Result<i64, &str> = cache.get_or_load("k", || async { Err("boom") }).await;
        assert!(err.is_err());
        assert!(cache.is_empty().await);

        let first: Result<i64, &str> = cache.get_or_load("k", || async { Ok(7) }).await;
        let second: Result<i64, &str> = cache.get_or_load("k", || async { Ok(99) }).await;
        assert_eq!(first, Ok(7));
        assert_eq!(second, Ok(7));
    }

    #[tokio::test]
    async fn test_invalidate_related() {
        let cache = LedgerCache::default();
        cache.points.set(keys::user_points("u1"), 10).await;
        cache.points.set(keys::user_points("u2"), 20).await;
        cache.claims.set(keys::user_claims("u1"), Vec::new()).await;
        cache.rewards.set(keys::ACTIVE_REWARDS, Vec::new()).await;

        cache.invalidate_related("claim", Some("u1")).await;

        assert_eq!(cache.points.get(&keys::user_points("u1")).await, None);
        assert_eq!(cache.points.get(&keys::user_points("u2")).await, Some(20));
        assert!(cache.claims.get(&keys::user_claims("u1")).await.is_none());
        assert!(cache.rewards.get(keys::ACTIVE_REWARDS).await.is_none());
    }

    #[test]
    fn test_configured_ttls() {
        let cache = LedgerCache::default();
        assert_eq!(cache.points.ttl(), Duration::from_secs(30));
        assert_eq!(cache.rewards.ttl(), Duration::from_secs(300));
    }
}
