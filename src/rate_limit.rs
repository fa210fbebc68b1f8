//! Request admission control.
//!
//! A fixed window per `"{client}:{endpoint}"` key. Admission is best-effort
//! and independent of claim correctness: a rejected request never reaches
//! storage, an admitted one goes through the normal pipeline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::error::{LoyaltyError, Result};

struct Window {
    count: u32,
    resets_at: Instant,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: Duration::from_secs(config.window_secs),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `client` to `endpoint`.
    ///
    /// Fails with `RateLimited` once the window's quota is spent; the error
    /// carries the seconds left until the window resets, rounded up so it is
    /// never zero while the caller is throttled.
    pub async fn check(&self, client: &str, endpoint: &str) -> Result<()> {
        let key = format!("{}:{}", client, endpoint);
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let window = windows.entry(key).or_insert(Window {
            count: 0,
            resets_at: now + self.window,
        });
        if window.resets_at <= now {
            window.count = 0;
            window.resets_at = now + self.window;
        }
        if window.count < self.max_requests {
            window.count += 1;
            return Ok(());
        }

        let remaining = window.resets_at.saturating_duration_since(now);
        let retry_after_secs =
            (remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)).max(1);
        warn!(client, endpoint, retry_after_secs, "rate limit exceeded");
        Err(LoyaltyError::RateLimited { retry_after_secs })
    }

    /// Drop windows that have already reset. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| window.resets_at > now);
        before - windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn limiter(max_requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            max_requests,
            window_secs,
        })
    }

    #[tokio::test]
    async fn test_allows_up_to_quota() {
        let limiter = limiter(3, 60);
        for _ in 0..3 {
            limiter.check("10.0.0.1", "claim").await.unwrap();
        }
        let err = limiter.check("10.0.0.1", "claim").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.status(), 429);
        match err {
            LoyaltyError::RateLimited { retry_after_secs } => {
                assert!((1..=60).contains(&retry_after_secs))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_after_rounds_up() {
        let limiter = limiter(1, 1);
        limiter.check("a", "claim").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        match limiter.check("a", "claim").await.unwrap_err() {
            LoyaltyError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_windows_are_per_client_and_endpoint() {
        let limiter = limiter(1, 60);
        limiter.check("a", "claim").await.unwrap();
        limiter.check("b", "claim").await.unwrap();
        limiter.check("a", "refund").await.unwrap();
        assert!(limiter.check("a", "claim").await.is_err());
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = limiter(1, 0);
        limiter.check("a", "claim").await.unwrap();
        // A zero-length window has always reset by the next call.
        limiter.check("a", "claim").await.unwrap();
        assert_eq!(limiter.purge_expired().await, 1);
    }
}
