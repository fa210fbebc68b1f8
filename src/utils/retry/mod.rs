//! Retry of transient storage failures with exponential backoff.
//!
//! Only errors whose kind is `Transient` (lock timeout/busy, deadlock,
//! serialization failure) are retried. Everything else, business outcomes
//! included, is returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use tracing::warn;

use crate::error::{ErrorKind, Result};
use crate::utils::metrics::{ClaimMetrics, Counter};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds. Doubles each retry.
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff schedule: base * 2^n, capped, no jitter, `max_retries` steps.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay())
            .with_max_delay(self.max_delay())
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
    }
}

/// Run `op`, re-invoking it while it fails transiently and the retry budget
/// lasts. Each retry bumps `claim_retry_total` and logs the attempt number
/// and reason. The last error is returned once the budget is spent.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    metrics: &ClaimMetrics,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = config.backoff().build();
    let mut attempt: u32 = 0;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == ErrorKind::Transient => e,
            Err(e) => return Err(e),
        };

        let Some(delay) = backoff.next() else {
            return Err(err);
        };
        attempt += 1;
        metrics.increment(Counter::Retry);
        warn!(
            operation,
            attempt,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            reason = %err,
            "claim retry"
        );
        tokio::time::sleep(delay).await;
    }
}
