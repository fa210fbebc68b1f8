//! Claim pipeline and collaborator configuration.

use serde::Deserialize;

use crate::utils::retry::RetryConfig;

/// Claim orchestrator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClaimsConfig {
    /// Transient-failure retry policy for claim and refund transactions.
    pub retry: RetryConfig,
}

/// Fixed-window admission limits per client and endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

/// Read-cache lifetimes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub points_ttl_secs: u64,
    pub rewards_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            points_ttl_secs: 30,
            rewards_ttl_secs: 300,
        }
    }
}

/// Error body rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ErrorsConfig {
    /// Attach developer-facing context to error bodies. Off in production.
    pub expose_detail: bool,
}
