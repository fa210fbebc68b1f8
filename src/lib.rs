//! Loyalty - reward claim pipeline
//!
//! An idempotent, concurrency-safe backend for spending loyalty points on
//! rewards. Every claim is keyed by a caller-supplied idempotency key so
//! unreliable clients can retry freely; the storage engine's unique
//! constraints decide every race, and transient storage failures are retried
//! with exponential backoff before surfacing.
//!
//! ## Layers
//! ```text
//! ClaimGateway (rate limit + validation)
//!        |
//!        v
//! ClaimService ----> LedgerStore (SQLite / in-memory)
//! RefundService         |
//! PointsLedger          +--> IdempotencyRecord, Claim, PointsBalance
//! RewardCatalog
//!        |
//!        +--> ClaimMetrics, AuditSink, LedgerCache (collaborators)
//! ```

pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod rate_limit;
pub mod services;
pub mod storage;
pub mod utils;
pub mod validation;

pub use error::{ErrorKind, LoyaltyError};
pub use services::{
    ClaimGateway, ClaimReply, ClaimService, PointsLedger, RefundService, RewardCatalog, Services,
};
