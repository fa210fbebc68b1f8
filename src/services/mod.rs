//! Loyalty services.
//!
//! Each service is a cheap, cloneable handle over the shared ledger store
//! and collaborators. `Services` wires them together from a `Config`.

use std::sync::Arc;

use tracing::warn;

use crate::audit::{AuditSink, StoreAuditSink};
use crate::cache::LedgerCache;
use crate::config::Config;
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::storage::{LedgerStore, LedgerTx};
use crate::utils::metrics::ClaimMetrics;

pub mod claim;
pub mod gateway;
pub mod points;
pub mod refund;
pub mod rewards;

pub use claim::{ClaimReply, ClaimService};
pub use gateway::ClaimGateway;
pub use points::{BulkPointsOperation, BulkPointsReport, PointsBalance, PointsLedger, PointsOverride};
pub use refund::{BulkRefundEntry, BulkRefundReport, RefundResult, RefundService, RefundStatistics};
pub use rewards::RewardCatalog;

/// Shared handles every service needs.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn LedgerStore>,
    pub metrics: Arc<ClaimMetrics>,
    pub audit: Arc<dyn AuditSink>,
    pub cache: Arc<LedgerCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

impl Services {
    /// Wire services over `store`. Audit entries go to the store's audit
    /// table and counters to the process-wide metrics.
    pub fn new(store: Arc<dyn LedgerStore>, config: Config) -> Self {
        Self {
            audit: Arc::new(StoreAuditSink::new(Arc::clone(&store))),
            metrics: ClaimMetrics::global(),
            cache: Arc::new(LedgerCache::new(&config.cache)),
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            config: Arc::new(config),
            store,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ClaimMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn claims(&self) -> ClaimService {
        ClaimService::new(self)
    }

    pub fn points(&self) -> PointsLedger {
        PointsLedger::new(self)
    }

    pub fn refunds(&self) -> RefundService {
        RefundService::new(self)
    }

    pub fn rewards(&self) -> RewardCatalog {
        RewardCatalog::new(self)
    }

    pub fn gateway(&self) -> ClaimGateway {
        ClaimGateway::new(self)
    }
}

/// Close a transaction according to `result`: commit on `Ok`, roll back on
/// `Err`. A failed rollback is logged and the original error returned.
pub(crate) async fn finish<T>(tx: Box<dyn LedgerTx>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}
