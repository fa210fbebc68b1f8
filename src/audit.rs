//! Audit trail collaborator.
//!
//! Every state-changing action emits an `AuditEntry`. Recording is
//! best-effort: `record_audit` swallows and logs sink failures so an audit
//! outage never fails the operation being audited.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::storage::{LedgerStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    ClaimReward,
    AddPoints,
    RefundClaim,
    OverridePoints,
    BulkAddPoints,
    UpdateReward,
}

impl AuditAction {
    const ALL: [AuditAction; 6] = [
        AuditAction::ClaimReward,
        AuditAction::AddPoints,
        AuditAction::RefundClaim,
        AuditAction::OverridePoints,
        AuditAction::BulkAddPoints,
        AuditAction::UpdateReward,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ClaimReward => "CLAIM_REWARD",
            AuditAction::AddPoints => "ADD_POINTS",
            AuditAction::RefundClaim => "REFUND_CLAIM",
            AuditAction::OverridePoints => "OVERRIDE_POINTS",
            AuditAction::BulkAddPoints => "BULK_ADD_POINTS",
            AuditAction::UpdateReward => "UPDATE_REWARD",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown audit action: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Failed,
    PartialSuccess,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Failed => "FAILED",
            AuditStatus::PartialSuccess => "PARTIAL_SUCCESS",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(AuditStatus::Success),
            "FAILED" => Ok(AuditStatus::Failed),
            "PARTIAL_SUCCESS" => Ok(AuditStatus::PartialSuccess),
            other => Err(format!("unknown audit status: {}", other)),
        }
    }
}

/// Append-only record of one state-changing action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub action: AuditAction,
    /// Who performed the action (the user for claims, the admin for overrides).
    pub actor_id: String,
    pub resource_id: String,
    pub resource_type: String,
    pub status: AuditStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        actor_id: impl Into<String>,
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        status: AuditStatus,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            actor_id: actor_id.into(),
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            status,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Fire-and-forget audit write. Failures are logged, never returned.
pub async fn record_audit(sink: &dyn AuditSink, entry: AuditEntry) {
    match sink.record(&entry).await {
        Ok(()) => debug!(action = %entry.action, resource_id = %entry.resource_id, "audit recorded"),
        Err(e) => warn!(
            action = %entry.action,
            resource_id = %entry.resource_id,
            error = %e,
            "audit log failed"
        ),
    }
}

/// Persists entries to the ledger's audit table, one short transaction each.
pub struct StoreAuditSink {
    store: Arc<dyn LedgerStore>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut tx = self.store.begin().await?;
        tx.append_audit(entry).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Keeps entries in memory. Can be switched to fail for testing.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
    fail: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("simulated audit failure".to_string()));
        }
        self.entries.write().await.push(entry.clone());
        Ok(())
    }
}

/// Discards every entry.
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }
}
