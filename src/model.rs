//! Ledger data model.
//!
//! Plain data carried between the storage backends and the services.
//! Timestamps are UTC and persisted as RFC 3339 text.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A loyalty program member. Owns at most one points balance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
        }
    }
}

/// A reward that can be claimed by spending `cost_points`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub id: String,
    pub name: String,
    pub cost_points: i64,
    pub active: bool,
}

impl Reward {
    pub fn new(id: impl Into<String>, name: impl Into<String>, cost_points: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cost_points,
            active: true,
        }
    }
}

/// Claim lifecycle. `Claimed` is the only state counted as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Claimed,
    Refunded,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claimed" => Ok(ClaimStatus::Claimed),
            "refunded" => Ok(ClaimStatus::Refunded),
            other => Err(format!("unknown claim status: {}", other)),
        }
    }
}

/// Why a claim was reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    UserRequest,
    AdminAction,
    SystemError,
    Duplicate,
}

impl RefundReason {
    pub const ALL: [RefundReason; 4] = [
        RefundReason::UserRequest,
        RefundReason::AdminAction,
        RefundReason::SystemError,
        RefundReason::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::UserRequest => "user_request",
            RefundReason::AdminAction => "admin_action",
            RefundReason::SystemError => "system_error",
            RefundReason::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for RefundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RefundReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "refund reason must be one of: {}",
                    RefundReason::ALL.map(|r| r.as_str()).join(", ")
                )
            })
    }
}

/// Durable record that a user spent a reward.
///
/// Never deleted. Only the refund engine moves it to `Refunded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub id: String,
    pub user_id: String,
    pub reward_id: String,
    pub idempotency_key: String,
    pub status: ClaimStatus,
    pub created_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refunded_by: Option<String>,
    pub refund_reason: Option<RefundReason>,
}

impl Claim {
    /// A fresh active claim with a random v4 id.
    pub fn new(user_id: &str, reward_id: &str, idempotency_key: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            reward_id: reward_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            status: ClaimStatus::Claimed,
            created_at: Utc::now(),
            refunded_at: None,
            refunded_by: None,
            refund_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ClaimStatus::Claimed
    }
}

/// Fields written when a claim transitions to `Refunded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundMark {
    pub reason: RefundReason,
    pub refunded_at: DateTime<Utc>,
    pub refunded_by: Option<String>,
}

/// A refunded claim joined with the cost of its reward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundedClaim {
    pub claim: Claim,
    pub cost_points: i64,
}

/// Terminal response bound to `(user_id, idempotency_key)`.
///
/// Immutable once written; replayed verbatim on every repeat of the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub user_id: String,
    pub idempotency_key: String,
    pub reward_id: String,
    pub response_body: String,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refund_reason_round_trips_wire_names() {
        for reason in RefundReason::ALL {
            assert_eq!(reason.as_str().parse::<RefundReason>(), Ok(reason));
        }
    }

    #[test]
    fn test_refund_reason_rejects_unknown() {
        let err = "because".parse::<RefundReason>().unwrap_err();
        assert!(err.contains("user_request"));
    }

    #[test]
    fn test_new_claim_is_active() {
        let claim = Claim::new("user-1", "reward-1", "key");
        assert!(claim.is_active());
        assert!(uuid::Uuid::parse_str(&claim.id).is_ok());
        assert!(claim.refunded_at.is_none());
    }

    #[test]
    fn test_claim_serializes_camel_case() {
        let claim = Claim::new("user-1", "reward-1", "key");
        let json = serde_json::to_value(&claim).unwrap();
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["status"], "claimed");
        assert!(json["refundedAt"].is_null());
    }
}
