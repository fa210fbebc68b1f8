//! Error taxonomy for the loyalty services.
//!
//! Every failure the services can report is a `LoyaltyError` variant. Each
//! variant maps to one `ErrorKind`, one HTTP-style status and one stable
//! string code. Callers dispatch on `kind()`, never on the variant name.

use serde::Serialize;
use serde_json::json;

use crate::storage::StorageError;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, LoyaltyError>;

/// Broad error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input, rejected before any storage access.
    Validation,
    /// Idempotency key bound to another reward, duplicate claim, already refunded.
    Conflict,
    /// Unknown user, reward or claim.
    NotFound,
    /// Balance too low or reward no longer claimable.
    InsufficientResource,
    /// Admission denied by the rate limiter.
    RateLimited,
    /// Lock/deadlock/serialization failure that outlived the retry budget.
    Transient,
    /// Anything else from storage.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum LoyaltyError {
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("Idempotency key must be a UUID v4")]
    InvalidIdempotencyKey,

    #[error("Idempotency key was already used for a different reward")]
    IdempotencyConflict { bound_reward_id: String },

    #[error("Reward has already been claimed: {reward_id}")]
    DuplicateClaim { reward_id: String },

    #[error("Claim has already been refunded: {claim_id}")]
    AlreadyRefunded { claim_id: String },

    #[error("User not found: {user_id}")]
    UserNotFound { user_id: String },

    #[error("Reward not found: {reward_id}")]
    RewardNotFound { reward_id: String },

    #[error("Claim not found: {claim_id}")]
    ClaimNotFound { claim_id: String },

    #[error("Reward is no longer active: {reward_id}")]
    RewardInactive { reward_id: String },

    #[error("Insufficient points: required {required}, available {available}")]
    InsufficientPoints { required: i64, available: i64 },

    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LoyaltyError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        LoyaltyError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LoyaltyError::Validation { .. } | LoyaltyError::InvalidIdempotencyKey => {
                ErrorKind::Validation
            }
            LoyaltyError::IdempotencyConflict { .. }
            | LoyaltyError::DuplicateClaim { .. }
            | LoyaltyError::AlreadyRefunded { .. } => ErrorKind::Conflict,
            LoyaltyError::UserNotFound { .. }
            | LoyaltyError::RewardNotFound { .. }
            | LoyaltyError::ClaimNotFound { .. } => ErrorKind::NotFound,
            LoyaltyError::RewardInactive { .. } | LoyaltyError::InsufficientPoints { .. } => {
                ErrorKind::InsufficientResource
            }
            LoyaltyError::RateLimited { .. } => ErrorKind::RateLimited,
            LoyaltyError::Storage(e) if e.is_transient() => ErrorKind::Transient,
            LoyaltyError::Storage(_) => ErrorKind::Fatal,
        }
    }

    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::InsufficientResource => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::Transient | ErrorKind::Fatal => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LoyaltyError::Validation { .. } => "VALIDATION_ERROR",
            LoyaltyError::InvalidIdempotencyKey => "INVALID_IDEMPOTENCY_KEY",
            LoyaltyError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            LoyaltyError::DuplicateClaim { .. } => "DUPLICATE_CLAIM",
            LoyaltyError::AlreadyRefunded { .. } => "ALREADY_REFUNDED",
            LoyaltyError::UserNotFound { .. } => "USER_NOT_FOUND",
            LoyaltyError::RewardNotFound { .. } => "REWARD_NOT_FOUND",
            LoyaltyError::ClaimNotFound { .. } => "CLAIM_NOT_FOUND",
            LoyaltyError::RewardInactive { .. } => "REWARD_INACTIVE",
            LoyaltyError::InsufficientPoints { .. } => "INSUFFICIENT_POINTS",
            LoyaltyError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            LoyaltyError::Storage(_) => "TRANSACTION_ERROR",
        }
    }

    /// Message safe to show end users. Storage internals are never included.
    pub fn public_message(&self) -> String {
        match self {
            LoyaltyError::Storage(_) => {
                "The operation could not be completed, please try again".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Developer-facing detail, attached to bodies only in non-production mode.
    pub fn context(&self) -> Option<serde_json::Value> {
        match self {
            LoyaltyError::Validation { field, .. } => Some(json!({ "field": field })),
            LoyaltyError::IdempotencyConflict { bound_reward_id } => {
                Some(json!({ "boundRewardId": bound_reward_id }))
            }
            LoyaltyError::DuplicateClaim { reward_id }
            | LoyaltyError::RewardNotFound { reward_id }
            | LoyaltyError::RewardInactive { reward_id } => Some(json!({ "rewardId": reward_id })),
            LoyaltyError::AlreadyRefunded { claim_id } | LoyaltyError::ClaimNotFound { claim_id } => {
                Some(json!({ "claimId": claim_id }))
            }
            LoyaltyError::UserNotFound { user_id } => Some(json!({ "userId": user_id })),
            LoyaltyError::InsufficientPoints {
                required,
                available,
            } => Some(json!({ "required": required, "available": available })),
            LoyaltyError::RateLimited { retry_after_secs } => {
                Some(json!({ "retryAfter": retry_after_secs }))
            }
            LoyaltyError::Storage(e) => Some(json!({ "cause": e.to_string() })),
            LoyaltyError::InvalidIdempotencyKey => None,
        }
    }

    /// Wire body for this error.
    pub fn to_body(&self, expose_detail: bool) -> ErrorBody {
        ErrorBody {
            success: false,
            error: self.public_message(),
            code: self.code(),
            context: if expose_detail { self.context() } else { None },
        }
    }
}

/// JSON shape of every failed response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_pairs() {
        let cases = [
            (LoyaltyError::validation("points", "must be positive"), 400, "VALIDATION_ERROR"),
            (LoyaltyError::InvalidIdempotencyKey, 400, "INVALID_IDEMPOTENCY_KEY"),
            (
                LoyaltyError::IdempotencyConflict {
                    bound_reward_id: "r".into(),
                },
                409,
                "IDEMPOTENCY_CONFLICT",
            ),
            (
                LoyaltyError::DuplicateClaim {
                    reward_id: "r".into(),
                },
                409,
                "DUPLICATE_CLAIM",
            ),
            (
                LoyaltyError::AlreadyRefunded {
                    claim_id: "c".into(),
                },
                409,
                "ALREADY_REFUNDED",
            ),
            (
                LoyaltyError::ClaimNotFound {
                    claim_id: "c".into(),
                },
                404,
                "CLAIM_NOT_FOUND",
            ),
            (
                LoyaltyError::InsufficientPoints {
                    required: 100,
                    available: 5,
                },
                400,
                "INSUFFICIENT_POINTS",
            ),
            (
                LoyaltyError::RateLimited {
                    retry_after_secs: 3,
                },
                429,
                "RATE_LIMIT_EXCEEDED",
            ),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status(), status, "{}", err);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_transient_storage_error_kind() {
        let err = LoyaltyError::from(StorageError::Busy("database is locked".into()));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_fatal_body_hides_internals() {
        let err = LoyaltyError::from(StorageError::Corrupt("bad status column".into()));
        assert_eq!(err.kind(), ErrorKind::Fatal);

        let body = err.to_body(false);
        assert!(!body.error.contains("bad status column"));
        assert!(body.context.is_none());

        let body = err.to_body(true);
        let context = body.context.unwrap();
        assert!(context["cause"].as_str().unwrap().contains("bad status column"));
    }

    #[test]
    fn test_error_body_serialization() {
        let body = LoyaltyError::IdempotencyConflict {
            bound_reward_id: "reward-1".into(),
        }
        .to_body(false);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "IDEMPOTENCY_CONFLICT");
        assert!(json.get("context").is_none());
    }
}
