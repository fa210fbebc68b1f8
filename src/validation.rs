//! Input validation for external data.
//!
//! Everything here except the balance ceiling check runs before any storage
//! access, so malformed requests never open a transaction.

use uuid::{Uuid, Variant};

use crate::error::{LoyaltyError, Result};
use crate::model::RefundReason;

/// Bounds for validated fields.
pub mod limits {
    /// Maximum user/reward/claim id length, after trimming.
    pub const MAX_ID_LENGTH: usize = 255;
    /// Largest single point grant.
    pub const MAX_POINTS_AMOUNT: i64 = 1_000_000;
    pub const MIN_REASON_LENGTH: usize = 3;
    pub const MAX_REASON_LENGTH: usize = 255;
    /// Largest balance any user may hold.
    pub const MAX_BALANCE: i64 = 1_000_000_000_000;
    /// Most users in one bulk grant.
    pub const MAX_BULK_USERS: usize = 1000;
    /// Hyphenated UUID form.
    pub const UUID_LENGTH: usize = 36;
}

/// Error constants for validation failures.
pub mod errmsg {
    pub const ID_EMPTY: &str = "must not be empty";
    pub const ID_TOO_LONG: &str = "exceeds maximum length";
    pub const POINTS_NOT_POSITIVE: &str = "must be a positive integer";
    pub const POINTS_TOO_LARGE: &str = "exceeds maximum grant";
    pub const POINTS_NEGATIVE: &str = "must not be negative";
    pub const BALANCE_TOO_LARGE: &str = "balance would exceed maximum";
    pub const REASON_LENGTH: &str = "must be between 3 and 255 characters";
    pub const BULK_EMPTY: &str = "must name at least one user";
    pub const BULK_TOO_MANY: &str = "names too many users";
}

/// Validate an idempotency key.
///
/// Must be a hyphenated UUID with version nibble 4 and RFC 4122 variant.
pub fn validate_idempotency_key(key: &str) -> Result<Uuid> {
    if key.len() != limits::UUID_LENGTH {
        return Err(LoyaltyError::InvalidIdempotencyKey);
    }
    let uuid = Uuid::parse_str(key).map_err(|_| LoyaltyError::InvalidIdempotencyKey)?;
    if uuid.get_version_num() != 4 || uuid.get_variant() != Variant::RFC4122 {
        return Err(LoyaltyError::InvalidIdempotencyKey);
    }
    Ok(uuid)
}

/// Validate an entity id and return it trimmed.
pub fn validate_id(field: &'static str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LoyaltyError::validation(field, errmsg::ID_EMPTY));
    }
    if trimmed.chars().count() > limits::MAX_ID_LENGTH {
        return Err(LoyaltyError::validation(
            field,
            format!("{} (max: {})", errmsg::ID_TOO_LONG, limits::MAX_ID_LENGTH),
        ));
    }
    Ok(trimmed.to_string())
}

/// Validate a point grant: positive and at most `MAX_POINTS_AMOUNT`.
pub fn validate_points_amount(amount: i64) -> Result<i64> {
    if amount <= 0 {
        return Err(LoyaltyError::validation("points", errmsg::POINTS_NOT_POSITIVE));
    }
    if amount > limits::MAX_POINTS_AMOUNT {
        return Err(LoyaltyError::validation(
            "points",
            format!("{} (max: {})", errmsg::POINTS_TOO_LARGE, limits::MAX_POINTS_AMOUNT),
        ));
    }
    Ok(amount)
}

/// Validate an admin override value: between zero and `MAX_BALANCE`.
pub fn validate_override_value(points: i64) -> Result<i64> {
    if points < 0 {
        return Err(LoyaltyError::validation("points", errmsg::POINTS_NEGATIVE));
    }
    if points > limits::MAX_BALANCE {
        return Err(balance_too_large());
    }
    Ok(points)
}

/// Balance after crediting `amount` to `current`, if it stays within
/// `MAX_BALANCE`.
pub fn validate_credit(current: i64, amount: i64) -> Result<i64> {
    current
        .checked_add(amount)
        .filter(|updated| *updated <= limits::MAX_BALANCE)
        .ok_or_else(balance_too_large)
}

fn balance_too_large() -> LoyaltyError {
    LoyaltyError::validation(
        "points",
        format!("{} (max: {})", errmsg::BALANCE_TOO_LARGE, limits::MAX_BALANCE),
    )
}

/// Validate an admin-supplied reason and return it trimmed.
pub fn validate_reason(reason: &str) -> Result<String> {
    let trimmed = reason.trim();
    let len = trimmed.chars().count();
    if !(limits::MIN_REASON_LENGTH..=limits::MAX_REASON_LENGTH).contains(&len) {
        return Err(LoyaltyError::validation("reason", errmsg::REASON_LENGTH));
    }
    Ok(trimmed.to_string())
}

/// Validate a bulk user list, returning trimmed ids.
pub fn validate_bulk_user_ids(user_ids: &[String]) -> Result<Vec<String>> {
    if user_ids.is_empty() {
        return Err(LoyaltyError::validation("userIds", errmsg::BULK_EMPTY));
    }
    if user_ids.len() > limits::MAX_BULK_USERS {
        return Err(LoyaltyError::validation(
            "userIds",
            format!("{} (max: {})", errmsg::BULK_TOO_MANY, limits::MAX_BULK_USERS),
        ));
    }
    user_ids.iter().map(|id| validate_id("userIds", id)).collect()
}

/// Parse a refund reason from its wire form.
pub fn parse_refund_reason(value: &str) -> Result<RefundReason> {
    value
        .parse()
        .map_err(|message: String| LoyaltyError::validation("reason", message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_idempotency_key_accepts_v4() {
        let key = Uuid::new_v4().to_string();
        assert!(validate_idempotency_key(&key).is_ok());
        assert!(validate_idempotency_key("3f2504e0-4f89-41d3-9a0c-0305e82c3301").is_ok());
    }

    #[test]
    fn test_idempotency_key_rejects_other_shapes() {
        for key in [
            "",
            "not-a-uuid",
            // v1
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
            // simple form
            "3f2504e04f8941d39a0c0305e82c3301",
            // braced form
            "{3f2504e0-4f89-41d3-9a0c-0305e82c3301}",
            // wrong variant nibble
            "3f2504e0-4f89-41d3-ca0c-0305e82c3301",
        ] {
            let err = validate_idempotency_key(key).unwrap_err();
            assert_eq!(err.code(), "INVALID_IDEMPOTENCY_KEY", "key {:?}", key);
        }
    }

    #[test]
    fn test_id_trimmed_and_bounded() {
        assert_eq!(validate_id("userId", "  user-1 ").unwrap(), "user-1");
        assert!(validate_id("userId", "   ").is_err());
        assert!(validate_id("userId", &"x".repeat(255)).is_ok());
        let err = validate_id("userId", &"x".repeat(256)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_points_amount_bounds() {
        assert!(validate_points_amount(-5).is_err());
        assert!(validate_points_amount(0).is_err());
        assert_eq!(validate_points_amount(1).unwrap(), 1);
        assert_eq!(validate_points_amount(1_000_000).unwrap(), 1_000_000);
        assert!(validate_points_amount(1_000_001).is_err());
    }

    #[test]
    fn test_override_value_allows_zero() {
        assert_eq!(validate_override_value(0).unwrap(), 0);
        assert!(validate_override_value(-1).is_err());
    }

    #[test]
    fn test_override_value_capped() {
        assert_eq!(
            validate_override_value(limits::MAX_BALANCE).unwrap(),
            limits::MAX_BALANCE
        );
        let err = validate_override_value(i64::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_credit_within_ceiling() {
        assert_eq!(validate_credit(100, 50).unwrap(), 150);
        assert_eq!(
            validate_credit(limits::MAX_BALANCE - 1, 1).unwrap(),
            limits::MAX_BALANCE
        );
        assert!(validate_credit(limits::MAX_BALANCE, 1).is_err());
        assert!(validate_credit(i64::MAX, 1).is_err());
    }

    #[test]
    fn test_reason_length() {
        assert!(validate_reason("ab").is_err());
        assert_eq!(validate_reason("  fix  ").unwrap(), "fix");
        assert!(validate_reason(&"r".repeat(256)).is_err());
    }

    #[test]
    fn test_bulk_user_ids() {
        assert!(validate_bulk_user_ids(&[]).is_err());
        let ids: Vec<String> = (0..1001).map(|i| format!("user-{}", i)).collect();
        assert!(validate_bulk_user_ids(&ids).is_err());
        assert_eq!(
            validate_bulk_user_ids(&[" a ".to_string(), "b".to_string()]).unwrap(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_parse_refund_reason() {
        assert_eq!(
            parse_refund_reason("admin_action").unwrap(),
            RefundReason::AdminAction
        );
        let err = parse_refund_reason("because").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
