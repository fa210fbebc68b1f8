//! Shared storage helper functions.
//!
//! Timestamp conversion and transient-error classification used across
//! storage backend implementations.

use chrono::{DateTime, SecondsFormat, Utc};

use super::{Result, StorageError};

/// SQLite primary and extended result codes for BUSY and LOCKED.
const SQLITE_TRANSIENT_CODES: &[&str] = &["5", "6", "261", "262", "517", "518", "773"];

/// PostgreSQL SQLSTATEs: serialization_failure, deadlock_detected, lock_not_available.
const POSTGRES_TRANSIENT_CODES: &[&str] = &["40001", "40P01", "55P03"];

/// Lowercase message fragments that identify transient failures.
const TRANSIENT_MESSAGES: &[&str] = &[
    "database is locked",
    "database table is locked",
    "deadlock",
    "serialization failure",
    "could not serialize",
];

/// Format a timestamp for storage.
///
/// Fixed-width UTC form so that stored values sort lexically in time order.
pub fn to_rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored RFC 3339 timestamp.
pub fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp {
            value: value.to_string(),
        })
}

/// Parse an optional stored timestamp.
pub fn parse_optional_rfc3339(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_rfc3339).transpose()
}

/// Whether an error code belongs to the transient set.
pub fn is_transient_code(code: &str) -> bool {
    SQLITE_TRANSIENT_CODES.contains(&code) || POSTGRES_TRANSIENT_CODES.contains(&code)
}

/// Whether an error message carries a transient signature.
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT_MESSAGES
        .iter()
        .any(|fragment| message.contains(fragment))
}

/// Classify a sqlx error as transient (worth retrying the transaction).
#[cfg(feature = "sqlite")]
pub fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            db.code().is_some_and(|code| is_transient_code(&code))
                || is_transient_message(db.message())
        }
        other => is_transient_message(&other.to_string()),
    }
}
