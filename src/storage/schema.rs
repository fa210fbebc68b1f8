//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Users table schema.
#[derive(Iden)]
pub enum Users {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "created_at"]
    CreatedAt,
}

/// Point balances, one row per user.
#[derive(Iden)]
pub enum LoyaltyPoints {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "points"]
    Points,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Rewards table schema.
#[derive(Iden)]
pub enum Rewards {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "cost_points"]
    CostPoints,
    #[iden = "active"]
    Active,
}

/// Reward claims table schema.
#[derive(Iden)]
pub enum RewardClaims {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "user_id"]
    UserId,
    #[iden = "reward_id"]
    RewardId,
    #[iden = "idempotency_key"]
    IdempotencyKey,
    #[iden = "status"]
    Status,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "refunded_at"]
    RefundedAt,
    #[iden = "refunded_by"]
    RefundedBy,
    #[iden = "refund_reason"]
    RefundReason,
}

/// Idempotency records table schema.
#[derive(Iden)]
pub enum IdempotencyRecords {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "idempotency_key"]
    IdempotencyKey,
    #[iden = "reward_id"]
    RewardId,
    #[iden = "response_body"]
    ResponseBody,
    #[iden = "status_code"]
    StatusCode,
    #[iden = "created_at"]
    CreatedAt,
}

/// Audit log table schema.
#[derive(Iden)]
pub enum AuditLog {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "action"]
    Action,
    #[iden = "actor_id"]
    ActorId,
    #[iden = "resource_id"]
    ResourceId,
    #[iden = "resource_type"]
    ResourceType,
    #[iden = "status"]
    Status,
    #[iden = "metadata"]
    Metadata,
    #[iden = "created_at"]
    CreatedAt,
}

/// SQL for creating the users and balances tables.
pub const CREATE_USERS_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT NOT NULL PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS loyalty_points (
    user_id TEXT NOT NULL PRIMARY KEY REFERENCES users(id),
    points INTEGER NOT NULL CHECK (points >= 0),
    updated_at TEXT NOT NULL
);
"#;

/// SQL for creating the rewards table.
pub const CREATE_REWARDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rewards (
    id TEXT NOT NULL PRIMARY KEY,
    name TEXT NOT NULL,
    cost_points INTEGER NOT NULL CHECK (cost_points > 0),
    active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_rewards_active ON rewards(active);
"#;

/// SQL for creating the claims table.
///
/// The partial unique index allows at most one claim in `claimed` status
/// per (user, reward); refunded claims do not count.
pub const CREATE_CLAIMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reward_claims (
    id TEXT NOT NULL PRIMARY KEY,
    user_id TEXT NOT NULL,
    reward_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'claimed',
    created_at TEXT NOT NULL,
    refunded_at TEXT,
    refunded_by TEXT,
    refund_reason TEXT,
    UNIQUE (user_id, idempotency_key)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_reward_claims_active
    ON reward_claims(user_id, reward_id) WHERE status = 'claimed';
CREATE INDEX IF NOT EXISTS idx_reward_claims_user ON reward_claims(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_reward_claims_refunded ON reward_claims(status, refunded_at);
"#;

/// SQL for creating the idempotency records table.
pub const CREATE_IDEMPOTENCY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_records (
    user_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    reward_id TEXT NOT NULL,
    response_body TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (user_id, idempotency_key)
);
"#;

/// SQL for creating the audit log table.
pub const CREATE_AUDIT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT NOT NULL PRIMARY KEY,
    action TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    status TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_resource ON audit_log(resource_id, created_at);
"#;

/// All schema statements, in creation order.
pub const SCHEMA: &[&str] = &[
    CREATE_USERS_TABLES,
    CREATE_REWARDS_TABLE,
    CREATE_CLAIMS_TABLE,
    CREATE_IDEMPOTENCY_TABLE,
    CREATE_AUDIT_TABLE,
];
