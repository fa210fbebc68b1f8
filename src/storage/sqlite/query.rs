//! Ledger statements shared by pooled reads and open transactions.
//!
//! Every function runs against a single `SqliteConnection`, so the same
//! statement serves the non-transactional fast path (on a pooled
//! connection) and the transactional path (on the connection holding
//! `BEGIN IMMEDIATE`).

use chrono::{DateTime, Utc};
use sea_query::{Alias, Expr, Func, OnConflict, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::audit::AuditEntry;
use crate::model::{
    Claim, ClaimStatus, IdempotencyRecord, RefundMark, RefundedClaim, Reward, User,
};
use crate::storage::helpers::{parse_optional_rfc3339, parse_rfc3339, to_rfc3339};
use crate::storage::schema::{
    AuditLog, IdempotencyRecords, LoyaltyPoints, RewardClaims, Rewards, Users,
};
use crate::storage::{Result, StorageError};

const CLAIM_COLUMNS: [RewardClaims; 9] = [
    RewardClaims::Id,
    RewardClaims::UserId,
    RewardClaims::RewardId,
    RewardClaims::IdempotencyKey,
    RewardClaims::Status,
    RewardClaims::CreatedAt,
    RewardClaims::RefundedAt,
    RewardClaims::RefundedBy,
    RewardClaims::RefundReason,
];

fn corrupt(detail: impl Into<String>) -> StorageError {
    StorageError::Corrupt(detail.into())
}

// ============================================================================
// Row decoding
// ============================================================================

fn decode_claim(row: &SqliteRow) -> Result<Claim> {
    let status: String = row.try_get("status")?;
    let refund_reason: Option<String> = row.try_get("refund_reason")?;
    Ok(Claim {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        reward_id: row.try_get("reward_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: status.parse().map_err(corrupt)?,
        created_at: parse_rfc3339(&row.try_get::<String, _>("created_at")?)?,
        refunded_at: parse_optional_rfc3339(row.try_get("refunded_at")?)?,
        refunded_by: row.try_get("refunded_by")?,
        refund_reason: refund_reason
            .map(|r| r.parse())
            .transpose()
            .map_err(corrupt)?,
    })
}

fn decode_reward(row: &SqliteRow) -> Result<Reward> {
    Ok(Reward {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cost_points: row.try_get("cost_points")?,
        active: row.try_get("active")?,
    })
}

fn decode_idempotency(row: &SqliteRow) -> Result<IdempotencyRecord> {
    let status_code: i64 = row.try_get("status_code")?;
    Ok(IdempotencyRecord {
        user_id: row.try_get("user_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        reward_id: row.try_get("reward_id")?,
        response_body: row.try_get("response_body")?,
        status_code: u16::try_from(status_code)
            .map_err(|_| corrupt(format!("status code out of range: {}", status_code)))?,
        created_at: parse_rfc3339(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn decode_audit(row: &SqliteRow) -> Result<AuditEntry> {
    let action: String = row.try_get("action")?;
    let status: String = row.try_get("status")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        action: action.parse().map_err(corrupt)?,
        actor_id: row.try_get("actor_id")?,
        resource_id: row.try_get("resource_id")?,
        resource_type: row.try_get("resource_type")?,
        status: status.parse().map_err(corrupt)?,
        metadata: match metadata {
            Some(text) => serde_json::from_str(&text)?,
            None => serde_json::Value::Null,
        },
        created_at: parse_rfc3339(&row.try_get::<String, _>("created_at")?)?,
    })
}

// ============================================================================
// Users and balances
// ============================================================================

pub async fn insert_user(conn: &mut SqliteConnection, user: &User) -> Result<()> {
    let (sql, values) = Query::insert()
        .into_table(Users::Table)
        .columns([Users::Id, Users::CreatedAt])
        .values_panic([user.id.clone().into(), to_rfc3339(&user.created_at).into()])
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(())
}

pub async fn user_exists(conn: &mut SqliteConnection, user_id: &str) -> Result<bool> {
    let (sql, values) = Query::select()
        .column(Users::Id)
        .from(Users::Table)
        .and_where(Expr::col(Users::Id).eq(user_id))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

pub async fn balance(conn: &mut SqliteConnection, user_id: &str) -> Result<Option<i64>> {
    let (sql, values) = Query::select()
        .column(LoyaltyPoints::Points)
        .from(LoyaltyPoints::Table)
        .and_where(Expr::col(LoyaltyPoints::UserId).eq(user_id))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| r.try_get::<i64, _>("points"))
        .transpose()
        .map_err(StorageError::from)
}

/// Add `delta` to a balance and return the new value.
///
/// Credits upsert the row. Debits only update an existing row: the CHECK on
/// `points` is evaluated against the VALUES row of an upsert before the
/// conflict is resolved, so a negative VALUES row would always be rejected.
pub async fn increment_balance(
    conn: &mut SqliteConnection,
    user_id: &str,
    delta: i64,
) -> Result<i64> {
    if delta < 0 {
        return debit_balance(conn, user_id, delta).await;
    }

    let now = to_rfc3339(&Utc::now());
    let (sql, values) = Query::insert()
        .into_table(LoyaltyPoints::Table)
        .columns([
            LoyaltyPoints::UserId,
            LoyaltyPoints::Points,
            LoyaltyPoints::UpdatedAt,
        ])
        .values_panic([user_id.into(), delta.into(), now.into()])
        .on_conflict(
            OnConflict::column(LoyaltyPoints::UserId)
                .value(LoyaltyPoints::Points, Expr::col(LoyaltyPoints::Points).add(delta))
                .update_column(LoyaltyPoints::UpdatedAt)
                .to_owned(),
        )
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    balance(conn, user_id).await?.ok_or_else(|| StorageError::NotFound {
        entity: "balance",
        id: user_id.to_string(),
    })
}

async fn debit_balance(conn: &mut SqliteConnection, user_id: &str, delta: i64) -> Result<i64> {
    let (sql, values) = Query::update()
        .table(LoyaltyPoints::Table)
        .value(LoyaltyPoints::Points, Expr::col(LoyaltyPoints::Points).add(delta))
        .value(LoyaltyPoints::UpdatedAt, to_rfc3339(&Utc::now()))
        .and_where(Expr::col(LoyaltyPoints::UserId).eq(user_id))
        .build_sqlx(SqliteQueryBuilder);

    let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "balance",
            id: user_id.to_string(),
        });
    }

    balance(conn, user_id).await?.ok_or_else(|| StorageError::NotFound {
        entity: "balance",
        id: user_id.to_string(),
    })
}

pub async fn set_balance(conn: &mut SqliteConnection, user_id: &str, points: i64) -> Result<i64> {
    let previous = balance(conn, user_id).await?.unwrap_or(0);

    let now = to_rfc3339(&Utc::now());
    let (sql, values) = Query::insert()
        .into_table(LoyaltyPoints::Table)
        .columns([
            LoyaltyPoints::UserId,
            LoyaltyPoints::Points,
            LoyaltyPoints::UpdatedAt,
        ])
        .values_panic([user_id.into(), points.into(), now.into()])
        .on_conflict(
            OnConflict::column(LoyaltyPoints::UserId)
                .update_columns([LoyaltyPoints::Points, LoyaltyPoints::UpdatedAt])
                .to_owned(),
        )
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(previous)
}

// ============================================================================
// Rewards
// ============================================================================

pub async fn upsert_reward(conn: &mut SqliteConnection, reward: &Reward) -> Result<()> {
    let (sql, values) = Query::insert()
        .into_table(Rewards::Table)
        .columns([Rewards::Id, Rewards::Name, Rewards::CostPoints, Rewards::Active])
        .values_panic([
            reward.id.clone().into(),
            reward.name.clone().into(),
            reward.cost_points.into(),
            reward.active.into(),
        ])
        .on_conflict(
            OnConflict::column(Rewards::Id)
                .update_columns([Rewards::Name, Rewards::CostPoints, Rewards::Active])
                .to_owned(),
        )
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(())
}

pub async fn find_reward(conn: &mut SqliteConnection, reward_id: &str) -> Result<Option<Reward>> {
    let (sql, values) = Query::select()
        .columns([Rewards::Id, Rewards::Name, Rewards::CostPoints, Rewards::Active])
        .from(Rewards::Table)
        .and_where(Expr::col(Rewards::Id).eq(reward_id))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode_reward).transpose()
}

pub async fn set_reward_active(
    conn: &mut SqliteConnection,
    reward_id: &str,
    active: bool,
) -> Result<Option<Reward>> {
    let (sql, values) = Query::update()
        .table(Rewards::Table)
        .value(Rewards::Active, active)
        .and_where(Expr::col(Rewards::Id).eq(reward_id))
        .build_sqlx(SqliteQueryBuilder);

    let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }
    find_reward(conn, reward_id).await
}

pub async fn list_active_rewards(conn: &mut SqliteConnection) -> Result<Vec<Reward>> {
    let (sql, values) = Query::select()
        .columns([Rewards::Id, Rewards::Name, Rewards::CostPoints, Rewards::Active])
        .from(Rewards::Table)
        .and_where(Expr::col(Rewards::Active).eq(true))
        .order_by(Rewards::Id, Order::Asc)
        .build_sqlx(SqliteQueryBuilder);

    let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
    rows.iter().map(decode_reward).collect()
}

// ============================================================================
// Claims
// ============================================================================

pub async fn insert_claim(conn: &mut SqliteConnection, claim: &Claim) -> Result<()> {
    let (sql, values) = Query::insert()
        .into_table(RewardClaims::Table)
        .columns(CLAIM_COLUMNS)
        .values_panic([
            claim.id.clone().into(),
            claim.user_id.clone().into(),
            claim.reward_id.clone().into(),
            claim.idempotency_key.clone().into(),
            claim.status.as_str().into(),
            to_rfc3339(&claim.created_at).into(),
            claim.refunded_at.as_ref().map(to_rfc3339).into(),
            claim.refunded_by.clone().into(),
            claim.refund_reason.map(|r| r.as_str().to_string()).into(),
        ])
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(())
}

pub async fn find_claim(conn: &mut SqliteConnection, claim_id: &str) -> Result<Option<Claim>> {
    let (sql, values) = Query::select()
        .columns(CLAIM_COLUMNS)
        .from(RewardClaims::Table)
        .and_where(Expr::col(RewardClaims::Id).eq(claim_id))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode_claim).transpose()
}

pub async fn mark_refunded(
    conn: &mut SqliteConnection,
    claim_id: &str,
    mark: &RefundMark,
) -> Result<()> {
    let (sql, values) = Query::update()
        .table(RewardClaims::Table)
        .values([
            (RewardClaims::Status, ClaimStatus::Refunded.as_str().into()),
            (RewardClaims::RefundReason, mark.reason.as_str().into()),
            (RewardClaims::RefundedAt, to_rfc3339(&mark.refunded_at).into()),
            (RewardClaims::RefundedBy, mark.refunded_by.clone().into()),
        ])
        .and_where(Expr::col(RewardClaims::Id).eq(claim_id))
        .build_sqlx(SqliteQueryBuilder);

    let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "claim",
            id: claim_id.to_string(),
        });
    }
    Ok(())
}

pub async fn list_claims(
    conn: &mut SqliteConnection,
    user_id: &str,
    status: Option<ClaimStatus>,
    limit: usize,
) -> Result<Vec<Claim>> {
    let mut query = Query::select();
    query
        .columns(CLAIM_COLUMNS)
        .from(RewardClaims::Table)
        .and_where(Expr::col(RewardClaims::UserId).eq(user_id))
        .order_by(RewardClaims::CreatedAt, Order::Desc)
        .limit(limit as u64);
    if let Some(status) = status {
        query.and_where(Expr::col(RewardClaims::Status).eq(status.as_str()));
    }
    let (sql, values) = query.build_sqlx(SqliteQueryBuilder);

    let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
    rows.iter().map(decode_claim).collect()
}

pub async fn refund_history(
    conn: &mut SqliteConnection,
    user_id: &str,
    limit: usize,
) -> Result<Vec<Claim>> {
    let (sql, values) = Query::select()
        .columns(CLAIM_COLUMNS)
        .from(RewardClaims::Table)
        .and_where(Expr::col(RewardClaims::UserId).eq(user_id))
        .and_where(Expr::col(RewardClaims::Status).eq(ClaimStatus::Refunded.as_str()))
        .order_by(RewardClaims::RefundedAt, Order::Desc)
        .limit(limit as u64)
        .build_sqlx(SqliteQueryBuilder);

    let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
    rows.iter().map(decode_claim).collect()
}

pub async fn refunded_since(
    conn: &mut SqliteConnection,
    since: DateTime<Utc>,
) -> Result<Vec<RefundedClaim>> {
    let (sql, values) = Query::select()
        .columns(CLAIM_COLUMNS.map(|c| (RewardClaims::Table, c)))
        .expr_as(
            Func::if_null(Expr::col((Rewards::Table, Rewards::CostPoints)), 0),
            Alias::new("cost_points"),
        )
        .from(RewardClaims::Table)
        .left_join(
            Rewards::Table,
            Expr::col((Rewards::Table, Rewards::Id)).equals((RewardClaims::Table, RewardClaims::RewardId)),
        )
        .and_where(
            Expr::col((RewardClaims::Table, RewardClaims::Status))
                .eq(ClaimStatus::Refunded.as_str()),
        )
        .and_where(Expr::col((RewardClaims::Table, RewardClaims::RefundedAt)).gte(to_rfc3339(&since)))
        .build_sqlx(SqliteQueryBuilder);

    let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| -> Result<RefundedClaim> {
            Ok(RefundedClaim {
                claim: decode_claim(row)?,
                cost_points: row.try_get("cost_points")?,
            })
        })
        .collect()
}

// ============================================================================
// Idempotency records
// ============================================================================

pub async fn find_idempotency(
    conn: &mut SqliteConnection,
    user_id: &str,
    idempotency_key: &str,
) -> Result<Option<IdempotencyRecord>> {
    let (sql, values) = Query::select()
        .columns([
            IdempotencyRecords::UserId,
            IdempotencyRecords::IdempotencyKey,
            IdempotencyRecords::RewardId,
            IdempotencyRecords::ResponseBody,
            IdempotencyRecords::StatusCode,
            IdempotencyRecords::CreatedAt,
        ])
        .from(IdempotencyRecords::Table)
        .and_where(Expr::col(IdempotencyRecords::UserId).eq(user_id))
        .and_where(Expr::col(IdempotencyRecords::IdempotencyKey).eq(idempotency_key))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode_idempotency).transpose()
}

pub async fn insert_idempotency(
    conn: &mut SqliteConnection,
    record: &IdempotencyRecord,
) -> Result<()> {
    let (sql, values) = Query::insert()
        .into_table(IdempotencyRecords::Table)
        .columns([
            IdempotencyRecords::UserId,
            IdempotencyRecords::IdempotencyKey,
            IdempotencyRecords::RewardId,
            IdempotencyRecords::ResponseBody,
            IdempotencyRecords::StatusCode,
            IdempotencyRecords::CreatedAt,
        ])
        .values_panic([
            record.user_id.clone().into(),
            record.idempotency_key.clone().into(),
            record.reward_id.clone().into(),
            record.response_body.clone().into(),
            i64::from(record.status_code).into(),
            to_rfc3339(&record.created_at).into(),
        ])
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(())
}

// ============================================================================
// Audit log
// ============================================================================

pub async fn append_audit(conn: &mut SqliteConnection, entry: &AuditEntry) -> Result<()> {
    let metadata = match &entry.metadata {
        serde_json::Value::Null => None,
        value => Some(serde_json::to_string(value)?),
    };

    let (sql, values) = Query::insert()
        .into_table(AuditLog::Table)
        .columns([
            AuditLog::Id,
            AuditLog::Action,
            AuditLog::ActorId,
            AuditLog::ResourceId,
            AuditLog::ResourceType,
            AuditLog::Status,
            AuditLog::Metadata,
            AuditLog::CreatedAt,
        ])
        .values_panic([
            entry.id.clone().into(),
            entry.action.as_str().into(),
            entry.actor_id.clone().into(),
            entry.resource_id.clone().into(),
            entry.resource_type.clone().into(),
            entry.status.as_str().into(),
            metadata.into(),
            to_rfc3339(&entry.created_at).into(),
        ])
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(())
}

pub async fn audit_entries(
    conn: &mut SqliteConnection,
    resource_id: &str,
) -> Result<Vec<AuditEntry>> {
    let (sql, values) = Query::select()
        .columns([
            AuditLog::Id,
            AuditLog::Action,
            AuditLog::ActorId,
            AuditLog::ResourceId,
            AuditLog::ResourceType,
            AuditLog::Status,
            AuditLog::Metadata,
            AuditLog::CreatedAt,
        ])
        .from(AuditLog::Table)
        .and_where(Expr::col(AuditLog::ResourceId).eq(resource_id))
        .order_by(AuditLog::CreatedAt, Order::Desc)
        .build_sqlx(SqliteQueryBuilder);

    let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
    rows.iter().map(decode_audit).collect()
}
