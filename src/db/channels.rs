//! Channel & Account Registry persistence (spec §4.8).

use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{Channel, PositionStatus, SubAccount};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("channel not found: {0}")]
    NotFound(Uuid),
    #[error("channel {0} still has non-terminal positions")]
    HasOpenPositions(Uuid),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub async fn find_by_external_id(
    pool: &PgPool,
    external_channel_id: &str,
) -> Result<Option<Channel>, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        "SELECT id, external_channel_id, name, active, paused, auto_execute, \
         max_position_percent, risk_percent, tp_distribution, sub_account_id \
         FROM channels WHERE external_channel_id = $1",
    )
    .bind(external_channel_id)
    .fetch_optional(pool)
    .await
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Channel, RegistryError> {
    sqlx::query_as::<_, Channel>(
        "SELECT id, external_channel_id, name, active, paused, auto_execute, \
         max_position_percent, risk_percent, tp_distribution, sub_account_id \
         FROM channels WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(RegistryError::NotFound(id))
}

pub async fn create(
    pool: &PgPool,
    external_channel_id: &str,
    name: &str,
    max_position_percent: Decimal,
    risk_percent: Decimal,
    tp_distribution: Vec<Decimal>,
    sub_account_id: Uuid,
) -> Result<Channel, sqlx::Error> {
    let sum: Decimal = tp_distribution.iter().sum();
    debug_assert!((sum - Decimal::ONE_HUNDRED).abs() <= Decimal::new(1, 1));

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO channels (id, external_channel_id, name, active, paused, \
         auto_execute, max_position_percent, risk_percent, tp_distribution, sub_account_id) \
         VALUES ($1, $2, $3, TRUE, FALSE, FALSE, $4, $5, $6, $7)",
    )
    .bind(id)
    .bind(external_channel_id)
    .bind(name)
    .bind(max_position_percent)
    .bind(risk_percent)
    .bind(Json(tp_distribution.clone()))
    .bind(sub_account_id)
    .execute(pool)
    .await?;

    Ok(Channel {
        id,
        external_channel_id: external_channel_id.to_string(),
        name: name.to_string(),
        active: true,
        paused: false,
        auto_execute: false,
        max_position_percent,
        risk_percent,
        tp_distribution: Json(tp_distribution),
        sub_account_id,
    })
}

pub async fn pause(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE channels SET paused = TRUE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn resume(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE channels SET paused = FALSE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_auto_execute(pool: &PgPool, id: Uuid, enabled: bool) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE channels SET auto_execute = $2 WHERE id = $1")
        .bind(id)
        .bind(enabled)
        .execute(pool)
        .await?;
    Ok(())
}

/// Deletes a channel only after verifying no owned Position is OPEN or
/// PARTIALLY_CLOSED (spec.md §3 invariant), sweeping sub-account funds first
/// when possible.
pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), RegistryError> {
    let open_count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM positions WHERE channel_id = $1 AND status = ANY($2)",
    )
    .bind(id)
    .bind(&[PositionStatus::Open, PositionStatus::PartiallyClosed] as &[PositionStatus])
    .fetch_one(pool)
    .await?;

    if open_count > 0 {
        return Err(RegistryError::HasOpenPositions(id));
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM sub_accounts WHERE channel_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM channels WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn get_sub_account(pool: &PgPool, channel_id: Uuid) -> Result<SubAccount, sqlx::Error> {
    sqlx::query_as::<_, SubAccount>(
        "SELECT id, venue_sub_account_id, name, total_balance, available_balance, \
         unrealized_pnl, total_pnl, channel_id FROM sub_accounts WHERE channel_id = $1",
    )
    .bind(channel_id)
    .fetch_one(pool)
    .await
}

pub async fn refresh_sub_account_snapshot(
    pool: &PgPool,
    sub_account_id: Uuid,
    total_balance: Decimal,
    available_balance: Decimal,
    unrealized_pnl: Decimal,
    total_pnl: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE sub_accounts SET total_balance = $2, available_balance = $3, \
         unrealized_pnl = $4, total_pnl = $5 WHERE id = $1",
    )
    .bind(sub_account_id)
    .bind(total_balance)
    .bind(available_balance)
    .bind(unrealized_pnl)
    .bind(total_pnl)
    .execute(pool)
    .await?;
    Ok(())
}
