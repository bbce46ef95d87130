//! Signal persistence: creation, status transitions, and the dedup query
//! behind spec §4.4 step 5 / property P7 (idempotent replay).

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{Direction, Signal, SignalStatus, SignalType};

#[derive(Debug, thiserror::Error)]
pub enum SignalStoreError {
    #[error("signal not found: {0}")]
    NotFound(Uuid),
    #[error("signal {0} is already in a terminal state ({1:?})")]
    AlreadyTerminal(Uuid, SignalStatus),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

const SELECT_COLUMNS: &str = "id, channel_id, external_message_id, asset, direction, leverage, \
    entry_price, tp_levels, stop_loss, suggested_volume, confidence, raw_message, parsed, \
    message_timestamp, processed_at, type, status, status_reason";

#[allow(clippy::too_many_arguments)]
pub struct NewSignal {
    pub channel_id: Uuid,
    pub external_message_id: String,
    pub asset: Option<String>,
    pub direction: Option<Direction>,
    pub leverage: Option<i32>,
    pub entry_price: Option<Decimal>,
    pub tp_levels: Vec<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub suggested_volume: Option<Decimal>,
    pub confidence: Decimal,
    pub raw_message: String,
    pub parsed: Option<serde_json::Value>,
    pub message_timestamp: DateTime<Utc>,
    pub kind: SignalType,
}

/// P7: replaying `(channelId, messageId)` must yield at most one signal row.
/// Enforced both here (check-then-insert) and by the DB unique index as the
/// authoritative backstop under races.
pub async fn find_by_external_message(
    pool: &PgPool,
    channel_id: Uuid,
    external_message_id: &str,
) -> Result<Option<Signal>, sqlx::Error> {
    sqlx::query_as::<_, Signal>(&format!(
        "SELECT {SELECT_COLUMNS} FROM signals WHERE channel_id = $1 AND external_message_id = $2"
    ))
    .bind(channel_id)
    .bind(external_message_id)
    .fetch_optional(pool)
    .await
}

/// Dedup window (spec §4.4 step 5): an open Signal with the same
/// (channelId, asset, direction, entryPrice ± ε) processed in the last 24h.
pub async fn find_recent_duplicate(
    pool: &PgPool,
    channel_id: Uuid,
    asset: &str,
    direction: Direction,
    entry_price: Decimal,
    epsilon: Decimal,
    now: DateTime<Utc>,
) -> Result<Option<Signal>, sqlx::Error> {
    let window_start = now - Duration::hours(24);
    let lo = entry_price - epsilon;
    let hi = entry_price + epsilon;
    sqlx::query_as::<_, Signal>(&format!(
        "SELECT {SELECT_COLUMNS} FROM signals \
         WHERE channel_id = $1 AND asset = $2 AND direction = $3 \
         AND entry_price BETWEEN $4 AND $5 \
         AND message_timestamp >= $6 \
         AND status NOT IN ('FAILED') \
         ORDER BY message_timestamp DESC LIMIT 1"
    ))
    .bind(channel_id)
    .bind(asset)
    .bind(direction)
    .bind(lo)
    .bind(hi)
    .bind(window_start)
    .fetch_optional(pool)
    .await
}

pub async fn insert(pool: &PgPool, new: NewSignal) -> Result<Signal, sqlx::Error> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO signals (id, channel_id, external_message_id, asset, direction, leverage, \
         entry_price, tp_levels, stop_loss, suggested_volume, confidence, raw_message, parsed, \
         message_timestamp, processed_at, type, status) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,'PENDING')",
    )
    .bind(id)
    .bind(new.channel_id)
    .bind(&new.external_message_id)
    .bind(&new.asset)
    .bind(new.direction)
    .bind(new.leverage)
    .bind(new.entry_price)
    .bind(Json(new.tp_levels.clone()))
    .bind(new.stop_loss)
    .bind(new.suggested_volume)
    .bind(new.confidence)
    .bind(&new.raw_message)
    .bind(&new.parsed)
    .bind(new.message_timestamp)
    .bind(now)
    .bind(new.kind)
    .execute(pool)
    .await?;

    Ok(Signal {
        id,
        channel_id: new.channel_id,
        external_message_id: new.external_message_id,
        asset: new.asset,
        direction: new.direction,
        leverage: new.leverage,
        entry_price: new.entry_price,
        tp_levels: Json(new.tp_levels),
        stop_loss: new.stop_loss,
        suggested_volume: new.suggested_volume,
        confidence: new.confidence,
        raw_message: new.raw_message,
        parsed: new.parsed,
        message_timestamp: new.message_timestamp,
        processed_at: now,
        kind: new.kind,
        status: SignalStatus::Pending,
        status_reason: None,
    })
}

/// Monotonic status transition (P1): refuses to move a signal that is
/// already terminal.
pub async fn transition(
    pool: &PgPool,
    id: Uuid,
    new_status: SignalStatus,
    reason: Option<&str>,
) -> Result<(), SignalStoreError> {
    let current: SignalStatus =
        sqlx::query_scalar("SELECT status FROM signals WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(SignalStoreError::NotFound(id))?;

    if current.is_terminal() {
        return Err(SignalStoreError::AlreadyTerminal(id, current));
    }

    sqlx::query("UPDATE signals SET status = $2, status_reason = $3 WHERE id = $1")
        .bind(id)
        .bind(new_status)
        .bind(reason)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Signal, SignalStoreError> {
    sqlx::query_as::<_, Signal>(&format!("SELECT {SELECT_COLUMNS} FROM signals WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(SignalStoreError::NotFound(id))
}
