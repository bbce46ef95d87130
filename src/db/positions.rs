//! Position & Order persistence (spec §4.6 RECORD step, §4.7 reconciler).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{OrderKind, OrderRow, Position, PositionStatus, Side};

const SELECT_COLUMNS: &str = "id, signal_id, channel_id, sub_account_id, venue_symbol, side, \
    quantity, entry_price, current_price, exit_price, leverage, unrealized_pnl, realized_pnl, \
    fees, tp_levels, tp_distribution, stop_loss, status, venue_order_id, compensation_required, \
    opened_at, closed_at";

pub struct NewPosition {
    pub signal_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub sub_account_id: Uuid,
    pub venue_symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub leverage: i32,
    pub tp_levels: Vec<Decimal>,
    pub tp_distribution: Vec<Decimal>,
    pub stop_loss: Decimal,
    pub venue_order_id: Option<String>,
}

pub async fn insert(pool: &PgPool, new: NewPosition) -> Result<Position, sqlx::Error> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO positions (id, signal_id, channel_id, sub_account_id, venue_symbol, side, \
         quantity, entry_price, leverage, tp_levels, tp_distribution, stop_loss, status, \
         venue_order_id, opened_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,'OPEN',$13,$14)",
    )
    .bind(id)
    .bind(new.signal_id)
    .bind(new.channel_id)
    .bind(new.sub_account_id)
    .bind(&new.venue_symbol)
    .bind(new.side)
    .bind(new.quantity)
    .bind(new.entry_price)
    .bind(new.leverage)
    .bind(Json(new.tp_levels.clone()))
    .bind(Json(new.tp_distribution.clone()))
    .bind(new.stop_loss)
    .bind(&new.venue_order_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Position {
        id,
        signal_id: new.signal_id,
        channel_id: new.channel_id,
        sub_account_id: new.sub_account_id,
        venue_symbol: new.venue_symbol,
        side: new.side,
        quantity: new.quantity,
        entry_price: new.entry_price,
        current_price: None,
        exit_price: None,
        leverage: new.leverage,
        unrealized_pnl: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        fees: Decimal::ZERO,
        tp_levels: Json(new.tp_levels),
        tp_distribution: Json(new.tp_distribution),
        stop_loss: new.stop_loss,
        status: PositionStatus::Open,
        venue_order_id: new.venue_order_id,
        compensation_required: false,
        opened_at: now,
        closed_at: None,
    })
}

pub async fn insert_order(
    pool: &PgPool,
    venue_order_id: &str,
    position_id: Uuid,
    kind: OrderKind,
    client_order_tag: &str,
    price: Option<Decimal>,
    quantity: Decimal,
    status: &str,
) -> Result<OrderRow, sqlx::Error> {
    sqlx::query(
        "INSERT INTO orders (venue_order_id, position_id, kind, client_order_tag, price, \
         quantity, status) VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(venue_order_id)
    .bind(position_id)
    .bind(kind)
    .bind(client_order_tag)
    .bind(price)
    .bind(quantity)
    .bind(status)
    .execute(pool)
    .await?;

    Ok(OrderRow {
        venue_order_id: venue_order_id.to_string(),
        position_id,
        kind,
        client_order_tag: client_order_tag.to_string(),
        price,
        quantity,
        status: status.to_string(),
    })
}

pub async fn mark_compensation_required(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE positions SET compensation_required = TRUE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Non-terminal positions for one sub-account, the reconciler's working set
/// (spec §4.7).
pub async fn open_positions_for_sub_account(
    pool: &PgPool,
    sub_account_id: Uuid,
) -> Result<Vec<Position>, sqlx::Error> {
    sqlx::query_as::<_, Position>(&format!(
        "SELECT {SELECT_COLUMNS} FROM positions WHERE sub_account_id = $1 \
         AND status != 'CLOSED'"
    ))
    .bind(sub_account_id)
    .fetch_all(pool)
    .await
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Position>, sqlx::Error> {
    sqlx::query_as::<_, Position>(&format!("SELECT {SELECT_COLUMNS} FROM positions WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Patches mark price / unrealized PnL / quantity / leverage from a live
/// venue snapshot (spec §4.7 step 3).
pub async fn patch_from_venue(
    pool: &PgPool,
    id: Uuid,
    current_price: Decimal,
    unrealized_pnl: Decimal,
    quantity: Decimal,
    leverage: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE positions SET current_price = $2, unrealized_pnl = $3, quantity = $4, \
         leverage = $5 WHERE id = $1",
    )
    .bind(id)
    .bind(current_price)
    .bind(unrealized_pnl)
    .bind(quantity)
    .bind(leverage)
    .execute(pool)
    .await?;
    Ok(())
}

/// Partial fill detected: local quantity exceeds venue-reported size
/// (spec §4.7 step 4).
pub async fn mark_partially_closed(
    pool: &PgPool,
    id: Uuid,
    new_quantity: Decimal,
    realized_delta: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE positions SET status = 'PARTIALLY_CLOSED', quantity = $2, \
         realized_pnl = realized_pnl + $3 WHERE id = $1",
    )
    .bind(id)
    .bind(new_quantity)
    .bind(realized_delta)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reconciled external close: venue no longer reports the position
/// (spec §4.7 step 2 / S5).
pub async fn close_reconciled(
    pool: &PgPool,
    id: Uuid,
    exit_price: Decimal,
    realized_pnl: Decimal,
    closed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE positions SET status = 'CLOSED', exit_price = $2, realized_pnl = $3, \
         unrealized_pnl = 0, quantity = 0, closed_at = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(exit_price)
    .bind(realized_pnl)
    .bind(closed_at)
    .execute(pool)
    .await?;
    Ok(())
}
