//! Executor (spec §4.6): orchestrates the multi-leg order sequence for one
//! accepted entry signal through an explicit state sequence, with
//! compensating cancellation on partial failure.
//!
//! `INIT → SIZED → LEVERAGE_SET → ENTRY_PLACED → RISK_LEGS_PLACED →
//! RECORDED → DONE`, with failure branches to `COMPENSATING → FAILED`.
//!
//! Grounded on the teacher's `MmExecutionEngine` (`execution.rs`): one
//! struct owning `Box<dyn ExchangeClient>` plus a `cancel_all`-style
//! compensating-action method, generalized from a market maker's
//! portfolio-wide halt into a per-signal state machine that records its
//! outcome to Postgres instead of an in-memory `SessionStats`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use uuid::Uuid;

use crate::bus::{EventBus, TOPIC_POSITION_COMPENSATION_REQUIRED, TOPIC_POSITION_OPENED, TOPIC_SIGNAL_EXECUTED, TOPIC_SIGNAL_FAILED};
use crate::db::models::{client_order_tag, Direction, OrderKind, Side, SignalStatus};
use crate::db::{positions, signals};
use crate::error::{ExchangeError, ExecutorError};
use crate::exchange::{EmbeddedLeg, ExchangeClient, OrderSpec, OrderType, PositionSide};
use crate::risk::{compute_order_size, SizingInput};

/// Price drift beyond this fraction of `entryPrice` is still executed but
/// annotated rather than rejected (spec §4.6 tie-break b).
const EXECUTED_PRICE_DRIFT_THRESHOLD: Decimal = dec!(0.02);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Init,
    Sized,
    LeverageSet,
    EntryPlaced,
    RiskLegsPlaced,
    Recorded,
    Done,
    Compensating,
    Failed,
}

pub struct ExecutionContext<'a> {
    pub pool: &'a PgPool,
    pub bus: &'a EventBus,
    pub exchange: &'a dyn ExchangeClient,
}

pub struct ApprovedSignal {
    pub signal_id: Uuid,
    pub channel_id: Uuid,
    pub sub_account_id: Uuid,
    pub venue_sub_account_id: String,
    pub venue_symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub tp_levels: Vec<Decimal>,
    pub leverage: u32,
    pub risk_percent: Decimal,
    pub max_position_percent: Decimal,
    pub tp_distribution: Vec<Decimal>,
    pub risk_management_disabled: bool,
}

/// Drives one approved entry signal through the full state sequence.
/// Returns the final state reached; `Done` and `Failed` are the only
/// terminal outcomes callers need branch on, the intermediate states exist
/// for observability (logged at each transition).
pub async fn execute(ctx: &ExecutionContext<'_>, signal: ApprovedSignal) -> ExecState {
    let mut state = ExecState::Init;
    tracing::info!(signal_id = %signal.signal_id, ?state, "executor: starting");
    if signal.risk_management_disabled {
        tracing::warn!(signal_id = %signal.signal_id, "executor: RISK_MANAGEMENT_DISABLED override active for this signal");
    }

    // 1. SIZE — balance snapshots on SubAccount are advisory only; size
    // against a fresh accountInfo fetch (spec §5).
    let symbol_info = match ctx.exchange.symbol_info(&signal.venue_symbol).await {
        Ok(info) => info,
        Err(e) => return fail(ctx, &signal, state, &e.to_string()).await,
    };
    let account = match ctx.exchange.account_info(Some(&signal.venue_sub_account_id)).await {
        Ok(a) => a,
        Err(e) => return fail(ctx, &signal, state, &e.to_string()).await,
    };
    let sizing_input = SizingInput {
        direction: signal.direction,
        entry_price: signal.entry_price,
        stop_loss: signal.stop_loss,
        tp_levels: signal.tp_levels.clone(),
        leverage: signal.leverage,
        risk_percent: signal.risk_percent,
        max_position_percent: signal.max_position_percent,
        tp_distribution: signal.tp_distribution.clone(),
        available_balance: account.available_balance,
        risk_management_disabled: signal.risk_management_disabled,
    };
    let sizing = match compute_order_size(&sizing_input, &symbol_info) {
        Ok(s) => s,
        Err(e) => return fail(ctx, &signal, state, &e.to_string()).await,
    };
    state = ExecState::Sized;
    tracing::info!(signal_id = %signal.signal_id, ?state, qty = %sizing.quantity, "executor: sized");

    // 2. LEVERAGE — failure is non-fatal (venue may cap it silently).
    let position_side = match signal.direction {
        Direction::Long => PositionSide::Long,
        Direction::Short => PositionSide::Short,
    };
    if let Err(e) = ctx
        .exchange
        .set_leverage(&signal.venue_symbol, signal.leverage, position_side, None)
        .await
    {
        tracing::warn!(signal_id = %signal.signal_id, error = %e, "executor: setLeverage failed, proceeding anyway");
    }
    state = ExecState::LeverageSet;

    // 3. ENTRY
    let side = Side::from(signal.direction);
    let exchange_side = match side {
        Side::Buy => crate::exchange::Side::Buy,
        Side::Sell => crate::exchange::Side::Sell,
    };

    let embedded_tp = sizing.tp_legs.first().and_then(|leg| {
        let sided_ok = match signal.direction {
            Direction::Long => leg.price > signal.entry_price,
            Direction::Short => leg.price < signal.entry_price,
        };
        sided_ok.then_some(EmbeddedLeg {
            stop_price: leg.price,
            working_type: "MARK_PRICE".to_string(),
        })
    });
    // Unconditional: the entry always carries the SL, independent of
    // whether the first TP leg was sided correctly (spec §4.6 step 3).
    let embedded_sl = Some(EmbeddedLeg {
        stop_price: signal.stop_loss,
        working_type: "MARK_PRICE".to_string(),
    });

    let entry_tag = client_order_tag(OrderKind::Entry, signal.signal_id, 0);
    let entry_spec = OrderSpec {
        venue_symbol: signal.venue_symbol.clone(),
        side: exchange_side,
        position_side,
        order_type: OrderType::Market,
        quantity: sizing.quantity,
        stop_price: None,
        reduce_only: false,
        client_order_tag: entry_tag.clone(),
        embedded_tp: embedded_tp.clone(),
        embedded_sl: embedded_sl.clone(),
    };
    let entry_carried_sl = entry_spec.embedded_sl.is_some();

    let entry_ack = match ctx.exchange.place_order(entry_spec).await {
        Ok(ack) => ack,
        Err(e) => return fail(ctx, &signal, state, &e.to_string()).await,
    };
    state = ExecState::EntryPlaced;

    let drift = if signal.entry_price.is_zero() {
        Decimal::ZERO
    } else {
        ((entry_ack.executed_price - signal.entry_price) / signal.entry_price).abs()
    };
    let drift_annotated = drift > EXECUTED_PRICE_DRIFT_THRESHOLD;
    if drift_annotated {
        tracing::warn!(
            signal_id = %signal.signal_id,
            executed_price = %entry_ack.executed_price,
            signal_entry_price = %signal.entry_price,
            "executor: executed price drifted beyond policy threshold, proceeding with annotation"
        );
    }
    tracing::info!(signal_id = %signal.signal_id, ?state, venue_order_id = %entry_ack.venue_order_id, "executor: entry placed");

    // 4. RISK LEGS
    let remaining_tp_legs: Vec<_> = if embedded_tp.is_some() {
        sizing.tp_legs.iter().skip(1).collect()
    } else {
        sizing.tp_legs.iter().collect()
    };

    let mut placed_leg_tags: Vec<(String, String)> = Vec::new(); // (venue_order_id, tag)
    let mut risk_leg_failure: Option<ExchangeError> = None;

    // Step 4 (spec §4.6): if the ENTRY did not carry an embedded SL, place a
    // standalone reduce-only STOP_MARKET SL before the TP legs.
    if !entry_carried_sl {
        let sl_tag = client_order_tag(OrderKind::Sl, signal.signal_id, 0);
        let sl_spec = OrderSpec {
            venue_symbol: signal.venue_symbol.clone(),
            side: opposite(exchange_side),
            position_side,
            order_type: OrderType::StopMarket,
            quantity: sizing.quantity,
            stop_price: Some(signal.stop_loss),
            reduce_only: true,
            client_order_tag: sl_tag.clone(),
            embedded_tp: None,
            embedded_sl: None,
        };
        match ctx.exchange.place_order(sl_spec).await {
            Ok(ack) => placed_leg_tags.push((ack.venue_order_id, sl_tag)),
            Err(e) => risk_leg_failure = Some(e),
        }
    }

    if risk_leg_failure.is_none() {
        for (idx, leg) in remaining_tp_legs.iter().enumerate() {
            let leg_idx = idx + 1;
            let tag = client_order_tag(OrderKind::Tp, signal.signal_id, leg_idx);
            let spec = OrderSpec {
                venue_symbol: signal.venue_symbol.clone(),
                side: opposite(exchange_side),
                position_side,
                order_type: OrderType::TakeProfitMarket,
                quantity: leg.quantity,
                stop_price: Some(leg.price),
                reduce_only: true,
                client_order_tag: tag.clone(),
                embedded_tp: None,
                embedded_sl: None,
            };
            match ctx.exchange.place_order(spec).await {
                Ok(ack) => placed_leg_tags.push((ack.venue_order_id, tag)),
                Err(e) => {
                    risk_leg_failure = Some(e);
                    break;
                }
            }
        }
    }

    if let Some(e) = risk_leg_failure {
        return compensate(
            ctx,
            &signal,
            entry_ack.venue_order_id.clone(),
            entry_ack.executed_qty,
            placed_leg_tags,
            &e.to_string(),
        )
        .await;
    }
    state = ExecState::RiskLegsPlaced;
    tracing::info!(signal_id = %signal.signal_id, ?state, legs = remaining_tp_legs.len(), "executor: risk legs placed");

    // 5. RECORD
    let new_position = positions::NewPosition {
        signal_id: Some(signal.signal_id),
        channel_id: Some(signal.channel_id),
        sub_account_id: signal.sub_account_id,
        venue_symbol: signal.venue_symbol.clone(),
        side,
        quantity: entry_ack.executed_qty,
        entry_price: entry_ack.executed_price,
        leverage: signal.leverage as i32,
        tp_levels: signal.tp_levels.clone(),
        tp_distribution: signal.tp_distribution.clone(),
        stop_loss: signal.stop_loss,
        venue_order_id: Some(entry_ack.venue_order_id.clone()),
    };
    let position = match positions::insert(ctx.pool, new_position).await {
        Ok(p) => p,
        Err(e) => return fail(ctx, &signal, state, &e.to_string()).await,
    };

    let _ = positions::insert_order(
        ctx.pool,
        &entry_ack.venue_order_id,
        position.id,
        OrderKind::Entry,
        &entry_tag,
        Some(entry_ack.executed_price),
        entry_ack.executed_qty,
        &entry_ack.status,
    )
    .await;
    for (venue_order_id, tag) in &placed_leg_tags {
        let _ = positions::insert_order(
            ctx.pool,
            venue_order_id,
            position.id,
            OrderKind::Tp,
            tag,
            None,
            Decimal::ZERO,
            "NEW",
        )
        .await;
    }

    if let Err(e) = signals::transition(ctx.pool, signal.signal_id, SignalStatus::Executed, None).await {
        tracing::warn!(signal_id = %signal.signal_id, error = %e, "executor: failed to mark signal EXECUTED");
    }
    let _ = ctx.bus.publish(TOPIC_SIGNAL_EXECUTED, &signal.signal_id).await;
    let _ = ctx.bus.publish(TOPIC_POSITION_OPENED, &position.id).await;

    state = ExecState::Recorded;
    tracing::info!(signal_id = %signal.signal_id, ?state, position_id = %position.id, "executor: recorded");

    state = ExecState::Done;
    tracing::info!(signal_id = %signal.signal_id, ?state, "executor: done");
    if signal.risk_management_disabled {
        tracing::warn!(signal_id = %signal.signal_id, position_id = %position.id, "executor: signal EXECUTED with RISK_MANAGEMENT_DISABLED override");
    }
    state
}

fn opposite(side: crate::exchange::Side) -> crate::exchange::Side {
    match side {
        crate::exchange::Side::Buy => crate::exchange::Side::Sell,
        crate::exchange::Side::Sell => crate::exchange::Side::Buy,
    }
}

async fn fail(ctx: &ExecutionContext<'_>, signal: &ApprovedSignal, _from: ExecState, reason: &str) -> ExecState {
    tracing::warn!(signal_id = %signal.signal_id, reason, "executor: failing signal");
    if let Err(e) = signals::transition(ctx.pool, signal.signal_id, SignalStatus::Failed, Some(reason)).await {
        tracing::warn!(signal_id = %signal.signal_id, error = %e, "executor: failed to mark signal FAILED");
    }
    let _ = ctx.bus.publish(TOPIC_SIGNAL_FAILED, &signal.signal_id).await;
    ExecState::Failed
}

/// Step 6 (spec §4.6): a risk-leg placement failed after ENTRY succeeded.
/// Attempts to cancel previously placed legs, then close the remainder with
/// a reduce-only market order. If compensation itself fails, escalate:
/// still persist the Position — the entry is real — mark it OPEN, and emit
/// `position:compensation-required` so the Reconciler converges state.
async fn compensate(
    ctx: &ExecutionContext<'_>,
    signal: &ApprovedSignal,
    entry_venue_order_id: String,
    entry_quantity: Decimal,
    placed_legs: Vec<(String, String)>,
    reason: &str,
) -> ExecState {
    tracing::error!(signal_id = %signal.signal_id, reason, "executor: compensating after partial risk-leg failure");

    let mut cancel_failed = false;
    for (venue_order_id, _tag) in &placed_legs {
        if let Err(e) = ctx.exchange.cancel_order(&signal.venue_symbol, venue_order_id).await {
            tracing::error!(signal_id = %signal.signal_id, venue_order_id, error = %e, "executor: failed to cancel risk leg during compensation");
            cancel_failed = true;
        }
    }

    let position_side = match signal.direction {
        Direction::Long => PositionSide::Long,
        Direction::Short => PositionSide::Short,
    };
    let close_side = match signal.direction {
        Direction::Long => crate::exchange::Side::Sell,
        Direction::Short => crate::exchange::Side::Buy,
    };
    let close_tag = client_order_tag(OrderKind::Entry, signal.signal_id, 999);
    let close_spec = OrderSpec {
        venue_symbol: signal.venue_symbol.clone(),
        side: close_side,
        position_side,
        order_type: OrderType::Market,
        quantity: entry_quantity,
        stop_price: None,
        reduce_only: true,
        client_order_tag: close_tag,
        embedded_tp: None,
        embedded_sl: None,
    };
    let close_result = ctx.exchange.place_order(close_spec).await;

    let side = Side::from(signal.direction);
    if cancel_failed || close_result.is_err() {
        tracing::error!(signal_id = %signal.signal_id, "executor: compensation itself failed, escalating");
        let new_position = positions::NewPosition {
            signal_id: Some(signal.signal_id),
            channel_id: Some(signal.channel_id),
            sub_account_id: signal.sub_account_id,
            venue_symbol: signal.venue_symbol.clone(),
            side,
            quantity: Decimal::ZERO,
            entry_price: signal.entry_price,
            leverage: signal.leverage as i32,
            tp_levels: signal.tp_levels.clone(),
            tp_distribution: signal.tp_distribution.clone(),
            stop_loss: signal.stop_loss,
            venue_order_id: Some(entry_venue_order_id),
        };
        if let Ok(position) = positions::insert(ctx.pool, new_position).await {
            let _ = positions::mark_compensation_required(ctx.pool, position.id).await;
            let _ = ctx.bus.publish(TOPIC_POSITION_COMPENSATION_REQUIRED, &position.id).await;
        }
        let _ = signals::transition(ctx.pool, signal.signal_id, SignalStatus::Failed, Some(reason)).await;
        let _ = ctx.bus.publish(TOPIC_SIGNAL_FAILED, &signal.signal_id).await;
        return ExecState::Failed;
    }

    let _ = signals::transition(ctx.pool, signal.signal_id, SignalStatus::Failed, Some(reason)).await;
    let _ = ctx.bus.publish(TOPIC_SIGNAL_FAILED, &signal.signal_id).await;
    ExecState::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_order_tags_are_unique_per_leg() {
        let id = Uuid::new_v4();
        let entry = client_order_tag(OrderKind::Entry, id, 0);
        let tp1 = client_order_tag(OrderKind::Tp, id, 1);
        let tp2 = client_order_tag(OrderKind::Tp, id, 2);
        assert_ne!(entry, tp1);
        assert_ne!(tp1, tp2);
    }

    #[test]
    fn opposite_side_flips() {
        assert_eq!(opposite(crate::exchange::Side::Buy), crate::exchange::Side::Sell);
        assert_eq!(opposite(crate::exchange::Side::Sell), crate::exchange::Side::Buy);
    }
}
