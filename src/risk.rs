//! Risk & Sizing (spec §4.5): a pure function from `(signal, channel,
//! sub-account snapshot, symbol info)` to an order quantity and TP-leg
//! split. No network or database calls; every input arrives already
//! resolved so the whole module is trivially unit-testable.
//!
//! The teacher's `risk.rs` is a stateful drawdown kill-switch for a market
//! maker (`RiskManager`/`RiskConfig`, consecutive-loss halts, daily
//! drawdown halts) — a different shape of risk control than this spec
//! calls for, so it has no counterpart here; the replacement keeps the
//! teacher's `thiserror`-free, serde-light struct style but is built from
//! the spec's sizing algorithm directly rather than generalized from the
//! teacher's halt logic.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::db::models::Direction;
use crate::error::SizingError;
use crate::exchange::SymbolInfo;

pub struct SizingInput {
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub tp_levels: Vec<Decimal>,
    pub leverage: u32,
    pub risk_percent: Decimal,
    pub max_position_percent: Decimal,
    pub tp_distribution: Vec<Decimal>,
    pub available_balance: Decimal,
    /// Operator override (spec §6): bypasses §4.5 sanity checks, never
    /// sizing itself. Every signal sized with this set must be logged
    /// loudly by the caller.
    pub risk_management_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpLeg {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizingResult {
    pub quantity: Decimal,
    pub tp_legs: Vec<TpLeg>,
    /// `quantity − Σ tp_legs.quantity`: the run-off portion closed only by
    /// SL or manual action (spec §4.5).
    pub runoff: Decimal,
}

/// Direction sanity (spec §4.5): LONG wants every TP above entry and the
/// stop below it; SHORT is the mirror. Violations are `INCOHERENT_SIGNAL`.
fn check_direction_sanity(input: &SizingInput) -> Result<(), SizingError> {
    let ok = match input.direction {
        Direction::Long => {
            input.tp_levels.iter().all(|&tp| tp > input.entry_price) && input.stop_loss < input.entry_price
        }
        Direction::Short => {
            input.tp_levels.iter().all(|&tp| tp < input.entry_price) && input.stop_loss > input.entry_price
        }
    };
    if ok {
        Ok(())
    } else {
        Err(SizingError::IncoherentSignal(format!(
            "direction={:?} entry={} stop={} tp_levels={:?}",
            input.direction, input.entry_price, input.stop_loss, input.tp_levels
        )))
    }
}

pub fn compute_order_size(input: &SizingInput, symbol: &SymbolInfo) -> Result<SizingResult, SizingError> {
    if !input.risk_management_disabled {
        check_direction_sanity(input)?;
    }

    let risk_amount = input.available_balance * input.risk_percent / dec!(100);
    let risk_per_unit = (input.entry_price - input.stop_loss).abs();
    if risk_per_unit.is_zero() {
        return Err(SizingError::IncoherentSignal("entryPrice equals stopLoss".into()));
    }
    let base_qty = risk_amount / risk_per_unit;

    let max_qty = (input.available_balance * input.max_position_percent / dec!(100))
        * Decimal::from(input.leverage)
        / input.entry_price;
    let qty = base_qty.min(max_qty);

    let qty = floor_to_step(qty, symbol.step_size);
    if qty * input.entry_price < symbol.min_notional {
        return Err(SizingError::BelowNotional);
    }

    let tp_legs = split_tp_legs(qty, &input.tp_distribution, &input.tp_levels, symbol)?;
    let allocated: Decimal = tp_legs.iter().map(|leg| leg.quantity).sum();
    let runoff = qty - allocated;

    Ok(SizingResult {
        quantity: qty,
        tp_legs,
        runoff,
    })
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).ceil() * step
}

/// TP split (spec §4.5): initial per-leg quantity from `tpDistribution`,
/// floored to `stepSize`. Legs below `minNotional` borrow from the
/// remaining unallocated quantity to reach the minimum; if there isn't
/// enough left to borrow, the leg is dropped rather than placed
/// under-notional. Legs are processed in order so earlier legs never
/// borrow from later ones.
fn split_tp_legs(
    qty: Decimal,
    tp_distribution: &[Decimal],
    tp_levels: &[Decimal],
    symbol: &SymbolInfo,
) -> Result<Vec<TpLeg>, SizingError> {
    let mut legs = Vec::with_capacity(tp_levels.len());
    let mut allocated = Decimal::ZERO;

    for (pct, &price) in tp_distribution.iter().zip(tp_levels.iter()) {
        let remaining = qty - allocated;
        if remaining <= Decimal::ZERO {
            break;
        }
        let mut leg_qty = floor_to_step(qty * *pct / dec!(100), symbol.step_size);

        if leg_qty * price < symbol.min_notional {
            let needed = ceil_to_step(symbol.min_notional / price, symbol.step_size);
            if needed <= remaining {
                leg_qty = needed;
            } else {
                // Not enough remaining quantity to lift this leg to the
                // minimum notional — coalesce into the last placed leg if
                // one exists, else drop it entirely.
                if let Some(last) = legs.last_mut() {
                    last.quantity += remaining;
                    allocated += remaining;
                }
                continue;
            }
        }

        allocated += leg_qty;
        legs.push(TpLeg { price, quantity: leg_qty });
    }

    Ok(legs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn symbol() -> SymbolInfo {
        SymbolInfo {
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: dec!(1_000_000),
            min_notional: dec!(5),
            price_precision: 2,
            quantity_precision: 3,
        }
    }

    fn base_input() -> SizingInput {
        SizingInput {
            direction: Direction::Long,
            entry_price: dec!(50000),
            stop_loss: dec!(49000),
            tp_levels: vec![dec!(51000), dec!(52000)],
            leverage: 10,
            risk_percent: dec!(1),
            max_position_percent: dec!(50),
            tp_distribution: vec![dec!(50), dec!(50)],
            available_balance: dec!(10000),
            risk_management_disabled: false,
        }
    }

    #[test]
    fn risk_management_disabled_bypasses_direction_sanity_not_sizing() {
        let mut input = base_input();
        input.stop_loss = dec!(51000); // stop above entry on a LONG: normally INCOHERENT_SIGNAL
        input.risk_management_disabled = true;
        let result = compute_order_size(&input, &symbol());
        assert!(result.is_ok(), "override must bypass sanity check, not fail sizing");
    }

    #[test]
    fn computes_quantity_from_risk_amount_and_distance() {
        let result = compute_order_size(&base_input(), &symbol()).unwrap();
        // riskAmount = 10000*1/100 = 100; riskPerUnit = 1000; baseQty = 0.1
        // maxQty = 10000*50/100*10/50000 = 1.0 -> capped by baseQty
        assert_eq!(result.quantity, dec!(0.1));
    }

    #[test]
    fn caps_quantity_by_max_position_percent() {
        let mut input = base_input();
        input.risk_percent = dec!(50); // would want a much larger base qty
        let result = compute_order_size(&input, &symbol()).unwrap();
        // maxQty = 10000*50/100*10/50000 = 1.0
        assert_eq!(result.quantity, dec!(1));
    }

    #[test]
    fn rejects_incoherent_long_signal() {
        let mut input = base_input();
        input.stop_loss = dec!(51000); // stop above entry on a LONG
        assert!(matches!(
            compute_order_size(&input, &symbol()),
            Err(SizingError::IncoherentSignal(_))
        ));
    }

    #[test]
    fn rejects_incoherent_short_signal() {
        let mut input = base_input();
        input.direction = Direction::Short;
        input.stop_loss = dec!(49000); // stop below entry on a SHORT
        input.tp_levels = vec![dec!(49500)];
        input.tp_distribution = vec![dec!(100)];
        assert!(matches!(
            compute_order_size(&input, &symbol()),
            Err(SizingError::IncoherentSignal(_))
        ));
    }

    #[test]
    fn rejects_below_notional() {
        let mut input = base_input();
        input.available_balance = dec!(1);
        assert!(matches!(
            compute_order_size(&input, &symbol()),
            Err(SizingError::BelowNotional)
        ));
    }

    #[test]
    fn tp_legs_sum_never_exceeds_quantity() {
        let result = compute_order_size(&base_input(), &symbol()).unwrap();
        let allocated: Decimal = result.tp_legs.iter().map(|l| l.quantity).sum();
        assert!(allocated <= result.quantity);
        assert_eq!(result.runoff, result.quantity - allocated);
    }

    #[rstest]
    #[case(vec![dec!(1), dec!(99)], dec!(0.1))]
    #[case(vec![dec!(50), dec!(50)], dec!(0.1))]
    #[case(vec![dec!(100)], dec!(0.1))]
    fn tp_distribution_shapes_never_overallocate(#[case] distribution: Vec<Decimal>, #[case] qty: Decimal) {
        let mut input = base_input();
        let n = distribution.len();
        input.tp_distribution = distribution;
        input.tp_levels = (1..=n).map(|i| dec!(51000) + Decimal::from(i as i64) * dec!(1000)).collect();
        let result = compute_order_size(&input, &symbol()).unwrap();
        assert_eq!(result.quantity, qty);
        let allocated: Decimal = result.tp_legs.iter().map(|l| l.quantity).sum();
        assert!(allocated <= qty);
    }

    #[test]
    fn tiny_first_leg_borrows_to_reach_min_notional_or_is_dropped() {
        let mut input = base_input();
        input.tp_distribution = vec![dec!(1), dec!(99)];
        input.risk_percent = dec!(0.01); // produces a very small qty
        let result = compute_order_size(&input, &symbol());
        // Either BELOW_NOTIONAL on the whole position, or legs respect min notional.
        if let Ok(sizing) = result {
            for leg in &sizing.tp_legs {
                assert!(leg.quantity * leg.price >= symbol().min_notional);
            }
        }
    }
}
