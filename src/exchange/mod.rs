//! Exchange Client (§4.1): a stable, typed surface independent of the
//! underlying HTTP transport, with symbol canonicalization, quantity/price
//! quantization, and a retry policy that only ever applies to idempotent
//! reads.
//!
//! Grounded on the teacher's `exchange.rs` `ExchangeClient` trait
//! (`get_balance`/`get_positions`/`open_order`/...) and `SimExchange` /
//! `LiveExchange` pair — generalized from a single-coin spot/perp MM surface
//! to the full venue surface a futures pipeline needs (symbol metadata,
//! leverage, sub-account transfer, embedded TP/SL).

pub mod live;
pub mod sim;
pub mod signing;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    StopMarket,
    TakeProfitMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    ToSubAccount,
    ToMain,
}

/// Embedded conditional leg carried by a MARKET entry order (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedLeg {
    pub stop_price: Decimal,
    pub working_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub venue_symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub client_order_tag: String,
    pub embedded_tp: Option<EmbeddedLeg>,
    pub embedded_sl: Option<EmbeddedLeg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub venue_order_id: String,
    pub status: String,
    pub executed_price: Decimal,
    pub executed_qty: Decimal,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub venue_symbol: String,
    pub position_side: PositionSide,
    /// Absolute size; direction carried separately by `position_side`.
    pub size: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_balance: Decimal,
    pub available_balance: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

/// Normalizes "BASEQUOTE"/"BASE_QUOTE"/"BASE-QUOTE" to the venue's own
/// canonical symbol, e.g. "BASEQUOTE" (spec §4.1).
pub fn canonicalize_symbol(input: &str) -> String {
    input.replace(['-', '_'], "").to_uppercase()
}

/// Floors `value` to the nearest multiple of `step` (§4.1: outbound
/// qty/price is always floored, never rounded — ceiling quantization is
/// used only elsewhere, e.g. risk sizing's TP-leg ceiling).
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

/// Validates a quantized order against venue minimums before any network
/// round-trip (spec §4.1: `BELOW_VENUE_MINIMUM` fails fast).
pub fn check_venue_minimums(
    qty: Decimal,
    price: Decimal,
    info: &SymbolInfo,
) -> Result<(), ExchangeError> {
    if qty < info.min_qty || qty * price < info.min_notional {
        return Err(ExchangeError::BelowVenueMinimum {
            qty,
            price,
            min_notional: info.min_notional,
        });
    }
    Ok(())
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, spec: OrderSpec) -> Result<OrderAck, ExchangeError>;
    async fn cancel_order(&self, venue_symbol: &str, venue_order_id: &str) -> Result<(), ExchangeError>;
    async fn open_orders(&self, venue_symbol: Option<&str>) -> Result<Vec<OrderAck>, ExchangeError>;
    async fn positions(&self, sub_account_id: Option<&str>) -> Result<Vec<VenuePosition>, ExchangeError>;
    async fn account_info(&self, sub_account_id: Option<&str>) -> Result<AccountInfo, ExchangeError>;
    async fn symbol_info(&self, venue_symbol: &str) -> Result<SymbolInfo, ExchangeError>;
    async fn price(&self, venue_symbol: &str) -> Result<Decimal, ExchangeError>;
    async fn set_leverage(
        &self,
        venue_symbol: &str,
        leverage: u32,
        position_side: PositionSide,
        sub_account_id: Option<&str>,
    ) -> Result<(), ExchangeError>;
    async fn transfer(
        &self,
        sub_account_id: &str,
        asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> Result<(), ExchangeError>;
}
