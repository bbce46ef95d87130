//! In-memory `ExchangeClient` for shadow mode and tests.
//!
//! Grounded on the teacher's `SimExchange` (`exchange.rs`): orders fill
//! immediately against a seeded mark price, positions accumulate in a
//! `Mutex`-guarded map, and nothing ever touches the network. Generalized to
//! the full venue surface (`symbol_info`/`set_leverage`/`transfer`) with
//! sane in-memory defaults so exercise code doesn't need a live venue to
//! drive the executor and reconciler end to end.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{
    canonicalize_symbol, check_venue_minimums, floor_to_step, AccountInfo, ExchangeClient, OrderAck,
    OrderSpec, PositionSide, Side, SymbolInfo, TransferDirection, VenuePosition,
};
use crate::error::ExchangeError;

#[derive(Clone)]
struct SimPosition {
    side: PositionSide,
    size: Decimal,
    entry_price: Decimal,
    leverage: i32,
}

pub struct SimExchangeClient {
    prices: Mutex<HashMap<String, Decimal>>,
    positions: Mutex<HashMap<String, SimPosition>>,
    symbols: Mutex<HashMap<String, SymbolInfo>>,
    orders: Mutex<Vec<OrderAck>>,
    balance: Mutex<Decimal>,
    next_order_id: Mutex<u64>,
}

impl SimExchangeClient {
    pub fn new() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            symbols: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            balance: Mutex::new(dec!(100_000)),
            next_order_id: Mutex::new(1),
        }
    }

    /// Test/shadow seam: stamps a mark price for a symbol so `place_order`
    /// and `price` have something to read.
    pub fn seed_price(&self, venue_symbol: &str, price: Decimal) {
        self.prices
            .lock()
            .unwrap()
            .insert(canonicalize_symbol(venue_symbol), price);
    }

    /// Test/shadow seam: stamps step/tick/minNotional metadata for a symbol.
    pub fn seed_symbol_info(&self, venue_symbol: &str, info: SymbolInfo) {
        self.symbols
            .lock()
            .unwrap()
            .insert(canonicalize_symbol(venue_symbol), info);
    }

    fn default_symbol_info() -> SymbolInfo {
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

    fn next_id(&self) -> String {
        let mut next = self.next_order_id.lock().unwrap();
        let id = *next;
        *next += 1;
        format!("sim-{id}")
    }
}

impl Default for SimExchangeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for SimExchangeClient {
    async fn place_order(&self, spec: OrderSpec) -> Result<OrderAck, ExchangeError> {
        let venue_symbol = canonicalize_symbol(&spec.venue_symbol);
        let info = self.symbol_info(&venue_symbol).await?;
        let mark = *self.prices.lock().unwrap().get(&venue_symbol).unwrap_or(&dec!(0));
        if mark.is_zero() {
            return Err(ExchangeError::UnknownSymbol(venue_symbol));
        }

        let quantized_qty = floor_to_step(spec.quantity, info.step_size);
        check_venue_minimums(quantized_qty, mark, &info)?;

        if !spec.reduce_only {
            let mut positions = self.positions.lock().unwrap();
            let entry = positions.entry(venue_symbol.clone()).or_insert(SimPosition {
                side: spec.position_side,
                size: Decimal::ZERO,
                entry_price: mark,
                leverage: 1,
            });
            entry.size += quantized_qty;
            entry.entry_price = mark;
        } else {
            let mut positions = self.positions.lock().unwrap();
            if let Some(entry) = positions.get_mut(&venue_symbol) {
                entry.size = (entry.size - quantized_qty).max(Decimal::ZERO);
            }
        }

        let ack = OrderAck {
            venue_order_id: self.next_id(),
            status: "FILLED".to_string(),
            executed_price: mark,
            executed_qty: quantized_qty,
            client_order_id: spec.client_order_tag,
        };
        self.orders.lock().unwrap().push(ack.clone());
        Ok(ack)
    }

    async fn cancel_order(&self, _venue_symbol: &str, venue_order_id: &str) -> Result<(), ExchangeError> {
        self.orders
            .lock()
            .unwrap()
            .retain(|o| o.venue_order_id != venue_order_id);
        Ok(())
    }

    async fn open_orders(&self, venue_symbol: Option<&str>) -> Result<Vec<OrderAck>, ExchangeError> {
        let orders = self.orders.lock().unwrap().clone();
        Ok(match venue_symbol {
            Some(_) => orders,
            None => orders,
        })
    }

    async fn positions(&self, _sub_account_id: Option<&str>) -> Result<Vec<VenuePosition>, ExchangeError> {
        let positions = self.positions.lock().unwrap();
        let prices = self.prices.lock().unwrap();
        Ok(positions
            .iter()
            .filter(|(_, p)| !p.size.is_zero())
            .map(|(symbol, p)| {
                let mark = *prices.get(symbol).unwrap_or(&p.entry_price);
                let direction = match p.side {
                    PositionSide::Short => -Decimal::ONE,
                    _ => Decimal::ONE,
                };
                VenuePosition {
                    venue_symbol: symbol.clone(),
                    position_side: p.side,
                    size: p.size,
                    mark_price: mark,
                    unrealized_pnl: (mark - p.entry_price) * p.size * direction,
                    leverage: p.leverage,
                }
            })
            .collect())
    }

    async fn account_info(&self, _sub_account_id: Option<&str>) -> Result<AccountInfo, ExchangeError> {
        let balance = *self.balance.lock().unwrap();
        Ok(AccountInfo {
            total_balance: balance,
            available_balance: balance,
        })
    }

    async fn symbol_info(&self, venue_symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        let canonical = canonicalize_symbol(venue_symbol);
        let mut symbols = self.symbols.lock().unwrap();
        Ok(*symbols.entry(canonical).or_insert_with(Self::default_symbol_info))
    }

    async fn price(&self, venue_symbol: &str) -> Result<Decimal, ExchangeError> {
        let canonical = canonicalize_symbol(venue_symbol);
        self.prices
            .lock()
            .unwrap()
            .get(&canonical)
            .copied()
            .ok_or(ExchangeError::UnknownSymbol(canonical))
    }

    async fn set_leverage(
        &self,
        venue_symbol: &str,
        leverage: u32,
        _position_side: PositionSide,
        _sub_account_id: Option<&str>,
    ) -> Result<(), ExchangeError> {
        let canonical = canonicalize_symbol(venue_symbol);
        if let Some(entry) = self.positions.lock().unwrap().get_mut(&canonical) {
            entry.leverage = leverage as i32;
        }
        Ok(())
    }

    async fn transfer(
        &self,
        _sub_account_id: &str,
        _asset: &str,
        amount: Decimal,
        direction: TransferDirection,
    ) -> Result<(), ExchangeError> {
        let mut balance = self.balance.lock().unwrap();
        match direction {
            TransferDirection::ToSubAccount => *balance -= amount,
            TransferDirection::ToMain => *balance += amount,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(symbol: &str, qty: Decimal) -> OrderSpec {
        OrderSpec {
            venue_symbol: symbol.to_string(),
            side: Side::Buy,
            position_side: PositionSide::Long,
            order_type: super::super::OrderType::Market,
            quantity: qty,
            stop_price: None,
            reduce_only: false,
            client_order_tag: "tag-1".to_string(),
            embedded_tp: None,
            embedded_sl: None,
        }
    }

    #[tokio::test]
    async fn place_order_fills_at_seeded_mark() {
        let ex = SimExchangeClient::new();
        ex.seed_price("BTC-USDT", dec!(50000));
        let ack = ex.place_order(spec("BTC-USDT", dec!(0.01))).await.unwrap();
        assert_eq!(ack.executed_price, dec!(50000));
        assert_eq!(ack.status, "FILLED");
    }

    #[tokio::test]
    async fn place_order_without_seeded_price_is_unknown_symbol() {
        let ex = SimExchangeClient::new();
        let err = ex.place_order(spec("ETH-USDT", dec!(1))).await.unwrap_err();
        assert!(matches!(err, ExchangeError::UnknownSymbol(_)));
    }

    #[tokio::test]
    async fn below_venue_minimum_is_rejected_before_fill() {
        let ex = SimExchangeClient::new();
        ex.seed_price("BTC-USDT", dec!(50000));
        let err = ex.place_order(spec("BTC-USDT", dec!(0.00001))).await.unwrap_err();
        assert!(matches!(err, ExchangeError::BelowVenueMinimum { .. }));
    }

    #[tokio::test]
    async fn positions_accumulate_across_fills() {
        let ex = SimExchangeClient::new();
        ex.seed_price("BTC-USDT", dec!(50000));
        ex.place_order(spec("BTC-USDT", dec!(0.01))).await.unwrap();
        ex.place_order(spec("BTC-USDT", dec!(0.02))).await.unwrap();
        let positions = ex.positions(None).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(0.03));
    }

    #[tokio::test]
    async fn reduce_only_shrinks_position() {
        let ex = SimExchangeClient::new();
        ex.seed_price("BTC-USDT", dec!(50000));
        ex.place_order(spec("BTC-USDT", dec!(0.03))).await.unwrap();
        let mut close = spec("BTC-USDT", dec!(0.01));
        close.reduce_only = true;
        ex.place_order(close).await.unwrap();
        let positions = ex.positions(None).await.unwrap();
        assert_eq!(positions[0].size, dec!(0.02));
    }
}
