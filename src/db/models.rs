//! Row structs mirroring the relational schema (§7) and the entity
//! invariants (§3). Generalizes the teacher's `Position` struct
//! (`exchange.rs`) from a single-venue-field snapshot into the
//! authoritative local record this pipeline needs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub id: Uuid,
    pub external_channel_id: String,
    pub name: String,
    pub active: bool,
    pub paused: bool,
    pub auto_execute: bool,
    pub max_position_percent: Decimal,
    pub risk_percent: Decimal,
    pub tp_distribution: Json<Vec<Decimal>>,
    pub sub_account_id: Uuid,
}

impl Channel {
    /// Invariant: tp_distribution sums to 100 ± 0.1 (spec.md §3).
    pub fn tp_distribution_is_valid(&self) -> bool {
        let sum: Decimal = self.tp_distribution.0.iter().sum();
        (sum - Decimal::ONE_HUNDRED).abs() <= Decimal::new(1, 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubAccount {
    pub id: Uuid,
    pub venue_sub_account_id: String,
    pub name: String,
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub channel_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum SignalType {
    Entry,
    Update,
    Close,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Pending,
    Approved,
    Executed,
    Ignored,
    Failed,
    Closed,
}

impl SignalStatus {
    /// P1: terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SignalStatus::Executed
                | SignalStatus::Ignored
                | SignalStatus::Failed
                | SignalStatus::Closed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Signal {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub external_message_id: String,
    pub asset: Option<String>,
    pub direction: Option<Direction>,
    pub leverage: Option<i32>,
    pub entry_price: Option<Decimal>,
    pub tp_levels: Json<Vec<Decimal>>,
    pub stop_loss: Option<Decimal>,
    pub suggested_volume: Option<Decimal>,
    pub confidence: Decimal,
    pub raw_message: String,
    pub parsed: Option<serde_json::Value>,
    pub message_timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    #[sqlx(rename = "type")]
    pub kind: SignalType,
    pub status: SignalStatus,
    pub status_reason: Option<String>,
}

impl Signal {
    /// spec.md §3: valid iff asset/direction/entry/stop present, at least one
    /// TP level, and the stop lies on the loss side of entry for the direction.
    pub fn is_valid(&self) -> bool {
        let (Some(direction), Some(entry), Some(stop)) =
            (self.direction, self.entry_price, self.stop_loss)
        else {
            return false;
        };
        if self.asset.is_none() || self.tp_levels.0.is_empty() {
            return false;
        }
        match direction {
            Direction::Long => stop < entry,
            Direction::Short => stop > entry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl From<Direction> for Side {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Position {
    pub id: Uuid,
    pub signal_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub sub_account_id: Uuid,
    pub venue_symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub leverage: i32,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub tp_levels: Json<Vec<Decimal>>,
    pub tp_distribution: Json<Vec<Decimal>>,
    pub stop_loss: Decimal,
    pub status: PositionStatus,
    pub venue_order_id: Option<String>,
    pub compensation_required: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// P2: status=CLOSED ⇒ closedAt set ∧ quantity=0.
    pub fn closed_invariant_holds(&self) -> bool {
        if self.status != PositionStatus::Closed {
            return true;
        }
        self.closed_at.is_some() && self.quantity.is_zero() && self.exit_price.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum OrderKind {
    Entry,
    Tp,
    Sl,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderRow {
    pub venue_order_id: String,
    pub position_id: Uuid,
    pub kind: OrderKind,
    pub client_order_tag: String,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub status: String,
}

pub fn client_order_tag(kind: OrderKind, signal_id: Uuid, leg_idx: usize) -> String {
    let kind_str = match kind {
        OrderKind::Entry => "ENTRY",
        OrderKind::Tp => "TP",
        OrderKind::Sl => "SL",
    };
    format!("{kind_str}_{signal_id}_{leg_idx}")
}
