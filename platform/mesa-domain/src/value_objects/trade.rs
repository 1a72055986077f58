use crate::value_objects::order::OrderId;
use crate::value_objects::side::Side;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(pub u64);

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Idle,
    EntryPending,
    Open,
    ExitPending,
    Closed,
}

impl TradeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TradeState::Idle | TradeState::Closed)
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TradeState::Idle => "IDLE",
            TradeState::EntryPending => "ENTRY_PENDING",
            TradeState::Open => "OPEN",
            TradeState::ExitPending => "EXIT_PENDING",
            TradeState::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Stop,
    Target,
    Signal,
    Flatten,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::Stop => "STOP",
            ExitReason::Target => "TARGET",
            ExitReason::Signal => "SIGNAL",
            ExitReason::Flatten => "FLATTEN",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single active position owned by the trade state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub side: Side,
    pub requested_qty: u64,
    pub entry_order_id: OrderId,
    pub entry_fill_price: Option<f64>,
    pub entry_fill_qty: u64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub exit_order_id: Option<OrderId>,
    pub exit_reason: Option<ExitReason>,
    pub exit_fill_price: Option<f64>,
    pub exit_fill_qty: u64,
    pub state: TradeState,
    pub entry_reason: String,
    pub opened_at: i64,
    pub entry_filled_at: Option<i64>,
}

impl Trade {
    pub fn pending_entry(
        id: TradeId,
        side: Side,
        requested_qty: u64,
        entry_order_id: OrderId,
        entry_reason: String,
        opened_at: i64,
    ) -> Self {
        Self {
            id,
            side,
            requested_qty,
            entry_order_id,
            entry_fill_price: None,
            entry_fill_qty: 0,
            stop_price: None,
            target_price: None,
            exit_order_id: None,
            exit_reason: None,
            exit_fill_price: None,
            exit_fill_qty: 0,
            state: TradeState::EntryPending,
            entry_reason,
            opened_at,
            entry_filled_at: None,
        }
    }

    /// Contracts held once the entry is (partially) filled, minus what the exit already closed.
    pub fn open_qty(&self) -> u64 {
        self.entry_fill_qty.saturating_sub(self.exit_fill_qty)
    }

    /// Net position expected at the broker, signed by side.
    pub fn expected_position(&self) -> i64 {
        let qty = i64::try_from(self.open_qty()).unwrap_or(i64::MAX);
        match self.side {
            Side::Long => qty,
            Side::Short => -qty,
        }
    }
}

/// Archived result of a trade whose exit has fully filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: TradeId,
    pub symbol: String,
    pub side: Side,
    pub qty: u64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub exit_reason: ExitReason,
    pub entry_timestamp: i64,
    pub exit_timestamp: i64,
    pub realized_pnl: f64,
    pub entry_reason: String,
}

pub fn realized_pnl(side: Side, entry_price: f64, exit_price: f64, qty: u64, multiplier: f64) -> f64 {
    (exit_price - entry_price) * qty as f64 * side.sign() * multiplier
}
