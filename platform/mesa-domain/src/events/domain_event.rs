use crate::value_objects::order::{OrderId, OrderStatus};
use crate::value_objects::side::Side;
use crate::value_objects::trade::{ClosedTrade, ExitReason, TradeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    UnknownOrder,
    Overfill,
    GatewayError,
    ExitRejected,
    ExitRetriesExhausted,
    FeedDisconnected,
    ReconciliationMismatch,
    OpenPositionAtShutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub kind: AlertKind,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<TradeId>,
    pub message: String,
}

/// Lifecycle outbox of the trade state machine, drained by the owner after each event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    EntrySubmitted {
        trade_id: TradeId,
        order_id: OrderId,
        side: Side,
        qty: u64,
        timestamp: i64,
        reason: String,
    },
    EntryFilled {
        trade_id: TradeId,
        side: Side,
        price: f64,
        qty: u64,
        stop: f64,
        target: f64,
        timestamp: i64,
    },
    EntryAbandoned {
        trade_id: TradeId,
        order_id: OrderId,
        status: OrderStatus,
        timestamp: i64,
    },
    StopAdjusted {
        trade_id: TradeId,
        stop: f64,
        timestamp: i64,
    },
    ExitSubmitted {
        trade_id: TradeId,
        order_id: OrderId,
        reason: ExitReason,
        qty: u64,
        timestamp: i64,
    },
    ExitRetryScheduled {
        trade_id: TradeId,
        attempt: u32,
        delay_ms: u64,
        timestamp: i64,
    },
    TradeClosed(ClosedTrade),
    Alert(Alert),
}
