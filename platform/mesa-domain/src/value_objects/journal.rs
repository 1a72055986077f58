use crate::value_objects::side::Side;
use crate::value_objects::trade::{ClosedTrade, ExitReason, TradeId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalEvent {
    Entry,
    Exit,
}

/// One line of the append-only trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub event: JournalEvent,
    pub trade_id: TradeId,
    pub symbol: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_utc: Option<String>,
    pub side: Side,
    pub price: f64,
    pub stop: f64,
    pub target: f64,
    pub qty: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
}

impl JournalRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn entry(
        trade_id: TradeId,
        symbol: &str,
        timestamp: i64,
        side: Side,
        price: f64,
        stop: f64,
        target: f64,
        qty: u64,
    ) -> Self {
        Self {
            event: JournalEvent::Entry,
            trade_id,
            symbol: symbol.to_string(),
            timestamp,
            time_utc: format_utc_millis(timestamp),
            side,
            price,
            stop,
            target,
            qty,
            pnl: None,
            exit_reason: None,
        }
    }

    pub fn exit(closed: &ClosedTrade) -> Self {
        Self {
            event: JournalEvent::Exit,
            trade_id: closed.trade_id,
            symbol: closed.symbol.clone(),
            timestamp: closed.exit_timestamp,
            time_utc: format_utc_millis(closed.exit_timestamp),
            side: closed.side,
            price: closed.exit_price,
            stop: closed.stop_price,
            target: closed.target_price,
            qty: closed.qty,
            pnl: Some(closed.realized_pnl),
            exit_reason: Some(closed.exit_reason),
        }
    }
}

pub fn format_utc_millis(timestamp: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}
