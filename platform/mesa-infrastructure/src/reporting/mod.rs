use chrono::{DateTime, Utc};
use mesa_domain::value_objects::trade::ClosedTrade;
use std::fs;
use std::path::Path;

pub const TRADES_CSV_HEADER: [&str; 13] = [
    "Trade #",
    "Date",
    "Time",
    "Symbol",
    "Side",
    "Entry Price",
    "Stop Loss",
    "Target Price",
    "Exit Price",
    "Exit Time",
    "Result",
    "P/L",
    "Comments",
];

fn utc(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
}

fn result_label(pnl: f64) -> &'static str {
    if pnl > 0.0 {
        "WIN"
    } else if pnl < 0.0 {
        "LOSS"
    } else {
        "BREAKEVEN"
    }
}

fn trade_row(trade: &ClosedTrade) -> [String; 13] {
    let entry = utc(trade.entry_timestamp);
    let exit = utc(trade.exit_timestamp);
    [
        trade.trade_id.0.to_string(),
        entry
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        entry
            .map(|dt| dt.format("%H:%M:%S%.3f").to_string())
            .unwrap_or_default(),
        trade.symbol.clone(),
        trade.side.as_str().to_string(),
        trade.entry_price.to_string(),
        trade.stop_price.to_string(),
        trade.target_price.to_string(),
        trade.exit_price.to_string(),
        exit.map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| trade.exit_timestamp.to_string()),
        result_label(trade.realized_pnl).to_string(),
        format!("{:.2}", trade.realized_pnl),
        format!("{} / exit {}", trade.entry_reason, trade.exit_reason),
    ]
}

pub fn write_trades_csv(path: &Path, trades: &[ClosedTrade]) -> Result<(), String> {
    let mut wtr = csv::Writer::from_path(path)
        .map_err(|err| format!("failed to create trades csv {}: {}", path.display(), err))?;
    wtr.write_record(TRADES_CSV_HEADER)
        .map_err(|err| format!("failed to write trades csv header: {}", err))?;
    for trade in trades {
        wtr.write_record(trade_row(trade))
            .map_err(|err| format!("failed to write trades row: {}", err))?;
    }
    wtr.flush()
        .map_err(|err| format!("failed to flush trades csv: {}", err))
}

pub fn write_summary_json(path: &Path, summary: &serde_json::Value) -> Result<(), String> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|err| format!("failed to serialize summary: {}", err))?;
    fs::write(path, json)
        .map_err(|err| format!("failed to write summary {}: {}", path.display(), err))
}
