use crate::engine::EngineReport;
use crate::shared::trades_fingerprint;
use mesa_domain::repositories::artifacts::ArtifactWriter;
use mesa_domain::repositories::trade_journal::TradeJournalReader;
use mesa_domain::value_objects::journal::{JournalEvent, JournalRecord};
use mesa_domain::value_objects::side::Side;
use mesa_domain::value_objects::trade::{ClosedTrade, TradeId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info_span, warn};

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TradeStats {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub breakeven: u64,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// `None` when there are no losing trades.
    pub win_loss_ratio: Option<f64>,
    pub profit_factor: Option<f64>,
    pub max_drawdown: f64,
    pub max_runup: f64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TradeStatsReport {
    pub all: TradeStats,
    pub long: TradeStats,
    pub short: TradeStats,
}

pub fn compute_trade_stats(trades: &[ClosedTrade]) -> TradeStatsReport {
    let long: Vec<&ClosedTrade> = trades.iter().filter(|t| t.side == Side::Long).collect();
    let short: Vec<&ClosedTrade> = trades.iter().filter(|t| t.side == Side::Short).collect();
    let all: Vec<&ClosedTrade> = trades.iter().collect();
    TradeStatsReport {
        all: stats_for(&all),
        long: stats_for(&long),
        short: stats_for(&short),
    }
}

fn stats_for(trades: &[&ClosedTrade]) -> TradeStats {
    let mut stats = TradeStats {
        trades: trades.len() as u64,
        ..TradeStats::default()
    };
    if trades.is_empty() {
        return stats;
    }

    let mut gross_win = 0.0;
    let mut gross_loss = 0.0;
    let mut equity = 0.0_f64;
    let mut peak = 0.0_f64;
    let mut trough = 0.0_f64;
    for trade in trades {
        let pnl = trade.realized_pnl;
        stats.total_pnl += pnl;
        if pnl > 0.0 {
            stats.wins += 1;
            gross_win += pnl;
            stats.largest_win = stats.largest_win.max(pnl);
        } else if pnl < 0.0 {
            stats.losses += 1;
            gross_loss += -pnl;
            stats.largest_loss = stats.largest_loss.min(pnl);
        } else {
            stats.breakeven += 1;
        }

        equity += pnl;
        peak = peak.max(equity);
        trough = trough.min(equity);
        stats.max_drawdown = stats.max_drawdown.max(peak - equity);
        stats.max_runup = stats.max_runup.max(equity - trough);
    }

    stats.win_rate = stats.wins as f64 / stats.trades as f64;
    stats.avg_pnl = stats.total_pnl / stats.trades as f64;
    if stats.wins > 0 {
        stats.avg_win = gross_win / stats.wins as f64;
    }
    if stats.losses > 0 {
        stats.avg_loss = -(gross_loss / stats.losses as f64);
        stats.win_loss_ratio = Some(stats.avg_win / stats.avg_loss.abs());
        stats.profit_factor = Some(gross_win / gross_loss);
    }
    stats
}

/// Trades rebuilt from journal lines.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconstructedTrades {
    pub closed: Vec<ClosedTrade>,
    /// ENTRY lines without a matching EXIT: positions still open when the log ends.
    pub open: Vec<JournalRecord>,
    /// EXIT lines whose ENTRY is missing; indicates a truncated or foreign log.
    pub orphan_exits: Vec<JournalRecord>,
}

/// Pairs ENTRY and EXIT records by trade id. Output follows exit order so it matches the
/// sequence a run produced.
pub fn reconstruct_trades(records: &[JournalRecord]) -> ReconstructedTrades {
    let mut entries: BTreeMap<TradeId, &JournalRecord> = BTreeMap::new();
    let mut out = ReconstructedTrades::default();
    for record in records {
        match record.event {
            JournalEvent::Entry => {
                if entries.insert(record.trade_id, record).is_some() {
                    warn!(trade = %record.trade_id, "duplicate ENTRY record; keeping the latest");
                }
            }
            JournalEvent::Exit => {
                let Some(entry) = entries.remove(&record.trade_id) else {
                    out.orphan_exits.push(record.clone());
                    continue;
                };
                let Some(exit_reason) = record.exit_reason else {
                    out.orphan_exits.push(record.clone());
                    continue;
                };
                out.closed.push(ClosedTrade {
                    trade_id: record.trade_id,
                    symbol: entry.symbol.clone(),
                    side: entry.side,
                    qty: record.qty,
                    entry_price: entry.price,
                    exit_price: record.price,
                    stop_price: record.stop,
                    target_price: record.target,
                    exit_reason,
                    entry_timestamp: entry.timestamp,
                    exit_timestamp: record.timestamp,
                    realized_pnl: record.pnl.unwrap_or(0.0),
                    entry_reason: String::new(),
                });
            }
        }
    }
    out.open = entries.into_values().cloned().collect();
    out
}

pub fn summary_json(
    run_id: &str,
    trades: &[ClosedTrade],
    stats: &TradeStatsReport,
    engine: Option<&EngineReport>,
) -> serde_json::Value {
    serde_json::json!({
        "run_id": run_id,
        "trades": trades.len(),
        "trades_sha256": trades_fingerprint(trades),
        "stats": stats,
        "engine": engine,
    })
}

/// Writes `trades.csv` and `summary.json` into `out_dir`.
pub fn write_run_artifacts(
    out_dir: &Path,
    writer: &dyn ArtifactWriter,
    trades: &[ClosedTrade],
    summary: &serde_json::Value,
) -> Result<(), String> {
    writer.ensure_dir(out_dir)?;
    writer.write_trades_csv(&out_dir.join("trades.csv"), trades)?;
    writer.write_summary_json(&out_dir.join("summary.json"), summary)?;
    Ok(())
}

pub struct GenerateReportResult {
    pub out_dir: PathBuf,
    pub trades: Vec<ClosedTrade>,
    pub open_trades: usize,
    pub orphan_exits: usize,
    pub stats: TradeStatsReport,
}

/// Rebuilds trades from a journal file and writes the report artifacts.
pub fn generate_report(
    journal_path: &Path,
    out_dir: &Path,
    run_id: &str,
    reader: &dyn TradeJournalReader,
    writer: &dyn ArtifactWriter,
) -> Result<GenerateReportResult, String> {
    let _span = info_span!("generate_report", journal = %journal_path.display()).entered();
    let stage_start = Instant::now();

    let records = reader.read_records(journal_path)?;
    let rebuilt = reconstruct_trades(&records);
    if !rebuilt.open.is_empty() {
        warn!(open = rebuilt.open.len(), "journal ends with open trades");
    }
    if !rebuilt.orphan_exits.is_empty() {
        warn!(orphans = rebuilt.orphan_exits.len(), "EXIT records without ENTRY");
    }

    let stats = compute_trade_stats(&rebuilt.closed);
    let mut summary = summary_json(run_id, &rebuilt.closed, &stats, None);
    summary["open_trades"] = serde_json::json!(rebuilt.open.len());
    summary["orphan_exits"] = serde_json::json!(rebuilt.orphan_exits.len());
    write_run_artifacts(out_dir, writer, &rebuilt.closed, &summary)?;

    metrics::histogram!("mesa.report.generate_ms")
        .record(stage_start.elapsed().as_millis() as f64);
    metrics::gauge!("mesa.report.trades").set(rebuilt.closed.len() as f64);

    Ok(GenerateReportResult {
        out_dir: out_dir.to_path_buf(),
        open_trades: rebuilt.open.len(),
        orphan_exits: rebuilt.orphan_exits.len(),
        trades: rebuilt.closed,
        stats,
    })
}
