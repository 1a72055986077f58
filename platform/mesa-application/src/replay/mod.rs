use crate::config::Config;
use crate::engine::{EngineEvent, EngineReport, TradingEngine};
use crate::reporting::{compute_trade_stats, TradeStatsReport};
use crate::shared::{build_engine, resolve_paper_venue_config, trades_fingerprint};
use mesa_domain::events::domain_event::Alert;
use mesa_domain::repositories::market_stream::{MarketStream, StreamError};
use mesa_domain::repositories::trade_journal::TradeJournal;
use mesa_domain::services::paper_venue::PaperVenue;
use mesa_domain::value_objects::trade::ClosedTrade;
use std::time::Instant;
use tracing::{info, info_span, warn};

/// Upper bound on shutdown rounds; a flatten on the paper venue settles in one.
const MAX_SHUTDOWN_ROUNDS: usize = 16;

#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub run_id: String,
    pub trades: Vec<ClosedTrade>,
    pub stats: TradeStatsReport,
    pub report: EngineReport,
    pub alerts: Vec<Alert>,
    pub trades_sha256: String,
}

/// Deterministic backtest: feeds every tick of `stream` through the engine against the
/// paper venue, then shuts down. Pending exit retries fire before the next tick.
pub fn run_replay(
    config: &Config,
    stream: &mut dyn MarketStream,
    journal: Box<dyn TradeJournal + Send>,
) -> Result<ReplayResult, String> {
    let _span = info_span!(
        "replay",
        run_id = %config.run.run_id,
        symbol = %config.run.symbol,
        bar = %config.run.bar
    )
    .entered();
    let started = Instant::now();

    let venue = PaperVenue::new(resolve_paper_venue_config(config));
    let mut engine = build_engine(config, venue, journal)?;
    drive(&mut engine, stream)?;

    let mut step = engine.handle(EngineEvent::Shutdown { flatten: None });
    let mut rounds = 0;
    while let Some(delay_ms) = step.retry_after_ms {
        if rounds >= MAX_SHUTDOWN_ROUNDS {
            break;
        }
        rounds += 1;
        info!(delay_ms, "retrying exit during shutdown");
        step = engine.handle(EngineEvent::RetryExit);
    }
    if !engine.is_settled() {
        warn!(
            state = %engine.machine().state(),
            mode = engine.machine().mode().as_str(),
            "replay ended with an unsettled trade"
        );
    }
    engine.disconnect();

    let report = engine.report();
    let trades = engine.closed_trades().to_vec();
    let stats = compute_trade_stats(&trades);
    let trades_sha256 = trades_fingerprint(&trades);
    metrics::histogram!("mesa.replay.run_ms").record(started.elapsed().as_millis() as f64);
    info!(
        ticks = report.ticks,
        bars = report.bars,
        trades = trades.len(),
        pnl = report.realized_pnl,
        "replay finished"
    );

    Ok(ReplayResult {
        run_id: config.run.run_id.clone(),
        alerts: engine.alerts().to_vec(),
        trades,
        stats,
        report,
        trades_sha256,
    })
}

fn drive(engine: &mut TradingEngine<PaperVenue>, stream: &mut dyn MarketStream) -> Result<(), String> {
    let mut retry_pending = false;
    loop {
        let tick = match stream.next_tick() {
            Ok(tick) => tick,
            Err(StreamError::EndOfStream) => return Ok(()),
            Err(StreamError::InvalidData(msg)) => {
                warn!(error = %msg, "skipping unreadable tick");
                continue;
            }
            Err(err) => return Err(format!("replay stream failed: {err}")),
        };
        if retry_pending {
            retry_pending = engine.handle(EngineEvent::RetryExit).retry_after_ms.is_some();
        }
        let step = engine.handle(EngineEvent::Tick(tick));
        retry_pending |= step.retry_after_ms.is_some();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesa_domain::repositories::market_stream::VecTickStream;
    use mesa_domain::repositories::trade_journal::MemoryJournal;
    use mesa_domain::value_objects::tick::Tick;

    fn config() -> Config {
        toml::from_str(
            r#"
[run]
run_id = "replay_unit"
symbol = "MES"
bar = "1s"
history_bars = 50

[orders]
quantity = 1
multiplier = 5.0

[bracket]
policy = "points"
stop = 2.0
target = 3.0

[signals]
ema_fast = 2
ema_slow = 4
rsi_period = 2
atr_period = 2

[paths]
out_dir = "runs/"
"#,
        )
        .expect("config")
    }

    fn rising_then_falling() -> Vec<Tick> {
        let mut ticks = Vec::new();
        let mut price = 100.0;
        for i in 0..40 {
            price += if i < 20 { 0.5 } else { -0.75 };
            ticks.push(Tick::new(i * 500, price, 1));
        }
        ticks
    }

    #[test]
    fn replay_is_deterministic() {
        let cfg = config();
        let a = run_replay(
            &cfg,
            &mut VecTickStream::new(rising_then_falling()),
            Box::new(MemoryJournal::default()),
        )
        .expect("replay a");
        let b = run_replay(
            &cfg,
            &mut VecTickStream::new(rising_then_falling()),
            Box::new(MemoryJournal::default()),
        )
        .expect("replay b");
        assert_eq!(a.trades, b.trades);
        assert_eq!(a.trades_sha256, b.trades_sha256);
        assert_eq!(a.report, b.report);
    }

    #[test]
    fn replay_trades_an_uptrend_and_ends_flat() {
        let result = run_replay(
            &config(),
            &mut VecTickStream::new(rising_then_falling()),
            Box::new(MemoryJournal::default()),
        )
        .expect("replay");
        assert_eq!(result.report.ticks, 40);
        assert_eq!(result.report.bars, 20);
        assert!(!result.trades.is_empty());
        assert_eq!(result.report.final_state, "IDLE");
        assert_eq!(result.stats.all.trades as usize, result.trades.len());
        assert_eq!(result.report.entries, result.report.trades_closed);
    }

    #[test]
    fn empty_stream_produces_no_trades() {
        let result = run_replay(
            &config(),
            &mut VecTickStream::new(Vec::new()),
            Box::new(MemoryJournal::default()),
        )
        .expect("replay");
        assert!(result.trades.is_empty());
        assert_eq!(result.report.bars, 0);
    }
}
