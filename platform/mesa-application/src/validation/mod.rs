use crate::config::{validate_config, Config};
use crate::shared::resolve_bar_length;
use mesa_domain::repositories::market_stream::{MarketStream, StreamError};
use mesa_domain::services::realtime_bar::{BarAggregator, TickError};
use serde::Serialize;
use std::time::Instant;
use tracing::{info_span, warn};

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TickQualityReport {
    pub ticks: u64,
    /// Rows the stream could not turn into a tick.
    pub unreadable_rows: u64,
    pub invalid_ticks: u64,
    pub out_of_order: u64,
    /// Out-of-order ticks that would fall before the active bar and be dropped.
    pub late_ticks: u64,
    pub duplicates: u64,
    pub bars: u64,
    /// Bar periods between the first and last tick that received no ticks.
    pub empty_periods: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

impl TickQualityReport {
    pub fn has_issues(&self) -> bool {
        self.unreadable_rows > 0
            || self.invalid_ticks > 0
            || self.late_ticks > 0
            || self.duplicates > 0
    }
}

/// Scans a tick stream the way the engine would aggregate it, without trading.
pub fn tick_quality(
    stream: &mut dyn MarketStream,
    symbol: &str,
    bar_length_ms: i64,
) -> Result<TickQualityReport, String> {
    let mut aggregator = BarAggregator::new(symbol.to_string(), bar_length_ms)?;
    let mut report = TickQualityReport::default();
    let mut previous: Option<(i64, f64, u64)> = None;
    let mut last_bar_start: Option<i64> = None;

    let mut count_bar = |start: i64, report: &mut TickQualityReport| {
        if let Some(prev) = last_bar_start {
            let skipped = (start - prev) / bar_length_ms - 1;
            report.empty_periods += skipped.max(0) as u64;
        }
        last_bar_start = Some(start);
        report.bars += 1;
    };

    loop {
        let tick = match stream.next_tick() {
            Ok(tick) => tick,
            Err(StreamError::EndOfStream) => break,
            Err(StreamError::InvalidData(msg)) => {
                report.unreadable_rows += 1;
                warn!(error = %msg, "unreadable tick row");
                continue;
            }
            Err(err) => return Err(format!("tick stream failed: {err}")),
        };
        report.ticks += 1;

        if let Some((ts, price, size)) = previous {
            if tick.timestamp < ts {
                report.out_of_order += 1;
            } else if tick.timestamp == ts && tick.price == price && tick.size == size {
                report.duplicates += 1;
            }
        }
        previous = Some((tick.timestamp, tick.price, tick.size));

        match aggregator.on_tick(&tick) {
            Ok(Some(bar)) => count_bar(bar.period_start, &mut report),
            Ok(None) => {}
            Err(TickError::Late(_)) => report.late_ticks += 1,
            Err(TickError::Invalid { .. }) => report.invalid_ticks += 1,
        }
        if tick.is_valid() {
            report.first_timestamp = Some(
                report
                    .first_timestamp
                    .map_or(tick.timestamp, |t| t.min(tick.timestamp)),
            );
            report.last_timestamp = Some(
                report
                    .last_timestamp
                    .map_or(tick.timestamp, |t| t.max(tick.timestamp)),
            );
        }
    }
    if let Some(bar) = aggregator.force_finalize() {
        count_bar(bar.period_start, &mut report);
    }
    Ok(report)
}

/// Config checks plus a data-quality pass over the tick stream. In strict mode warnings
/// and data issues are failures.
pub fn validate(
    config: &Config,
    strict: bool,
    stream: Option<&mut dyn MarketStream>,
) -> Result<serde_json::Value, String> {
    let _span = info_span!(
        "validate",
        strict = strict,
        run_id = %config.run.run_id,
        symbol = %config.run.symbol,
        bar = %config.run.bar
    )
    .entered();

    let check = validate_config(config);
    for warning in &check.warnings {
        warn!("config: {warning}");
    }
    if !check.errors.is_empty() {
        return Err(format!("invalid config: {}", check.errors.join("; ")));
    }

    let stage_start = Instant::now();
    let quality = match stream {
        Some(stream) => {
            let bar = resolve_bar_length(config)?;
            Some(tick_quality(stream, &config.run.symbol, bar.length_ms)?)
        }
        None => None,
    };
    metrics::histogram!("mesa.validate.scan_ms").record(stage_start.elapsed().as_millis() as f64);

    if let Some(q) = quality.as_ref() {
        metrics::gauge!("mesa.validate.ticks").set(q.ticks as f64);
        metrics::gauge!("mesa.validate.late_ticks").set(q.late_ticks as f64);
        metrics::gauge!("mesa.validate.invalid_ticks").set(q.invalid_ticks as f64);
        metrics::gauge!("mesa.validate.duplicates").set(q.duplicates as f64);
    }

    if strict {
        if !check.warnings.is_empty() {
            return Err(format!(
                "strict validation failed: {}",
                check.warnings.join("; ")
            ));
        }
        if quality.as_ref().is_some_and(TickQualityReport::has_issues) {
            return Err("strict validation failed: tick data quality issues".to_string());
        }
    }

    Ok(serde_json::json!({
        "run_id": config.run.run_id,
        "symbol": config.run.symbol,
        "bar": config.run.bar,
        "warnings": check.warnings,
        "ticks": quality,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesa_domain::repositories::market_stream::VecTickStream;
    use mesa_domain::value_objects::tick::Tick;

    struct FlakyStream {
        items: Vec<Result<Tick, StreamError>>,
    }

    impl MarketStream for FlakyStream {
        fn next_tick(&mut self) -> Result<Tick, StreamError> {
            if self.items.is_empty() {
                return Err(StreamError::EndOfStream);
            }
            self.items.remove(0)
        }
    }

    fn config() -> Config {
        toml::from_str(
            r#"
[run]
run_id = "v"
symbol = "MES"
bar = "1s"

[orders]
quantity = 1

[bracket]
policy = "points"
stop = 2.0
target = 4.0

[paths]
out_dir = "runs/"
"#,
        )
        .expect("config")
    }

    #[test]
    fn tick_quality_counts_gaps_late_and_duplicates() {
        let ticks = vec![
            Tick::new(100, 10.0, 1),
            Tick::new(100, 10.0, 1),
            Tick::new(1_200, 10.5, 1),
            Tick::new(900, 10.1, 1),
            Tick::new(4_100, 11.0, 2),
            Tick::new(4_200, 0.0, 1),
        ];
        let mut stream = VecTickStream::new(ticks);
        let report = tick_quality(&mut stream, "MES", 1_000).expect("report");
        assert_eq!(report.ticks, 6);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.out_of_order, 1);
        assert_eq!(report.late_ticks, 1);
        assert_eq!(report.invalid_ticks, 1);
        assert_eq!(report.bars, 3);
        assert_eq!(report.empty_periods, 2);
        assert_eq!(report.first_timestamp, Some(100));
        assert_eq!(report.last_timestamp, Some(4_100));
    }

    #[test]
    fn unreadable_rows_are_counted_and_fatal_errors_propagate() {
        let mut stream = FlakyStream {
            items: vec![
                Ok(Tick::new(0, 10.0, 1)),
                Err(StreamError::InvalidData("row 3".to_string())),
                Ok(Tick::new(10, 10.0, 1)),
            ],
        };
        let report = tick_quality(&mut stream, "MES", 1_000).expect("report");
        assert_eq!(report.unreadable_rows, 1);
        assert_eq!(report.ticks, 2);

        let mut broken = FlakyStream {
            items: vec![Err(StreamError::Protocol("bad header".to_string()))],
        };
        assert!(tick_quality(&mut broken, "MES", 1_000).is_err());
    }

    #[test]
    fn strict_validation_rejects_dirty_data() {
        let cfg = config();
        let ticks = vec![Tick::new(1_500, 10.0, 1), Tick::new(2_500, 10.0, 1), Tick::new(1_000, 9.0, 1)];
        let lenient = validate(&cfg, false, Some(&mut VecTickStream::new(ticks.clone())))
            .expect("lenient");
        assert_eq!(lenient["ticks"]["late_ticks"], 1);
        assert!(validate(&cfg, true, Some(&mut VecTickStream::new(ticks))).is_err());
    }

    #[test]
    fn config_errors_fail_validation() {
        let mut cfg = config();
        cfg.orders.quantity = 0;
        let err = validate(&cfg, false, None).unwrap_err();
        assert!(err.contains("orders.quantity"));
    }
}
