use crate::value_objects::bar::Bar;
use crate::value_objects::tick::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LateTickError {
    pub tick_timestamp: i64,
    pub period_start: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickError {
    Late(LateTickError),
    Invalid { timestamp: i64, reason: String },
}

impl std::fmt::Display for TickError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickError::Late(late) => write!(
                f,
                "late tick at {} precedes active period starting {}",
                late.tick_timestamp, late.period_start
            ),
            TickError::Invalid { timestamp, reason } => {
                write!(f, "invalid tick at {timestamp}: {reason}")
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BarAggregationReport {
    pub ticks_accepted: u64,
    pub late_ticks: u64,
    pub invalid_ticks: u64,
    pub bars_emitted: u64,
    pub last_tick_timestamp: Option<i64>,
    pub last_bar_start: Option<i64>,
}

/// Folds ticks into period-aligned bars. Bars are tick driven: a period that sees no
/// ticks never produces a bar.
#[derive(Debug, Clone)]
pub struct BarAggregator {
    symbol: String,
    length_ms: i64,
    active: Option<Bar>,
    finalized_until: Option<i64>,
    report: BarAggregationReport,
}

impl BarAggregator {
    pub fn new(symbol: String, length_ms: i64) -> Result<Self, String> {
        if length_ms <= 0 {
            return Err("bar length must be > 0".to_string());
        }
        Ok(Self {
            symbol,
            length_ms,
            active: None,
            finalized_until: None,
            report: BarAggregationReport::default(),
        })
    }

    pub fn length_ms(&self) -> i64 {
        self.length_ms
    }

    pub fn report(&self) -> &BarAggregationReport {
        &self.report
    }

    pub fn active_bar(&self) -> Option<&Bar> {
        self.active.as_ref()
    }

    /// Ingests one tick. Returns the bar this tick finalized, if any; at most one bar
    /// closes per tick because idle periods are skipped rather than emitted.
    pub fn on_tick(&mut self, tick: &Tick) -> Result<Option<Bar>, TickError> {
        if !tick.is_valid() {
            self.report.invalid_ticks = self.report.invalid_ticks.saturating_add(1);
            return Err(TickError::Invalid {
                timestamp: tick.timestamp,
                reason: format!("price={} size={}", tick.price, tick.size),
            });
        }

        let period_floor = match &self.active {
            Some(bar) => bar.period_start,
            None => self.finalized_until.unwrap_or(i64::MIN),
        };
        if tick.timestamp < period_floor {
            self.report.late_ticks = self.report.late_ticks.saturating_add(1);
            return Err(TickError::Late(LateTickError {
                tick_timestamp: tick.timestamp,
                period_start: period_floor,
            }));
        }

        self.report.ticks_accepted = self.report.ticks_accepted.saturating_add(1);
        self.report.last_tick_timestamp = Some(tick.timestamp);

        let rolls_over = self
            .active
            .as_ref()
            .is_some_and(|bar| !bar.contains(tick.timestamp));
        let finalized = if rolls_over {
            self.finalize_active()
        } else {
            if let Some(bar) = self.active.as_mut() {
                bar.fold(tick.price, tick.size);
            }
            None
        };

        if self.active.is_none() {
            let start = self.period_start_for(tick.timestamp);
            self.active = Some(Bar::opened_at(
                &self.symbol,
                start,
                self.length_ms,
                tick.price,
                tick.size,
            ));
        }

        Ok(finalized)
    }

    /// Closes the in-progress bar, if any. Used at shutdown and at the end of a replay.
    pub fn force_finalize(&mut self) -> Option<Bar> {
        self.finalize_active()
    }

    fn finalize_active(&mut self) -> Option<Bar> {
        let bar = self.active.take()?;
        self.finalized_until = Some(bar.period_end);
        self.report.bars_emitted = self.report.bars_emitted.saturating_add(1);
        self.report.last_bar_start = Some(bar.period_start);
        Some(bar)
    }

    fn period_start_for(&self, timestamp: i64) -> i64 {
        timestamp.saturating_sub(timestamp.rem_euclid(self.length_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts: i64, price: f64, size: u64) -> Tick {
        Tick::new(ts, price, size)
    }

    #[test]
    fn aggregates_ticks_into_bars_and_rolls_on_period_change() {
        let mut agg = BarAggregator::new("MES".to_string(), 60_000).unwrap();

        assert_eq!(agg.on_tick(&tick(1_000, 10.0, 1)), Ok(None));
        assert_eq!(agg.on_tick(&tick(10_000, 11.0, 2)), Ok(None));
        assert_eq!(agg.on_tick(&tick(20_000, 9.5, 1)), Ok(None));
        let bar0 = agg
            .on_tick(&tick(70_000, 12.0, 4))
            .unwrap()
            .expect("finalize first bar");

        assert_eq!(bar0.period_start, 0);
        assert_eq!(bar0.period_end, 60_000);
        assert_eq!(bar0.open, 10.0);
        assert_eq!(bar0.high, 11.0);
        assert_eq!(bar0.low, 9.5);
        assert_eq!(bar0.close, 9.5);
        assert_eq!(bar0.volume, 4);
        assert_eq!(bar0.tick_count, 3);
        assert_eq!(agg.active_bar().map(|b| b.period_start), Some(60_000));
    }

    #[test]
    fn tick_exactly_at_period_end_belongs_to_next_bar() {
        let mut agg = BarAggregator::new("MES".to_string(), 60_000).unwrap();
        agg.on_tick(&tick(59_999, 10.0, 1)).unwrap();
        let closed = agg.on_tick(&tick(60_000, 11.0, 1)).unwrap().expect("closed");
        assert_eq!(closed.close, 10.0);
        assert_eq!(agg.active_bar().map(|b| b.open), Some(11.0));
    }

    #[test]
    fn idle_periods_are_skipped_without_synthetic_bars() {
        let mut agg = BarAggregator::new("MES".to_string(), 60_000).unwrap();
        agg.on_tick(&tick(0, 10.0, 1)).unwrap();
        let closed = agg.on_tick(&tick(600_000, 11.0, 1)).unwrap().expect("closed");
        assert_eq!(closed.period_start, 0);
        assert_eq!(agg.active_bar().map(|b| b.period_start), Some(600_000));
        assert_eq!(agg.report().bars_emitted, 1);
    }

    #[test]
    fn out_of_order_tick_within_active_period_is_folded() {
        let mut agg = BarAggregator::new("MES".to_string(), 60_000).unwrap();
        agg.on_tick(&tick(30_000, 10.0, 1)).unwrap();
        agg.on_tick(&tick(20_000, 12.0, 1)).unwrap();
        let bar = agg.force_finalize().expect("bar");
        assert_eq!(bar.high, 12.0);
        assert_eq!(bar.close, 12.0);
        assert_eq!(agg.report().late_ticks, 0);
    }

    #[test]
    fn rejects_late_ticks_and_counts_them() {
        let mut agg = BarAggregator::new("MES".to_string(), 60_000).unwrap();
        agg.on_tick(&tick(10_000, 10.0, 1)).unwrap();
        let emitted = agg.on_tick(&tick(65_000, 11.0, 1)).unwrap().expect("closed");

        let err = agg.on_tick(&tick(50_000, 99.0, 1)).unwrap_err();
        assert_eq!(
            err,
            TickError::Late(LateTickError {
                tick_timestamp: 50_000,
                period_start: 60_000
            })
        );
        assert_eq!(agg.report().late_ticks, 1);
        assert_eq!(emitted.high, 10.0);
        assert_eq!(agg.active_bar().map(|b| b.high), Some(11.0));
    }

    #[test]
    fn late_tick_after_force_finalize_is_rejected() {
        let mut agg = BarAggregator::new("MES".to_string(), 60_000).unwrap();
        agg.on_tick(&tick(10_000, 10.0, 1)).unwrap();
        agg.force_finalize().expect("bar");
        assert!(matches!(
            agg.on_tick(&tick(20_000, 10.0, 1)),
            Err(TickError::Late(_))
        ));
        assert_eq!(agg.on_tick(&tick(60_000, 10.0, 1)), Ok(None));
    }

    #[test]
    fn force_finalize_is_noop_without_active_bar() {
        let mut agg = BarAggregator::new("MES".to_string(), 60_000).unwrap();
        assert_eq!(agg.force_finalize(), None);
        assert_eq!(agg.report().bars_emitted, 0);
    }

    #[test]
    fn invalid_ticks_are_rejected() {
        let mut agg = BarAggregator::new("MES".to_string(), 60_000).unwrap();
        assert!(matches!(
            agg.on_tick(&tick(0, f64::NAN, 1)),
            Err(TickError::Invalid { .. })
        ));
        assert!(matches!(
            agg.on_tick(&tick(0, 10.0, 0)),
            Err(TickError::Invalid { .. })
        ));
        assert_eq!(agg.report().invalid_ticks, 2);
        assert!(agg.active_bar().is_none());
    }

    #[test]
    fn rejects_non_positive_length() {
        assert!(BarAggregator::new("MES".to_string(), 0).is_err());
    }
}
