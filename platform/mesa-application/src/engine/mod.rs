use mesa_domain::events::domain_event::{Alert, AlertKind, LifecycleEvent, Severity};
use mesa_domain::repositories::order_gateway::{BrokerEvent, OrderGateway};
use mesa_domain::repositories::trade_journal::TradeJournal;
use mesa_domain::services::bracket::MarketContext;
use mesa_domain::services::indicators::{BarHistory, IndicatorPipeline, IndicatorValues, ATR};
use mesa_domain::services::realtime_bar::{BarAggregator, TickError};
use mesa_domain::services::signals::SignalEvaluator;
use mesa_domain::services::trade_machine::TradeStateMachine;
use mesa_domain::value_objects::bar::Bar;
use mesa_domain::value_objects::journal::JournalRecord;
use mesa_domain::value_objects::tick::Tick;
use mesa_domain::value_objects::trade::{ClosedTrade, TradeState};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything the single owner task reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Tick(Tick),
    Broker(BrokerEvent),
    FeedDisconnected { reason: String },
    FeedReconnected,
    /// Backoff for a rejected exit elapsed.
    RetryExit,
    /// `None` uses the configured flatten policy.
    Shutdown { flatten: Option<bool> },
}

impl EngineEvent {
    pub fn is_tick(&self) -> bool {
        matches!(self, EngineEvent::Tick(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Run stop/target checks on every tick, not only at bar close.
    pub intrabar_checks: bool,
    pub flatten_on_shutdown: bool,
    pub history_bars: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            intrabar_checks: false,
            flatten_on_shutdown: true,
            history_bars: 200,
        }
    }
}

/// Follow-up work the runtime has to schedule after an event.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EngineStep {
    pub bar_closed: Option<Bar>,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct EngineReport {
    pub ticks: u64,
    pub late_ticks: u64,
    pub invalid_ticks: u64,
    pub bars: u64,
    pub entries: u64,
    pub trades_closed: u64,
    pub realized_pnl: f64,
    pub alerts_warning: u64,
    pub alerts_critical: u64,
    pub journal_errors: u64,
    pub mode: String,
    pub final_state: String,
}

/// Single owner of the aggregator, the trade state machine and the gateway. Every
/// mutation goes through [`TradingEngine::handle`], one event at a time.
pub struct TradingEngine<G: OrderGateway> {
    symbol: String,
    aggregator: BarAggregator,
    history: BarHistory,
    indicators: Box<dyn IndicatorPipeline + Send>,
    evaluator: Box<dyn SignalEvaluator + Send>,
    machine: TradeStateMachine,
    gateway: G,
    journal: Box<dyn TradeJournal + Send>,
    settings: EngineSettings,
    clock: i64,
    last_indicators: IndicatorValues,
    closed: Vec<ClosedTrade>,
    alerts: Vec<Alert>,
    report: EngineReport,
    shutdown_requested: bool,
}

impl<G: OrderGateway> TradingEngine<G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        aggregator: BarAggregator,
        indicators: Box<dyn IndicatorPipeline + Send>,
        evaluator: Box<dyn SignalEvaluator + Send>,
        machine: TradeStateMachine,
        gateway: G,
        journal: Box<dyn TradeJournal + Send>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            symbol,
            aggregator,
            history: BarHistory::new(settings.history_bars),
            indicators,
            evaluator,
            machine,
            gateway,
            journal,
            settings,
            clock: i64::MIN,
            last_indicators: IndicatorValues::default(),
            closed: Vec::new(),
            alerts: Vec::new(),
            report: EngineReport::default(),
            shutdown_requested: false,
        }
    }

    pub fn machine(&self) -> &TradeStateMachine {
        &self.machine
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn aggregator(&self) -> &BarAggregator {
        &self.aggregator
    }

    pub fn last_indicators(&self) -> &IndicatorValues {
        &self.last_indicators
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn is_flat(&self) -> bool {
        self.machine.is_flat()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Nothing left to wait for after a shutdown: flat, or an open position deliberately
    /// left in place. Pending orders keep the engine unsettled.
    pub fn is_settled(&self) -> bool {
        match self.machine.state() {
            TradeState::Idle | TradeState::Closed => true,
            TradeState::Open => self.shutdown_requested,
            TradeState::EntryPending | TradeState::ExitPending => false,
        }
    }

    /// Latest event time seen; control events are stamped with it.
    pub fn clock(&self) -> i64 {
        self.clock.max(0)
    }

    pub fn report(&self) -> EngineReport {
        let mut report = self.report.clone();
        report.mode = self.machine.mode().as_str().to_string();
        report.final_state = self.machine.state().to_string();
        report
    }

    pub fn handle(&mut self, event: EngineEvent) -> EngineStep {
        let mut step = EngineStep::default();
        let now = self.clock();
        match event {
            EngineEvent::Tick(tick) => self.on_tick(tick, &mut step),
            EngineEvent::Broker(event) => self.apply_broker(event),
            EngineEvent::FeedDisconnected { reason } => {
                self.machine.suspend(now, &reason);
            }
            EngineEvent::FeedReconnected => {
                info!(clock = now, "feed reconnected; requesting reconciliation");
                if let Err(err) = self.gateway.request_reconciliation(now) {
                    let trade_id = self.machine.active_trade().map(|t| t.id);
                    self.record_alert(Alert {
                        severity: Severity::Critical,
                        kind: AlertKind::GatewayError,
                        timestamp: now,
                        trade_id,
                        message: format!("reconciliation request failed: {err}"),
                    });
                }
            }
            EngineEvent::RetryExit => {
                self.machine.retry_exit(now, &mut self.gateway);
            }
            EngineEvent::Shutdown { flatten } => self.shutdown(flatten, &mut step),
        }
        self.pump(&mut step);
        step
    }

    /// Stops entries, cancels or flattens per policy and force-finalizes the active bar.
    /// Events the gateway produces later still have to be fed through `handle`.
    pub fn shutdown(&mut self, flatten: Option<bool>, step: &mut EngineStep) {
        let flatten = flatten.unwrap_or(self.settings.flatten_on_shutdown);
        info!(
            flatten,
            state = %self.machine.state(),
            "shutdown requested"
        );
        self.shutdown_requested = true;
        let now = self.clock();
        self.machine.begin_shutdown(flatten, now, &mut self.gateway);
        self.pump(step);
        if let Some(bar) = self.aggregator.force_finalize() {
            self.on_bar(bar, step);
        }
    }

    pub fn disconnect(&mut self) {
        self.gateway.disconnect();
    }

    fn on_tick(&mut self, tick: Tick, step: &mut EngineStep) {
        let started = Instant::now();
        let closed = match self.aggregator.on_tick(&tick) {
            Ok(closed) => closed,
            Err(TickError::Late(late)) => {
                self.report.late_ticks += 1;
                metrics::counter!("mesa.ticks_late").increment(1);
                warn!(
                    tick_timestamp = late.tick_timestamp,
                    period_start = late.period_start,
                    "late tick dropped"
                );
                return;
            }
            Err(err @ TickError::Invalid { .. }) => {
                self.report.invalid_ticks += 1;
                metrics::counter!("mesa.ticks_invalid").increment(1);
                warn!(error = %err, "invalid tick dropped");
                return;
            }
        };
        self.report.ticks += 1;
        metrics::counter!("mesa.ticks").increment(1);

        // The closed bar is evaluated before the venue sees the tick that closed it.
        if let Some(bar) = closed {
            self.on_bar(bar, step);
        }
        self.clock = self.clock.max(tick.timestamp);
        self.gateway.observe_tick(&tick);
        self.pump(step);

        if self.settings.intrabar_checks {
            self.machine
                .on_price(tick.price, tick.timestamp, &mut self.gateway);
            self.pump(step);
        }
        metrics::histogram!("mesa.event_latency_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
    }

    fn on_bar(&mut self, bar: Bar, step: &mut EngineStep) {
        self.clock = self.clock.max(bar.period_end);
        self.report.bars += 1;
        metrics::counter!("mesa.bars").increment(1);

        self.history.push(bar.clone());
        let values = self.indicators.compute(&self.history);
        let signal = self
            .evaluator
            .evaluate(&bar, &values, self.machine.open_side());
        debug!(
            period_start = bar.period_start,
            open = bar.open,
            high = bar.high,
            low = bar.low,
            close = bar.close,
            volume = bar.volume,
            ticks = bar.tick_count,
            signal = ?signal.as_ref().map(|s| (s.kind, s.side)),
            "bar closed"
        );

        let ctx = MarketContext {
            timestamp: bar.period_end,
            last_close: Some(bar.close),
            atr: values.get(ATR),
        };
        self.machine
            .on_bar_close(&bar, signal.as_ref(), ctx, &mut self.gateway);
        self.last_indicators = values;
        step.bar_closed = Some(bar);
        self.pump(step);
    }

    fn apply_broker(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Fill(fill) => {
                debug!(order = %fill.order_id, qty = fill.qty, price = fill.price, "fill");
                self.clock = self.clock.max(fill.timestamp);
                self.machine.on_fill(fill, &mut self.gateway);
            }
            BrokerEvent::OrderStatus {
                order_id,
                status,
                timestamp,
                message,
            } => {
                debug!(order = %order_id, status = %status, message = ?message, "order status");
                self.clock = self.clock.max(timestamp);
                self.machine
                    .on_order_status(order_id, status, timestamp, &mut self.gateway);
            }
            BrokerEvent::Snapshot(snapshot) => {
                match self.machine.reconcile(&snapshot, &mut self.gateway) {
                    Ok(()) => info!(
                        position = snapshot.net_position,
                        working = snapshot.working_orders.len(),
                        mode = self.machine.mode().as_str(),
                        "broker reconciliation succeeded"
                    ),
                    Err(err) => error!(error = %err, "broker reconciliation failed; halted"),
                }
            }
        }
    }

    /// Feeds synchronous gateway events back into the machine until none remain, then
    /// publishes the machine's lifecycle events.
    fn pump(&mut self, step: &mut EngineStep) {
        loop {
            let events = self.gateway.drain_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.apply_broker(event);
            }
        }
        for event in self.machine.drain_events() {
            self.publish(event, step);
        }
    }

    fn publish(&mut self, event: LifecycleEvent, step: &mut EngineStep) {
        match event {
            LifecycleEvent::EntrySubmitted {
                trade_id,
                order_id,
                side,
                qty,
                reason,
                ..
            } => {
                info!(trade = %trade_id, order = %order_id, side = %side, qty, reason = %reason, "entry submitted");
            }
            LifecycleEvent::EntryFilled {
                trade_id,
                side,
                price,
                qty,
                stop,
                target,
                timestamp,
            } => {
                info!(trade = %trade_id, side = %side, price, qty, stop, target, "trade open");
                self.report.entries += 1;
                let record = JournalRecord::entry(
                    trade_id,
                    &self.symbol,
                    timestamp,
                    side,
                    price,
                    stop,
                    target,
                    qty,
                );
                self.append_journal(&record);
            }
            LifecycleEvent::EntryAbandoned {
                trade_id, status, ..
            } => {
                info!(trade = %trade_id, status = %status, "entry ended without fill; idle");
            }
            LifecycleEvent::StopAdjusted { trade_id, stop, .. } => {
                debug!(trade = %trade_id, stop, "trailing stop moved");
            }
            LifecycleEvent::ExitSubmitted {
                trade_id,
                order_id,
                reason,
                qty,
                ..
            } => {
                info!(trade = %trade_id, order = %order_id, reason = reason.as_str(), qty, "exit submitted");
            }
            LifecycleEvent::ExitRetryScheduled {
                trade_id,
                attempt,
                delay_ms,
                ..
            } => {
                warn!(trade = %trade_id, attempt, delay_ms, "exit retry scheduled");
                step.retry_after_ms = Some(delay_ms);
            }
            LifecycleEvent::TradeClosed(closed) => {
                info!(
                    trade = %closed.trade_id,
                    side = %closed.side,
                    entry = closed.entry_price,
                    exit = closed.exit_price,
                    reason = closed.exit_reason.as_str(),
                    pnl = closed.realized_pnl,
                    "trade closed"
                );
                self.report.trades_closed += 1;
                self.report.realized_pnl += closed.realized_pnl;
                metrics::counter!("mesa.trades_closed").increment(1);
                metrics::gauge!("mesa.realized_pnl").set(self.report.realized_pnl);
                self.append_journal(&JournalRecord::exit(&closed));
                self.closed.push(closed);
            }
            LifecycleEvent::Alert(alert) => self.record_alert(alert),
        }
    }

    fn append_journal(&mut self, record: &JournalRecord) {
        if let Err(err) = self.journal.append(record) {
            self.report.journal_errors += 1;
            error!(trade = %record.trade_id, error = %err, "trade journal append failed");
        }
    }

    fn record_alert(&mut self, alert: Alert) {
        let trade = alert.trade_id.map(|id| id.to_string()).unwrap_or_default();
        match alert.severity {
            Severity::Critical => {
                self.report.alerts_critical += 1;
                error!(kind = ?alert.kind, trade = %trade, "{}", alert.message);
            }
            Severity::Warning => {
                self.report.alerts_warning += 1;
                warn!(kind = ?alert.kind, trade = %trade, "{}", alert.message);
            }
        }
        metrics::counter!("mesa.alerts", "severity" => alert.severity.as_str()).increment(1);
        self.alerts.push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesa_domain::repositories::trade_journal::MemoryJournal;
    use mesa_domain::services::bracket::PointsBracket;
    use mesa_domain::services::indicators::{IndicatorConfig, StandardIndicators};
    use mesa_domain::services::paper_venue::{PaperVenue, PaperVenueConfig};
    use mesa_domain::services::trade_machine::TradeMachineConfig;
    use mesa_domain::value_objects::side::Side;
    use mesa_domain::value_objects::signal::Signal;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedJournal(Arc<Mutex<Vec<JournalRecord>>>);

    impl TradeJournal for SharedJournal {
        fn append(&mut self, record: &JournalRecord) -> Result<(), String> {
            self.0.lock().expect("lock").push(record.clone());
            Ok(())
        }
    }

    fn engine_with(
        evaluator: Box<dyn SignalEvaluator + Send>,
        journal: Box<dyn TradeJournal + Send>,
        settings: EngineSettings,
    ) -> TradingEngine<PaperVenue> {
        let machine = TradeStateMachine::new(
            TradeMachineConfig::default(),
            Box::new(PointsBracket {
                stop_points: 2.0,
                target_points: 4.0,
            }),
        );
        TradingEngine::new(
            "MES".to_string(),
            BarAggregator::new("MES".to_string(), 1_000).expect("aggregator"),
            Box::new(StandardIndicators::new(IndicatorConfig::default())),
            evaluator,
            machine,
            PaperVenue::new(PaperVenueConfig::default()),
            journal,
            settings,
        )
    }

    fn long_when_flat() -> Box<dyn SignalEvaluator + Send> {
        Box::new(
            |_bar: &Bar, _ind: &IndicatorValues, open: Option<Side>| match open {
                None => Some(Signal::entry(Side::Long, "test")),
                Some(_) => None,
            },
        )
    }

    fn tick(ts: i64, price: f64) -> EngineEvent {
        EngineEvent::Tick(Tick::new(ts, price, 1))
    }

    #[test]
    fn bar_close_entry_fills_at_bar_close_and_is_journaled() {
        let journal = SharedJournal::default();
        let mut engine = engine_with(
            long_when_flat(),
            Box::new(journal.clone()),
            EngineSettings::default(),
        );
        engine.handle(tick(0, 100.0));
        engine.handle(tick(500, 101.0));
        let step = engine.handle(tick(1_000, 103.0));

        assert_eq!(step.bar_closed.map(|b| b.close), Some(101.0));
        let trade = engine.machine().active_trade().expect("trade");
        assert_eq!(trade.state, TradeState::Open);
        assert_eq!(trade.entry_fill_price, Some(101.0));
        let records = journal.0.lock().expect("lock").clone();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stop, 99.0);
        assert_eq!(records[0].target, 105.0);
    }

    #[test]
    fn intrabar_target_closes_trade_before_bar_end() {
        let mut engine = engine_with(
            long_when_flat(),
            Box::new(MemoryJournal::default()),
            EngineSettings {
                intrabar_checks: true,
                ..EngineSettings::default()
            },
        );
        engine.handle(tick(0, 100.0));
        engine.handle(tick(1_000, 100.0));
        engine.handle(tick(1_200, 104.5));
        assert!(engine.is_flat());
        let step = engine.handle(tick(1_300, 100.0));
        assert!(step.bar_closed.is_none());

        let trades = engine.closed_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_price, 104.5);
        assert_eq!(engine.report().trades_closed, 1);
    }

    #[test]
    fn late_and_invalid_ticks_are_counted_not_applied() {
        let mut engine = engine_with(
            Box::new(|_: &Bar, _: &IndicatorValues, _: Option<Side>| -> Option<Signal> { None }),
            Box::new(MemoryJournal::default()),
            EngineSettings::default(),
        );
        engine.handle(tick(1_500, 100.0));
        engine.handle(tick(2_100, 100.0));
        engine.handle(tick(1_900, 80.0));
        engine.handle(tick(2_200, f64::NAN));
        let report = engine.report();
        assert_eq!(report.ticks, 2);
        assert_eq!(report.late_ticks, 1);
        assert_eq!(report.invalid_ticks, 1);
        assert_eq!(report.bars, 1);
    }

    #[test]
    fn shutdown_flattens_and_finalizes_the_active_bar() {
        let mut engine = engine_with(
            long_when_flat(),
            Box::new(MemoryJournal::default()),
            EngineSettings::default(),
        );
        engine.handle(tick(0, 100.0));
        engine.handle(tick(1_000, 101.0));
        assert_eq!(engine.machine().state(), TradeState::Open);

        let step = engine.handle(EngineEvent::Shutdown { flatten: None });
        assert!(step.bar_closed.is_some());
        assert!(engine.is_flat());
        assert!(engine.shutdown_requested());
        assert_eq!(engine.closed_trades()[0].exit_reason.as_str(), "FLATTEN");
        assert_eq!(engine.report().bars, 2);
    }

    #[test]
    fn disconnect_then_matching_snapshot_resumes() {
        let mut engine = engine_with(
            long_when_flat(),
            Box::new(MemoryJournal::default()),
            EngineSettings::default(),
        );
        engine.handle(tick(0, 100.0));
        engine.handle(tick(1_000, 101.0));
        engine.handle(EngineEvent::FeedDisconnected {
            reason: "socket closed".to_string(),
        });
        assert_eq!(engine.machine().mode().as_str(), "suspended");
        assert_eq!(engine.report().alerts_critical, 1);

        engine.handle(EngineEvent::FeedReconnected);
        assert_eq!(engine.machine().mode().as_str(), "active");
        assert_eq!(engine.machine().state(), TradeState::Open);
    }
}
