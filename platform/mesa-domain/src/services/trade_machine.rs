use crate::events::domain_event::{Alert, AlertKind, LifecycleEvent, Severity};
use crate::repositories::order_gateway::{BrokerSnapshot, OrderGateway};
use crate::services::bracket::{BracketPolicy, MarketContext, TrailingStop};
use crate::services::fill_tracker::FillTracker;
use crate::value_objects::bar::Bar;
use crate::value_objects::fill::Fill;
use crate::value_objects::order::{OrderId, OrderRequest, OrderStatus};
use crate::value_objects::side::Side;
use crate::value_objects::signal::{Signal, SignalKind};
use crate::value_objects::trade::{
    realized_pnl, ClosedTrade, ExitReason, Trade, TradeId, TradeState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceCheck {
    /// Stop and target are compared against the bar's low/high.
    BarRange,
    /// Only the closing price is compared.
    BarClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Option<u64> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        Some(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeMachineConfig {
    pub symbol: String,
    pub quantity: u64,
    pub multiplier: f64,
    pub price_check: PriceCheck,
    pub exit_retry: RetryPolicy,
    pub trailing: Option<TrailingStop>,
}

impl Default for TradeMachineConfig {
    fn default() -> Self {
        Self {
            symbol: "MES".to_string(),
            quantity: 1,
            multiplier: 1.0,
            price_check: PriceCheck::BarRange,
            exit_retry: RetryPolicy::default(),
            trailing: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineMode {
    Active,
    /// Feed lost; no autonomous decisions until a reconciliation succeeds.
    Suspended,
    /// Risk condition needing an operator; only fills and status updates are applied.
    Halted,
}

impl MachineMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineMode::Active => "active",
            MachineMode::Suspended => "suspended",
            MachineMode::Halted => "halted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileError {
    pub expected_position: i64,
    pub broker_position: i64,
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "broker reports position {} but {} was expected",
            self.broker_position, self.expected_position
        )
    }
}

pub struct TradeStateMachine {
    config: TradeMachineConfig,
    bracket: Box<dyn BracketPolicy + Send>,
    fills: FillTracker,
    active: Option<Trade>,
    next_trade_id: u64,
    mode: MachineMode,
    accepting_entries: bool,
    flatten_on_shutdown: bool,
    exit_retries: u32,
    exit_carry_qty: u64,
    exit_carry_notional: f64,
    context: MarketContext,
    outbox: Vec<LifecycleEvent>,
}

impl TradeStateMachine {
    pub fn new(config: TradeMachineConfig, bracket: Box<dyn BracketPolicy + Send>) -> Self {
        Self {
            config,
            bracket,
            fills: FillTracker::new(),
            active: None,
            next_trade_id: 1,
            mode: MachineMode::Active,
            accepting_entries: true,
            flatten_on_shutdown: false,
            exit_retries: 0,
            exit_carry_qty: 0,
            exit_carry_notional: 0.0,
            context: MarketContext::default(),
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> TradeState {
        self.active
            .as_ref()
            .map(|trade| trade.state)
            .unwrap_or(TradeState::Idle)
    }

    pub fn active_trade(&self) -> Option<&Trade> {
        self.active.as_ref()
    }

    pub fn open_side(&self) -> Option<Side> {
        self.active.as_ref().map(|trade| trade.side)
    }

    pub fn mode(&self) -> MachineMode {
        self.mode
    }

    pub fn is_flat(&self) -> bool {
        self.active.is_none()
    }

    pub fn accepting_entries(&self) -> bool {
        self.accepting_entries
    }

    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Bar-close evaluation: entries from IDLE, then for an OPEN trade the discretionary
    /// exit, the stop/target check and finally the trailing stop.
    pub fn on_bar_close(
        &mut self,
        bar: &Bar,
        signal: Option<&Signal>,
        ctx: MarketContext,
        gateway: &mut dyn OrderGateway,
    ) {
        self.context = ctx;
        if self.mode != MachineMode::Active {
            return;
        }
        let timestamp = bar.period_end;

        match self.state() {
            TradeState::Idle | TradeState::Closed => {
                if let Some(signal) = signal.filter(|s| s.kind == SignalKind::Entry) {
                    if self.accepting_entries {
                        self.submit_entry(signal, timestamp, gateway);
                    }
                }
            }
            TradeState::Open => {
                if signal.is_some_and(|s| s.kind == SignalKind::Exit) {
                    self.submit_exit(ExitReason::Signal, timestamp, gateway);
                    return;
                }
                let (low, high) = match self.config.price_check {
                    PriceCheck::BarRange => (bar.low, bar.high),
                    PriceCheck::BarClose => (bar.close, bar.close),
                };
                if let Some(reason) = self.breach(low, high) {
                    self.submit_exit(reason, timestamp, gateway);
                    return;
                }
                self.trail(bar.close, timestamp);
            }
            TradeState::EntryPending | TradeState::ExitPending => {}
        }
    }

    /// Sub-bar stop/target check against a single traded price.
    pub fn on_price(&mut self, price: f64, timestamp: i64, gateway: &mut dyn OrderGateway) {
        if self.mode != MachineMode::Active || self.state() != TradeState::Open {
            return;
        }
        if let Some(reason) = self.breach(price, price) {
            self.submit_exit(reason, timestamp, gateway);
        }
    }

    pub fn on_fill(&mut self, fill: Fill, gateway: &mut dyn OrderGateway) {
        let progress = match self.fills.add_fill(fill) {
            Ok(progress) => progress,
            Err(err) => {
                let trade_id = self.active.as_ref().map(|t| t.id);
                self.alert(
                    Severity::Critical,
                    AlertKind::UnknownOrder,
                    fill.timestamp,
                    trade_id,
                    format!("{err}: qty={} price={}", fill.qty, fill.price),
                );
                return;
            }
        };
        if progress.overfill > 0 {
            let trade_id = self.active.as_ref().map(|t| t.id);
            self.alert(
                Severity::Critical,
                AlertKind::Overfill,
                fill.timestamp,
                trade_id,
                format!(
                    "order {} filled {} of {} requested",
                    fill.order_id, progress.filled_qty, progress.requested_qty
                ),
            );
        }

        let Some(trade) = self.active.as_mut() else {
            return;
        };
        if fill.order_id == trade.entry_order_id {
            trade.entry_fill_qty = progress.filled_qty;
            trade.entry_fill_price = Some(progress.average_price);
            if trade.state == TradeState::EntryPending {
                if progress.completed_now {
                    self.open_trade(fill.timestamp, gateway);
                }
            } else if progress.overfill == 0 {
                let trade_id = trade.id;
                self.alert(
                    Severity::Warning,
                    AlertKind::Overfill,
                    fill.timestamp,
                    Some(trade_id),
                    format!("entry fill after the trade opened; position now {}", progress.filled_qty),
                );
            }
        } else if trade.exit_order_id == Some(fill.order_id) {
            // Exit fills accumulate across retried exit orders.
            let closed_qty = self.exit_carry_qty.saturating_add(progress.filled_qty);
            let notional =
                self.exit_carry_notional + progress.average_price * progress.filled_qty as f64;
            trade.exit_fill_qty = closed_qty;
            if closed_qty > 0 {
                trade.exit_fill_price = Some(notional / closed_qty as f64);
            }
            if trade.state == TradeState::ExitPending && progress.completed_now {
                self.close_trade(fill.timestamp);
            }
        } else {
            let trade_id = trade.id;
            self.alert(
                Severity::Warning,
                AlertKind::UnknownOrder,
                fill.timestamp,
                Some(trade_id),
                format!("fill for order {} outside the active trade", fill.order_id),
            );
        }
    }

    pub fn on_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
        timestamp: i64,
        gateway: &mut dyn OrderGateway,
    ) {
        if !status.is_dead() {
            return;
        }
        let Some(trade) = self.active.as_ref() else {
            return;
        };
        if order_id == trade.entry_order_id && trade.state == TradeState::EntryPending {
            self.entry_ended(status, timestamp, gateway);
        } else if trade.exit_order_id == Some(order_id) && trade.state == TradeState::ExitPending {
            self.exit_failed(format!("exit order {order_id} {status}"), timestamp);
        }
    }

    /// Places the exit again after a rejection. No-op unless an exit is owed and no order
    /// is working.
    pub fn retry_exit(&mut self, timestamp: i64, gateway: &mut dyn OrderGateway) {
        if self.mode == MachineMode::Halted {
            return;
        }
        let Some(trade) = self.active.as_ref() else {
            return;
        };
        if trade.state != TradeState::ExitPending || trade.exit_order_id.is_some() {
            return;
        }
        let reason = trade.exit_reason.unwrap_or(ExitReason::Flatten);
        self.place_exit(reason, timestamp, gateway);
    }

    pub fn suspend(&mut self, timestamp: i64, reason: &str) {
        if self.mode == MachineMode::Active {
            self.mode = MachineMode::Suspended;
        }
        let (severity, trade_id) = match self.active.as_ref() {
            Some(trade) => (Severity::Critical, Some(trade.id)),
            None => (Severity::Warning, None),
        };
        let state = self.state();
        self.alert(
            severity,
            AlertKind::FeedDisconnected,
            timestamp,
            trade_id,
            format!("feed disconnected ({reason}); trade state {state} unconfirmed until reconciliation"),
        );
    }

    /// Compares the broker's view with the local trade. Resumes a suspended machine on a
    /// match and halts it otherwise.
    pub fn reconcile(
        &mut self,
        snapshot: &BrokerSnapshot,
        gateway: &mut dyn OrderGateway,
    ) -> Result<(), ReconcileError> {
        let expected = self
            .active
            .as_ref()
            .map(Trade::expected_position)
            .unwrap_or(0);
        if snapshot.net_position != expected {
            self.mode = MachineMode::Halted;
            let trade_id = self.active.as_ref().map(|t| t.id);
            let err = ReconcileError {
                expected_position: expected,
                broker_position: snapshot.net_position,
            };
            self.alert(
                Severity::Critical,
                AlertKind::ReconciliationMismatch,
                snapshot.timestamp,
                trade_id,
                err.to_string(),
            );
            return Err(err);
        }

        if self.mode == MachineMode::Suspended {
            self.mode = MachineMode::Active;
        }

        let Some((state, entry_id, exit_id)) = self
            .active
            .as_ref()
            .map(|t| (t.state, t.entry_order_id, t.exit_order_id))
        else {
            return Ok(());
        };
        let working = |id: OrderId| snapshot.working_orders.contains(&id);
        match (state, exit_id) {
            (TradeState::EntryPending, _) if !working(entry_id) => {
                self.entry_ended(OrderStatus::Canceled, snapshot.timestamp, gateway);
            }
            (TradeState::ExitPending, Some(exit_id)) if !working(exit_id) => {
                self.exit_failed(
                    format!("exit order {exit_id} no longer working at broker"),
                    snapshot.timestamp,
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Stops new entries, cancels a pending entry and, when `flatten` is set, exits an
    /// open trade at market.
    pub fn begin_shutdown(&mut self, flatten: bool, timestamp: i64, gateway: &mut dyn OrderGateway) {
        self.accepting_entries = false;
        self.flatten_on_shutdown = flatten;

        let Some(trade) = self.active.as_ref() else {
            return;
        };
        let (trade_id, entry_order_id, state) = (trade.id, trade.entry_order_id, trade.state);
        match state {
            TradeState::EntryPending => {
                if let Err(err) = gateway.cancel_order(entry_order_id) {
                    self.alert(
                        Severity::Warning,
                        AlertKind::GatewayError,
                        timestamp,
                        Some(trade_id),
                        format!("cancel of entry order {entry_order_id} failed: {err}"),
                    );
                }
            }
            TradeState::Open if flatten && self.mode != MachineMode::Halted => {
                self.submit_exit(ExitReason::Flatten, timestamp, gateway);
            }
            TradeState::Open => {
                self.alert(
                    Severity::Warning,
                    AlertKind::OpenPositionAtShutdown,
                    timestamp,
                    Some(trade_id),
                    "shutdown requested with an open position and flatten disabled".to_string(),
                );
            }
            _ => {}
        }
    }

    fn submit_entry(&mut self, signal: &Signal, timestamp: i64, gateway: &mut dyn OrderGateway) {
        let qty = self.config.quantity;
        let request = OrderRequest::market(signal.side.entry_action(), qty, timestamp);
        match gateway.place_order(&request) {
            Ok(order_id) => {
                let trade_id = TradeId(self.next_trade_id);
                self.next_trade_id += 1;
                self.fills.register(order_id, qty);
                self.active = Some(Trade::pending_entry(
                    trade_id,
                    signal.side,
                    qty,
                    order_id,
                    signal.reason.clone(),
                    timestamp,
                ));
                self.outbox.push(LifecycleEvent::EntrySubmitted {
                    trade_id,
                    order_id,
                    side: signal.side,
                    qty,
                    timestamp,
                    reason: signal.reason.clone(),
                });
            }
            Err(err) => self.alert(
                Severity::Warning,
                AlertKind::GatewayError,
                timestamp,
                None,
                format!("entry order not placed: {err}"),
            ),
        }
    }

    fn entry_ended(&mut self, status: OrderStatus, timestamp: i64, gateway: &mut dyn OrderGateway) {
        let Some(trade) = self.active.as_ref() else {
            return;
        };
        if trade.entry_fill_qty == 0 {
            let (trade_id, order_id) = (trade.id, trade.entry_order_id);
            self.fills.forget(order_id);
            self.active = None;
            self.outbox.push(LifecycleEvent::EntryAbandoned {
                trade_id,
                order_id,
                status,
                timestamp,
            });
            return;
        }
        let (trade_id, filled, requested) = (trade.id, trade.entry_fill_qty, trade.requested_qty);
        self.alert(
            Severity::Warning,
            AlertKind::GatewayError,
            timestamp,
            Some(trade_id),
            format!("entry {status} after {filled} of {requested} filled; opening with filled quantity"),
        );
        self.open_trade(timestamp, gateway);
    }

    fn open_trade(&mut self, timestamp: i64, gateway: &mut dyn OrderGateway) {
        let ctx = MarketContext {
            timestamp,
            ..self.context
        };
        let Some(trade) = self.active.as_mut() else {
            return;
        };
        let Some(entry_price) = trade.entry_fill_price else {
            return;
        };
        let bracket = self.bracket.compute(entry_price, trade.side, &ctx);
        trade.stop_price = Some(bracket.stop);
        trade.target_price = Some(bracket.target);
        trade.state = TradeState::Open;
        trade.entry_filled_at = Some(timestamp);
        self.outbox.push(LifecycleEvent::EntryFilled {
            trade_id: trade.id,
            side: trade.side,
            price: entry_price,
            qty: trade.entry_fill_qty,
            stop: bracket.stop,
            target: bracket.target,
            timestamp,
        });

        if !self.accepting_entries && self.flatten_on_shutdown && self.mode != MachineMode::Halted {
            self.submit_exit(ExitReason::Flatten, timestamp, gateway);
        }
    }

    fn breach(&self, low: f64, high: f64) -> Option<ExitReason> {
        let trade = self.active.as_ref()?;
        let (stop, target) = (trade.stop_price?, trade.target_price?);
        let (stop_hit, target_hit) = match trade.side {
            Side::Long => (low <= stop, high >= target),
            Side::Short => (high >= stop, low <= target),
        };
        if stop_hit {
            Some(ExitReason::Stop)
        } else if target_hit {
            Some(ExitReason::Target)
        } else {
            None
        }
    }

    fn trail(&mut self, close: f64, timestamp: i64) {
        let Some(trailing) = self.config.trailing else {
            return;
        };
        let Some(trade) = self.active.as_mut() else {
            return;
        };
        let Some(stop) = trade.stop_price else {
            return;
        };
        if let Some(next) = trailing.ratchet(trade.side, stop, close) {
            trade.stop_price = Some(next);
            self.outbox.push(LifecycleEvent::StopAdjusted {
                trade_id: trade.id,
                stop: next,
                timestamp,
            });
        }
    }

    fn submit_exit(&mut self, reason: ExitReason, timestamp: i64, gateway: &mut dyn OrderGateway) {
        let Some(trade) = self.active.as_mut() else {
            return;
        };
        trade.state = TradeState::ExitPending;
        trade.exit_reason = Some(reason);
        self.exit_retries = 0;
        self.exit_carry_qty = 0;
        self.exit_carry_notional = 0.0;
        self.place_exit(reason, timestamp, gateway);
    }

    fn place_exit(&mut self, reason: ExitReason, timestamp: i64, gateway: &mut dyn OrderGateway) {
        let Some(trade) = self.active.as_ref() else {
            return;
        };
        let qty = trade.open_qty();
        let request = OrderRequest::market(trade.side.exit_action(), qty, timestamp);
        match gateway.place_order(&request) {
            Ok(order_id) => {
                self.fills.register(order_id, qty);
                let Some(trade) = self.active.as_mut() else {
                    return;
                };
                trade.exit_order_id = Some(order_id);
                self.outbox.push(LifecycleEvent::ExitSubmitted {
                    trade_id: trade.id,
                    order_id,
                    reason,
                    qty,
                    timestamp,
                });
            }
            Err(err) => self.exit_failed(format!("exit order not placed: {err}"), timestamp),
        }
    }

    fn exit_failed(&mut self, detail: String, timestamp: i64) {
        let Some(trade) = self.active.as_mut() else {
            return;
        };
        let trade_id = trade.id;
        if let Some(order_id) = trade.exit_order_id.take() {
            // Whatever the dead order closed stays closed; a retry covers the remainder.
            let filled = self.fills.filled_qty(order_id).unwrap_or(0);
            let avg = self.fills.average_price(order_id).ok().flatten().unwrap_or(0.0);
            self.exit_carry_qty = self.exit_carry_qty.saturating_add(filled);
            self.exit_carry_notional += avg * filled as f64;
            self.fills.forget(order_id);
        }
        self.alert(
            Severity::Critical,
            AlertKind::ExitRejected,
            timestamp,
            Some(trade_id),
            format!("{detail}; position is unprotected"),
        );

        self.exit_retries += 1;
        match self.config.exit_retry.delay_for(self.exit_retries) {
            Some(delay_ms) => self.outbox.push(LifecycleEvent::ExitRetryScheduled {
                trade_id,
                attempt: self.exit_retries,
                delay_ms,
                timestamp,
            }),
            None => {
                self.mode = MachineMode::Halted;
                let attempts = self.exit_retries - 1;
                self.alert(
                    Severity::Critical,
                    AlertKind::ExitRetriesExhausted,
                    timestamp,
                    Some(trade_id),
                    format!("exit not working after {attempts} retries; manual intervention required"),
                );
            }
        }
    }

    fn close_trade(&mut self, timestamp: i64) {
        let Some(trade) = self.active.take() else {
            return;
        };
        let entry_price = trade.entry_fill_price.unwrap_or_default();
        let exit_price = trade.exit_fill_price.unwrap_or_default();
        let qty = trade.entry_fill_qty;
        let closed = ClosedTrade {
            trade_id: trade.id,
            symbol: self.config.symbol.clone(),
            side: trade.side,
            qty,
            entry_price,
            exit_price,
            stop_price: trade.stop_price.unwrap_or_default(),
            target_price: trade.target_price.unwrap_or_default(),
            exit_reason: trade.exit_reason.unwrap_or(ExitReason::Flatten),
            entry_timestamp: trade.entry_filled_at.unwrap_or(trade.opened_at),
            exit_timestamp: timestamp,
            realized_pnl: realized_pnl(
                trade.side,
                entry_price,
                exit_price,
                qty,
                self.config.multiplier,
            ),
            entry_reason: trade.entry_reason.clone(),
        };
        self.fills.forget(trade.entry_order_id);
        if let Some(exit_id) = trade.exit_order_id {
            self.fills.forget(exit_id);
        }
        self.exit_retries = 0;
        self.exit_carry_qty = 0;
        self.exit_carry_notional = 0.0;
        self.outbox.push(LifecycleEvent::TradeClosed(closed));
    }

    fn alert(
        &mut self,
        severity: Severity,
        kind: AlertKind,
        timestamp: i64,
        trade_id: Option<TradeId>,
        message: String,
    ) {
        self.outbox.push(LifecycleEvent::Alert(Alert {
            severity,
            kind,
            timestamp,
            trade_id,
            message,
        }));
    }
}
