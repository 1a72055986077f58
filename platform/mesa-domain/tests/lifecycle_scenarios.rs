use mesa_domain::events::domain_event::LifecycleEvent;
use mesa_domain::repositories::order_gateway::{GatewayError, OrderGateway};
use mesa_domain::services::bracket::{AtrBracket, MarketContext};
use mesa_domain::services::trade_machine::{TradeMachineConfig, TradeStateMachine};
use mesa_domain::value_objects::bar::Bar;
use mesa_domain::value_objects::fill::Fill;
use mesa_domain::value_objects::journal::{JournalEvent, JournalRecord};
use mesa_domain::value_objects::order::{OrderId, OrderRequest, OrderStatus};
use mesa_domain::value_objects::side::{OrderAction, Side};
use mesa_domain::value_objects::signal::Signal;
use mesa_domain::value_objects::trade::{ExitReason, TradeState};

#[derive(Default)]
struct RecordingGateway {
    next_id: u64,
    placed: Vec<(OrderId, OrderRequest)>,
}

impl RecordingGateway {
    fn last_id(&self) -> OrderId {
        self.placed.last().map(|(id, _)| *id).expect("an order was placed")
    }
}

impl OrderGateway for RecordingGateway {
    fn place_order(&mut self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        self.next_id += 1;
        let id = OrderId(self.next_id);
        self.placed.push((id, request.clone()));
        Ok(id)
    }

    fn cancel_order(&mut self, _order_id: OrderId) -> Result<(), GatewayError> {
        Ok(())
    }

    fn request_reconciliation(&mut self, _timestamp: i64) -> Result<(), GatewayError> {
        Ok(())
    }
}

fn machine(quantity: u64) -> TradeStateMachine {
    TradeStateMachine::new(
        TradeMachineConfig {
            quantity,
            ..TradeMachineConfig::default()
        },
        Box::new(AtrBracket {
            stop_mult: 1.5,
            target_mult: 3.0,
            fallback_atr: 2.0,
        }),
    )
}

fn bar(start: i64, low: f64, high: f64, close: f64) -> Bar {
    Bar {
        symbol: "MES".to_string(),
        period_start: start,
        period_end: start + 60_000,
        open: close,
        high,
        low,
        close,
        volume: 10,
        tick_count: 4,
    }
}

fn ctx(atr: f64) -> MarketContext {
    MarketContext {
        timestamp: 60_000,
        last_close: Some(4501.0),
        atr: Some(atr),
    }
}

fn fill(order_id: OrderId, price: f64, qty: u64) -> Fill {
    Fill {
        order_id,
        timestamp: 61_000,
        price,
        qty,
    }
}

/// Journal lines the owner derives from the lifecycle outbox.
fn journal_lines(events: &[LifecycleEvent]) -> Vec<JournalRecord> {
    events
        .iter()
        .filter_map(|event| match event {
            LifecycleEvent::EntryFilled {
                trade_id,
                side,
                price,
                qty,
                stop,
                target,
                timestamp,
            } => Some(JournalRecord::entry(
                *trade_id, "MES", *timestamp, *side, *price, *stop, *target, *qty,
            )),
            LifecycleEvent::TradeClosed(closed) => Some(JournalRecord::exit(closed)),
            _ => None,
        })
        .collect()
}

#[test]
fn simple_full_fill_opens_with_atr_bracket() {
    let mut gw = RecordingGateway::default();
    let mut m = machine(1);
    let signal = Signal::entry(Side::Long, "trend");

    m.on_bar_close(&bar(0, 4500.0, 4501.5, 4501.0), Some(&signal), ctx(1.0), &mut gw);
    assert_eq!(m.state(), TradeState::EntryPending);
    let (entry_id, request) = gw.placed[0].clone();
    assert_eq!(request.action, OrderAction::Buy);
    assert_eq!(request.qty, 1);

    m.on_fill(fill(entry_id, 4501.0, 1), &mut gw);
    let trade = m.active_trade().expect("trade");
    assert_eq!(trade.state, TradeState::Open);
    assert_eq!(trade.entry_fill_price, Some(4501.0));
    assert_eq!(trade.stop_price, Some(4499.5));
    assert_eq!(trade.target_price, Some(4504.0));

    let journal = journal_lines(&m.drain_events());
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].event, JournalEvent::Entry);
    assert_eq!(journal[0].stop, 4499.5);
}

#[test]
fn partial_fills_converge_to_weighted_average() {
    let mut gw = RecordingGateway::default();
    let mut m = machine(3);
    let signal = Signal::entry(Side::Long, "trend");
    m.on_bar_close(&bar(0, 4500.0, 4501.5, 4501.0), Some(&signal), ctx(1.0), &mut gw);
    let entry_id = gw.last_id();

    m.on_fill(fill(entry_id, 4501.0, 1), &mut gw);
    assert_eq!(m.state(), TradeState::EntryPending);
    m.on_fill(fill(entry_id, 4501.25, 1), &mut gw);
    assert_eq!(m.state(), TradeState::EntryPending);
    m.on_fill(fill(entry_id, 4501.5, 1), &mut gw);
    assert_eq!(m.state(), TradeState::Open);

    let trade = m.active_trade().expect("trade");
    assert_eq!(trade.entry_fill_price, Some(4501.25));
    assert_eq!(trade.entry_fill_qty, 3);

    let opened = m
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, LifecycleEvent::EntryFilled { .. }))
        .count();
    assert_eq!(opened, 1);
}

#[test]
fn stop_takes_priority_when_bar_spans_both_levels() {
    let mut gw = RecordingGateway::default();
    let mut m = machine(1);
    let signal = Signal::entry(Side::Long, "trend");
    m.on_bar_close(&bar(0, 4500.0, 4501.5, 4501.0), Some(&signal), ctx(1.0), &mut gw);
    m.on_fill(fill(gw.last_id(), 4501.0, 1), &mut gw);

    m.on_bar_close(&bar(60_000, 4498.0, 4506.0, 4502.0), None, ctx(1.0), &mut gw);
    let trade = m.active_trade().expect("trade");
    assert_eq!(trade.state, TradeState::ExitPending);
    assert_eq!(trade.exit_reason, Some(ExitReason::Stop));
    let (_, exit_request) = gw.placed.last().cloned().expect("exit");
    assert_eq!(exit_request.action, OrderAction::Sell);
    assert_eq!(exit_request.qty, 1);

    m.on_fill(fill(gw.last_id(), 4499.5, 1), &mut gw);
    assert!(m.is_flat());
    let journal = journal_lines(&m.drain_events());
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[1].event, JournalEvent::Exit);
    assert_eq!(journal[1].exit_reason, Some(ExitReason::Stop));
    assert_eq!(journal[1].pnl, Some(-1.5));
}

#[test]
fn discretionary_exit_precedes_stop_and_target() {
    let mut gw = RecordingGateway::default();
    let mut m = machine(1);
    let entry = Signal::entry(Side::Long, "trend");
    m.on_bar_close(&bar(0, 4500.0, 4501.5, 4501.0), Some(&entry), ctx(1.0), &mut gw);
    m.on_fill(fill(gw.last_id(), 4501.0, 1), &mut gw);

    let exit = Signal::exit(Side::Long, "ema cross");
    m.on_bar_close(&bar(60_000, 4498.0, 4506.0, 4502.0), Some(&exit), ctx(1.0), &mut gw);
    assert_eq!(
        m.active_trade().and_then(|t| t.exit_reason),
        Some(ExitReason::Signal)
    );
}

#[test]
fn rejected_entry_returns_to_idle_without_journal_lines() {
    let mut gw = RecordingGateway::default();
    let mut m = machine(1);
    let signal = Signal::entry(Side::Short, "mean_reversion");
    m.on_bar_close(&bar(0, 4500.0, 4501.5, 4501.0), Some(&signal), ctx(1.0), &mut gw);
    let entry_id = gw.last_id();

    m.on_order_status(entry_id, OrderStatus::Rejected, 61_000, &mut gw);
    assert_eq!(m.state(), TradeState::Idle);
    assert!(m.active_trade().is_none());

    let events = m.drain_events();
    assert!(journal_lines(&events).is_empty());
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::EntryAbandoned { status: OrderStatus::Rejected, .. })));

    m.on_bar_close(&bar(60_000, 4500.0, 4501.5, 4501.0), Some(&signal), ctx(1.0), &mut gw);
    assert_eq!(m.state(), TradeState::EntryPending);
}

#[test]
fn short_trade_pnl_uses_side_sign_and_multiplier() {
    let mut gw = RecordingGateway::default();
    let mut m = TradeStateMachine::new(
        TradeMachineConfig {
            quantity: 2,
            multiplier: 5.0,
            ..TradeMachineConfig::default()
        },
        Box::new(AtrBracket {
            stop_mult: 1.5,
            target_mult: 3.0,
            fallback_atr: 2.0,
        }),
    );
    let signal = Signal::entry(Side::Short, "trend");
    m.on_bar_close(&bar(0, 4500.0, 4501.5, 4501.0), Some(&signal), ctx(1.0), &mut gw);
    m.on_fill(fill(gw.last_id(), 4501.0, 2), &mut gw);
    // target for a short sits below the entry
    m.on_bar_close(&bar(60_000, 4497.5, 4500.0, 4498.0), None, ctx(1.0), &mut gw);
    m.on_fill(fill(gw.last_id(), 4498.0, 2), &mut gw);

    let closed = m
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            LifecycleEvent::TradeClosed(c) => Some(c),
            _ => None,
        })
        .expect("closed");
    assert_eq!(closed.exit_reason, ExitReason::Target);
    assert_eq!(closed.realized_pnl, 30.0);
}
