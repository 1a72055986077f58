use crate::config::{Config, OverflowKind};
use crate::engine::{EngineEvent, EngineReport, EngineStep, TradingEngine};
use crate::reporting::{compute_trade_stats, TradeStatsReport};
use crate::shared::{
    build_engine, resolve_runtime_settings, trades_fingerprint, RuntimeSettings,
    MAX_RECONNECT_BACKOFF,
};
use mesa_domain::events::domain_event::Alert;
use mesa_domain::repositories::market_stream::{MarketConnector, MarketStream, StreamError};
use mesa_domain::repositories::order_gateway::OrderGateway;
use mesa_domain::repositories::trade_journal::TradeJournal;
use mesa_domain::value_objects::trade::ClosedTrade;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Connection state shared between the feeder thread, the owner task and the binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedStatus {
    pub connected: bool,
    pub reconnects: u64,
    pub last_error: Option<String>,
    pub last_tick_timestamp: Option<i64>,
    pub ticks_enqueued: u64,
    pub ticks_dropped: u64,
    pub invalid_events: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOutcome {
    Ended,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct LiveResult {
    pub run_id: String,
    pub trades: Vec<ClosedTrade>,
    pub stats: TradeStatsReport,
    pub report: EngineReport,
    pub alerts: Vec<Alert>,
    pub trades_sha256: String,
    pub feed: FeedStatus,
    pub feed_outcome: Option<FeedOutcome>,
    /// False when the run ended with an order or position still needing attention.
    pub settled: bool,
}

/// Bounded event queue plus the owner loop. Broker adapters that deliver fills from their
/// own connection push onto [`LiveRuntime::event_sender`].
pub struct LiveRuntime {
    settings: RuntimeSettings,
    tx: mpsc::Sender<EngineEvent>,
    rx: mpsc::Receiver<EngineEvent>,
    status: Arc<Mutex<FeedStatus>>,
}

impl LiveRuntime {
    pub fn new(settings: RuntimeSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            settings,
            tx,
            rx,
            status: Arc::new(Mutex::new(FeedStatus::default())),
        }
    }

    pub fn event_sender(&self) -> mpsc::Sender<EngineEvent> {
        self.tx.clone()
    }

    pub fn feed_status(&self) -> Arc<Mutex<FeedStatus>> {
        Arc::clone(&self.status)
    }

    /// Connects the feed (bounded by the startup timeout), then processes events until a
    /// shutdown has settled the trade or the feed is gone.
    pub async fn run<C, G, S>(
        self,
        run_id: &str,
        mut engine: TradingEngine<G>,
        connector: C,
        shutdown: S,
    ) -> Result<LiveResult, String>
    where
        C: MarketConnector + Send + 'static,
        C::Stream: Send,
        G: OrderGateway,
        S: Future<Output = ()>,
    {
        let LiveRuntime {
            settings,
            tx,
            mut rx,
            status,
        } = self;
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let feeder = {
            let status = Arc::clone(&status);
            let stop = Arc::clone(&stop);
            let handle = Handle::current();
            tokio::task::spawn_blocking(move || {
                Feeder {
                    tx,
                    status,
                    stop,
                    settings,
                    handle,
                }
                .run(connector, ready_tx)
            })
        };

        match tokio::time::timeout(settings.startup_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => info!("market feed connected"),
            Ok(Ok(Err(err))) => {
                stop.store(true, Ordering::SeqCst);
                return Err(format!("market feed connection failed: {err}"));
            }
            Ok(Err(_)) => {
                stop.store(true, Ordering::SeqCst);
                return Err("market feed task ended before connecting".to_string());
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                return Err(format!(
                    "startup handshake timed out after {} ms",
                    settings.startup_timeout.as_millis()
                ));
            }
        }

        let (timer_tx, mut timer_rx) = mpsc::channel::<()>(8);
        let mut retries_in_flight = 0usize;
        let mut shutdown_seen = false;
        let mut feed_outcome: Option<FeedOutcome> = None;
        let mut feeder = feeder;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown, if !shutdown_seen => {
                    shutdown_seen = true;
                    info!("shutdown signal received");
                    let step = engine.handle(EngineEvent::Shutdown { flatten: None });
                    retries_in_flight += schedule_retry(&step, &timer_tx);
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        // Every sender is gone, so the feeder has returned.
                        let outcome = join_feeder(&mut feeder).await;
                        info!(outcome = ?outcome, "market feed finished");
                        feed_outcome = Some(outcome);
                        break;
                    };
                    metrics::gauge!("mesa.queue_depth").set(rx.len() as f64);
                    let step = engine.handle(event);
                    retries_in_flight += schedule_retry(&step, &timer_tx);
                }
                Some(()) = timer_rx.recv() => {
                    retries_in_flight = retries_in_flight.saturating_sub(1);
                    let step = engine.handle(EngineEvent::RetryExit);
                    retries_in_flight += schedule_retry(&step, &timer_tx);
                }
                joined = &mut feeder => {
                    let outcome = joined
                        .unwrap_or_else(|err| FeedOutcome::Failed(format!("feeder panicked: {err}")));
                    info!(outcome = ?outcome, "market feed finished");
                    feed_outcome = Some(outcome);
                    while let Ok(event) = rx.try_recv() {
                        let step = engine.handle(event);
                        retries_in_flight += schedule_retry(&step, &timer_tx);
                    }
                    break;
                }
            }
            if shutdown_seen && engine.is_settled() {
                break;
            }
        }
        stop.store(true, Ordering::SeqCst);

        if !engine.shutdown_requested() {
            let step = engine.handle(EngineEvent::Shutdown { flatten: None });
            retries_in_flight += schedule_retry(&step, &timer_tx);
        }
        // Every scheduled timer fires, so a pending exit is always retried or halts.
        while retries_in_flight > 0 && !engine.is_settled() {
            let Some(()) = timer_rx.recv().await else {
                break;
            };
            retries_in_flight -= 1;
            let step = engine.handle(EngineEvent::RetryExit);
            retries_in_flight += schedule_retry(&step, &timer_tx);
        }

        let settled = engine.is_settled();
        if !settled {
            error!(
                state = %engine.machine().state(),
                mode = engine.machine().mode().as_str(),
                "live run ended with an unsettled trade; operator action required"
            );
        }
        engine.disconnect();

        let report = engine.report();
        let trades = engine.closed_trades().to_vec();
        let feed = status.lock().clone();
        Ok(LiveResult {
            run_id: run_id.to_string(),
            stats: compute_trade_stats(&trades),
            trades_sha256: trades_fingerprint(&trades),
            alerts: engine.alerts().to_vec(),
            trades,
            report,
            feed,
            feed_outcome,
            settled,
        })
    }
}

async fn join_feeder(feeder: &mut JoinHandle<FeedOutcome>) -> FeedOutcome {
    feeder
        .await
        .unwrap_or_else(|err| FeedOutcome::Failed(format!("feeder panicked: {err}")))
}

fn schedule_retry(step: &EngineStep, timer_tx: &mpsc::Sender<()>) -> usize {
    let Some(delay_ms) = step.retry_after_ms else {
        return 0;
    };
    let timer_tx = timer_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let _ = timer_tx.send(()).await;
    });
    1
}

/// Paper/live entry point: builds the engine from config and runs it on the current
/// tokio runtime.
pub async fn run_live<C, G, S>(
    config: &Config,
    connector: C,
    gateway: G,
    journal: Box<dyn TradeJournal + Send>,
    shutdown: S,
) -> Result<LiveResult, String>
where
    C: MarketConnector + Send + 'static,
    C::Stream: Send,
    G: OrderGateway,
    S: Future<Output = ()>,
{
    let span = info_span!(
        "live",
        run_id = %config.run.run_id,
        symbol = %config.run.symbol,
        bar = %config.run.bar
    );
    let engine = build_engine(config, gateway, journal)?;
    let runtime = LiveRuntime::new(resolve_runtime_settings(config));
    runtime
        .run(&config.run.run_id, engine, connector, shutdown)
        .instrument(span)
        .await
}

enum Enqueue {
    Sent,
    Dropped,
    Closed,
}

struct Feeder {
    tx: mpsc::Sender<EngineEvent>,
    status: Arc<Mutex<FeedStatus>>,
    stop: Arc<AtomicBool>,
    settings: RuntimeSettings,
    handle: Handle,
}

impl Feeder {
    fn run<C: MarketConnector>(
        self,
        mut connector: C,
        ready: oneshot::Sender<Result<(), String>>,
    ) -> FeedOutcome {
        let mut stream = match connector.connect() {
            Ok(stream) => {
                self.status.lock().connected = true;
                let _ = ready.send(Ok(()));
                stream
            }
            Err(err) => {
                let msg = err.to_string();
                self.status.lock().last_error = Some(msg.clone());
                let _ = ready.send(Err(msg.clone()));
                return FeedOutcome::Failed(msg);
            }
        };

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return FeedOutcome::Stopped;
            }
            match stream.next_tick() {
                Ok(tick) => {
                    self.status.lock().last_tick_timestamp = Some(tick.timestamp);
                    match self.enqueue_tick(EngineEvent::Tick(tick)) {
                        Enqueue::Sent => self.status.lock().ticks_enqueued += 1,
                        Enqueue::Dropped => {
                            self.status.lock().ticks_dropped += 1;
                            metrics::counter!("mesa.ticks_dropped").increment(1);
                        }
                        Enqueue::Closed => return FeedOutcome::Stopped,
                    }
                }
                Err(StreamError::EndOfStream) => return FeedOutcome::Ended,
                Err(StreamError::InvalidData(msg)) => {
                    self.status.lock().invalid_events += 1;
                    warn!(error = %msg, "invalid market data skipped");
                }
                Err(err @ (StreamError::Disconnected(_) | StreamError::Protocol(_))) => {
                    let reason = err.to_string();
                    warn!(error = %reason, "market feed lost");
                    {
                        let mut status = self.status.lock();
                        status.connected = false;
                        status.last_error = Some(reason.clone());
                    }
                    if !self.send_control(EngineEvent::FeedDisconnected {
                        reason: reason.clone(),
                    }) {
                        return FeedOutcome::Stopped;
                    }
                    match self.reconnect(&mut connector) {
                        Some(next) => stream = next,
                        None => {
                            return FeedOutcome::Failed(format!(
                                "reconnect attempts exhausted after: {reason}"
                            ))
                        }
                    }
                    if !self.send_control(EngineEvent::FeedReconnected) {
                        return FeedOutcome::Stopped;
                    }
                }
            }
        }
    }

    fn reconnect<C: MarketConnector>(&self, connector: &mut C) -> Option<C::Stream> {
        let mut backoff = self.settings.reconnect_backoff;
        for attempt in 1..=self.settings.reconnect_max_attempts {
            thread::sleep(backoff.min(MAX_RECONNECT_BACKOFF));
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            match connector.connect() {
                Ok(stream) => {
                    let mut status = self.status.lock();
                    status.connected = true;
                    status.reconnects += 1;
                    metrics::counter!("mesa.feed_reconnects").increment(1);
                    info!(attempt, "market feed reconnected");
                    return Some(stream);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect failed");
                    self.status.lock().last_error = Some(err.to_string());
                }
            }
            backoff = backoff.saturating_mul(2).min(MAX_RECONNECT_BACKOFF);
        }
        None
    }

    fn enqueue_tick(&self, event: EngineEvent) -> Enqueue {
        match self.settings.overflow {
            OverflowKind::DropTicks => match self.tx.try_send(event) {
                Ok(()) => Enqueue::Sent,
                Err(TrySendError::Full(_)) => Enqueue::Dropped,
                Err(TrySendError::Closed(_)) => Enqueue::Closed,
            },
            OverflowKind::Block => {
                let sent = self
                    .handle
                    .block_on(self.tx.send_timeout(event, self.settings.enqueue_timeout));
                match sent {
                    Ok(()) => Enqueue::Sent,
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(
                            timeout_ms = self.settings.enqueue_timeout.as_millis() as u64,
                            "event queue stalled; tick dropped"
                        );
                        Enqueue::Dropped
                    }
                    Err(SendTimeoutError::Closed(_)) => Enqueue::Closed,
                }
            }
        }
    }

    /// Control events are never dropped.
    fn send_control(&self, event: EngineEvent) -> bool {
        self.handle.block_on(self.tx.send(event)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesa_domain::value_objects::tick::Tick;

    fn feeder(overflow: OverflowKind, capacity: usize) -> (Feeder, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let feeder = Feeder {
            tx,
            status: Arc::new(Mutex::new(FeedStatus::default())),
            stop: Arc::new(AtomicBool::new(false)),
            settings: RuntimeSettings {
                overflow,
                enqueue_timeout: Duration::from_millis(20),
                ..RuntimeSettings::default()
            },
            handle: Handle::current(),
        };
        (feeder, rx)
    }

    fn tick(ts: i64) -> EngineEvent {
        EngineEvent::Tick(Tick::new(ts, 100.0, 1))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_ticks_policy_drops_when_full() {
        let (feeder, mut rx) = feeder(OverflowKind::DropTicks, 1);
        let outcomes = tokio::task::spawn_blocking(move || {
            let first = matches!(feeder.enqueue_tick(tick(1)), Enqueue::Sent);
            let second = matches!(feeder.enqueue_tick(tick(2)), Enqueue::Dropped);
            (first, second)
        })
        .await
        .expect("join");
        assert_eq!(outcomes, (true, true));
        assert_eq!(rx.recv().await, Some(tick(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn block_policy_gives_up_after_the_enqueue_timeout() {
        let (feeder, mut rx) = feeder(OverflowKind::Block, 1);
        let (feeder, first, second) = tokio::task::spawn_blocking(move || {
            let first = matches!(feeder.enqueue_tick(tick(1)), Enqueue::Sent);
            let second = matches!(feeder.enqueue_tick(tick(2)), Enqueue::Dropped);
            (feeder, first, second)
        })
        .await
        .expect("join");
        assert!(first && second);
        assert_eq!(rx.recv().await, Some(tick(1)));

        let control = tokio::task::spawn_blocking(move || feeder.send_control(EngineEvent::FeedReconnected))
            .await
            .expect("join");
        assert!(control);
        assert_eq!(rx.recv().await, Some(EngineEvent::FeedReconnected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_queue_stops_the_feeder() {
        let (feeder, rx) = feeder(OverflowKind::DropTicks, 4);
        drop(rx);
        let closed = tokio::task::spawn_blocking(move || {
            matches!(feeder.enqueue_tick(tick(1)), Enqueue::Closed)
                && !feeder.send_control(EngineEvent::RetryExit)
        })
        .await
        .expect("join");
        assert!(closed);
    }
}
