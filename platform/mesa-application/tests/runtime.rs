use mesa_application::config::Config;
use mesa_application::live::{run_live, FeedOutcome};
use mesa_application::replay::run_replay;
use mesa_application::reporting::{generate_report, reconstruct_trades};
use mesa_application::shared::resolve_paper_venue_config;
use mesa_domain::events::domain_event::{AlertKind, Severity};
use mesa_domain::repositories::market_stream::{
    MarketConnector, MarketStream, StreamError, VecTickStream,
};
use mesa_domain::repositories::order_gateway::{BrokerEvent, GatewayError, OrderGateway};
use mesa_domain::repositories::trade_journal::MemoryJournal;
use mesa_domain::services::paper_venue::PaperVenue;
use mesa_domain::value_objects::order::{OrderId, OrderRequest};
use mesa_domain::value_objects::tick::Tick;
use mesa_infrastructure::artifacts::FilesystemArtifactWriter;
use mesa_infrastructure::journal::{read_journal, JsonlJournalReader, JsonlTradeJournal};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn config(extra: &str) -> Config {
    let text = format!(
        r#"
[run]
run_id = "it"
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

{extra}
"#
    );
    toml::from_str(&text).expect("config")
}

fn runtime_config() -> Config {
    config(
        r#"
[engine]
startup_timeout_ms = 2000
reconnect_max_attempts = 3
reconnect_backoff_ms = 5
"#,
    )
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

fn unique_tmp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("mesa_{prefix}_{}_{}", std::process::id(), now))
}

/// Hands out one scripted session per `connect`; a session that runs dry ends the stream.
struct ScriptedConnector {
    sessions: VecDeque<Vec<Result<Tick, StreamError>>>,
    connect_delay: Duration,
}

struct ScriptedStream {
    items: VecDeque<Result<Tick, StreamError>>,
}

impl MarketStream for ScriptedStream {
    fn next_tick(&mut self) -> Result<Tick, StreamError> {
        self.items.pop_front().unwrap_or(Err(StreamError::EndOfStream))
    }
}

impl MarketConnector for ScriptedConnector {
    type Stream = ScriptedStream;

    fn connect(&mut self) -> Result<ScriptedStream, StreamError> {
        thread::sleep(self.connect_delay);
        let session = self
            .sessions
            .pop_front()
            .ok_or_else(|| StreamError::Disconnected("no session".to_string()))?;
        Ok(ScriptedStream {
            items: session.into(),
        })
    }
}

fn single_session(ticks: Vec<Tick>) -> ScriptedConnector {
    ScriptedConnector {
        sessions: VecDeque::from(vec![ticks.into_iter().map(Ok).collect()]),
        connect_delay: Duration::ZERO,
    }
}

/// Feed split in two sessions by a disconnect after `split` ticks.
fn split_sessions(ticks: Vec<Tick>, split: usize) -> ScriptedConnector {
    let mut first: Vec<Result<Tick, StreamError>> = ticks[..split].iter().copied().map(Ok).collect();
    first.push(Err(StreamError::Disconnected("socket reset".to_string())));
    let second = ticks[split..].iter().copied().map(Ok).collect();
    ScriptedConnector {
        sessions: VecDeque::from(vec![first, second]),
        connect_delay: Duration::ZERO,
    }
}

/// Paper venue whose snapshots disagree with the real position.
struct SkewedVenue {
    inner: PaperVenue,
    skew: i64,
}

impl OrderGateway for SkewedVenue {
    fn place_order(&mut self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        self.inner.place_order(request)
    }

    fn cancel_order(&mut self, order_id: OrderId) -> Result<(), GatewayError> {
        self.inner.cancel_order(order_id)
    }

    fn request_reconciliation(&mut self, timestamp: i64) -> Result<(), GatewayError> {
        self.inner.request_reconciliation(timestamp)
    }

    fn observe_tick(&mut self, tick: &Tick) {
        self.inner.observe_tick(tick)
    }

    fn drain_events(&mut self) -> Vec<BrokerEvent> {
        let skew = self.skew;
        self.inner
            .drain_events()
            .into_iter()
            .map(|event| match event {
                BrokerEvent::Snapshot(mut snapshot) => {
                    snapshot.net_position += skew;
                    BrokerEvent::Snapshot(snapshot)
                }
                other => other,
            })
            .collect()
    }

    fn disconnect(&mut self) {
        self.inner.disconnect()
    }
}

/// Paper venue that refuses the n-th order placed (1-based).
struct RefusingVenue {
    inner: PaperVenue,
    refuse_nth: usize,
    placed: usize,
}

impl OrderGateway for RefusingVenue {
    fn place_order(&mut self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        self.placed += 1;
        if self.placed == self.refuse_nth {
            return Err(GatewayError::Rejected("venue busy".to_string()));
        }
        self.inner.place_order(request)
    }

    fn cancel_order(&mut self, order_id: OrderId) -> Result<(), GatewayError> {
        self.inner.cancel_order(order_id)
    }

    fn request_reconciliation(&mut self, timestamp: i64) -> Result<(), GatewayError> {
        self.inner.request_reconciliation(timestamp)
    }

    fn observe_tick(&mut self, tick: &Tick) {
        self.inner.observe_tick(tick)
    }

    fn drain_events(&mut self) -> Vec<BrokerEvent> {
        self.inner.drain_events()
    }

    fn disconnect(&mut self) {
        self.inner.disconnect()
    }
}

#[test]
fn replay_journal_rebuilds_the_same_trades_and_report() {
    let dir = unique_tmp_dir("replay_e2e");
    let journal_path = dir.join("trades.jsonl");
    let cfg = config("");
    let journal = JsonlTradeJournal::create(&journal_path).expect("journal");
    let result = run_replay(
        &cfg,
        &mut VecTickStream::new(rising_then_falling()),
        Box::new(journal),
    )
    .expect("replay");
    assert!(!result.trades.is_empty());

    let records = read_journal(&journal_path).expect("records");
    assert_eq!(records.len(), result.trades.len() * 2);
    let rebuilt = reconstruct_trades(&records);
    assert!(rebuilt.open.is_empty());
    assert_eq!(rebuilt.closed.len(), result.trades.len());
    for (a, b) in rebuilt.closed.iter().zip(&result.trades) {
        assert_eq!(a.trade_id, b.trade_id);
        assert_eq!(a.exit_reason, b.exit_reason);
        assert!((a.realized_pnl - b.realized_pnl).abs() < 1e-9);
    }

    let out_dir = dir.join("report");
    let report = generate_report(
        &journal_path,
        &out_dir,
        "it",
        &JsonlJournalReader,
        &FilesystemArtifactWriter::new(),
    )
    .expect("report");
    assert_eq!(report.trades.len(), result.trades.len());
    assert_eq!(report.open_trades, 0);
    assert!(out_dir.join("trades.csv").exists());
    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(out_dir.join("summary.json")).expect("summary"),
    )
    .expect("json");
    assert_eq!(summary["trades"], result.trades.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_run_matches_replay_on_the_same_ticks() {
    let cfg = runtime_config();
    let replay = run_replay(
        &cfg,
        &mut VecTickStream::new(rising_then_falling()),
        Box::new(MemoryJournal::default()),
    )
    .expect("replay");

    let venue = PaperVenue::new(resolve_paper_venue_config(&cfg));
    let live = run_live(
        &cfg,
        single_session(rising_then_falling()),
        venue,
        Box::new(MemoryJournal::default()),
        std::future::pending::<()>(),
    )
    .await
    .expect("live");

    assert_eq!(live.feed_outcome, Some(FeedOutcome::Ended));
    assert!(live.settled);
    assert_eq!(live.feed.ticks_enqueued, 40);
    assert_eq!(live.feed.ticks_dropped, 0);
    assert_eq!(live.trades, replay.trades);
    assert_eq!(live.trades_sha256, replay.trades_sha256);
    assert_eq!(live.report.final_state, "IDLE");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_connect_fails_the_startup_handshake() {
    let cfg = config(
        r#"
[engine]
startup_timeout_ms = 50
"#,
    );
    let connector = ScriptedConnector {
        sessions: VecDeque::from(vec![Vec::new()]),
        connect_delay: Duration::from_millis(400),
    };
    let err = run_live(
        &cfg,
        connector,
        PaperVenue::new(resolve_paper_venue_config(&cfg)),
        Box::new(MemoryJournal::default()),
        std::future::pending::<()>(),
    )
    .await
    .unwrap_err();
    assert!(err.contains("timed out"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_connect_is_reported() {
    let cfg = runtime_config();
    let connector = ScriptedConnector {
        sessions: VecDeque::new(),
        connect_delay: Duration::ZERO,
    };
    let err = run_live(
        &cfg,
        connector,
        PaperVenue::new(resolve_paper_venue_config(&cfg)),
        Box::new(MemoryJournal::default()),
        std::future::pending::<()>(),
    )
    .await
    .unwrap_err();
    assert!(err.contains("connection failed"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_reconciles_and_resumes() {
    let cfg = runtime_config();
    let live = run_live(
        &cfg,
        split_sessions(rising_then_falling(), 15),
        PaperVenue::new(resolve_paper_venue_config(&cfg)),
        Box::new(MemoryJournal::default()),
        std::future::pending::<()>(),
    )
    .await
    .expect("live");

    assert_eq!(live.feed.reconnects, 1);
    assert!(live.feed.connected);
    assert_eq!(live.feed_outcome, Some(FeedOutcome::Ended));
    assert_eq!(live.report.mode, "active");
    assert_eq!(live.report.ticks, 40);
    assert!(live
        .alerts
        .iter()
        .any(|a| a.kind == AlertKind::FeedDisconnected));
    assert!(!live
        .alerts
        .iter()
        .any(|a| a.kind == AlertKind::ReconciliationMismatch));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconciliation_mismatch_halts_with_critical_alert() {
    let cfg = runtime_config();
    let venue = SkewedVenue {
        inner: PaperVenue::new(resolve_paper_venue_config(&cfg)),
        skew: 1,
    };
    let live = run_live(
        &cfg,
        split_sessions(rising_then_falling(), 15),
        venue,
        Box::new(MemoryJournal::default()),
        std::future::pending::<()>(),
    )
    .await
    .expect("live");

    assert_eq!(live.report.mode, "halted");
    assert!(live.report.alerts_critical >= 1);
    assert!(live.alerts.iter().any(|a| {
        a.kind == AlertKind::ReconciliationMismatch && a.severity == Severity::Critical
    }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_reconnects_end_the_run() {
    let cfg = runtime_config();
    let mut first: Vec<Result<Tick, StreamError>> =
        rising_then_falling()[..10].iter().copied().map(Ok).collect();
    first.push(Err(StreamError::Protocol("bad frame".to_string())));
    let connector = ScriptedConnector {
        sessions: VecDeque::from(vec![first]),
        connect_delay: Duration::ZERO,
    };
    let live = run_live(
        &cfg,
        connector,
        PaperVenue::new(resolve_paper_venue_config(&cfg)),
        Box::new(MemoryJournal::default()),
        std::future::pending::<()>(),
    )
    .await
    .expect("live");

    assert!(matches!(live.feed_outcome, Some(FeedOutcome::Failed(_))));
    assert!(!live.feed.connected);
    assert_eq!(live.feed.reconnects, 0);
    assert_eq!(live.report.ticks, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_signal_stops_an_endless_feed() {
    struct Endless {
        next: i64,
    }
    impl MarketStream for Endless {
        fn next_tick(&mut self) -> Result<Tick, StreamError> {
            thread::sleep(Duration::from_millis(1));
            self.next += 100;
            Ok(Tick::new(self.next, 100.0, 1))
        }
    }
    struct EndlessConnector;
    impl MarketConnector for EndlessConnector {
        type Stream = Endless;
        fn connect(&mut self) -> Result<Endless, StreamError> {
            Ok(Endless { next: 0 })
        }
    }

    let cfg = runtime_config();
    let live = run_live(
        &cfg,
        EndlessConnector,
        PaperVenue::new(resolve_paper_venue_config(&cfg)),
        Box::new(MemoryJournal::default()),
        tokio::time::sleep(Duration::from_millis(100)),
    )
    .await
    .expect("live");

    assert!(live.settled);
    assert!(live.feed_outcome.is_none());
    assert!(live.report.ticks > 0);
    assert!(live.trades.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_retry_pending_at_feed_end_is_completed_before_returning() {
    let cfg = config(
        r#"
[engine]
startup_timeout_ms = 2000

[exit_retry]
max_attempts = 3
initial_backoff_ms = 300
max_backoff_ms = 600
"#,
    );
    // Order 1 is the entry, order 2 the first exit.
    let venue = RefusingVenue {
        inner: PaperVenue::new(resolve_paper_venue_config(&cfg)),
        refuse_nth: 2,
        placed: 0,
    };
    let started = std::time::Instant::now();
    let live = run_live(
        &cfg,
        single_session(rising_then_falling()),
        venue,
        Box::new(MemoryJournal::default()),
        std::future::pending::<()>(),
    )
    .await
    .expect("live");

    assert_eq!(live.feed_outcome, Some(FeedOutcome::Ended));
    assert!(live.settled);
    assert_eq!(live.report.final_state, "IDLE");
    assert_eq!(live.report.mode, "active");
    assert_eq!(live.trades.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(300));
}
