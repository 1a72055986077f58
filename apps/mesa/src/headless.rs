use mesa_application::config::{load_config_with_source, Config};
use mesa_application::live::LiveRuntime;
use mesa_application::replay::run_replay;
use mesa_application::reporting::{generate_report, summary_json, write_run_artifacts};
use mesa_application::shared::{
    build_engine, config_fingerprint, resolve_paper_venue_config, resolve_runtime_settings,
};
use mesa_domain::repositories::artifacts::ArtifactWriter;
use mesa_domain::services::paper_venue::PaperVenue;
use mesa_infrastructure::artifacts::FilesystemArtifactWriter;
use mesa_infrastructure::journal::{JsonlJournalReader, JsonlTradeJournal};
use mesa_infrastructure::market_data::ticks::{CsvConnector, CsvTickStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);
const FEEDER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadlessMode {
    Replay,
    Paper,
    Validate,
    Report,
}

pub struct HeadlessArgs {
    pub mode: HeadlessMode,
    pub config_path: PathBuf,
    pub ticks: Option<PathBuf>,
    pub strict: bool,
    pub replay_scale: Option<u64>,
    pub journal: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
}

pub fn run_headless(args: HeadlessArgs) -> Result<serde_json::Value, String> {
    let (config, config_toml) = load_config_with_source(&args.config_path)?;
    let mut out = match args.mode {
        HeadlessMode::Replay => run_replay_mode(&config, &config_toml, &args)?,
        HeadlessMode::Paper => run_paper_mode(&config, &config_toml, &args)?,
        HeadlessMode::Validate => run_validate_mode(&config, &args)?,
        HeadlessMode::Report => run_report_mode(&config, &args)?,
    };
    out["config_sha"] = serde_json::json!(config_fingerprint(&config_toml));
    out["finished_at"] = serde_json::json!(chrono::Utc::now().to_rfc3339());
    Ok(out)
}

fn run_dir_for(config: &Config, override_dir: Option<&Path>) -> PathBuf {
    override_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&config.paths.out_dir).join(&config.run.run_id))
}

fn ticks_path(config: &Config, args: &HeadlessArgs) -> Result<PathBuf, String> {
    args.ticks
        .clone()
        .or_else(|| config.paths.ticks.as_ref().map(PathBuf::from))
        .ok_or_else(|| "missing --ticks and paths.ticks is not set".to_string())
}

fn artifacts_for_run(run_dir: &Path) -> serde_json::Value {
    serde_json::json!({
        "run_dir": run_dir.display().to_string(),
        "trades_csv": run_dir.join("trades.csv").display().to_string(),
        "summary_json": run_dir.join("summary.json").display().to_string(),
        "journal_jsonl": run_dir.join("trades.jsonl").display().to_string(),
        "config_snapshot_toml": run_dir.join("config_snapshot.toml").display().to_string(),
    })
}

fn open_run_dir(
    run_dir: &Path,
    writer: &FilesystemArtifactWriter,
    config_toml: &str,
) -> Result<JsonlTradeJournal, String> {
    writer.ensure_dir(run_dir)?;
    let journal = JsonlTradeJournal::create(&run_dir.join("trades.jsonl"))?;
    writer.write_config_snapshot_toml(&run_dir.join("config_snapshot.toml"), config_toml)?;
    Ok(journal)
}

fn run_replay_mode(
    config: &Config,
    config_toml: &str,
    args: &HeadlessArgs,
) -> Result<serde_json::Value, String> {
    let ticks = ticks_path(config, args)?;
    let run_dir = run_dir_for(config, args.out_dir.as_deref());
    let writer = FilesystemArtifactWriter::new();
    let journal = open_run_dir(&run_dir, &writer, config_toml)?;

    let mut stream = CsvTickStream::open(&ticks, None)?;
    let result = run_replay(config, &mut stream, Box::new(journal))?;

    let summary = summary_json(
        &result.run_id,
        &result.trades,
        &result.stats,
        Some(&result.report),
    );
    write_run_artifacts(&run_dir, &writer, &result.trades, &summary)?;

    Ok(serde_json::json!({
        "status": "ok",
        "mode": "replay",
        "run_id": result.run_id,
        "ticks": ticks.display().to_string(),
        "trades": result.trades.len(),
        "realized_pnl": result.report.realized_pnl,
        "trades_sha256": result.trades_sha256,
        "alerts": result.alerts.len(),
        "engine": result.report,
        "artifacts": artifacts_for_run(&run_dir),
    }))
}

fn run_paper_mode(
    config: &Config,
    config_toml: &str,
    args: &HeadlessArgs,
) -> Result<serde_json::Value, String> {
    let ticks = ticks_path(config, args)?;
    let run_dir = run_dir_for(config, args.out_dir.as_deref());
    let writer = FilesystemArtifactWriter::new();
    let journal = open_run_dir(&run_dir, &writer, config_toml)?;

    let replay_scale = args
        .replay_scale
        .or_else(|| config.paper.as_ref().and_then(|p| p.replay_scale))
        .unwrap_or(1);
    let connector = CsvConnector::new(&ticks, Some(replay_scale));
    let venue = PaperVenue::new(resolve_paper_venue_config(config));
    let engine = build_engine(config, venue, Box::new(journal))?;
    let runtime_settings = resolve_runtime_settings(config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("failed to init tokio runtime: {err}"))?;

    let result = runtime.block_on(async {
        let live = LiveRuntime::new(runtime_settings);
        let status = live.feed_status();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let snapshot = status.lock().clone();
                metrics::gauge!("mesa.feed_connected").set(if snapshot.connected { 1.0 } else { 0.0 });
                info!(
                    connected = snapshot.connected,
                    reconnects = snapshot.reconnects,
                    enqueued = snapshot.ticks_enqueued,
                    dropped = snapshot.ticks_dropped,
                    last_tick = ?snapshot.last_tick_timestamp,
                    "feed status"
                );
            }
        });
        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable; running until the feed ends");
                std::future::pending::<()>().await;
            }
        };
        let span = tracing::info_span!(
            "live",
            run_id = %config.run.run_id,
            symbol = %config.run.symbol,
            bar = %config.run.bar
        );
        let result = tracing::Instrument::instrument(
            live.run(&config.run.run_id, engine, connector, shutdown),
            span,
        )
        .await;
        heartbeat.abort();
        result
    });
    // A paced feeder may still be sleeping toward its next tick.
    runtime.shutdown_timeout(FEEDER_GRACE);
    let result = result?;

    let mut summary = summary_json(
        &result.run_id,
        &result.trades,
        &result.stats,
        Some(&result.report),
    );
    summary["feed"] = serde_json::json!(result.feed);
    summary["settled"] = serde_json::json!(result.settled);
    write_run_artifacts(&run_dir, &writer, &result.trades, &summary)?;

    if !result.settled {
        return Err(format!(
            "paper run ended unsettled (state {}, mode {}); see {}",
            result.report.final_state,
            result.report.mode,
            run_dir.display()
        ));
    }

    Ok(serde_json::json!({
        "status": "ok",
        "mode": "paper",
        "run_id": result.run_id,
        "ticks": ticks.display().to_string(),
        "replay_scale": replay_scale,
        "trades": result.trades.len(),
        "realized_pnl": result.report.realized_pnl,
        "trades_sha256": result.trades_sha256,
        "alerts": result.alerts.len(),
        "feed": result.feed,
        "feed_outcome": result.feed_outcome,
        "engine": result.report,
        "artifacts": artifacts_for_run(&run_dir),
    }))
}

fn run_validate_mode(config: &Config, args: &HeadlessArgs) -> Result<serde_json::Value, String> {
    let ticks = args
        .ticks
        .clone()
        .or_else(|| config.paths.ticks.as_ref().map(PathBuf::from));
    let report = match ticks.as_deref() {
        Some(path) => {
            let mut stream = CsvTickStream::open(path, None)?;
            mesa_application::validation::validate(config, args.strict, Some(&mut stream))?
        }
        None => mesa_application::validation::validate(config, args.strict, None)?,
    };
    Ok(serde_json::json!({
        "status": "ok",
        "mode": "validate",
        "strict": args.strict,
        "run_id": config.run.run_id,
        "out_dir": config.paths.out_dir,
        "report": report,
    }))
}

fn run_report_mode(config: &Config, args: &HeadlessArgs) -> Result<serde_json::Value, String> {
    let run_dir = run_dir_for(config, args.out_dir.as_deref());
    let journal = args
        .journal
        .clone()
        .unwrap_or_else(|| run_dir.join("trades.jsonl"));
    let result = generate_report(
        &journal,
        &run_dir,
        &config.run.run_id,
        &JsonlJournalReader,
        &FilesystemArtifactWriter::new(),
    )?;
    Ok(serde_json::json!({
        "status": "ok",
        "mode": "report",
        "run_id": config.run.run_id,
        "journal": journal.display().to_string(),
        "trades": result.trades.len(),
        "open_trades": result.open_trades,
        "orphan_exits": result.orphan_exits,
        "stats": result.stats,
        "artifacts": artifacts_for_run(&result.out_dir),
    }))
}
