use clap::{Args, Parser, Subcommand};
use mesa::headless::{run_headless, HeadlessArgs, HeadlessMode};
use mesa::obs::{self, LogFormat};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mesa")]
#[command(about = "Tick-to-bar futures strategy runner: replay, paper trading, validation, reports.", version)]
struct Cli {
    /// Config file path (TOML). If omitted, uses env MESA_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when MESA_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on host:port. Falls back to env MESA_METRICS_ADDR.
    #[arg(long, global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct TickArgs {
    /// Tick CSV (timestamp,price,size). Overrides paths.ticks.
    #[arg(long)]
    ticks: Option<PathBuf>,

    /// Run directory. Defaults to <paths.out_dir>/<run_id>.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deterministic backtest over a tick file against the paper venue.
    Replay {
        #[command(flatten)]
        ticks: TickArgs,
    },
    /// Paced paper trading through the live runtime; ctrl-c shuts down.
    Paper {
        #[command(flatten)]
        ticks: TickArgs,

        /// Playback speed-up; overrides paper.replay_scale.
        #[arg(long)]
        replay_scale: Option<u64>,
    },
    /// Check the config and, when a tick file is known, its data quality.
    Validate {
        #[arg(long)]
        ticks: Option<PathBuf>,

        /// Treat warnings and data issues as failures (exit code 2).
        #[arg(long)]
        strict: bool,
    },
    /// Rebuild trades.csv and summary.json from a trade journal.
    Report {
        /// Journal path. Defaults to <run dir>/trades.jsonl.
        #[arg(long)]
        journal: Option<PathBuf>,

        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = obs::init_tracing(&cli.log_level, cli.log_format) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    if let Err(err) = obs::init_metrics(cli.metrics_addr.as_deref()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    let config_path = cli
        .config
        .or_else(|| {
            std::env::var("MESA_CONFIG")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| {
            eprintln!("error: missing --config and env MESA_CONFIG is not set");
            std::process::exit(1);
        });

    let mut args = HeadlessArgs {
        mode: HeadlessMode::Replay,
        config_path,
        ticks: None,
        strict: false,
        replay_scale: None,
        journal: None,
        out_dir: None,
    };
    match cli.command {
        Command::Replay { ticks } => {
            args.ticks = ticks.ticks;
            args.out_dir = ticks.out_dir;
        }
        Command::Paper {
            ticks,
            replay_scale,
        } => {
            args.mode = HeadlessMode::Paper;
            args.ticks = ticks.ticks;
            args.out_dir = ticks.out_dir;
            args.replay_scale = replay_scale;
        }
        Command::Validate { ticks, strict } => {
            args.mode = HeadlessMode::Validate;
            args.ticks = ticks;
            args.strict = strict;
        }
        Command::Report { journal, out_dir } => {
            args.mode = HeadlessMode::Report;
            args.journal = journal;
            args.out_dir = out_dir;
        }
    }

    match run_headless(args) {
        Ok(json) => {
            println!(
                "{}",
                serde_json::to_string(&json)
                    .unwrap_or_else(|_| "{\"status\":\"error\",\"error\":\"json\"}".to_string())
            );
            std::process::exit(0);
        }
        Err(err) => {
            let code = if err.to_lowercase().contains("strict validation failed") {
                2
            } else {
                1
            };
            tracing::error!(error = %err, "run failed");
            println!(
                "{}",
                serde_json::json!({"status": "error", "error": err, "exit_code": code})
            );
            eprintln!("error: {err}");
            std::process::exit(code);
        }
    }
}
