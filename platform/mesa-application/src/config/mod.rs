use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub run: RunConfig,
    pub orders: OrdersConfig,
    pub bracket: BracketConfig,
    pub trailing: Option<TrailingConfig>,
    pub signals: Option<SignalsConfig>,
    pub engine: Option<EngineConfig>,
    pub exit_retry: Option<ExitRetryConfig>,
    pub paper: Option<PaperConfig>,
    pub paths: PathsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub run_id: String,
    pub symbol: String,
    /// Bar length as a duration string (`5s`, `1m`, `1h`).
    pub bar: String,
    pub history_bars: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OrdersConfig {
    pub quantity: u64,
    /// Currency per point per contract.
    pub multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BracketPolicyKind {
    Atr,
    Percent,
    Points,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BracketConfig {
    pub policy: BracketPolicyKind,
    pub stop: f64,
    pub target: f64,
    pub fallback_atr: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TrailingConfig {
    pub offset_points: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryRuleKind {
    Trend,
    MeanReversion,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct SignalsConfig {
    pub entry_rule: Option<EntryRuleKind>,
    pub ema_fast: Option<usize>,
    pub ema_slow: Option<usize>,
    pub rsi_period: Option<usize>,
    pub atr_period: Option<usize>,
    pub rsi_oversold: Option<f64>,
    pub rsi_overbought: Option<f64>,
    pub allow_short: Option<bool>,
    pub exit_on_cross: Option<bool>,
    pub min_rvol: Option<f64>,
    pub rvol_window: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PriceCheckKind {
    Range,
    Close,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowKind {
    /// Feeder waits up to `enqueue_timeout_ms`, then treats the queue as stalled.
    Block,
    /// Ticks that do not fit are dropped and counted; control events always wait.
    DropTicks,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub price_check: Option<PriceCheckKind>,
    pub intrabar_checks: Option<bool>,
    pub flatten_on_shutdown: Option<bool>,
    pub queue_capacity: Option<usize>,
    pub overflow: Option<OverflowKind>,
    pub enqueue_timeout_ms: Option<u64>,
    pub startup_timeout_ms: Option<u64>,
    pub reconnect_max_attempts: Option<u32>,
    pub reconnect_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ExitRetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct PaperConfig {
    pub max_fill_qty_per_tick: Option<u64>,
    pub limit_fill_to_tick_size: Option<bool>,
    pub slippage_points: Option<f64>,
    pub max_order_qty: Option<u64>,
    /// Playback speed-up for paced tick files; 1 is wall-clock pace.
    pub replay_scale: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub ticks: Option<String>,
    pub out_dir: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ConfigCheck {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigCheck {
    pub fn is_ok(&self, strict: bool) -> bool {
        self.errors.is_empty() && (!strict || self.warnings.is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config, String> {
    let (config, _source) = load_config_with_source(path)?;
    Ok(config)
}

pub fn load_config_with_source(path: &Path) -> Result<(Config, String), String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {}", path.display(), err))?;
    let config = toml::from_str(&contents)
        .map_err(|err| format!("failed to parse TOML {}: {}", path.display(), err))?;
    Ok((config, contents))
}

pub fn to_toml_pretty(config: &Config) -> Result<String, String> {
    toml::to_string_pretty(config)
        .map_err(|err| format!("failed to serialize config as TOML: {err}"))
}

fn finite_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Semantic checks beyond what deserialization enforces. Errors make the config unusable;
/// warnings flag settings that run but are likely mistakes.
pub fn validate_config(config: &Config) -> ConfigCheck {
    let mut check = ConfigCheck::default();

    if config.run.symbol.trim().is_empty() {
        check.errors.push("run.symbol must not be empty".to_string());
    }
    if let Err(err) = mesa_domain::value_objects::timeframe::BarLength::parse(&config.run.bar) {
        check.errors.push(format!("run.bar: {err}"));
    }
    if config.run.history_bars == Some(0) {
        check.errors.push("run.history_bars must be >= 1".to_string());
    }

    if config.orders.quantity == 0 {
        check.errors.push("orders.quantity must be >= 1".to_string());
    }
    if let Some(multiplier) = config.orders.multiplier {
        if !finite_positive(multiplier) {
            check
                .errors
                .push("orders.multiplier must be finite and > 0".to_string());
        }
    }

    let bracket = &config.bracket;
    if !finite_positive(bracket.stop) || !finite_positive(bracket.target) {
        check
            .errors
            .push("bracket.stop and bracket.target must be finite and > 0".to_string());
    }
    if bracket.policy == BracketPolicyKind::Percent && (bracket.stop >= 1.0 || bracket.target >= 1.0)
    {
        check.warnings.push(
            "bracket.policy = \"percent\" expects fractions (0.002 = 0.2%)".to_string(),
        );
    }
    match (bracket.policy, bracket.fallback_atr) {
        (BracketPolicyKind::Atr, None) => check.warnings.push(
            "bracket.fallback_atr not set; entries during ATR warm-up use 1 point".to_string(),
        ),
        (BracketPolicyKind::Atr, Some(v)) if !finite_positive(v) => check
            .errors
            .push("bracket.fallback_atr must be finite and > 0".to_string()),
        (BracketPolicyKind::Percent | BracketPolicyKind::Points, Some(_)) => check
            .warnings
            .push("bracket.fallback_atr is ignored unless policy = \"atr\"".to_string()),
        _ => {}
    }

    if let Some(trailing) = config.trailing.as_ref() {
        if !finite_positive(trailing.offset_points) {
            check
                .errors
                .push("trailing.offset_points must be finite and > 0".to_string());
        }
    }

    if let Some(signals) = config.signals.as_ref() {
        for (name, value) in [
            ("ema_fast", signals.ema_fast),
            ("ema_slow", signals.ema_slow),
            ("rsi_period", signals.rsi_period),
            ("atr_period", signals.atr_period),
            ("rvol_window", signals.rvol_window),
        ] {
            if value == Some(0) {
                check.errors.push(format!("signals.{name} must be >= 1"));
            }
        }
        if let (Some(fast), Some(slow)) = (signals.ema_fast, signals.ema_slow) {
            if fast >= slow {
                check
                    .warnings
                    .push("signals.ema_fast should be shorter than signals.ema_slow".to_string());
            }
        }
        let oversold = signals.rsi_oversold.unwrap_or(30.0);
        let overbought = signals.rsi_overbought.unwrap_or(70.0);
        if !(0.0..=100.0).contains(&oversold) || !(0.0..=100.0).contains(&overbought) {
            check
                .errors
                .push("signals.rsi_oversold/rsi_overbought must be within 0..=100".to_string());
        } else if oversold >= overbought {
            check
                .errors
                .push("signals.rsi_oversold must be below signals.rsi_overbought".to_string());
        }
        if let Some(min_rvol) = signals.min_rvol {
            if !min_rvol.is_finite() || min_rvol < 0.0 {
                check
                    .errors
                    .push("signals.min_rvol must be finite and >= 0".to_string());
            }
        }
    }

    if let Some(history) = config.run.history_bars {
        let signals = config.signals.clone().unwrap_or_default();
        let needed = [
            signals.ema_slow.unwrap_or(21),
            signals.rsi_period.unwrap_or(9) + 1,
            signals.atr_period.unwrap_or(9) + 1,
            signals.rvol_window.unwrap_or(20) + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(1);
        if history > 0 && history < needed {
            check.warnings.push(format!(
                "run.history_bars={history} is shorter than the longest indicator window ({needed})"
            ));
        }
    }

    if let Some(engine) = config.engine.as_ref() {
        if engine.queue_capacity == Some(0) {
            check
                .errors
                .push("engine.queue_capacity must be >= 1".to_string());
        }
        if engine.startup_timeout_ms == Some(0) {
            check
                .errors
                .push("engine.startup_timeout_ms must be > 0".to_string());
        }
        if engine.flatten_on_shutdown == Some(false) {
            check.warnings.push(
                "engine.flatten_on_shutdown = false leaves open positions at shutdown".to_string(),
            );
        }
    }

    if let Some(retry) = config.exit_retry.as_ref() {
        if retry.max_attempts == Some(0) {
            check.warnings.push(
                "exit_retry.max_attempts = 0 halts on the first rejected exit".to_string(),
            );
        }
        if let (Some(initial), Some(max)) = (retry.initial_backoff_ms, retry.max_backoff_ms) {
            if initial > max {
                check.errors.push(
                    "exit_retry.initial_backoff_ms must not exceed exit_retry.max_backoff_ms"
                        .to_string(),
                );
            }
        }
    }

    if let Some(paper) = config.paper.as_ref() {
        if let Some(slippage) = paper.slippage_points {
            if !slippage.is_finite() || slippage < 0.0 {
                check
                    .errors
                    .push("paper.slippage_points must be finite and >= 0".to_string());
            }
        }
        if paper.replay_scale == Some(0) {
            check.errors.push("paper.replay_scale must be >= 1".to_string());
        }
        if let Some(max_qty) = paper.max_order_qty {
            if max_qty > 0 && max_qty < config.orders.quantity {
                check.warnings.push(format!(
                    "paper.max_order_qty={max_qty} rejects every entry of orders.quantity={}",
                    config.orders.quantity
                ));
            }
        }
    }

    if config.paths.out_dir.trim().is_empty() {
        check.errors.push("paths.out_dir must not be empty".to_string());
    }

    check
}
