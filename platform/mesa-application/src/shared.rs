use crate::config::{
    BracketPolicyKind, Config, EntryRuleKind, OverflowKind, PriceCheckKind,
};
use crate::engine::{EngineSettings, TradingEngine};
use mesa_domain::repositories::order_gateway::OrderGateway;
use mesa_domain::repositories::trade_journal::TradeJournal;
use mesa_domain::services::bracket::{
    AtrBracket, BracketPolicy, PercentBracket, PointsBracket, TrailingStop,
};
use mesa_domain::services::indicators::{IndicatorConfig, StandardIndicators};
use mesa_domain::services::paper_venue::PaperVenueConfig;
use mesa_domain::services::realtime_bar::BarAggregator;
use mesa_domain::services::signals::{EmaRsiRules, EntryRule, RuleParams};
use mesa_domain::services::trade_machine::{
    PriceCheck, RetryPolicy, TradeMachineConfig, TradeStateMachine,
};
use mesa_domain::value_objects::timeframe::BarLength;
use mesa_domain::value_objects::trade::ClosedTrade;
use sha2::{Digest, Sha256};
use std::time::Duration;

const DEFAULT_FALLBACK_ATR: f64 = 1.0;

pub fn resolve_bar_length(config: &Config) -> Result<BarLength, String> {
    BarLength::parse(&config.run.bar).map_err(|err| format!("run.bar: {err}"))
}

pub fn resolve_bracket(config: &Config) -> Result<Box<dyn BracketPolicy + Send>, String> {
    let bracket = &config.bracket;
    if !bracket.stop.is_finite() || bracket.stop <= 0.0 {
        return Err("bracket.stop must be finite and > 0".to_string());
    }
    if !bracket.target.is_finite() || bracket.target <= 0.0 {
        return Err("bracket.target must be finite and > 0".to_string());
    }
    Ok(match bracket.policy {
        BracketPolicyKind::Atr => Box::new(AtrBracket {
            stop_mult: bracket.stop,
            target_mult: bracket.target,
            fallback_atr: bracket.fallback_atr.unwrap_or(DEFAULT_FALLBACK_ATR),
        }),
        BracketPolicyKind::Percent => Box::new(PercentBracket {
            stop_pct: bracket.stop,
            target_pct: bracket.target,
        }),
        BracketPolicyKind::Points => Box::new(PointsBracket {
            stop_points: bracket.stop,
            target_points: bracket.target,
        }),
    })
}

pub fn resolve_retry_policy(config: &Config) -> RetryPolicy {
    let defaults = RetryPolicy::default();
    let Some(retry) = config.exit_retry.as_ref() else {
        return defaults;
    };
    RetryPolicy {
        max_attempts: retry.max_attempts.unwrap_or(defaults.max_attempts),
        initial_backoff_ms: retry
            .initial_backoff_ms
            .unwrap_or(defaults.initial_backoff_ms),
        max_backoff_ms: retry.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
    }
}

pub fn resolve_machine_config(config: &Config) -> Result<TradeMachineConfig, String> {
    if config.orders.quantity == 0 {
        return Err("orders.quantity must be >= 1".to_string());
    }
    let multiplier = config.orders.multiplier.unwrap_or(1.0);
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return Err("orders.multiplier must be finite and > 0".to_string());
    }
    let price_check = match config.engine.as_ref().and_then(|e| e.price_check) {
        Some(PriceCheckKind::Close) => PriceCheck::BarClose,
        Some(PriceCheckKind::Range) | None => PriceCheck::BarRange,
    };
    let trailing = match config.trailing.as_ref() {
        Some(t) if t.offset_points.is_finite() && t.offset_points > 0.0 => Some(TrailingStop {
            offset: t.offset_points,
        }),
        Some(_) => return Err("trailing.offset_points must be finite and > 0".to_string()),
        None => None,
    };
    Ok(TradeMachineConfig {
        symbol: config.run.symbol.clone(),
        quantity: config.orders.quantity,
        multiplier,
        price_check,
        exit_retry: resolve_retry_policy(config),
        trailing,
    })
}

pub fn resolve_indicator_config(config: &Config) -> IndicatorConfig {
    let defaults = IndicatorConfig::default();
    let Some(signals) = config.signals.as_ref() else {
        return defaults;
    };
    IndicatorConfig {
        ema_fast: signals.ema_fast.unwrap_or(defaults.ema_fast).max(1),
        ema_slow: signals.ema_slow.unwrap_or(defaults.ema_slow).max(1),
        rsi_period: signals.rsi_period.unwrap_or(defaults.rsi_period).max(1),
        atr_period: signals.atr_period.unwrap_or(defaults.atr_period).max(1),
        rvol_window: signals.rvol_window.unwrap_or(defaults.rvol_window).max(1),
    }
}

pub fn resolve_rule_params(config: &Config) -> RuleParams {
    let defaults = RuleParams::default();
    let Some(signals) = config.signals.as_ref() else {
        return defaults;
    };
    RuleParams {
        entry_rule: match signals.entry_rule {
            Some(EntryRuleKind::MeanReversion) => EntryRule::MeanReversion,
            Some(EntryRuleKind::Trend) | None => EntryRule::Trend,
        },
        rsi_oversold: signals.rsi_oversold.unwrap_or(defaults.rsi_oversold),
        rsi_overbought: signals.rsi_overbought.unwrap_or(defaults.rsi_overbought),
        allow_short: signals.allow_short.unwrap_or(defaults.allow_short),
        exit_on_cross: signals.exit_on_cross.unwrap_or(defaults.exit_on_cross),
        min_rvol: signals.min_rvol,
    }
}

pub fn resolve_engine_settings(config: &Config) -> EngineSettings {
    let defaults = EngineSettings::default();
    let engine = config.engine.clone().unwrap_or_default();
    EngineSettings {
        intrabar_checks: engine.intrabar_checks.unwrap_or(defaults.intrabar_checks),
        flatten_on_shutdown: engine
            .flatten_on_shutdown
            .unwrap_or(defaults.flatten_on_shutdown),
        history_bars: config.run.history_bars.unwrap_or(defaults.history_bars).max(1),
    }
}

pub fn resolve_paper_venue_config(config: &Config) -> PaperVenueConfig {
    let defaults = PaperVenueConfig::default();
    let paper = config.paper.clone().unwrap_or_default();
    PaperVenueConfig {
        max_fill_qty_per_tick: paper
            .max_fill_qty_per_tick
            .unwrap_or(defaults.max_fill_qty_per_tick),
        limit_fill_to_tick_size: paper
            .limit_fill_to_tick_size
            .unwrap_or(defaults.limit_fill_to_tick_size),
        slippage_points: paper.slippage_points.unwrap_or(defaults.slippage_points),
        max_order_qty: paper.max_order_qty.unwrap_or(defaults.max_order_qty),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub queue_capacity: usize,
    pub overflow: OverflowKind,
    pub enqueue_timeout: Duration,
    pub startup_timeout: Duration,
    pub reconnect_max_attempts: u32,
    /// First reconnect delay; doubles per attempt up to `MAX_RECONNECT_BACKOFF`.
    pub reconnect_backoff: Duration,
}

pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            overflow: OverflowKind::Block,
            enqueue_timeout: Duration::from_millis(5_000),
            startup_timeout: Duration::from_millis(10_000),
            reconnect_max_attempts: 5,
            reconnect_backoff: Duration::from_millis(250),
        }
    }
}

pub fn resolve_runtime_settings(config: &Config) -> RuntimeSettings {
    let defaults = RuntimeSettings::default();
    let engine = config.engine.clone().unwrap_or_default();
    RuntimeSettings {
        queue_capacity: engine.queue_capacity.unwrap_or(defaults.queue_capacity).max(1),
        overflow: engine.overflow.unwrap_or(defaults.overflow),
        enqueue_timeout: engine
            .enqueue_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.enqueue_timeout),
        startup_timeout: engine
            .startup_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.startup_timeout),
        reconnect_max_attempts: engine
            .reconnect_max_attempts
            .unwrap_or(defaults.reconnect_max_attempts),
        reconnect_backoff: engine
            .reconnect_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_backoff),
    }
}

/// Wires an engine for `gateway` from the config using the standard indicators and rules.
pub fn build_engine<G: OrderGateway>(
    config: &Config,
    gateway: G,
    journal: Box<dyn TradeJournal + Send>,
) -> Result<TradingEngine<G>, String> {
    let bar = resolve_bar_length(config)?;
    let aggregator = BarAggregator::new(config.run.symbol.clone(), bar.length_ms)?;
    let machine = TradeStateMachine::new(resolve_machine_config(config)?, resolve_bracket(config)?);
    Ok(TradingEngine::new(
        config.run.symbol.clone(),
        aggregator,
        Box::new(StandardIndicators::new(resolve_indicator_config(config))),
        Box::new(EmaRsiRules::new(resolve_rule_params(config))),
        machine,
        gateway,
        journal,
        resolve_engine_settings(config),
    ))
}

/// Fingerprint of the closed-trade sequence; identical runs produce identical hashes.
pub fn trades_fingerprint(trades: &[ClosedTrade]) -> String {
    let mut hasher = Sha256::new();
    for trade in trades {
        let canonical = serde_json::to_string(trade)
            .unwrap_or_else(|_| format!("{{\"trade_id\":{}}}", trade.trade_id.0));
        hasher.update(canonical.as_bytes());
        hasher.update(b"\n");
    }
    let bytes = hasher.finalize();
    to_hex(&bytes[..])
}

pub fn config_fingerprint(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let bytes = hasher.finalize();
    to_hex(&bytes[..])[..12].to_string()
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
