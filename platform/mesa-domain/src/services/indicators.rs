use crate::value_objects::bar::Bar;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

pub const EMA_FAST: &str = "ema_fast";
pub const EMA_SLOW: &str = "ema_slow";
pub const RSI: &str = "rsi";
pub const ATR: &str = "atr";
pub const VWAP: &str = "vwap";
pub const RVOL: &str = "rvol";

/// Most recent finalized bars, oldest first, bounded by capacity.
#[derive(Debug, Clone)]
pub struct BarHistory {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl BarHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, bar: Bar) {
        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Bar> + ExactSizeIterator {
        self.bars.iter()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndicatorValues {
    values: BTreeMap<String, f64>,
}

impl IndicatorValues {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn set(&mut self, name: &str, value: Option<f64>) {
        if let Some(value) = value.filter(|v| v.is_finite()) {
            self.values.insert(name.to_string(), value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Derived values per finalized bar. Called once per bar with that bar already appended.
pub trait IndicatorPipeline {
    fn compute(&mut self, history: &BarHistory) -> IndicatorValues;
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorConfig {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub rvol_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_fast: 9,
            ema_slow: 21,
            rsi_period: 9,
            atr_period: 9,
            rvol_window: 20,
        }
    }
}

/// Recomputes every indicator from the bounded history, so output depends only on the
/// bars passed in.
#[derive(Debug, Clone, Default)]
pub struct StandardIndicators {
    config: IndicatorConfig,
}

impl StandardIndicators {
    pub fn new(config: IndicatorConfig) -> Self {
        Self { config }
    }
}

impl IndicatorPipeline for StandardIndicators {
    fn compute(&mut self, history: &BarHistory) -> IndicatorValues {
        let closes: Vec<f64> = history.iter().map(|b| b.close).collect();
        let mut out = IndicatorValues::default();
        out.set(EMA_FAST, ema(&closes, self.config.ema_fast));
        out.set(EMA_SLOW, ema(&closes, self.config.ema_slow));
        out.set(RSI, rsi(&closes, self.config.rsi_period));
        out.set(ATR, atr(history, self.config.atr_period));
        out.set(VWAP, vwap(history));
        out.set(RVOL, rvol(history, self.config.rvol_window));
        out
    }
}

fn smoothing(span: usize) -> f64 {
    2.0 / (span as f64 + 1.0)
}

/// Recursive exponential average seeded with the first value.
pub fn ema(values: &[f64], span: usize) -> Option<f64> {
    if span == 0 {
        return None;
    }
    let alpha = smoothing(span);
    let mut iter = values.iter().copied();
    let mut acc = iter.next()?;
    for value in iter {
        acc = alpha * value + (1.0 - alpha) * acc;
    }
    Some(acc)
}

pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let alpha = smoothing(period);
    let mut avg_gain: Option<f64> = None;
    let mut avg_loss: Option<f64> = None;
    for pair in closes.windows(2) {
        let delta = pair[1] - pair[0];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = Some(avg_gain.map_or(gain, |g| alpha * gain + (1.0 - alpha) * g));
        avg_loss = Some(avg_loss.map_or(loss, |l| alpha * loss + (1.0 - alpha) * l));
    }
    let (gain, loss) = (avg_gain?, avg_loss?);
    if loss == 0.0 {
        return Some(if gain == 0.0 { 50.0 } else { 100.0 });
    }
    Some(100.0 - 100.0 / (1.0 + gain / loss))
}

pub fn atr(history: &BarHistory, period: usize) -> Option<f64> {
    if period == 0 || history.len() < period + 1 {
        return None;
    }
    let alpha = smoothing(period);
    let mut prev_close: Option<f64> = None;
    let mut acc: Option<f64> = None;
    for bar in history.iter() {
        let range = bar.high - bar.low;
        let tr = match prev_close {
            Some(prev) => range.max((bar.high - prev).abs()).max((bar.low - prev).abs()),
            None => range,
        };
        acc = Some(acc.map_or(tr, |a| alpha * tr + (1.0 - alpha) * a));
        prev_close = Some(bar.close);
    }
    acc
}

pub fn vwap(history: &BarHistory) -> Option<f64> {
    let (weighted, volume) = history.iter().fold((0.0, 0u64), |(w, v), bar| {
        (w + bar.close * bar.volume as f64, v.saturating_add(bar.volume))
    });
    if volume == 0 {
        return None;
    }
    Some(weighted / volume as f64)
}

/// Last bar volume over the mean volume of the `window` bars before it.
pub fn rvol(history: &BarHistory, window: usize) -> Option<f64> {
    if window == 0 || history.len() < window + 1 {
        return None;
    }
    let mut rev = history.iter().rev();
    let last = rev.next()?.volume as f64;
    let total: u64 = rev.take(window).map(|b| b.volume).sum();
    let mean = total as f64 / window as f64;
    if mean <= 0.0 {
        return None;
    }
    Some(last / mean)
}
