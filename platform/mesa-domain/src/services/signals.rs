use crate::services::indicators::{IndicatorValues, EMA_FAST, EMA_SLOW, RSI, RVOL};
use crate::value_objects::bar::Bar;
use crate::value_objects::side::Side;
use crate::value_objects::signal::Signal;

/// Maps a closed bar and its indicators to at most one signal.
///
/// `open_trade` is the side of the active trade, if any. Entry rules run only when it is
/// `None`, exit rules only when it is `Some`, and exit rules never yield an entry.
/// Implementations must be deterministic and free of side effects.
pub trait SignalEvaluator {
    fn evaluate(
        &self,
        bar: &Bar,
        indicators: &IndicatorValues,
        open_trade: Option<Side>,
    ) -> Option<Signal>;
}

impl<F> SignalEvaluator for F
where
    F: Fn(&Bar, &IndicatorValues, Option<Side>) -> Option<Signal>,
{
    fn evaluate(
        &self,
        bar: &Bar,
        indicators: &IndicatorValues,
        open_trade: Option<Side>,
    ) -> Option<Signal> {
        self(bar, indicators, open_trade)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRule {
    /// Fast EMA above slow EMA with RSI above 50.
    Trend,
    /// Oversold RSI above the slow EMA, overbought RSI below it.
    MeanReversion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleParams {
    pub entry_rule: EntryRule,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub allow_short: bool,
    /// Exit an open trade while the fast EMA sits on the wrong side of the slow EMA
    /// (below it for a long, above it for a short). Level based, not an edge trigger: a
    /// mean-reversion entry taken against the EMAs exits on the next bar close.
    pub exit_on_cross: bool,
    pub min_rvol: Option<f64>,
}

impl Default for RuleParams {
    fn default() -> Self {
        Self {
            entry_rule: EntryRule::Trend,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            allow_short: false,
            exit_on_cross: true,
            min_rvol: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmaRsiRules {
    params: RuleParams,
}

impl EmaRsiRules {
    pub fn new(params: RuleParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RuleParams {
        &self.params
    }

    fn entry(&self, bar: &Bar, indicators: &IndicatorValues) -> Option<Signal> {
        if let Some(min_rvol) = self.params.min_rvol {
            if indicators.get(RVOL)? < min_rvol {
                return None;
            }
        }
        let rsi = indicators.get(RSI)?;
        let slow = indicators.get(EMA_SLOW)?;

        let side = match self.params.entry_rule {
            EntryRule::Trend => {
                let fast = indicators.get(EMA_FAST)?;
                if fast > slow && rsi > 50.0 {
                    Some(Side::Long)
                } else if fast < slow && rsi < 50.0 {
                    Some(Side::Short)
                } else {
                    None
                }
            }
            EntryRule::MeanReversion => {
                if rsi < self.params.rsi_oversold && bar.close > slow {
                    Some(Side::Long)
                } else if rsi > self.params.rsi_overbought && bar.close < slow {
                    Some(Side::Short)
                } else {
                    None
                }
            }
        }?;

        if side == Side::Short && !self.params.allow_short {
            return None;
        }
        let reason = match self.params.entry_rule {
            EntryRule::Trend => format!("trend rsi={rsi:.2}"),
            EntryRule::MeanReversion => format!("mean_reversion rsi={rsi:.2}"),
        };
        Some(Signal::entry(side, reason))
    }

    fn exit(&self, indicators: &IndicatorValues, side: Side) -> Option<Signal> {
        if !self.params.exit_on_cross {
            return None;
        }
        let fast = indicators.get(EMA_FAST)?;
        let slow = indicators.get(EMA_SLOW)?;
        let against = match side {
            Side::Long => fast < slow,
            Side::Short => fast > slow,
        };
        against.then(|| Signal::exit(side, "fast ema against position"))
    }
}

impl SignalEvaluator for EmaRsiRules {
    fn evaluate(
        &self,
        bar: &Bar,
        indicators: &IndicatorValues,
        open_trade: Option<Side>,
    ) -> Option<Signal> {
        match open_trade {
            None => self.entry(bar, indicators),
            Some(side) => self.exit(indicators, side),
        }
    }
}
