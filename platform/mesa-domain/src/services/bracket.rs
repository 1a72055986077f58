use crate::value_objects::side::Side;

/// Market facts available when an entry fills.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarketContext {
    pub timestamp: i64,
    pub last_close: Option<f64>,
    pub atr: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bracket {
    pub stop: f64,
    pub target: f64,
}

/// Pure stop/target computation injected into the trade state machine.
pub trait BracketPolicy {
    fn compute(&self, entry_price: f64, side: Side, ctx: &MarketContext) -> Bracket;
}

impl<F> BracketPolicy for F
where
    F: Fn(f64, Side, &MarketContext) -> Bracket,
{
    fn compute(&self, entry_price: f64, side: Side, ctx: &MarketContext) -> Bracket {
        self(entry_price, side, ctx)
    }
}

fn offsets(entry_price: f64, side: Side, stop_distance: f64, target_distance: f64) -> Bracket {
    let sign = side.sign();
    Bracket {
        stop: entry_price - sign * stop_distance,
        target: entry_price + sign * target_distance,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentBracket {
    pub stop_pct: f64,
    pub target_pct: f64,
}

impl BracketPolicy for PercentBracket {
    fn compute(&self, entry_price: f64, side: Side, _ctx: &MarketContext) -> Bracket {
        offsets(
            entry_price,
            side,
            entry_price * self.stop_pct,
            entry_price * self.target_pct,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtrBracket {
    pub stop_mult: f64,
    pub target_mult: f64,
    /// Used while the ATR is still warming up.
    pub fallback_atr: f64,
}

impl BracketPolicy for AtrBracket {
    fn compute(&self, entry_price: f64, side: Side, ctx: &MarketContext) -> Bracket {
        let atr = ctx
            .atr
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(self.fallback_atr);
        offsets(entry_price, side, self.stop_mult * atr, self.target_mult * atr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointsBracket {
    pub stop_points: f64,
    pub target_points: f64,
}

impl BracketPolicy for PointsBracket {
    fn compute(&self, entry_price: f64, side: Side, _ctx: &MarketContext) -> Bracket {
        offsets(entry_price, side, self.stop_points, self.target_points)
    }
}

/// Stop that follows the close by a fixed offset and never loosens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStop {
    pub offset: f64,
}

impl TrailingStop {
    pub fn ratchet(&self, side: Side, current_stop: f64, close: f64) -> Option<f64> {
        let candidate = close - side.sign() * self.offset;
        let tighter = match side {
            Side::Long => candidate > current_stop,
            Side::Short => candidate < current_stop,
        };
        tighter.then_some(candidate)
    }
}
