use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn entry_action(self) -> OrderAction {
        match self {
            Side::Long => OrderAction::Buy,
            Side::Short => OrderAction::Sell,
        }
    }

    pub fn exit_action(self) -> OrderAction {
        self.opposite().entry_action()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    /// Signed contract delta applied to a net position.
    pub fn signed_qty(self, qty: u64) -> i64 {
        let qty = i64::try_from(qty).unwrap_or(i64::MAX);
        match self {
            OrderAction::Buy => qty,
            OrderAction::Sell => -qty,
        }
    }
}
