use serde::{Deserialize, Serialize};

/// One trade print. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: i64,
    pub price: f64,
    pub size: u64,
}

impl Tick {
    pub fn new(timestamp: i64, price: f64, size: u64) -> Self {
        Self {
            timestamp,
            price,
            size,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.size >= 1
    }
}
