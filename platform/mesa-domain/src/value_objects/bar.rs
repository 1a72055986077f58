use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub period_start: i64,
    pub period_end: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub tick_count: u64,
}

impl Bar {
    pub fn opened_at(symbol: &str, period_start: i64, length_ms: i64, price: f64, size: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            period_start,
            period_end: period_start.saturating_add(length_ms),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
            tick_count: 1,
        }
    }

    pub fn fold(&mut self, price: f64, size: u64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume = self.volume.saturating_add(size);
        self.tick_count = self.tick_count.saturating_add(1);
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.period_start && timestamp < self.period_end
    }

    pub fn period_start_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.period_start)
    }
}
