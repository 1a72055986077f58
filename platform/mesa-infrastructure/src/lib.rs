pub mod artifacts;
pub mod journal;
pub mod market_data;
pub mod reporting;
