pub mod bracket;
pub mod fill_tracker;
pub mod indicators;
pub mod paper_venue;
pub mod realtime_bar;
pub mod signals;
pub mod trade_machine;
