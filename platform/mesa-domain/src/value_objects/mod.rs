pub mod bar;
pub mod fill;
pub mod journal;
pub mod order;
pub mod side;
pub mod signal;
pub mod tick;
pub mod timeframe;
pub mod trade;
