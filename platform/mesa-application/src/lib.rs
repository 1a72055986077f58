pub mod config;
pub mod engine;
pub mod live;
pub mod replay;
pub mod reporting;
pub mod shared;
pub mod validation;
