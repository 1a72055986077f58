pub mod artifacts;
pub mod market_stream;
pub mod order_gateway;
pub mod trade_journal;
