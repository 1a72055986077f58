use crate::value_objects::order::OrderId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub timestamp: i64,
    pub price: f64,
    pub qty: u64,
}
