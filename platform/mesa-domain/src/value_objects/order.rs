use crate::value_objects::side::OrderAction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-side order identifier, allocated by the gateway adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Submitted,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_dead(self) -> bool {
        matches!(self, OrderStatus::Canceled | OrderStatus::Rejected)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub action: OrderAction,
    pub qty: u64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub timestamp: i64,
}

impl OrderRequest {
    pub fn market(action: OrderAction, qty: u64, timestamp: i64) -> Self {
        Self {
            action,
            qty,
            order_type: OrderType::Market,
            price: None,
            timestamp,
        }
    }
}
