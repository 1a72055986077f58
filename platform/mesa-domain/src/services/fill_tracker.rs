use crate::value_objects::fill::Fill;
use crate::value_objects::order::OrderId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillError {
    UnknownOrder(OrderId),
}

impl std::fmt::Display for FillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FillError::UnknownOrder(id) => write!(f, "fill for unknown order {id}"),
        }
    }
}

/// Accumulation state of one order after a fill was applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillProgress {
    pub order_id: OrderId,
    pub requested_qty: u64,
    pub filled_qty: u64,
    pub average_price: f64,
    /// True only for the fill that first reached the requested quantity.
    pub completed_now: bool,
    /// Quantity reported beyond the requested amount, kept rather than truncated.
    pub overfill: u64,
}

#[derive(Debug, Clone, Default)]
struct OrderFills {
    requested_qty: u64,
    fills: Vec<Fill>,
    filled_qty: u64,
    notional: f64,
}

impl OrderFills {
    fn average_price(&self) -> Option<f64> {
        if self.filled_qty == 0 {
            return None;
        }
        Some(self.notional / self.filled_qty as f64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FillTracker {
    orders: BTreeMap<OrderId, OrderFills>,
}

impl FillTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, order_id: OrderId, requested_qty: u64) {
        self.orders.insert(
            order_id,
            OrderFills {
                requested_qty,
                ..OrderFills::default()
            },
        );
    }

    pub fn is_registered(&self, order_id: OrderId) -> bool {
        self.orders.contains_key(&order_id)
    }

    pub fn add_fill(&mut self, fill: Fill) -> Result<FillProgress, FillError> {
        let entry = self
            .orders
            .get_mut(&fill.order_id)
            .ok_or(FillError::UnknownOrder(fill.order_id))?;

        let was_complete = entry.filled_qty >= entry.requested_qty;
        entry.filled_qty = entry.filled_qty.saturating_add(fill.qty);
        entry.notional += fill.price * fill.qty as f64;
        entry.fills.push(fill);

        Ok(FillProgress {
            order_id: fill.order_id,
            requested_qty: entry.requested_qty,
            filled_qty: entry.filled_qty,
            average_price: entry.average_price().unwrap_or(fill.price),
            completed_now: !was_complete && entry.filled_qty >= entry.requested_qty,
            overfill: entry.filled_qty.saturating_sub(entry.requested_qty),
        })
    }

    pub fn is_complete(&self, order_id: OrderId, requested_qty: u64) -> Result<bool, FillError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.filled_qty >= requested_qty)
            .ok_or(FillError::UnknownOrder(order_id))
    }

    /// Size-weighted mean of every fill seen for the order; `None` before the first fill.
    pub fn average_price(&self, order_id: OrderId) -> Result<Option<f64>, FillError> {
        self.orders
            .get(&order_id)
            .map(OrderFills::average_price)
            .ok_or(FillError::UnknownOrder(order_id))
    }

    pub fn filled_qty(&self, order_id: OrderId) -> Result<u64, FillError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.filled_qty)
            .ok_or(FillError::UnknownOrder(order_id))
    }

    pub fn fills(&self, order_id: OrderId) -> Result<&[Fill], FillError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.fills.as_slice())
            .ok_or(FillError::UnknownOrder(order_id))
    }

    pub fn forget(&mut self, order_id: OrderId) {
        self.orders.remove(&order_id);
    }
}
