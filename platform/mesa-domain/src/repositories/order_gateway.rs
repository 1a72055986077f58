use crate::value_objects::fill::Fill;
use crate::value_objects::order::{OrderId, OrderRequest, OrderStatus};
use crate::value_objects::tick::Tick;
use serde::{Deserialize, Serialize};

/// Events a broker adapter delivers back to the trade state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    Fill(Fill),
    OrderStatus {
        order_id: OrderId,
        status: OrderStatus,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Snapshot(BrokerSnapshot),
}

/// Broker-side view used to reconcile after a disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub timestamp: i64,
    pub net_position: i64,
    pub working_orders: Vec<OrderId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    Disconnected(String),
    Rejected(String),
    Unsupported(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Disconnected(msg) => write!(f, "gateway disconnected: {msg}"),
            GatewayError::Rejected(msg) => write!(f, "order rejected by gateway: {msg}"),
            GatewayError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

/// Order placement capability. Calls are fire-and-forget: the adapter returns the id it
/// allocated from its own sequence and reports fills and status changes later as
/// [`BrokerEvent`]s.
pub trait OrderGateway {
    fn place_order(&mut self, request: &OrderRequest) -> Result<OrderId, GatewayError>;

    fn cancel_order(&mut self, order_id: OrderId) -> Result<(), GatewayError>;

    /// Asks the broker for its position and working orders; answered by a
    /// [`BrokerEvent::Snapshot`].
    fn request_reconciliation(&mut self, timestamp: i64) -> Result<(), GatewayError>;

    /// Market data hook for simulated venues.
    fn observe_tick(&mut self, _tick: &Tick) {}

    /// Events produced synchronously by the adapter, delivered after the event being processed.
    /// Adapters backed by a real connection push their events onto the engine queue instead.
    fn drain_events(&mut self) -> Vec<BrokerEvent> {
        Vec::new()
    }

    fn disconnect(&mut self) {}
}
