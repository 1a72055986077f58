use crate::repositories::order_gateway::{BrokerEvent, BrokerSnapshot, GatewayError, OrderGateway};
use crate::value_objects::fill::Fill;
use crate::value_objects::order::{OrderId, OrderRequest, OrderStatus, OrderType};
use crate::value_objects::side::OrderAction;
use crate::value_objects::tick::Tick;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct PaperVenueConfig {
    /// 0 disables the cap.
    pub max_fill_qty_per_tick: u64,
    pub limit_fill_to_tick_size: bool,
    pub slippage_points: f64,
    /// Orders above this size are rejected. 0 disables the check.
    pub max_order_qty: u64,
}

impl Default for PaperVenueConfig {
    fn default() -> Self {
        Self {
            max_fill_qty_per_tick: 0,
            limit_fill_to_tick_size: false,
            slippage_points: 0.0,
            max_order_qty: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct WorkingOrder {
    request: OrderRequest,
    remaining: u64,
    triggered: bool,
}

/// Simulated broker. Owns the order id sequence and the net position; matches working
/// orders against observed ticks and queues the resulting broker events.
#[derive(Debug, Clone)]
pub struct PaperVenue {
    config: PaperVenueConfig,
    next_order_id: u64,
    last_tick: Option<Tick>,
    working: BTreeMap<OrderId, WorkingOrder>,
    position: i64,
    connected: bool,
    outbox: Vec<BrokerEvent>,
}

impl PaperVenue {
    pub fn new(config: PaperVenueConfig) -> Self {
        Self {
            config,
            next_order_id: 1,
            last_tick: None,
            working: BTreeMap::new(),
            position: 0,
            connected: true,
            outbox: Vec::new(),
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn working_orders(&self) -> Vec<OrderId> {
        self.working.keys().copied().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    fn allocate_id(&mut self) -> OrderId {
        let id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        id
    }

    fn status(&mut self, order_id: OrderId, status: OrderStatus, timestamp: i64, message: Option<String>) {
        self.outbox.push(BrokerEvent::OrderStatus {
            order_id,
            status,
            timestamp,
            message,
        });
    }

    fn match_against(&mut self, tick: &Tick) {
        let ids: Vec<OrderId> = self.working.keys().copied().collect();
        for order_id in ids {
            let Some(order) = self.working.get_mut(&order_id) else {
                continue;
            };
            let Some(price) = execution_price(order, tick, self.config.slippage_points) else {
                continue;
            };

            let mut qty = order.remaining;
            if self.config.max_fill_qty_per_tick > 0 {
                qty = qty.min(self.config.max_fill_qty_per_tick);
            }
            if self.config.limit_fill_to_tick_size {
                qty = qty.min(tick.size);
            }
            if qty == 0 {
                continue;
            }

            order.remaining -= qty;
            let action = order.request.action;
            let done = order.remaining == 0;
            self.position = self.position.saturating_add(action.signed_qty(qty));
            self.outbox.push(BrokerEvent::Fill(Fill {
                order_id,
                timestamp: tick.timestamp,
                price,
                qty,
            }));
            if done {
                self.working.remove(&order_id);
                self.status(order_id, OrderStatus::Filled, tick.timestamp, None);
            }
        }
    }
}

fn execution_price(order: &mut WorkingOrder, tick: &Tick, slippage: f64) -> Option<f64> {
    let buy = order.request.action == OrderAction::Buy;
    let slipped = if buy {
        tick.price + slippage
    } else {
        tick.price - slippage
    };
    match order.request.order_type {
        OrderType::Market => Some(slipped),
        OrderType::Limit => {
            let limit = order.request.price?;
            let crosses = if buy {
                tick.price <= limit
            } else {
                tick.price >= limit
            };
            crosses.then_some(limit)
        }
        OrderType::Stop => {
            let stop = order.request.price?;
            if !order.triggered {
                order.triggered = if buy {
                    tick.price >= stop
                } else {
                    tick.price <= stop
                };
            }
            order.triggered.then_some(slipped)
        }
    }
}

impl OrderGateway for PaperVenue {
    fn place_order(&mut self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        if !self.connected {
            return Err(GatewayError::Disconnected("paper venue offline".to_string()));
        }
        let order_id = self.allocate_id();
        let timestamp = self
            .last_tick
            .map(|t| t.timestamp.max(request.timestamp))
            .unwrap_or(request.timestamp);

        let too_large = self.config.max_order_qty > 0 && request.qty > self.config.max_order_qty;
        let missing_price = request.order_type != OrderType::Market && request.price.is_none();
        if request.qty == 0 || too_large || missing_price {
            let reason = if missing_price {
                "price required for non-market order".to_string()
            } else {
                format!("quantity {} outside venue limits", request.qty)
            };
            self.status(order_id, OrderStatus::Rejected, timestamp, Some(reason));
            return Ok(order_id);
        }

        self.working.insert(
            order_id,
            WorkingOrder {
                request: request.clone(),
                remaining: request.qty,
                triggered: false,
            },
        );
        self.status(order_id, OrderStatus::Submitted, timestamp, None);
        if let Some(tick) = self.last_tick {
            self.match_against(&tick);
        }
        Ok(order_id)
    }

    fn cancel_order(&mut self, order_id: OrderId) -> Result<(), GatewayError> {
        if !self.connected {
            return Err(GatewayError::Disconnected("paper venue offline".to_string()));
        }
        if self.working.remove(&order_id).is_none() {
            return Err(GatewayError::Rejected(format!("order {order_id} is not working")));
        }
        let timestamp = self.last_tick.map(|t| t.timestamp).unwrap_or_default();
        self.status(order_id, OrderStatus::Canceled, timestamp, None);
        Ok(())
    }

    fn request_reconciliation(&mut self, timestamp: i64) -> Result<(), GatewayError> {
        if !self.connected {
            return Err(GatewayError::Disconnected("paper venue offline".to_string()));
        }
        self.outbox.push(BrokerEvent::Snapshot(BrokerSnapshot {
            timestamp,
            net_position: self.position,
            working_orders: self.working_orders(),
        }));
        Ok(())
    }

    fn observe_tick(&mut self, tick: &Tick) {
        self.last_tick = Some(*tick);
        if self.connected {
            self.match_against(tick);
        }
    }

    fn drain_events(&mut self) -> Vec<BrokerEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}
