use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::EventId;
use courier_events::{Event, EventScope};

use crate::order::{OrderId, OrderStatus};

/// Integration event: an order was placed and downstream modules may act on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub event_id: EventId,
    pub order_id: OrderId,
    pub customer: String,
    pub total_cents: u64,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OrderPlaced {
    const EVENT_TYPE: &'static str = "orders.order_placed";
    const SCOPE: EventScope = EventScope::Integration;

    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Integration event: a placed order was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub event_id: EventId,
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OrderCancelled {
    const EVENT_TYPE: &'static str = "orders.order_cancelled";
    const SCOPE: EventScope = EventScope::Integration;

    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Domain event: the order changed status. Never leaves the orders module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub event_id: EventId,
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OrderStatusChanged {
    const EVENT_TYPE: &'static str = "orders.order_status_changed";

    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
