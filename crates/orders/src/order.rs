use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::{AggregateId, AggregateRoot, DomainError, EventId};
use courier_events::{EventCollector, EventError, RaisesEvents};

use crate::events::{OrderCancelled, OrderPlaced, OrderStatusChanged};

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new() -> Self {
        Self(AggregateId::new())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    Placed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Event(#[from] EventError),
}

/// Aggregate root: Order.
///
/// Serializes to the document persisted by the unit of work; raised events are not
/// part of the persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    customer: String,
    total_cents: u64,
    status: OrderStatus,
    version: u64,
    #[serde(skip)]
    events: EventCollector,
}

impl Order {
    pub fn draft(id: OrderId, customer: impl Into<String>, total_cents: u64) -> Result<Self, OrderError> {
        let customer = customer.into();
        if customer.trim().is_empty() {
            return Err(DomainError::validation("customer must not be empty").into());
        }
        if total_cents == 0 {
            return Err(DomainError::validation("order total must be positive").into());
        }

        Ok(Self {
            id,
            customer,
            total_cents,
            status: OrderStatus::Draft,
            version: 0,
            events: EventCollector::new(),
        })
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn customer(&self) -> &str {
        &self.customer
    }

    pub fn total_cents(&self) -> u64 {
        self.total_cents
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Draft → Placed. Raises `OrderStatusChanged` and `OrderPlaced`.
    ///
    /// Returns the id of the `OrderPlaced` integration event.
    pub fn place(&mut self, now: DateTime<Utc>) -> Result<EventId, OrderError> {
        if self.status != OrderStatus::Draft {
            return Err(DomainError::invariant(format!(
                "order {} cannot be placed from {:?}",
                self.id, self.status
            ))
            .into());
        }

        self.transition(OrderStatus::Placed, now)?;
        let placed = OrderPlaced {
            event_id: EventId::new(),
            order_id: self.id,
            customer: self.customer.clone(),
            total_cents: self.total_cents,
            occurred_at: now,
        };
        Ok(self.events.raise(&placed)?)
    }

    /// Draft|Placed → Cancelled. Only a placed order announces the cancellation to
    /// other modules.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), OrderError> {
        let was = self.status;
        if was == OrderStatus::Cancelled {
            return Err(DomainError::conflict(format!("order {} is already cancelled", self.id)).into());
        }

        self.transition(OrderStatus::Cancelled, now)?;
        if was == OrderStatus::Placed {
            self.events.raise(&OrderCancelled {
                event_id: EventId::new(),
                order_id: self.id,
                reason: reason.into(),
                occurred_at: now,
            })?;
        }
        Ok(())
    }

    fn transition(&mut self, to: OrderStatus, now: DateTime<Utc>) -> Result<(), OrderError> {
        let from = self.status;
        self.status = to;
        self.version += 1;
        self.events.raise(&OrderStatusChanged {
            event_id: EventId::new(),
            order_id: self.id,
            from,
            to,
            occurred_at: now,
        })?;
        Ok(())
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl RaisesEvents for Order {
    fn events(&self) -> &EventCollector {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventCollector {
        &mut self.events
    }
}
