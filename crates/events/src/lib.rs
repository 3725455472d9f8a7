//! Domain & integration event mechanics.
//!
//! Nothing in this crate performs IO: it defines what an event is, how aggregates
//! collect them, how they travel between modules and how handlers are registered.
//! Durable storage and the processing loops live in `courier-infra`.

pub mod bus;
pub mod collector;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod registry;

pub use bus::{EventBus, Subscription};
pub use collector::{EventCollector, RaisesEvents};
pub use envelope::MessageEnvelope;
pub use event::{Event, EventError, EventRecord, EventScope};
pub use handler::{Consumption, EventHandler, HandlerError, MessageConsumer, TypedConsumer};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use registry::{DomainEventDispatcher, HandlerRegistry, RegistryError};
