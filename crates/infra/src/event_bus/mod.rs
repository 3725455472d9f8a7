//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `courier-events`. This module provides
//! infrastructure-backed transports for [`MessageEnvelope`](courier_events::MessageEnvelope)s.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};
