use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use courier_core::EventId;

use crate::envelope::MessageEnvelope;

/// Visibility of an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    /// Visible only inside the module that raised it. Dispatched in-process inside
    /// the business transaction and never persisted on its own.
    Domain,
    /// Crosses module boundaries. Always persisted to the outbox.
    Integration,
}

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **identified** (the id is the deduplication key downstream)
/// - **scoped** (only integration events leave the module)
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "orders.order_placed").
    const EVENT_TYPE: &'static str;

    /// Events are domain-local unless explicitly marked for cross-module delivery.
    const SCOPE: EventScope = EventScope::Domain;

    fn event_id(&self) -> EventId;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("failed to serialize event '{event_type}': {source}")]
    Serialize {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable record of a raised event, serialized at raise time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct EventRecord {
    id: EventId,
    occurred_at: DateTime<Utc>,
    event_type: String,
    scope: EventScope,
    payload: JsonValue,
}

impl EventRecord {
    pub fn from_event<E: Event>(event: &E) -> Result<Self, EventError> {
        let payload = serde_json::to_value(event).map_err(|source| EventError::Serialize {
            event_type: E::EVENT_TYPE,
            source,
        })?;

        Ok(Self {
            id: event.event_id(),
            occurred_at: event.occurred_at(),
            event_type: E::EVENT_TYPE.to_string(),
            scope: E::SCOPE,
            payload,
        })
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn scope(&self) -> EventScope {
        self.scope
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn is_integration(&self) -> bool {
        self.scope == EventScope::Integration
    }

    pub fn to_envelope(&self) -> MessageEnvelope {
        MessageEnvelope::new(
            self.id,
            self.event_type.clone(),
            self.payload.clone(),
            self.occurred_at,
        )
    }
}
