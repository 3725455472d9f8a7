use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::EventId;

/// Envelope for an integration event on its way between modules.
///
/// This is what the outbox hands to consumers, what travels over the bus and what
/// the receiving inbox persists.
///
/// Notes:
/// - `id` is the event id and the deduplication key on the consumer side.
/// - `payload` is the JSON-serialized event; its shape is owned by the event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    id: EventId,
    event_type: String,
    payload: JsonValue,
    occurred_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(
        id: EventId,
        event_type: impl Into<String>,
        payload: JsonValue,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload,
            occurred_at,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Deserialize the payload into a typed event.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }
}
