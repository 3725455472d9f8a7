//! Aggregate event collection.
//!
//! An aggregate records what happened during a business operation by raising events
//! into its own collector. Nothing leaves memory until the unit of work drains the
//! collector and commits; one aggregate instance belongs to exactly one in-flight
//! operation, so the collector is a plain owned `Vec`.

use courier_core::EventId;

use crate::event::{Event, EventError, EventRecord};

/// Ordered, aggregate-private collection of raised events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCollector {
    events: Vec<EventRecord>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. Returns its id.
    pub fn raise<E: Event>(&mut self, event: &E) -> Result<EventId, EventError> {
        let record = EventRecord::from_event(event)?;
        let id = record.id();
        self.events.push(record);
        Ok(id)
    }

    /// Take every collected event in raise order, leaving the collector empty.
    pub fn drain_events(&mut self) -> Vec<EventRecord> {
        std::mem::take(&mut self.events)
    }

    pub fn pending(&self) -> &[EventRecord] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Implemented by aggregates that raise events.
pub trait RaisesEvents {
    fn events(&self) -> &EventCollector;

    fn events_mut(&mut self) -> &mut EventCollector;

    fn drain_events(&mut self) -> Vec<EventRecord> {
        self.events_mut().drain_events()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::EventScope;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ticked {
        id: EventId,
        n: u32,
        at: DateTime<Utc>,
    }

    impl Event for Ticked {
        const EVENT_TYPE: &'static str = "test.ticked";

        fn event_id(&self) -> EventId {
            self.id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Shipped {
        id: EventId,
        at: DateTime<Utc>,
    }

    impl Event for Shipped {
        const EVENT_TYPE: &'static str = "test.shipped";
        const SCOPE: EventScope = EventScope::Integration;

        fn event_id(&self) -> EventId {
            self.id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn ticked(n: u32) -> Ticked {
        Ticked {
            id: EventId::new(),
            n,
            at: Utc::now(),
        }
    }

    #[test]
    fn raise_records_type_scope_and_payload() {
        let mut collector = EventCollector::new();
        let event = ticked(7);
        let id = collector.raise(&event).unwrap();

        let record = &collector.pending()[0];
        assert_eq!(record.id(), id);
        assert_eq!(record.event_type(), "test.ticked");
        assert_eq!(record.scope(), EventScope::Domain);
        assert_eq!(record.payload()["n"], 7);

        let shipped = Shipped {
            id: EventId::new(),
            at: Utc::now(),
        };
        collector.raise(&shipped).unwrap();
        assert!(collector.pending()[1].is_integration());
    }

    #[test]
    fn drain_clears_the_collector() {
        let mut collector = EventCollector::new();
        collector.raise(&ticked(1)).unwrap();
        assert_eq!(collector.drain_events().len(), 1);
        assert!(collector.is_empty());
        assert!(collector.drain_events().is_empty());
    }

    proptest! {
        #[test]
        fn drain_preserves_raise_order(ns in proptest::collection::vec(any::<u32>(), 0..32)) {
            let mut collector = EventCollector::new();
            let mut ids = Vec::new();
            for n in &ns {
                ids.push(collector.raise(&ticked(*n)).unwrap());
            }

            let drained = collector.drain_events();
            let drained_ids: Vec<_> = drained.iter().map(|r| r.id()).collect();
            let drained_ns: Vec<u32> = drained
                .iter()
                .map(|r| r.payload()["n"].as_u64().unwrap() as u32)
                .collect();

            prop_assert_eq!(drained_ids, ids);
            prop_assert_eq!(drained_ns, ns);
            prop_assert!(collector.is_empty());
        }
    }
}
