//! Explicit, statically-typed handler registration.
//!
//! A [`HandlerRegistry`] maps integration event types to an ordered list of named
//! consumers and is what outbox/inbox processors resolve against. A
//! [`DomainEventDispatcher`] holds handlers for domain-local events, invoked inside the
//! business transaction by the unit of work.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::event::{Event, EventRecord, EventScope};
use crate::handler::{EventHandler, HandlerError, MessageConsumer, TypedConsumer};

type PayloadCheck = fn(&JsonValue) -> Result<(), serde_json::Error>;

fn decodes_as<E: Event>(payload: &JsonValue) -> Result<(), serde_json::Error> {
    E::deserialize(payload).map(|_| ())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("consumer name '{0}' is already registered")]
    DuplicateName(String),

    #[error("event type '{event_type}' has scope {actual:?}, this registry accepts {expected:?}")]
    ScopeMismatch {
        event_type: &'static str,
        expected: EventScope,
        actual: EventScope,
    },

    #[error("consumer name must not be empty")]
    EmptyName,
}

/// Event type → ordered named consumers, plus wildcard consumers that see every type.
pub struct HandlerRegistry<Tx> {
    scope: EventScope,
    by_type: HashMap<String, Vec<Arc<dyn MessageConsumer<Tx>>>>,
    checks: HashMap<String, PayloadCheck>,
    wildcard: Vec<Arc<dyn MessageConsumer<Tx>>>,
    names: HashSet<String>,
}

impl<Tx: Send + 'static> HandlerRegistry<Tx> {
    /// Registry for integration events (outbox/inbox processing).
    pub fn new() -> Self {
        Self::with_scope(EventScope::Integration)
    }

    fn with_scope(scope: EventScope) -> Self {
        Self {
            scope,
            by_type: HashMap::new(),
            checks: HashMap::new(),
            wildcard: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Register a typed handler for `E`.
    ///
    /// The payload of every `E::EVENT_TYPE` message must decode as `E`; a message that
    /// doesn't is poison regardless of which consumers are still pending.
    pub fn register<E, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        E: Event,
        H: EventHandler<E, Tx> + 'static,
    {
        if E::SCOPE != self.scope {
            return Err(RegistryError::ScopeMismatch {
                event_type: E::EVENT_TYPE,
                expected: self.scope,
                actual: E::SCOPE,
            });
        }

        let consumer: Arc<dyn MessageConsumer<Tx>> = Arc::new(TypedConsumer::<E, H>::new(handler));
        self.claim_name(consumer.name())?;
        self.checks.insert(E::EVENT_TYPE.to_string(), decodes_as::<E>);
        self.by_type
            .entry(E::EVENT_TYPE.to_string())
            .or_default()
            .push(consumer);
        Ok(self)
    }

    /// Register an untyped consumer for one event type.
    ///
    /// Pass the bare consumer; processors install the ledger and logging middleware.
    pub fn register_consumer(
        &mut self,
        event_type: impl Into<String>,
        consumer: Arc<dyn MessageConsumer<Tx>>,
    ) -> Result<&mut Self, RegistryError> {
        self.claim_name(consumer.name())?;
        self.by_type.entry(event_type.into()).or_default().push(consumer);
        Ok(self)
    }

    /// Register a consumer for every event type (e.g. the bus publisher).
    pub fn register_for_all(
        &mut self,
        consumer: Arc<dyn MessageConsumer<Tx>>,
    ) -> Result<&mut Self, RegistryError> {
        self.claim_name(consumer.name())?;
        self.wildcard.push(consumer);
        Ok(self)
    }

    fn claim_name(&mut self, name: &str) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if !self.names.insert(name.to_string()) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Consumers for `event_type` in registration order: type-specific first, then
    /// wildcard.
    pub fn resolve(&self, event_type: &str) -> Vec<Arc<dyn MessageConsumer<Tx>>> {
        self.by_type
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(self.wildcard.iter())
            .cloned()
            .collect()
    }

    /// Validate a payload against the typed registration for its event type.
    ///
    /// Types only known to untyped or wildcard consumers pass unchecked.
    pub fn check_payload(&self, event_type: &str, payload: &JsonValue) -> Result<(), serde_json::Error> {
        match self.checks.get(event_type) {
            Some(check) => check(payload),
            None => Ok(()),
        }
    }

    pub fn is_known(&self, event_type: &str) -> bool {
        self.by_type.contains_key(event_type) || !self.wildcard.is_empty()
    }

    /// Wrap every registered consumer with `layer`, preserving order.
    ///
    /// Used to install middleware (idempotency, logging) once registration is done.
    pub fn layered<F>(self, mut layer: F) -> Self
    where
        F: FnMut(Arc<dyn MessageConsumer<Tx>>) -> Arc<dyn MessageConsumer<Tx>>,
    {
        let by_type = self
            .by_type
            .into_iter()
            .map(|(ty, consumers)| (ty, consumers.into_iter().map(&mut layer).collect()))
            .collect();
        let wildcard = self.wildcard.into_iter().map(&mut layer).collect();

        Self {
            scope: self.scope,
            by_type,
            checks: self.checks,
            wildcard,
            names: self.names,
        }
    }
}

impl<Tx: Send + 'static> Default for HandlerRegistry<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process dispatcher for domain-local events.
///
/// Handlers run inside the business transaction; the first failure aborts the
/// dispatch and, with it, the unit of work.
pub struct DomainEventDispatcher<Tx> {
    handlers: HandlerRegistry<Tx>,
}

impl<Tx: Send + 'static> DomainEventDispatcher<Tx> {
    pub fn new() -> Self {
        Self {
            handlers: HandlerRegistry::with_scope(EventScope::Domain),
        }
    }

    pub fn register<E, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        E: Event,
        H: EventHandler<E, Tx> + 'static,
    {
        self.handlers.register::<E, H>(handler)?;
        Ok(self)
    }

    /// Run every handler registered for the record's type. Returns how many ran.
    pub async fn dispatch(&self, record: &EventRecord, tx: &mut Tx) -> Result<usize, HandlerError> {
        let envelope = record.to_envelope();
        let consumers = self.handlers.resolve(record.event_type());
        for consumer in &consumers {
            consumer.consume(&envelope, tx).await?;
            tracing::debug!(
                event_type = record.event_type(),
                event_id = %record.id(),
                handler = consumer.name(),
                "domain event handled"
            );
        }
        Ok(consumers.len())
    }
}

impl<Tx: Send + 'static> Default for DomainEventDispatcher<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use courier_core::EventId;

    use super::*;
    use crate::envelope::MessageEnvelope;
    use crate::handler::Consumption;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Shipped {
        id: EventId,
        at: DateTime<Utc>,
        parcel: String,
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

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Renamed {
        id: EventId,
        at: DateTime<Utc>,
    }

    impl Event for Renamed {
        const EVENT_TYPE: &'static str = "test.renamed";

        fn event_id(&self) -> EventId {
            self.id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    struct Named(&'static str);

    #[async_trait]
    impl EventHandler<Shipped, Vec<String>> for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _event: Shipped, tx: &mut Vec<String>) -> Result<(), HandlerError> {
            tx.push(self.0.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl EventHandler<Renamed, Vec<String>> for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _event: Renamed, tx: &mut Vec<String>) -> Result<(), HandlerError> {
            if self.0 == "reject" {
                return Err(HandlerError::transient("nope"));
            }
            tx.push(self.0.to_string());
            Ok(())
        }
    }

    struct Everything;

    #[async_trait]
    impl MessageConsumer<Vec<String>> for Everything {
        fn name(&self) -> &str {
            "everything"
        }

        async fn consume(
            &self,
            _message: &MessageEnvelope,
            tx: &mut Vec<String>,
        ) -> Result<Consumption, HandlerError> {
            tx.push("everything".into());
            Ok(Consumption::Applied)
        }
    }

    fn names(consumers: &[Arc<dyn MessageConsumer<Vec<String>>>]) -> Vec<String> {
        consumers.iter().map(|c| c.name().to_string()).collect()
    }

    #[test]
    fn resolves_typed_consumers_before_wildcards() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry.register_for_all(Arc::new(Everything)).unwrap();
        registry.register::<Shipped, _>(Named("a")).unwrap();
        registry.register::<Shipped, _>(Named("b")).unwrap();

        assert_eq!(names(&registry.resolve("test.shipped")), vec!["a", "b", "everything"]);
        assert_eq!(names(&registry.resolve("other.type")), vec!["everything"]);
    }

    #[test]
    fn rejects_duplicate_names_and_wrong_scope() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry.register::<Shipped, _>(Named("a")).unwrap();

        assert_eq!(
            registry.register::<Shipped, _>(Named("a")).err(),
            Some(RegistryError::DuplicateName("a".into()))
        );
        assert!(matches!(
            registry.register::<Renamed, _>(Named("c")),
            Err(RegistryError::ScopeMismatch { .. })
        ));
        assert_eq!(
            registry.register::<Shipped, _>(Named(" ")).err(),
            Some(RegistryError::EmptyName)
        );
    }

    #[test]
    fn payload_checks_follow_typed_registrations() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        assert!(!registry.is_known("test.shipped"));
        registry.register::<Shipped, _>(Named("a")).unwrap();

        let good = serde_json::json!({ "id": EventId::new(), "at": Utc::now(), "parcel": "p1" });
        assert!(registry.check_payload("test.shipped", &good).is_ok());
        assert!(registry.check_payload("test.shipped", &serde_json::json!([1, 2])).is_err());
        assert!(registry.check_payload("untyped", &serde_json::json!(null)).is_ok());
        assert!(registry.is_known("test.shipped"));
    }

    #[tokio::test]
    async fn domain_dispatch_runs_in_order_and_stops_on_failure() {
        let mut dispatcher = DomainEventDispatcher::<Vec<String>>::new();
        assert!(dispatcher.register::<Shipped, _>(Named("x")).is_err());
        dispatcher.register::<Renamed, _>(Named("first")).unwrap();
        dispatcher.register::<Renamed, _>(Named("second")).unwrap();

        let record = EventRecord::from_event(&Renamed {
            id: EventId::new(),
            at: Utc::now(),
        })
        .unwrap();

        let mut tx = Vec::new();
        assert_eq!(dispatcher.dispatch(&record, &mut tx).await.unwrap(), 2);
        assert_eq!(tx, vec!["first", "second"]);

        let mut failing = DomainEventDispatcher::<Vec<String>>::new();
        failing.register::<Renamed, _>(Named("reject")).unwrap();
        failing.register::<Renamed, _>(Named("after")).unwrap();
        let mut tx = Vec::new();
        assert!(failing.dispatch(&record, &mut tx).await.is_err());
        assert!(tx.is_empty());
    }
}
