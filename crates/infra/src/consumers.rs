//! Built-in consumers for outbox processors.

use std::sync::Arc;

use async_trait::async_trait;

use courier_events::{Consumption, EventBus, HandlerError, MessageConsumer, MessageEnvelope};

use crate::inbox::{InboxWriter, Receipt};
use crate::store::MessageStore;

/// Publishes outbox messages to an [`EventBus`].
///
/// Usually registered with `register_for_all` so every integration event leaves the
/// module. A failed publish, including one that reached no subscriber, is transient;
/// once the ledger records the publish, the message is not published again by this
/// consumer.
pub struct BusPublisher<B> {
    name: String,
    bus: Arc<B>,
}

impl<B> BusPublisher<B> {
    pub const DEFAULT_NAME: &'static str = "bus.publish";

    pub fn new(bus: Arc<B>) -> Self {
        Self::named(Self::DEFAULT_NAME, bus)
    }

    pub fn named(name: impl Into<String>, bus: Arc<B>) -> Self {
        Self { name: name.into(), bus }
    }
}

#[async_trait]
impl<B, Tx> MessageConsumer<Tx> for BusPublisher<B>
where
    B: EventBus<MessageEnvelope> + 'static,
    Tx: Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, message: &MessageEnvelope, _tx: &mut Tx) -> Result<Consumption, HandlerError> {
        self.bus
            .publish(message.clone())
            .map_err(|e| HandlerError::transient(format!("publish failed: {e}")))?;
        Ok(Consumption::Applied)
    }
}

/// Delivers outbox messages straight into another module's inbox.
///
/// For deployments where both modules share a process and no bus sits in between.
/// The inbox write is its own transaction; retries after a lost ledger write are
/// absorbed by the inbox's id deduplication.
pub struct InboxForwarder<S: MessageStore> {
    name: String,
    writer: InboxWriter<S>,
}

impl<S: MessageStore> InboxForwarder<S> {
    pub fn new(writer: InboxWriter<S>) -> Self {
        let name = format!("inbox.{}", writer.table().module());
        Self { name, writer }
    }
}

#[async_trait]
impl<S, Tx> MessageConsumer<Tx> for InboxForwarder<S>
where
    S: MessageStore,
    Tx: Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, message: &MessageEnvelope, _tx: &mut Tx) -> Result<Consumption, HandlerError> {
        match self.writer.receive(message).await? {
            Receipt::Accepted | Receipt::Duplicate => Ok(Consumption::Applied),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use courier_core::{EventId, ModuleName};
    use courier_events::InMemoryEventBus;

    use super::*;
    use crate::store::{InMemoryMessageStore, InMemoryTransaction, MessageStore, MessageTable};

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(EventId::new(), "orders.order_placed", json!({ "n": 1 }), Utc::now())
    }

    #[tokio::test]
    async fn publisher_forwards_the_envelope() {
        let bus = Arc::new(InMemoryEventBus::<MessageEnvelope>::new());
        let mut subscription = bus.subscribe();
        let publisher = BusPublisher::new(bus.clone());

        let store = InMemoryMessageStore::new();
        let mut tx: InMemoryTransaction = store.begin().await.unwrap();
        let message = envelope();
        let outcome = publisher.consume(&message, &mut tx).await.unwrap();

        assert_eq!(outcome, Consumption::Applied);
        assert_eq!(subscription.try_recv().unwrap(), message);
        assert_eq!(MessageConsumer::<InMemoryTransaction>::name(&publisher), "bus.publish");
    }

    #[tokio::test]
    async fn publishing_to_nobody_is_transient() {
        let bus = Arc::new(InMemoryEventBus::<MessageEnvelope>::new());
        let publisher = BusPublisher::new(bus);

        let store = InMemoryMessageStore::new();
        let mut tx: InMemoryTransaction = store.begin().await.unwrap();
        let err = publisher.consume(&envelope(), &mut tx).await.unwrap_err();

        assert!(matches!(err, HandlerError::Transient(reason) if reason.contains("no live subscriber")));
    }

    #[tokio::test]
    async fn forwarder_writes_into_the_target_inbox_once() {
        let target = Arc::new(InMemoryMessageStore::new());
        let inbox = MessageTable::inbox(ModuleName::new("shipping").unwrap());
        let forwarder = InboxForwarder::new(InboxWriter::new(target.clone(), inbox.clone()));
        assert_eq!(MessageConsumer::<InMemoryTransaction>::name(&forwarder), "inbox.shipping");

        let source = InMemoryMessageStore::new();
        let message = envelope();
        for _ in 0..2 {
            let mut tx: InMemoryTransaction = source.begin().await.unwrap();
            assert_eq!(forwarder.consume(&message, &mut tx).await.unwrap(), Consumption::Applied);
        }

        let received = target.messages(&inbox).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, message.id());
    }
}
