//! Consumer middleware: idempotency over the consumption ledger, and logging.
//!
//! Processors wrap every registered consumer as
//! `LoggingConsumer(IdempotentConsumer(consumer))` and run each invocation in its own
//! store transaction with [`consume_in_transaction`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use courier_events::{Consumption, HandlerError, MessageConsumer, MessageEnvelope};

use crate::store::{MessageStore, MessageTable, StoreError, StoreTransaction};

/// Applies the wrapped consumer at most once per message.
///
/// 1. A ledger entry for `(message id, consumer name)` → `AlreadyApplied`, the inner
///    consumer is not invoked.
/// 2. Otherwise the inner consumer runs against the same transaction.
/// 3. On success (whatever `Consumption` it reports) the ledger entry is recorded in
///    that transaction, so the effect and the entry commit together.
/// 4. On failure the error propagates and no entry is recorded.
///
/// A ledger conflict while recording surfaces as [`HandlerError::Duplicate`]; the
/// caller must roll the transaction back, discarding the duplicate effect.
pub struct IdempotentConsumer<Tx> {
    inner: Arc<dyn MessageConsumer<Tx>>,
    table: MessageTable,
}

impl<Tx> IdempotentConsumer<Tx> {
    pub fn new(inner: Arc<dyn MessageConsumer<Tx>>, table: MessageTable) -> Self {
        Self { inner, table }
    }
}

#[async_trait]
impl<Tx: StoreTransaction> MessageConsumer<Tx> for IdempotentConsumer<Tx> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn consume(&self, message: &MessageEnvelope, tx: &mut Tx) -> Result<Consumption, HandlerError> {
        let name = self.inner.name();

        if tx.has_consumed(&self.table, message.id(), name).await? {
            return Ok(Consumption::AlreadyApplied);
        }

        // An inner `AlreadyApplied` without a ledger entry is recorded like `Applied`.
        self.inner.consume(message, tx).await?;
        tx.record_consumer(&self.table, message.id(), name).await?;
        Ok(Consumption::Applied)
    }

    fn records_consumption(&self) -> bool {
        true
    }
}

/// Logs every invocation of the wrapped consumer.
pub struct LoggingConsumer<Tx> {
    inner: Arc<dyn MessageConsumer<Tx>>,
}

impl<Tx> LoggingConsumer<Tx> {
    pub fn new(inner: Arc<dyn MessageConsumer<Tx>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<Tx: Send + 'static> MessageConsumer<Tx> for LoggingConsumer<Tx> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn records_consumption(&self) -> bool {
        self.inner.records_consumption()
    }

    async fn consume(&self, message: &MessageEnvelope, tx: &mut Tx) -> Result<Consumption, HandlerError> {
        let started = Instant::now();
        let result = self.inner.consume(message, tx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(outcome) => debug!(
                consumer = self.inner.name(),
                message_id = %message.id(),
                event_type = message.event_type(),
                outcome = ?outcome,
                elapsed_ms,
                "consumer finished"
            ),
            Err(err) if err.is_duplicate() => debug!(
                consumer = self.inner.name(),
                message_id = %message.id(),
                "consumer lost ledger race"
            ),
            Err(err) => warn!(
                consumer = self.inner.name(),
                message_id = %message.id(),
                event_type = message.event_type(),
                error = %err,
                elapsed_ms,
                "consumer failed"
            ),
        }
        result
    }
}

/// Wrap `consumer` in the standard middleware chain for `table`.
///
/// A consumer that already records its own ledger entries is returned unchanged.
pub fn layered<Tx: StoreTransaction>(
    consumer: Arc<dyn MessageConsumer<Tx>>,
    table: &MessageTable,
) -> Arc<dyn MessageConsumer<Tx>> {
    if consumer.records_consumption() {
        return consumer;
    }
    let idempotent: Arc<dyn MessageConsumer<Tx>> = Arc::new(IdempotentConsumer::new(consumer, table.clone()));
    Arc::new(LoggingConsumer::new(idempotent))
}

/// Run one consumer invocation in a fresh transaction of `store`.
///
/// Commits on success and rolls back on failure. A ledger conflict (at record or at
/// commit time) means another invocation won: the effect is rolled back and the
/// result is `AlreadyApplied`. Exceeding `timeout` is a transient failure.
pub async fn consume_in_transaction<S: MessageStore>(
    store: &S,
    consumer: &dyn MessageConsumer<S::Tx>,
    message: &MessageEnvelope,
    timeout: Duration,
) -> Result<Consumption, HandlerError> {
    let mut tx = store.begin().await?;

    let result = match tokio::time::timeout(timeout, consumer.consume(message, &mut tx)).await {
        Ok(result) => result,
        Err(_) => Err(HandlerError::transient(format!(
            "consumer '{}' timed out after {}ms",
            consumer.name(),
            timeout.as_millis()
        ))),
    };

    match result {
        Ok(consumption) => match tx.commit().await {
            Ok(()) => Ok(consumption),
            Err(StoreError::DuplicateConsumer { .. }) => Ok(Consumption::AlreadyApplied),
            Err(err) => Err(err.into()),
        },
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(consumer = consumer.name(), error = %rollback_err, "rollback failed");
            }
            if err.is_duplicate() {
                Ok(Consumption::AlreadyApplied)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use courier_core::{EventId, ModuleName};

    use super::*;
    use crate::store::{InMemoryMessageStore, InMemoryTransaction};

    /// Increments a counter document and counts invocations.
    struct Counter {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Counter {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl MessageConsumer<InMemoryTransaction> for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn consume(
            &self,
            message: &MessageEnvelope,
            tx: &mut InMemoryTransaction,
        ) -> Result<Consumption, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HandlerError::transient("downstream unavailable"));
            }
            let key = message.id().to_string();
            let current = tx.get("effects", &key)?.and_then(|v| v.as_u64()).unwrap_or(0);
            tx.put("effects", &key, json!(current + 1));
            Ok(Consumption::Applied)
        }
    }

    fn table() -> MessageTable {
        MessageTable::inbox(ModuleName::new("shipping").unwrap())
    }

    fn message() -> MessageEnvelope {
        MessageEnvelope::new(EventId::new(), "orders.order_placed", json!({}), Utc::now())
    }

    fn effect(store: &InMemoryMessageStore, message: &MessageEnvelope) -> u64 {
        store
            .document("effects", &message.id().to_string())
            .unwrap()
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn second_invocation_is_skipped() {
        let store = InMemoryMessageStore::new();
        let counter = Counter::new(false);
        let wrapped: Arc<dyn MessageConsumer<InMemoryTransaction>> = layered(counter.clone(), &table());
        let message = message();

        let first = consume_in_transaction(&store, wrapped.as_ref(), &message, Duration::from_secs(1)).await;
        let second = consume_in_transaction(&store, wrapped.as_ref(), &message, Duration::from_secs(1)).await;

        assert_eq!(first, Ok(Consumption::Applied));
        assert_eq!(second, Ok(Consumption::AlreadyApplied));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(effect(&store, &message), 1);
        assert_eq!(store.consumers_of(&table(), message.id()).await.unwrap(), vec!["counter"]);
    }

    #[tokio::test]
    async fn failure_records_nothing() {
        let store = InMemoryMessageStore::new();
        let wrapped: Arc<dyn MessageConsumer<InMemoryTransaction>> = layered(Counter::new(true), &table());
        let message = message();

        let result = consume_in_transaction(&store, wrapped.as_ref(), &message, Duration::from_secs(1)).await;

        assert!(matches!(result, Err(HandlerError::Transient(_))));
        assert!(store.consumers_of(&table(), message.id()).await.unwrap().is_empty());
        assert_eq!(effect(&store, &message), 0);
    }

    #[tokio::test]
    async fn losing_the_ledger_race_rolls_back_the_effect() {
        let store = InMemoryMessageStore::new();
        let counter = Counter::new(false);
        let wrapped: IdempotentConsumer<InMemoryTransaction> = IdempotentConsumer::new(counter.clone(), table());
        let message = message();

        // Both transactions pass the ledger check before either commits.
        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        assert_eq!(wrapped.consume(&message, &mut a).await, Ok(Consumption::Applied));
        assert_eq!(wrapped.consume(&message, &mut b).await, Ok(Consumption::Applied));

        a.commit().await.unwrap();
        assert!(matches!(b.commit().await, Err(StoreError::DuplicateConsumer { .. })));

        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(effect(&store, &message), 1);
        assert_eq!(store.ledger_len(&table()).unwrap(), 1);
    }

    struct Sleepy;

    #[async_trait]
    impl MessageConsumer<InMemoryTransaction> for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn consume(
            &self,
            _message: &MessageEnvelope,
            _tx: &mut InMemoryTransaction,
        ) -> Result<Consumption, HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Consumption::Applied)
        }
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let store = InMemoryMessageStore::new();
        let wrapped: Arc<dyn MessageConsumer<InMemoryTransaction>> = layered(Arc::new(Sleepy), &table());
        let message = message();

        let result = consume_in_transaction(&store, wrapped.as_ref(), &message, Duration::from_millis(20)).await;

        assert!(matches!(result, Err(HandlerError::Transient(_))));
        assert!(store.consumers_of(&table(), message.id()).await.unwrap().is_empty());
    }

    struct AppliedUpstream;

    #[async_trait]
    impl MessageConsumer<InMemoryTransaction> for AppliedUpstream {
        fn name(&self) -> &str {
            "applied.upstream"
        }

        async fn consume(
            &self,
            _message: &MessageEnvelope,
            _tx: &mut InMemoryTransaction,
        ) -> Result<Consumption, HandlerError> {
            Ok(Consumption::AlreadyApplied)
        }
    }

    #[tokio::test]
    async fn inner_already_applied_is_recorded_in_the_ledger() {
        let store = InMemoryMessageStore::new();
        let wrapped: Arc<dyn MessageConsumer<InMemoryTransaction>> = layered(Arc::new(AppliedUpstream), &table());
        let message = message();

        let first = consume_in_transaction(&store, wrapped.as_ref(), &message, Duration::from_secs(1)).await;
        let second = consume_in_transaction(&store, wrapped.as_ref(), &message, Duration::from_secs(1)).await;

        assert_eq!(first, Ok(Consumption::Applied));
        assert_eq!(second, Ok(Consumption::AlreadyApplied));
        assert_eq!(
            store.consumers_of(&table(), message.id()).await.unwrap(),
            vec!["applied.upstream"]
        );
    }

    #[tokio::test]
    async fn layering_twice_applies_once() {
        let store = InMemoryMessageStore::new();
        let counter = Counter::new(false);
        let once: Arc<dyn MessageConsumer<InMemoryTransaction>> = layered(counter.clone(), &table());
        assert!(once.records_consumption());
        let twice = layered(once.clone(), &table());
        assert!(Arc::ptr_eq(&once, &twice));

        let message = message();
        let result = consume_in_transaction(&store, twice.as_ref(), &message, Duration::from_secs(1)).await;

        assert_eq!(result, Ok(Consumption::Applied));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(effect(&store, &message), 1);
        assert_eq!(store.consumers_of(&table(), message.id()).await.unwrap(), vec!["counter"]);
    }
}
