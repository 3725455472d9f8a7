//! Inbox writer and bus listener.
//!
//! The receiving side of cross-module delivery: every envelope that arrives is
//! persisted to the module's inbox before any local handler sees it. Receipt is
//! idempotent on the message id, so bus redeliveries collapse into one inbox row.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use courier_events::{MessageEnvelope, Subscription};

use crate::store::{InsertOutcome, MessageStore, MessageTable, StoreResult, StoreTransaction};

/// Outcome of receiving an envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Receipt {
    Accepted,
    /// Already in the inbox; nothing was written.
    Duplicate,
}

impl From<InsertOutcome> for Receipt {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Inserted => Receipt::Accepted,
            InsertOutcome::Duplicate => Receipt::Duplicate,
        }
    }
}

/// Persists received integration events into one module's inbox.
pub struct InboxWriter<S: MessageStore> {
    store: Arc<S>,
    table: MessageTable,
}

impl<S: MessageStore> Clone for InboxWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            table: self.table.clone(),
        }
    }
}

impl<S: MessageStore> InboxWriter<S> {
    pub fn new(store: Arc<S>, table: MessageTable) -> Self {
        Self { store, table }
    }

    pub fn table(&self) -> &MessageTable {
        &self.table
    }

    /// Persist `envelope` in its own transaction.
    #[instrument(
        skip(self, envelope),
        fields(table = %self.table, message_id = %envelope.id(), event_type = envelope.event_type()),
        err
    )]
    pub async fn receive(&self, envelope: &MessageEnvelope) -> StoreResult<Receipt> {
        let mut tx = self.store.begin().await?;
        let receipt = match self.receive_in(&mut tx, envelope).await {
            Ok(receipt) => receipt,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "inbox rollback failed");
                }
                return Err(err);
            }
        };
        tx.commit().await?;

        if receipt == Receipt::Duplicate {
            debug!("duplicate delivery absorbed");
        }
        Ok(receipt)
    }

    /// Persist `envelope` inside a transaction owned by the caller.
    pub async fn receive_in(&self, tx: &mut S::Tx, envelope: &MessageEnvelope) -> StoreResult<Receipt> {
        Ok(tx.insert_message(&self.table, envelope).await?.into())
    }
}

/// Counters of an [`InboxListener`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ListenerStats {
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    /// Failed inbox writes that were retried.
    pub write_retries: u64,
    /// Envelopes still unwritten when the listener shut down.
    pub errors: u64,
}

/// Handle to control a running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ListenerStats>>,
}

impl ListenerHandle {
    /// Request shutdown and wait for the listener task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> ListenerStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Feeds a bus subscription into a module's inbox.
///
/// An envelope taken off the subscription is retried until the inbox write succeeds;
/// only shutdown abandons it. The listener never reads the next envelope while one is
/// unwritten.
pub struct InboxListener;

impl InboxListener {
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

    pub fn spawn<S: MessageStore>(
        name: impl Into<String>,
        mut subscription: Subscription<MessageEnvelope>,
        writer: InboxWriter<S>,
    ) -> ListenerHandle {
        let name = name.into();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ListenerStats::default()));
        let task_stats = Arc::clone(&stats);

        let join = tokio::spawn(async move {
            info!(listener = %name, table = %writer.table(), "inbox listener started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let envelope = tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    next = subscription.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let (outcome, retries) = write_until_stored(&writer, &envelope, &mut shutdown_rx).await;
                let mut stats = match task_stats.lock() {
                    Ok(stats) => stats,
                    Err(poisoned) => poisoned.into_inner(),
                };
                stats.received += 1;
                stats.write_retries += retries;
                match outcome {
                    Ok(Receipt::Accepted) => stats.accepted += 1,
                    Ok(Receipt::Duplicate) => stats.duplicates += 1,
                    Err(err) => {
                        stats.errors += 1;
                        error!(
                            listener = %name,
                            message_id = %envelope.id(),
                            error = %err,
                            "listener stopped before the received message was persisted"
                        );
                    }
                }
            }

            info!(listener = %name, "inbox listener stopped");
        });

        ListenerHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }
}

/// Write `envelope` with capped exponential backoff. Gives up only on shutdown, with
/// the last storage error. Also returns how many failed writes were retried.
async fn write_until_stored<S: MessageStore>(
    writer: &InboxWriter<S>,
    envelope: &MessageEnvelope,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> (StoreResult<Receipt>, u64) {
    let mut failures = 0u64;
    let mut delay = InboxListener::RETRY_BASE_DELAY;
    loop {
        let err = match writer.receive(envelope).await {
            Ok(receipt) => return (Ok(receipt), failures),
            Err(err) => err,
        };
        failures += 1;
        warn!(message_id = %envelope.id(), attempt = failures, error = %err, "inbox write failed, retrying");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return (Err(err), failures - 1);
                }
            }
        }
        delay = (delay * 2).min(InboxListener::RETRY_MAX_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use courier_core::{EventId, ModuleName};
    use courier_events::{EventBus, InMemoryEventBus};

    use super::*;
    use crate::store::InMemoryMessageStore;
    use crate::store::in_memory::FailingBegin;

    fn writer(store: &Arc<InMemoryMessageStore>) -> InboxWriter<InMemoryMessageStore> {
        InboxWriter::new(store.clone(), MessageTable::inbox(ModuleName::new("shipping").unwrap()))
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(EventId::new(), "orders.order_placed", json!({}), Utc::now())
    }

    #[tokio::test]
    async fn redelivery_is_absorbed() {
        let store = Arc::new(InMemoryMessageStore::new());
        let writer = writer(&store);
        let envelope = envelope();

        assert_eq!(writer.receive(&envelope).await.unwrap(), Receipt::Accepted);
        assert_eq!(writer.receive(&envelope).await.unwrap(), Receipt::Duplicate);
        assert_eq!(store.messages(writer.table()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receive_in_joins_the_callers_transaction() {
        let store = Arc::new(InMemoryMessageStore::new());
        let writer = writer(&store);

        let mut tx = store.begin().await.unwrap();
        writer.receive_in(&mut tx, &envelope()).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.messages(writer.table()).unwrap().is_empty());
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn listener_keeps_retrying_a_failing_write() {
        let inner = InMemoryMessageStore::new();
        let table = MessageTable::inbox(ModuleName::new("shipping").unwrap());
        // More consecutive failures than a short fixed retry budget would survive.
        let store = Arc::new(FailingBegin::new(inner.clone(), 1..5));
        let bus = InMemoryEventBus::<MessageEnvelope>::new();
        let listener = InboxListener::spawn("shipping.listener", bus.subscribe(), InboxWriter::new(store, table.clone()));

        let envelope = envelope();
        bus.publish(envelope.clone()).unwrap();

        wait_for("the write to land", || listener.stats().accepted == 1).await;
        let stats = listener.stats();
        assert_eq!((stats.received, stats.write_retries, stats.errors), (1, 4, 0));
        assert_eq!(inner.messages(&table).unwrap()[0].id, envelope.id());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_abandons_an_unwritable_envelope() {
        let table = MessageTable::inbox(ModuleName::new("shipping").unwrap());
        let store = Arc::new(FailingBegin::new(InMemoryMessageStore::new(), 1..usize::MAX));
        let bus = InMemoryEventBus::<MessageEnvelope>::new();
        let listener = InboxListener::spawn(
            "shipping.listener",
            bus.subscribe(),
            InboxWriter::new(store.clone(), table),
        );

        bus.publish(envelope()).unwrap();
        wait_for("a retried write", || store.begin_calls() >= 2).await;

        let stats = Arc::clone(&listener.stats);
        listener.shutdown().await;
        let stats = stats.lock().unwrap().clone();
        assert_eq!((stats.received, stats.accepted, stats.errors), (1, 0, 1));
    }
}
