//! In-memory message store (tests/dev).
//!
//! Transactions stage their writes and apply them atomically on commit, so an
//! uncommitted or rolled-back transaction leaves no trace. Claimed rows are held in a
//! store-wide lock set until the claiming transaction finishes, which gives the same
//! lock-and-skip behaviour as `FOR UPDATE SKIP LOCKED`.
//!
//! Besides messages, the store keeps a small document map (`collection`, `key`) →
//! JSON so business mutations and handler side effects commit in the same
//! transaction as outbox rows and ledger entries.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use courier_core::EventId;
use courier_events::MessageEnvelope;

use super::{
    InsertOutcome, MessageRecord, MessageStats, MessageStatus, MessageStore, MessageTable, StoreError,
    StoreResult, StoreTransaction,
};
use crate::outbox::Mutation;

type DocumentKey = (String, String);

#[derive(Debug, Default)]
struct TableState {
    messages: HashMap<EventId, MessageRecord>,
    consumers: HashSet<(EventId, String)>,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: HashMap<MessageTable, TableState>,
    documents: HashMap<DocumentKey, JsonValue>,
    locked: HashSet<(MessageTable, EventId)>,
}

impl StoreState {
    fn table_mut(&mut self, table: &MessageTable) -> &mut TableState {
        self.tables.entry(table.clone()).or_default()
    }

    fn message_mut(&mut self, table: &MessageTable, id: EventId) -> Option<&mut MessageRecord> {
        self.tables.get_mut(table).and_then(|t| t.messages.get_mut(&id))
    }

    fn is_consumed(&self, table: &MessageTable, id: EventId, consumer: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.consumers.contains(&(id, consumer.to_string())))
    }
}

fn lock_state(state: &Mutex<StoreState>) -> StoreResult<MutexGuard<'_, StoreState>> {
    state
        .lock()
        .map_err(|_| StoreError::Storage("in-memory store lock poisoned".into()))
}

/// Thread-safe in-memory message store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed document, if any.
    pub fn document(&self, collection: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        let state = lock_state(&self.state)?;
        Ok(state
            .documents
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    /// Every committed message of a table, oldest first.
    pub fn messages(&self, table: &MessageTable) -> StoreResult<Vec<MessageRecord>> {
        let state = lock_state(&self.state)?;
        let mut messages: Vec<_> = state
            .tables
            .get(table)
            .map(|t| t.messages.values().cloned().collect())
            .unwrap_or_default();
        messages.sort_by_key(|m| (m.occurred_at, m.id));
        Ok(messages)
    }

    /// Number of ledger rows in a table.
    pub fn ledger_len(&self, table: &MessageTable) -> StoreResult<usize> {
        let state = lock_state(&self.state)?;
        Ok(state.tables.get(table).map(|t| t.consumers.len()).unwrap_or(0))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
            locks: Vec::new(),
        })
    }

    async fn find_message(&self, table: &MessageTable, id: EventId) -> StoreResult<Option<MessageRecord>> {
        let state = lock_state(&self.state)?;
        Ok(state.tables.get(table).and_then(|t| t.messages.get(&id)).cloned())
    }

    async fn consumers_of(&self, table: &MessageTable, id: EventId) -> StoreResult<Vec<String>> {
        let state = lock_state(&self.state)?;
        let mut names: Vec<String> = state
            .tables
            .get(table)
            .map(|t| {
                t.consumers
                    .iter()
                    .filter(|(message_id, _)| *message_id == id)
                    .map(|(_, name)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn stats(&self, table: &MessageTable) -> StoreResult<MessageStats> {
        let state = lock_state(&self.state)?;
        let mut stats = MessageStats::default();
        if let Some(t) = state.tables.get(table) {
            for m in t.messages.values() {
                match m.status {
                    MessageStatus::Pending => stats.pending += 1,
                    MessageStatus::Processed => stats.processed += 1,
                    MessageStatus::Failed => stats.failed += 1,
                }
            }
        }
        Ok(stats)
    }

    async fn failed_messages(&self, table: &MessageTable, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        let mut failed: Vec<_> = self
            .messages(table)?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Failed)
            .collect();
        failed.truncate(limit);
        Ok(failed)
    }

    async fn requeue(&self, table: &MessageTable, id: EventId) -> StoreResult<()> {
        let mut state = lock_state(&self.state)?;
        let message = state.message_mut(table, id).ok_or(StoreError::NotFound(id))?;
        if message.status != MessageStatus::Failed {
            return Err(StoreError::NotRequeueable(id));
        }
        message.status = MessageStatus::Pending;
        message.attempts = 0;
        Ok(())
    }
}

#[derive(Debug)]
enum StagedOp {
    Insert(MessageTable, MessageRecord),
    Consumer(MessageTable, EventId, String),
    Failure(MessageTable, EventId, String),
    Processed(MessageTable, EventId, DateTime<Utc>),
    Failed(MessageTable, EventId, Option<String>),
    Document(DocumentKey, JsonValue),
}

/// Transaction over [`InMemoryMessageStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<Mutex<StoreState>>,
    staged: Vec<StagedOp>,
    locks: Vec<(MessageTable, EventId)>,
}

impl InMemoryTransaction {
    /// Stage a document write.
    pub fn put(&mut self, collection: &str, key: &str, value: JsonValue) {
        self.staged
            .push(StagedOp::Document((collection.to_string(), key.to_string()), value));
    }

    /// Read a document, seeing this transaction's own staged writes.
    pub fn get(&self, collection: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        let doc_key = (collection.to_string(), key.to_string());
        let staged = self.staged.iter().rev().find_map(|op| match op {
            StagedOp::Document(k, v) if *k == doc_key => Some(v.clone()),
            _ => None,
        });
        if staged.is_some() {
            return Ok(staged);
        }

        let state = lock_state(&self.state)?;
        Ok(state.documents.get(&doc_key).cloned())
    }

    fn staged_insert(&self, table: &MessageTable, id: EventId) -> bool {
        self.staged
            .iter()
            .any(|op| matches!(op, StagedOp::Insert(t, m) if t == table && m.id == id))
    }

    fn staged_consumer(&self, table: &MessageTable, id: EventId, consumer: &str) -> bool {
        self.staged
            .iter()
            .any(|op| matches!(op, StagedOp::Consumer(t, m, c) if t == table && *m == id && c == consumer))
    }

    fn do_insert(&mut self, table: &MessageTable, envelope: &MessageEnvelope) -> StoreResult<InsertOutcome> {
        let exists = {
            let state = lock_state(&self.state)?;
            state
                .tables
                .get(table)
                .is_some_and(|t| t.messages.contains_key(&envelope.id()))
        };
        if exists || self.staged_insert(table, envelope.id()) {
            return Ok(InsertOutcome::Duplicate);
        }

        self.staged
            .push(StagedOp::Insert(table.clone(), MessageRecord::pending(envelope)));
        Ok(InsertOutcome::Inserted)
    }

    fn do_claim(&mut self, table: &MessageTable, limit: usize, max_attempts: u32) -> StoreResult<Vec<MessageRecord>> {
        let mut state = lock_state(&self.state)?;

        let mut candidates: Vec<MessageRecord> = state
            .tables
            .get(table)
            .map(|t| {
                t.messages
                    .values()
                    .filter(|m| {
                        m.status == MessageStatus::Pending
                            && m.processed_at.is_none()
                            && m.attempts < max_attempts
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        candidates.retain(|m| !state.locked.contains(&(table.clone(), m.id)));
        candidates.sort_by_key(|m| (m.occurred_at, m.id));
        candidates.truncate(limit);

        for m in &candidates {
            state.locked.insert((table.clone(), m.id));
            self.locks.push((table.clone(), m.id));
        }
        Ok(candidates)
    }

    fn do_fail_exhausted(&mut self, table: &MessageTable, max_attempts: u32) -> StoreResult<Vec<EventId>> {
        let mut state = lock_state(&self.state)?;

        let mut exhausted: Vec<EventId> = state
            .tables
            .get(table)
            .map(|t| {
                t.messages
                    .values()
                    .filter(|m| {
                        m.status == MessageStatus::Pending
                            && m.processed_at.is_none()
                            && m.attempts >= max_attempts
                    })
                    .map(|m| m.id)
                    .collect()
            })
            .unwrap_or_default();
        exhausted.retain(|id| !state.locked.contains(&(table.clone(), *id)));
        exhausted.sort();

        for id in &exhausted {
            state.locked.insert((table.clone(), *id));
            self.locks.push((table.clone(), *id));
            self.staged.push(StagedOp::Failed(table.clone(), *id, None));
        }
        Ok(exhausted)
    }

    fn do_has_consumed(&self, table: &MessageTable, message_id: EventId, consumer: &str) -> StoreResult<bool> {
        if self.staged_consumer(table, message_id, consumer) {
            return Ok(true);
        }
        let state = lock_state(&self.state)?;
        Ok(state.is_consumed(table, message_id, consumer))
    }

    fn do_record_consumer(&mut self, table: &MessageTable, message_id: EventId, consumer: &str) -> StoreResult<()> {
        if self.do_has_consumed(table, message_id, consumer)? {
            return Err(StoreError::DuplicateConsumer {
                message_id,
                consumer: consumer.to_string(),
            });
        }
        self.staged
            .push(StagedOp::Consumer(table.clone(), message_id, consumer.to_string()));
        Ok(())
    }

    fn stage(&mut self, op: StagedOp) -> StoreResult<()> {
        self.staged.push(op);
        Ok(())
    }

    fn do_commit(&mut self) -> StoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut state = lock_state(&self.state)?;

        // The ledger's uniqueness is re-checked against everything committed since
        // this transaction recorded its entries.
        for op in &staged {
            if let StagedOp::Consumer(table, id, name) = op {
                if state.is_consumed(table, *id, name) {
                    release(&mut state, &mut self.locks);
                    return Err(StoreError::DuplicateConsumer {
                        message_id: *id,
                        consumer: name.clone(),
                    });
                }
            }
        }

        for op in staged {
            match op {
                StagedOp::Insert(table, record) => {
                    state
                        .table_mut(&table)
                        .messages
                        .entry(record.id)
                        .or_insert(record);
                }
                StagedOp::Consumer(table, id, name) => {
                    state.table_mut(&table).consumers.insert((id, name));
                }
                StagedOp::Failure(table, id, error) => {
                    if let Some(m) = state.message_mut(&table, id) {
                        m.attempts = m.attempts.saturating_add(1);
                        m.error = Some(error);
                    }
                }
                StagedOp::Processed(table, id, at) => {
                    if let Some(m) = state.message_mut(&table, id) {
                        m.processed_at.get_or_insert(at);
                        m.status = MessageStatus::Processed;
                    }
                }
                StagedOp::Failed(table, id, error) => {
                    if let Some(m) = state.message_mut(&table, id) {
                        m.status = MessageStatus::Failed;
                        if error.is_some() {
                            m.error = error;
                        }
                    }
                }
                StagedOp::Document(key, value) => {
                    state.documents.insert(key, value);
                }
            }
        }

        release(&mut state, &mut self.locks);
        Ok(())
    }

    fn do_rollback(&mut self) -> StoreResult<()> {
        self.staged.clear();
        let mut state = lock_state(&self.state)?;
        release(&mut state, &mut self.locks);
        Ok(())
    }
}

fn release(state: &mut StoreState, locks: &mut Vec<(MessageTable, EventId)>) {
    for key in locks.drain(..) {
        state.locked.remove(&key);
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.locks.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            release(&mut state, &mut self.locks);
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn insert_message(
        &mut self,
        table: &MessageTable,
        envelope: &MessageEnvelope,
    ) -> StoreResult<InsertOutcome> {
        self.do_insert(table, envelope)
    }

    async fn claim_pending(
        &mut self,
        table: &MessageTable,
        limit: usize,
        max_attempts: u32,
    ) -> StoreResult<Vec<MessageRecord>> {
        self.do_claim(table, limit, max_attempts)
    }

    async fn fail_exhausted(&mut self, table: &MessageTable, max_attempts: u32) -> StoreResult<Vec<EventId>> {
        self.do_fail_exhausted(table, max_attempts)
    }

    async fn has_consumed(&mut self, table: &MessageTable, message_id: EventId, consumer: &str) -> StoreResult<bool> {
        self.do_has_consumed(table, message_id, consumer)
    }

    async fn record_consumer(&mut self, table: &MessageTable, message_id: EventId, consumer: &str) -> StoreResult<()> {
        self.do_record_consumer(table, message_id, consumer)
    }

    async fn record_failure(&mut self, table: &MessageTable, message_id: EventId, error: &str) -> StoreResult<()> {
        self.stage(StagedOp::Failure(table.clone(), message_id, error.to_string()))
    }

    async fn mark_processed(&mut self, table: &MessageTable, message_id: EventId, at: DateTime<Utc>) -> StoreResult<()> {
        self.stage(StagedOp::Processed(table.clone(), message_id, at))
    }

    async fn mark_failed(&mut self, table: &MessageTable, message_id: EventId, error: Option<&str>) -> StoreResult<()> {
        self.stage(StagedOp::Failed(table.clone(), message_id, error.map(str::to_string)))
    }

    async fn commit(mut self) -> StoreResult<()> {
        self.do_commit()
    }

    async fn rollback(mut self) -> StoreResult<()> {
        self.do_rollback()
    }
}

/// Mutation writing one document, for business state kept in the in-memory store.
#[derive(Debug, Clone)]
pub struct PutDocument {
    pub collection: String,
    pub key: String,
    pub value: JsonValue,
}

impl PutDocument {
    pub fn new(collection: impl Into<String>, key: impl Into<String>, value: JsonValue) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            value,
        }
    }
}

#[async_trait]
impl Mutation<InMemoryTransaction> for PutDocument {
    async fn apply(&self, tx: &mut InMemoryTransaction) -> StoreResult<()> {
        tx.put(&self.collection, &self.key, self.value.clone());
        Ok(())
    }
}

/// Store whose `begin` fails for the 1-based call numbers in `failing`.
#[cfg(test)]
pub(crate) struct FailingBegin {
    pub inner: InMemoryMessageStore,
    pub calls: std::sync::atomic::AtomicUsize,
    pub failing: std::ops::Range<usize>,
}

#[cfg(test)]
impl FailingBegin {
    pub fn new(inner: InMemoryMessageStore, failing: std::ops::Range<usize>) -> Self {
        Self {
            inner,
            calls: std::sync::atomic::AtomicUsize::new(0),
            failing,
        }
    }

    pub fn begin_calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl MessageStore for FailingBegin {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> StoreResult<InMemoryTransaction> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if self.failing.contains(&call) {
            return Err(StoreError::Storage("connection reset".into()));
        }
        self.inner.begin().await
    }

    async fn find_message(&self, table: &MessageTable, id: EventId) -> StoreResult<Option<MessageRecord>> {
        self.inner.find_message(table, id).await
    }

    async fn consumers_of(&self, table: &MessageTable, id: EventId) -> StoreResult<Vec<String>> {
        self.inner.consumers_of(table, id).await
    }

    async fn stats(&self, table: &MessageTable) -> StoreResult<MessageStats> {
        self.inner.stats(table).await
    }

    async fn failed_messages(&self, table: &MessageTable, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        self.inner.failed_messages(table, limit).await
    }

    async fn requeue(&self, table: &MessageTable, id: EventId) -> StoreResult<()> {
        self.inner.requeue(table, id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use courier_core::ModuleName;

    use super::*;

    fn table() -> MessageTable {
        MessageTable::outbox(ModuleName::new("orders").unwrap())
    }

    fn envelope_at(offset_secs: i64) -> MessageEnvelope {
        MessageEnvelope::new(
            EventId::new(),
            "orders.order_placed",
            json!({ "n": offset_secs }),
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    async fn seed(store: &InMemoryMessageStore, envelopes: &[MessageEnvelope]) {
        let mut tx = store.begin().await.unwrap();
        for e in envelopes {
            tx.insert_message(&table(), e).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = InMemoryMessageStore::new();
        let envelope = envelope_at(0);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.insert_message(&table(), &envelope).await.unwrap(), InsertOutcome::Inserted);
        tx.put("orders", "o-1", json!({ "status": "placed" }));
        assert_eq!(tx.get("orders", "o-1").unwrap(), Some(json!({ "status": "placed" })));
        assert!(store.find_message(&table(), envelope.id()).await.unwrap().is_none());
        tx.rollback().await.unwrap();

        assert!(store.find_message(&table(), envelope.id()).await.unwrap().is_none());
        assert!(store.document("orders", "o-1").unwrap().is_none());

        seed(&store, &[envelope.clone()]).await;
        let stored = store.find_message(&table(), envelope.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.to_envelope(), envelope);
    }

    #[tokio::test]
    async fn duplicate_insert_is_absorbed() {
        let store = InMemoryMessageStore::new();
        let envelope = envelope_at(0);
        seed(&store, &[envelope.clone()]).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.insert_message(&table(), &envelope).await.unwrap(), InsertOutcome::Duplicate);
        tx.commit().await.unwrap();
        assert_eq!(store.messages(&table()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claims_oldest_first_and_skips_locked_rows() {
        let store = InMemoryMessageStore::new();
        let (late, early, middle) = (envelope_at(30), envelope_at(-30), envelope_at(0));
        seed(&store, &[late.clone(), early.clone(), middle.clone()]).await;

        let mut first = store.begin().await.unwrap();
        let claimed = first.claim_pending(&table(), 2, 5).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![early.id(), middle.id()]);

        let mut second = store.begin().await.unwrap();
        let claimed = second.claim_pending(&table(), 10, 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, late.id());

        drop(first);
        let mut third = store.begin().await.unwrap();
        assert_eq!(third.claim_pending(&table(), 10, 5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ledger_uniqueness_is_enforced_at_commit() {
        let store = InMemoryMessageStore::new();
        let envelope = envelope_at(0);
        seed(&store, &[envelope.clone()]).await;

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        a.record_consumer(&table(), envelope.id(), "notify").await.unwrap();
        b.record_consumer(&table(), envelope.id(), "notify").await.unwrap();
        b.put("effects", "notify", json!(1));

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateConsumer { .. }));

        assert_eq!(store.consumers_of(&table(), envelope.id()).await.unwrap(), vec!["notify"]);
        assert!(store.document("effects", "notify").unwrap().is_none());

        let mut c = store.begin().await.unwrap();
        assert!(c.has_consumed(&table(), envelope.id(), "notify").await.unwrap());
        assert!(matches!(
            c.record_consumer(&table(), envelope.id(), "notify").await,
            Err(StoreError::DuplicateConsumer { .. })
        ));
    }

    #[tokio::test]
    async fn failures_processing_and_requeue() {
        let store = InMemoryMessageStore::new();
        let envelope = envelope_at(0);
        seed(&store, &[envelope.clone()]).await;
        let id = envelope.id();

        let mut tx = store.begin().await.unwrap();
        tx.record_failure(&table(), id, "boom").await.unwrap();
        tx.record_failure(&table(), id, "boom again").await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.find_message(&table(), id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.error.as_deref(), Some("boom again"));

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.fail_exhausted(&table(), 2).await.unwrap(), vec![id]);
        tx.commit().await.unwrap();
        assert_eq!(store.stats(&table()).await.unwrap().failed, 1);
        assert_eq!(store.failed_messages(&table(), 10).await.unwrap()[0].error.as_deref(), Some("boom again"));

        store.requeue(&table(), id).await.unwrap();
        let requeued = store.find_message(&table(), id).await.unwrap().unwrap();
        assert_eq!((requeued.status, requeued.attempts), (MessageStatus::Pending, 0));

        let first = Utc::now();
        let mut tx = store.begin().await.unwrap();
        tx.mark_processed(&table(), id, first).await.unwrap();
        tx.mark_processed(&table(), id, first + Duration::seconds(5)).await.unwrap();
        tx.commit().await.unwrap();

        let processed = store.find_message(&table(), id).await.unwrap().unwrap();
        assert_eq!(processed.processed_at, Some(first));
        assert_eq!(store.requeue(&table(), id).await, Err(StoreError::NotRequeueable(id)));
        assert!(matches!(
            store.requeue(&table(), EventId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
