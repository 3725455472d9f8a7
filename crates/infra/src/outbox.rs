//! Outbox writer: one business operation, one transaction.
//!
//! A [`UnitOfWork`] collects the operation's mutations and raised events and commits
//! them exactly once:
//!
//! 1. apply mutations in registration order,
//! 2. walk the events in raise order: integration events become outbox rows, domain
//!    events are dispatched to in-process handlers,
//! 3. commit.
//!
//! Any failure rolls the whole transaction back, so a state change is visible iff its
//! integration events are in the outbox.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use courier_core::EventId;
use courier_events::{DomainEventDispatcher, Event, EventError, EventRecord, HandlerError, RaisesEvents};

use crate::store::{InsertOutcome, MessageStore, MessageTable, StoreError, StoreResult, StoreTransaction};

/// A state change applied inside the unit-of-work transaction.
#[async_trait]
pub trait Mutation<Tx: Send>: Send + Sync {
    async fn apply(&self, tx: &mut Tx) -> StoreResult<()>;
}

#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    #[error("mutation failed: {0}")]
    Mutation(#[source] StoreError),

    #[error("domain handler for '{event_type}' failed: {source}")]
    DomainHandler {
        event_type: String,
        #[source]
        source: HandlerError,
    },

    #[error("event {0} is already in the outbox")]
    DuplicateEvent(EventId),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a successful commit wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Ids of the outbox messages inserted, in raise order.
    pub outbox_message_ids: Vec<EventId>,
    /// Domain handler invocations, summed over all domain events.
    pub domain_events_dispatched: usize,
}

/// Writes business mutations and their events to one module's outbox.
pub struct OutboxWriter<S: MessageStore> {
    store: Arc<S>,
    table: MessageTable,
    domain_handlers: Arc<DomainEventDispatcher<S::Tx>>,
}

impl<S: MessageStore> OutboxWriter<S> {
    pub fn new(store: Arc<S>, table: MessageTable) -> Self {
        Self {
            store,
            table,
            domain_handlers: Arc::new(DomainEventDispatcher::new()),
        }
    }

    pub fn with_domain_handlers(mut self, handlers: DomainEventDispatcher<S::Tx>) -> Self {
        self.domain_handlers = Arc::new(handlers);
        self
    }

    pub fn table(&self) -> &MessageTable {
        &self.table
    }

    /// Start a unit of work.
    pub fn begin(&self) -> UnitOfWork<'_, S> {
        UnitOfWork {
            writer: self,
            mutations: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Persist `mutations` and the integration `events` atomically.
    #[instrument(
        skip(self, mutations, events),
        fields(table = %self.table, mutations = mutations.len(), events = events.len()),
        err
    )]
    pub async fn commit(
        &self,
        mutations: Vec<Box<dyn Mutation<S::Tx>>>,
        events: Vec<EventRecord>,
    ) -> Result<CommitReceipt, UnitOfWorkError> {
        let mut tx = self.store.begin().await?;

        match self.write(&mut tx, &mutations, &events).await {
            Ok(receipt) => {
                tx.commit().await?;
                debug!(
                    outboxed = receipt.outbox_message_ids.len(),
                    domain_events = receipt.domain_events_dispatched,
                    "unit of work committed"
                );
                Ok(receipt)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed unit of work also failed");
                }
                Err(err)
            }
        }
    }

    async fn write(
        &self,
        tx: &mut S::Tx,
        mutations: &[Box<dyn Mutation<S::Tx>>],
        events: &[EventRecord],
    ) -> Result<CommitReceipt, UnitOfWorkError> {
        for mutation in mutations {
            mutation.apply(tx).await.map_err(UnitOfWorkError::Mutation)?;
        }

        let mut receipt = CommitReceipt::default();
        for event in events {
            if event.is_integration() {
                match tx.insert_message(&self.table, &event.to_envelope()).await? {
                    InsertOutcome::Inserted => receipt.outbox_message_ids.push(event.id()),
                    InsertOutcome::Duplicate => return Err(UnitOfWorkError::DuplicateEvent(event.id())),
                }
            } else {
                let ran = self
                    .domain_handlers
                    .dispatch(event, tx)
                    .await
                    .map_err(|source| UnitOfWorkError::DomainHandler {
                        event_type: event.event_type().to_string(),
                        source,
                    })?;
                receipt.domain_events_dispatched += ran;
            }
        }
        Ok(receipt)
    }
}

/// Mutations and events of one business operation.
///
/// `commit` consumes the unit of work, so it runs at most once. Dropping it without
/// committing writes nothing.
pub struct UnitOfWork<'w, S: MessageStore> {
    writer: &'w OutboxWriter<S>,
    mutations: Vec<Box<dyn Mutation<S::Tx>>>,
    events: Vec<EventRecord>,
}

impl<'w, S: MessageStore> UnitOfWork<'w, S> {
    pub fn register_mutation(&mut self, mutation: impl Mutation<S::Tx> + 'static) -> &mut Self {
        self.mutations.push(Box::new(mutation));
        self
    }

    pub fn register_event(&mut self, event: EventRecord) -> &mut Self {
        self.events.push(event);
        self
    }

    /// Record a typed event that wasn't raised through an aggregate.
    pub fn raise<E: Event>(&mut self, event: &E) -> Result<EventId, EventError> {
        let record = EventRecord::from_event(event)?;
        let id = record.id();
        self.events.push(record);
        Ok(id)
    }

    /// Drain every event the aggregate raised so far.
    pub fn collect_from<A: RaisesEvents>(&mut self, aggregate: &mut A) -> &mut Self {
        self.events.extend(aggregate.drain_events());
        self
    }

    pub async fn commit(self) -> Result<CommitReceipt, UnitOfWorkError> {
        self.writer.commit(self.mutations, self.events).await
    }
}
