//! Durable message store: outbox/inbox tables and their consumption ledgers.
//!
//! Each module owns four tables in its own schema:
//!
//! | Table | Key |
//! |-------|-----|
//! | `outbox_messages` | message id (= event id) |
//! | `outbox_message_consumers` | `(outbox_message_id, name)` |
//! | `inbox_messages` | message id (= event id) |
//! | `inbox_message_consumers` | `(inbox_message_id, name)` |
//!
//! The store is accessed through [`StoreTransaction`]s. Business mutations, outbox
//! inserts and ledger rows all go through the same transaction type so they commit or
//! roll back together.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use courier_core::{EventId, ModuleName};
use courier_events::{HandlerError, MessageEnvelope};

pub mod in_memory;
pub mod postgres;
pub mod schema;

pub use in_memory::{InMemoryMessageStore, InMemoryTransaction, PutDocument};
pub use postgres::{PgStoreTransaction, PostgresMessageStore};

/// Which side of a module's messaging a table belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Outbox,
    Inbox,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Outbox => "outbox",
            MessageKind::Inbox => "inbox",
        }
    }
}

/// A module's outbox or inbox table (plus its consumer ledger).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageTable {
    module: ModuleName,
    kind: MessageKind,
}

impl MessageTable {
    pub fn new(module: ModuleName, kind: MessageKind) -> Self {
        Self { module, kind }
    }

    pub fn outbox(module: ModuleName) -> Self {
        Self::new(module, MessageKind::Outbox)
    }

    pub fn inbox(module: ModuleName) -> Self {
        Self::new(module, MessageKind::Inbox)
    }

    pub fn module(&self) -> &ModuleName {
        &self.module
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Schema-qualified messages table, e.g. `"orders".outbox_messages`.
    ///
    /// Safe to splice into SQL: `ModuleName` only admits `[a-z][a-z0-9_]*`.
    pub fn messages_relation(&self) -> String {
        format!("\"{}\".{}_messages", self.module, self.kind.as_str())
    }

    /// Schema-qualified ledger table, e.g. `"orders".outbox_message_consumers`.
    pub fn consumers_relation(&self) -> String {
        format!("\"{}\".{}_message_consumers", self.module, self.kind.as_str())
    }

    /// Ledger column referencing the message, e.g. `outbox_message_id`.
    pub fn message_id_column(&self) -> String {
        format!("{}_message_id", self.kind.as_str())
    }
}

impl core::fmt::Display for MessageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.module, self.kind.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for (more) processing attempts.
    Pending,
    /// Every consumer applied it. Terminal.
    Processed,
    /// Poison or out of attempts. Terminal unless requeued by an operator.
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processed" => Ok(MessageStatus::Processed),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(StoreError::InvalidRow(format!("unknown message status '{other}'"))),
        }
    }
}

/// A stored outbox or inbox message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: EventId,
    pub event_type: String,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Failed processing attempts so far.
    pub attempts: u32,
    pub status: MessageStatus,
}

impl MessageRecord {
    pub fn pending(envelope: &MessageEnvelope) -> Self {
        Self {
            id: envelope.id(),
            event_type: envelope.event_type().to_string(),
            payload: envelope.payload().clone(),
            occurred_at: envelope.occurred_at(),
            processed_at: None,
            error: None,
            attempts: 0,
            status: MessageStatus::Pending,
        }
    }

    pub fn to_envelope(&self) -> MessageEnvelope {
        MessageEnvelope::new(self.id, self.event_type.clone(), self.payload.clone(), self.occurred_at)
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    /// The ledger already holds `(message_id, consumer)`.
    #[error("consumer '{consumer}' already recorded for message {message_id}")]
    DuplicateConsumer { message_id: EventId, consumer: String },

    #[error("message {0} not found")]
    NotFound(EventId),

    #[error("message {0} is not in failed state")]
    NotRequeueable(EventId),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateConsumer { consumer, .. } => HandlerError::Duplicate { consumer },
            other => HandlerError::Transient(other.to_string()),
        }
    }
}

/// Outcome of inserting a message row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id already exists; nothing was written.
    Duplicate,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageStats {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

impl MessageStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processed + self.failed
    }
}

/// A transaction over the message store.
///
/// Dropping a transaction without calling `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send + 'static {
    /// Insert a pending message. An existing id is left untouched.
    async fn insert_message(
        &mut self,
        table: &MessageTable,
        envelope: &MessageEnvelope,
    ) -> StoreResult<InsertOutcome>;

    /// Lock and return up to `limit` pending messages with `attempts < max_attempts`,
    /// oldest first. Rows locked by other transactions are skipped.
    async fn claim_pending(
        &mut self,
        table: &MessageTable,
        limit: usize,
        max_attempts: u32,
    ) -> StoreResult<Vec<MessageRecord>>;

    /// Mark pending messages whose attempts already reached `max_attempts` as failed.
    /// Returns the affected ids.
    async fn fail_exhausted(&mut self, table: &MessageTable, max_attempts: u32) -> StoreResult<Vec<EventId>>;

    async fn has_consumed(&mut self, table: &MessageTable, message_id: EventId, consumer: &str) -> StoreResult<bool>;

    /// Insert a ledger entry. Fails with [`StoreError::DuplicateConsumer`] if the pair
    /// exists (possibly only at commit time, depending on the store).
    async fn record_consumer(&mut self, table: &MessageTable, message_id: EventId, consumer: &str) -> StoreResult<()>;

    /// Count a failed attempt and store its error.
    async fn record_failure(&mut self, table: &MessageTable, message_id: EventId, error: &str) -> StoreResult<()>;

    /// Set `processed_at` (first call wins) and status `processed`.
    async fn mark_processed(&mut self, table: &MessageTable, message_id: EventId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Set status `failed`. `error` overwrites the last error when given.
    async fn mark_failed(&mut self, table: &MessageTable, message_id: EventId, error: Option<&str>) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// Message store: transactions plus read/maintenance operations for operators.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    type Tx: StoreTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn find_message(&self, table: &MessageTable, id: EventId) -> StoreResult<Option<MessageRecord>>;

    /// Ledger entries for a message, sorted by consumer name.
    async fn consumers_of(&self, table: &MessageTable, id: EventId) -> StoreResult<Vec<String>>;

    async fn stats(&self, table: &MessageTable) -> StoreResult<MessageStats>;

    /// Failed messages, oldest first.
    async fn failed_messages(&self, table: &MessageTable, limit: usize) -> StoreResult<Vec<MessageRecord>>;

    /// Move a failed message back to pending with its attempt counter reset.
    async fn requeue(&self, table: &MessageTable, id: EventId) -> StoreResult<()>;
}
