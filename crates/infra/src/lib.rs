//! Infrastructure layer: message storage, outbox/inbox, processors and transports.
//!
//! ```text
//! UnitOfWork ──commit──▶ outbox ──MessageProcessor──▶ consumers (BusPublisher, InboxForwarder, ...)
//!                                                          │
//! EventBus ──InboxListener──▶ inbox ──MessageProcessor──▶ local handlers
//! ```

pub mod config;
pub mod consumers;
pub mod event_bus;
pub mod idempotency;
pub mod inbox;
pub mod outbox;
pub mod processor;
pub mod store;


pub use config::{ConfigError, ModuleMessagingConfig, ProcessorConfig};
pub use consumers::{BusPublisher, InboxForwarder};
pub use idempotency::{IdempotentConsumer, LoggingConsumer, consume_in_transaction};
pub use inbox::{InboxListener, InboxWriter, ListenerHandle, ListenerStats, Receipt};
pub use outbox::{CommitReceipt, Mutation, OutboxWriter, UnitOfWork, UnitOfWorkError};
pub use processor::{MessageProcessor, ProcessorError, ProcessorHandle, ProcessorStats, TickReport};
pub use store::{
    InMemoryMessageStore, InMemoryTransaction, MessageKind, MessageRecord, MessageStats, MessageStatus,
    MessageStore, MessageTable, PostgresMessageStore, StoreError, StoreResult, StoreTransaction,
};
