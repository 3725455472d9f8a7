//! Consumer-side abstractions.
//!
//! Two layers:
//! - [`EventHandler`]: business logic for one typed event, executed against the
//!   caller's transaction `Tx` so its side effects commit together with the ledger row.
//! - [`MessageConsumer`]: the untyped, named unit a processor invokes for a stored
//!   message. Middleware (logging, idempotency) and built-in consumers (bus publisher,
//!   inbox forwarder) are all `MessageConsumer`s; [`TypedConsumer`] bridges the two.

use std::marker::PhantomData;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::MessageEnvelope;
use crate::event::Event;

/// Failure reported by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Retry on a later tick, bounded by the attempt budget.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Never retried; the message is marked failed immediately.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The consumption ledger already holds this (message, consumer) pair.
    #[error("consumer '{consumer}' already applied this message")]
    Duplicate { consumer: String },
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Result of a successful consumption.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Consumption {
    /// The effect was applied in this call.
    Applied,
    /// The ledger showed the effect was applied earlier; nothing ran.
    AlreadyApplied,
}

/// Business logic for one event type.
///
/// `name()` is the consumer name recorded in the consumption ledger. It must stay
/// stable across deployments: renaming a handler makes every message look unconsumed.
#[async_trait]
pub trait EventHandler<E: Event, Tx: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: E, tx: &mut Tx) -> Result<(), HandlerError>;
}

/// A named consumer of stored messages.
#[async_trait]
pub trait MessageConsumer<Tx: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn consume(
        &self,
        message: &MessageEnvelope,
        tx: &mut Tx,
    ) -> Result<Consumption, HandlerError>;

    /// `true` when this consumer writes its own consumption-ledger entry, so it must
    /// not be wrapped in ledger middleware again.
    fn records_consumption(&self) -> bool {
        false
    }
}

/// Decodes the envelope payload into `E` and calls the typed handler.
///
/// A payload that does not decode is a permanent failure.
pub struct TypedConsumer<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> TypedConsumer<E, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H, Tx> MessageConsumer<Tx> for TypedConsumer<E, H>
where
    E: Event,
    H: EventHandler<E, Tx>,
    Tx: Send,
{
    fn name(&self) -> &str {
        self.handler.name()
    }

    async fn consume(
        &self,
        message: &MessageEnvelope,
        tx: &mut Tx,
    ) -> Result<Consumption, HandlerError> {
        let event: E = message.decode().map_err(|e| {
            HandlerError::permanent(format!(
                "cannot decode '{}' payload of message {}: {e}",
                message.event_type(),
                message.id()
            ))
        })?;

        self.handler.handle(event, tx).await?;
        Ok(Consumption::Applied)
    }
}
