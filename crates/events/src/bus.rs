//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the transport between modules once an integration event has left the
//! outbox. It makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, a broker.
//! - **At-least-once delivery**: messages may be delivered more than once; the receiving
//!   inbox deduplicates by message id and the consumption ledger absorbs the rest.
//! - **No persistence**: the outbox is the source of truth. A failed publish leaves the
//!   outbox message pending, so it is retried on the next processor tick.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// A subscription to a bus.
///
/// Each subscription receives a copy of every message published after it was created
/// (broadcast semantics). Receiving is async so a listener task can `select!` on it
/// together with a shutdown signal.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Outbox Processor ──publish──▶ EventBus ──subscription──▶ InboxListener ──▶ Inbox
/// ```
///
/// `publish()` can fail (bus closed, network error, no live subscriber). The failure is
/// surfaced to the outbox processor, which records it on the message and retries
/// later. A message that reached nobody must not count as published.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
