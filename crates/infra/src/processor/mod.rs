//! Outbox and inbox processors.
//!
//! Both sides run the same algorithm against their own table. Per tick:
//!
//! 1. open a claiming transaction; sweep messages that already used up their attempt
//!    budget into `failed`,
//! 2. claim up to `batch_size` pending messages (oldest first, locked rows skipped),
//! 3. for each message, validate the payload and resolve its consumers; every
//!    consumer runs in its own transaction through the idempotency middleware, which
//!    skips consumers that already have a ledger entry,
//! 4. before a message counts as processed, confirm every consumer's ledger entry
//!    is committed,
//! 5. record the outcome on the claimed row (processed / retried / failed) and commit
//!    the claiming transaction.
//!
//! Messages in a batch are handled sequentially. One consumer failing never stops the
//! others, and one message failing never stops the batch. The claiming transaction
//! only carries status writes; if one of them fails, the settles before it are still
//! committed and the rest of the batch is released.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{Span, debug, error, info, instrument, warn};

use courier_events::{Consumption, HandlerError, HandlerRegistry, MessageConsumer};

use crate::config::ProcessorConfig;
use crate::idempotency::{consume_in_transaction, layered};
use crate::store::{MessageKind, MessageRecord, MessageStore, MessageTable, StoreError, StoreTransaction};

pub mod runner;

pub use runner::{ProcessorHandle, ProcessorStats};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub processed: usize,
    /// Messages left pending for another attempt.
    pub retried: usize,
    /// Messages marked failed this tick (poison, exhausted budget, or swept).
    pub failed: usize,
    /// Consumers skipped because the ledger already had their entry.
    pub skipped: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0 && self.failed == 0
    }
}

enum Outcome {
    Processed,
    Retry(String),
    Poison(String),
}

/// Drains one module's outbox or inbox.
pub struct MessageProcessor<S: MessageStore> {
    name: String,
    store: Arc<S>,
    table: MessageTable,
    registry: Arc<HandlerRegistry<S::Tx>>,
    config: ProcessorConfig,
}

impl<S: MessageStore> MessageProcessor<S> {
    /// Build a processor for `table`. Every consumer in `registry` is wrapped in the
    /// logging + idempotency middleware for this table.
    pub fn new(
        store: Arc<S>,
        table: MessageTable,
        registry: HandlerRegistry<S::Tx>,
        config: ProcessorConfig,
    ) -> Result<Self, ProcessorError> {
        config.validate()?;
        let registry = registry.layered(|consumer| layered(consumer, &table));

        Ok(Self {
            name: format!("{table}.processor"),
            store,
            table,
            registry: Arc::new(registry),
            config,
        })
    }

    /// Processor for `module`'s outbox: consumers are in-process handlers and bus
    /// publishers.
    pub fn outbox(
        store: Arc<S>,
        module: courier_core::ModuleName,
        registry: HandlerRegistry<S::Tx>,
        config: ProcessorConfig,
    ) -> Result<Self, ProcessorError> {
        Self::new(store, MessageTable::new(module, MessageKind::Outbox), registry, config)
    }

    /// Processor for `module`'s inbox: consumers are the module's local handlers.
    pub fn inbox(
        store: Arc<S>,
        module: courier_core::ModuleName,
        registry: HandlerRegistry<S::Tx>,
        config: ProcessorConfig,
    ) -> Result<Self, ProcessorError> {
        Self::new(store, MessageTable::new(module, MessageKind::Inbox), registry, config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &MessageTable {
        &self.table
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Run one processing pass.
    #[instrument(
        skip(self),
        fields(processor = %self.name, table = %self.table, claimed = tracing::field::Empty),
        err
    )]
    pub async fn tick(&self) -> Result<TickReport, ProcessorError> {
        let mut report = TickReport::default();
        let mut claim = self.store.begin().await?;

        let swept = claim.fail_exhausted(&self.table, self.config.max_attempts).await?;
        for id in &swept {
            error!(message_id = %id, max_attempts = self.config.max_attempts, "message exhausted its attempts, marked failed");
        }
        report.failed += swept.len();

        let messages = claim
            .claim_pending(&self.table, self.config.batch_size, self.config.max_attempts)
            .await?;
        report.claimed = messages.len();
        Span::current().record("claimed", messages.len());

        let mut settle_error = None;
        for message in &messages {
            let (outcome, skipped) = self.process(message).await;
            report.skipped += skipped;
            if let Err(err) = self.settle(&mut claim, message, outcome, &mut report).await {
                error!(message_id = %message.id, error = %err, "recording message outcome failed, releasing the rest of the batch");
                settle_error = Some(err);
                break;
            }
        }

        claim.commit().await?;
        if let Some(err) = settle_error {
            return Err(err);
        }

        if !report.is_empty() {
            info!(
                processed = report.processed,
                retried = report.retried,
                failed = report.failed,
                skipped = report.skipped,
                "tick finished"
            );
        }
        Ok(report)
    }

    /// Run every consumer of `message`. Returns the outcome and the number of
    /// consumers skipped as already applied. Store errors become retries.
    async fn process(&self, message: &MessageRecord) -> (Outcome, usize) {
        if let Err(e) = self.registry.check_payload(&message.event_type, &message.payload) {
            return (
                Outcome::Poison(format!("cannot deserialize '{}': {e}", message.event_type)),
                0,
            );
        }

        let consumers = self.registry.resolve(&message.event_type);
        if consumers.is_empty() {
            return (
                Outcome::Poison(format!("no consumer registered for '{}'", message.event_type)),
                0,
            );
        }

        let envelope = message.to_envelope();
        let mut skipped = 0;
        let mut transient: Vec<String> = Vec::new();
        let mut permanent: Vec<String> = Vec::new();

        for consumer in &consumers {
            match consume_in_transaction(self.store.as_ref(), consumer.as_ref(), &envelope, self.config.handler_timeout).await {
                Ok(Consumption::Applied) => {}
                Ok(Consumption::AlreadyApplied) => skipped += 1,
                Err(HandlerError::Permanent(reason)) => permanent.push(format!("{}: {reason}", consumer.name())),
                Err(err) => transient.push(format!("{}: {err}", consumer.name())),
            }
        }

        let outcome = if !permanent.is_empty() {
            permanent.extend(transient);
            Outcome::Poison(permanent.join("; "))
        } else if !transient.is_empty() {
            Outcome::Retry(transient.join("; "))
        } else {
            self.confirm_ledger(message, &consumers).await
        };
        (outcome, skipped)
    }

    /// `Processed` only if every consumer has a committed ledger entry.
    async fn confirm_ledger(
        &self,
        message: &MessageRecord,
        consumers: &[Arc<dyn MessageConsumer<S::Tx>>],
    ) -> Outcome {
        let recorded = match self.store.consumers_of(&self.table, message.id).await {
            Ok(names) => names,
            Err(e) => return Outcome::Retry(format!("cannot read consumption ledger: {e}")),
        };
        let missing: Vec<&str> = consumers
            .iter()
            .map(|c| c.name())
            .filter(|name| !recorded.iter().any(|r| r == name))
            .collect();
        if missing.is_empty() {
            Outcome::Processed
        } else {
            Outcome::Retry(format!("no ledger entry for {}", missing.join(", ")))
        }
    }

    async fn settle(
        &self,
        claim: &mut S::Tx,
        message: &MessageRecord,
        outcome: Outcome,
        report: &mut TickReport,
    ) -> Result<(), ProcessorError> {
        match outcome {
            Outcome::Processed => {
                claim.mark_processed(&self.table, message.id, Utc::now()).await?;
                debug!(message_id = %message.id, "message processed");
                report.processed += 1;
            }
            Outcome::Retry(reason) => {
                claim.record_failure(&self.table, message.id, &reason).await?;
                let attempts = message.attempts.saturating_add(1);
                if attempts >= self.config.max_attempts {
                    claim.mark_failed(&self.table, message.id, None).await?;
                    error!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        attempts,
                        error = %reason,
                        "message exhausted its attempts, marked failed"
                    );
                    report.failed += 1;
                } else {
                    warn!(message_id = %message.id, attempts, error = %reason, "message will be retried");
                    report.retried += 1;
                }
            }
            Outcome::Poison(reason) => {
                claim.record_failure(&self.table, message.id, &reason).await?;
                claim.mark_failed(&self.table, message.id, None).await?;
                error!(
                    message_id = %message.id,
                    event_type = %message.event_type,
                    error = %reason,
                    "poison message marked failed"
                );
                report.failed += 1;
            }
        }
        Ok(())
    }
}
