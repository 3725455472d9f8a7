//! Redis pub/sub transport for integration events (optional).
//!
//! Redis pub/sub is not durable: an envelope published while no listener is connected
//! is lost. Publishing therefore fails when Redis reports zero receivers, so the outbox
//! message stays pending and is published again on a later tick. Republishing is safe
//! because the receiving inbox deduplicates by id. For delivery that survives a
//! listener restart, forward into the inbox directly instead.

use std::thread;

use redis::Commands;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_core::ModuleName;
use courier_events::{EventBus, MessageEnvelope, Subscription};

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no subscriber on channel '{channel}'")]
    NoSubscribers { channel: String },
}

/// Channel carrying the integration events published by `module`.
pub fn channel_for(module: &ModuleName) -> String {
    format!("courier:{module}")
}

pub fn encode(envelope: &MessageEnvelope) -> Result<String, RedisBusError> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn decode(payload: &str) -> Result<MessageEnvelope, RedisBusError> {
    Ok(serde_json::from_str(payload)?)
}

/// `PUBLISH` returns how many clients received the message; zero means it was lost.
fn check_receivers(channel: &str, receivers: i64) -> Result<(), RedisBusError> {
    if receivers <= 0 {
        return Err(RedisBusError::NoSubscribers {
            channel: channel.to_string(),
        });
    }
    Ok(())
}

/// Redis pub/sub bus for message envelopes, one channel per publishing module.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, module: &ModuleName) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self {
            client,
            channel: channel_for(module),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<MessageEnvelope> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: MessageEnvelope) -> Result<(), Self::Error> {
        let payload = encode(&message)?;
        let mut conn = self.client.get_connection()?;
        let receivers: i64 = conn.publish(&self.channel, payload)?;
        check_receivers(&self.channel, receivers)?;
        debug!(channel = %self.channel, message_id = %message.id(), receivers, "published");
        Ok(())
    }

    fn subscribe(&self) -> Subscription<MessageEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Blocking pub/sub reader; exits when the connection or the subscription drops.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    warn!(channel = %channel, error = %err, "redis subscribe connection failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channel) {
                warn!(channel = %channel, error = %err, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let envelope = match decode(&payload) {
                    Ok(e) => e,
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "dropping undecodable envelope");
                        continue;
                    }
                };

                if tx.send(envelope).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use courier_core::EventId;

    use super::*;

    #[test]
    fn zero_receivers_is_a_failed_publish() {
        let err = check_receivers("courier:orders", 0).unwrap_err();
        assert!(matches!(&err, RedisBusError::NoSubscribers { channel } if channel == "courier:orders"));
        assert!(check_receivers("courier:orders", 2).is_ok());
    }

    #[test]
    fn channel_is_scoped_by_module() {
        assert_eq!(channel_for(&ModuleName::new("orders").unwrap()), "courier:orders");
    }

    #[test]
    fn wire_format_preserves_the_envelope() {
        let envelope = MessageEnvelope::new(EventId::new(), "orders.order_placed", json!({ "total": 5 }), Utc::now());
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode("not json"), Err(RedisBusError::Encode(_))));
    }
}
