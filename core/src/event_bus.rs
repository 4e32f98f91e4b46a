//! Event bus abstraction for topic-routed publish and queue-bound consumption.
//!
//! This module provides the [`EventBus`] trait. Publishers send a
//! [`MessageEnvelope`] to a topic; each consumer group binds its own durable
//! queue to a set of topics and receives every message published to them.
//!
//! # Architecture
//!
//! ```text
//!  outbox relay
//!       │ publish(topic, envelope)
//!       ▼
//! ┌─────────────────┐
//! │   topic         │  auction-created, bid-placed, ...
//! └────────┬────────┘
//!     ┌────┴─────┬──────────────┐
//!     ▼          ▼              ▼
//! ┌────────┐ ┌────────┐ ┌───────────────┐
//! │ search │ │auction │ │ notifications │   one durable queue per group
//! └────────┘ └────────┘ └───────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a message is delivered until it is acknowledged
//! - **Explicit acknowledgement**: every [`Delivery`] must be `ack`ed or `nack`ed;
//!   dropping one unacknowledged is a `nack`
//! - **Idempotency**: consumers deduplicate on `message_id`
//! - **Ordered within partition**: messages of one aggregate keep their order
//!
//! Bounded redelivery and dead-lettering are layered on top by the runtime's
//! `EventConsumer`, so every implementation of this trait gets identical
//! failure semantics.
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (gavel-testing) - for tests
//! - `RedpandaEventBus` (gavel-redpanda) - Kafka-compatible production bus

use crate::message::MessageEnvelope;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for queue '{queue}' on topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// Queue (consumer group) that failed to bind
        queue: String,
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize a message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Settles a delivery with the broker.
///
/// Implemented by each event bus. Exactly one of the two methods is called
/// for every delivery.
pub trait Acknowledger: Send + Sync {
    /// The message was handled; the broker may forget it.
    fn ack(self: Box<Self>);

    /// The message was not handled; the broker must deliver it again.
    fn nack(self: Box<Self>);
}

/// A message received from a queue, pending acknowledgement.
///
/// Dropping a `Delivery` without calling [`Delivery::ack`] returns the message
/// to the broker, the same as [`Delivery::nack`]. A consumer that is cancelled
/// mid-handler therefore never loses a message.
pub struct Delivery {
    topic: String,
    envelope: MessageEnvelope,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// Create a delivery settled by `acker`.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        envelope: MessageEnvelope,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            envelope,
            acker: Some(Box::new(acker)),
        }
    }

    /// Topic the message was published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The delivered message.
    #[must_use]
    pub const fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    /// Acknowledge the message.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    /// Reject the message so it is redelivered.
    pub fn nack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("message_id", &self.envelope.message_id)
            .field("message_type", &self.envelope.message_type)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn EventBus>` between the relay, consumers and
/// the compensation path.
pub trait EventBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// Returning `Ok` means the broker has durably accepted the message.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] (or a connection error) if the
    /// broker did not accept the message. Callers must assume it may still
    /// have been delivered.
    fn publish(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Bind `queue` to `topics` and stream its deliveries.
    ///
    /// Every distinct queue receives its own copy of each message; multiple
    /// subscribers of the same queue share its messages.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the queue cannot be bound.
    fn subscribe(
        &self,
        queue: &str,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl Acknowledger for Recorder {
        fn ack(self: Box<Self>) {
            self.0.lock().unwrap().push("ack");
        }
        fn nack(self: Box<Self>) {
            self.0.lock().unwrap().push("nack");
        }
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            message_id: Uuid::new_v4(),
            message_type: "Pinged".into(),
            aggregate_id: "a".into(),
            payload: b"{}".to_vec(),
            sent_at: Utc::now(),
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn ack_settles_once() {
        let recorder = Recorder::default();
        let delivery = Delivery::new("pinged", envelope(), recorder.clone());
        delivery.ack();
        assert_eq!(*recorder.0.lock().unwrap(), vec!["ack"]);
    }

    #[test]
    fn dropping_unsettled_delivery_nacks() {
        let recorder = Recorder::default();
        {
            let _delivery = Delivery::new("pinged", envelope(), recorder.clone());
        }
        assert_eq!(*recorder.0.lock().unwrap(), vec!["nack"]);
    }

    #[test]
    fn explicit_nack_is_not_repeated_on_drop() {
        let recorder = Recorder::default();
        Delivery::new("pinged", envelope(), recorder.clone()).nack();
        assert_eq!(*recorder.0.lock().unwrap(), vec!["nack"]);
    }
}
