//! Redpanda event bus for Gavel.
//!
//! Implements the [`EventBus`] trait from `gavel-core` on rdkafka, so it works
//! against Redpanda or any other Kafka-compatible broker.
//!
//! # Mapping
//!
//! ```text
//! gavel                 Kafka
//! ─────────────────     ─────────────────────────────
//! topic              →  topic (auto-created)
//! queue              →  consumer group (group.id)
//! aggregate_id       →  record key (per-aggregate order)
//! MessageEnvelope    →  bincode record value
//! Delivery::ack      →  offset commit, once contiguous
//! Delivery::nack     →  redelivered from this process; offset held
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once.** Auto-commit is off. A delivery's offset is committed
//! only after it and every earlier offset of its partition were acked (see
//! [`OffsetTracker`]). A crash before the commit redelivers; consumers must
//! deduplicate on `message_id`.
//!
//! The producer waits for `acks=all` by default, so a successful
//! [`publish`](EventBus::publish) means the broker durably accepted the record
//! and the relay may mark its outbox row sent.
//!
//! # Example
//!
//! ```no_run
//! use gavel_core::event_bus::EventBus;
//! use gavel_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::new("localhost:9092")?;
//!
//! let mut deliveries = bus.subscribe("search", &["auction-created"]).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("{}", delivery.envelope().message_type);
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

mod offsets;

pub use offsets::OffsetTracker;

use futures::StreamExt;
use gavel_core::event_bus::{Acknowledger, Delivery, DeliveryStream, EventBus, EventBusError};
use gavel_core::message::MessageEnvelope;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// Serialize an envelope as a record value.
///
/// # Errors
///
/// Returns [`EventBusError::PublishFailed`] if the envelope cannot be encoded.
pub fn encode_envelope(topic: &str, envelope: &MessageEnvelope) -> Result<Vec<u8>, EventBusError> {
    bincode::serialize(envelope).map_err(|e| EventBusError::PublishFailed {
        topic: topic.to_string(),
        reason: format!("Failed to serialize envelope: {e}"),
    })
}

/// Deserialize a record value.
///
/// # Errors
///
/// Returns [`EventBusError::DeserializationFailed`] for a value that is not an
/// encoded envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<MessageEnvelope, EventBusError> {
    bincode::deserialize(bytes)
        .map_err(|e| EventBusError::DeserializationFailed(format!("Failed to deserialize envelope: {e}")))
}

/// Kafka-compatible event bus.
///
/// Publishing goes through one shared producer. Every
/// [`subscribe`](EventBus::subscribe) creates its own consumer in the queue's
/// group and a task that pumps records into the returned stream.
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create an event bus with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created (for example, malformed broker addresses).
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring an event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for a [`RedpandaEventBus`].
///
/// ```no_run
/// use gavel_redpanda::RedpandaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deliveries buffered between the Kafka consumer and the stream (at least 1).
    ///
    /// Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a queue without committed offsets starts reading.
    ///
    /// Default: `"earliest"`, so a queue bound after messages were published
    /// still receives them.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the event bus.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no brokers were set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let buffer_size = self.buffer_size.unwrap_or(1000);
        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            buffer_size,
            auto_offset_reset,
        })
    }
}

/// How a delivery was settled.
#[derive(Debug)]
enum Settle {
    Ack {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Nack {
        topic: String,
        partition: i32,
        offset: i64,
        envelope: MessageEnvelope,
    },
}

/// Reports a settlement back to the subscription task.
struct KafkaAcker {
    settle: mpsc::UnboundedSender<Settle>,
    topic: String,
    partition: i32,
    offset: i64,
    envelope: MessageEnvelope,
}

impl KafkaAcker {
    fn report(&self, settle: Settle) {
        if self.settle.send(settle).is_err() {
            tracing::debug!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                "Subscription closed before settlement; offset stays uncommitted"
            );
        }
    }
}

impl Acknowledger for KafkaAcker {
    fn ack(self: Box<Self>) {
        self.report(Settle::Ack {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        });
    }

    fn nack(self: Box<Self>) {
        let this = *self;
        this.report(Settle::Nack {
            topic: this.topic.clone(),
            partition: this.partition,
            offset: this.offset,
            envelope: this.envelope.clone(),
        });
    }
}

/// A record read off the wire, detached from the consumer's borrow.
struct Received {
    topic: String,
    partition: i32,
    offset: i64,
    envelope: Result<MessageEnvelope, EventBusError>,
}

impl Received {
    fn read(message: &BorrowedMessage<'_>) -> Self {
        let envelope = message.payload().map_or_else(
            || Err(EventBusError::DeserializationFailed("Record has no value".to_string())),
            decode_envelope,
        );
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            envelope,
        }
    }
}

fn commit(consumer: &StreamConsumer, queue: &str, topic: &str, partition: i32, next: i64) {
    let mut list = TopicPartitionList::new();
    let result = list
        .add_partition_offset(topic, partition, Offset::Offset(next))
        .and_then(|()| consumer.commit(&list, CommitMode::Async));
    if let Err(e) = result {
        tracing::warn!(
            queue = %queue,
            topic = %topic,
            partition,
            offset = next,
            error = %e,
            "Failed to commit offset (messages may be redelivered)"
        );
    }
}

/// Pump records into `deliveries` and settle acks until the stream is dropped.
async fn pump(
    consumer: StreamConsumer,
    queue: String,
    deliveries: mpsc::Sender<Result<Delivery, EventBusError>>,
    settle_tx: mpsc::UnboundedSender<Settle>,
    mut settle_rx: mpsc::UnboundedReceiver<Settle>,
) {
    let mut offsets = OffsetTracker::new();
    let mut stream = consumer.stream();

    loop {
        let outgoing = tokio::select! {
            () = deliveries.closed() => break,
            Some(settle) = settle_rx.recv() => match settle {
                Settle::Ack { topic, partition, offset } => {
                    if let Some(next) = offsets.ack(&topic, partition, offset) {
                        commit(&consumer, &queue, &topic, partition, next);
                    }
                    continue;
                }
                Settle::Nack { topic, partition, offset, envelope } => {
                    tracing::debug!(queue = %queue, topic = %topic, partition, offset, "Redelivering nacked message");
                    let acker = KafkaAcker {
                        settle: settle_tx.clone(),
                        topic: topic.clone(),
                        partition,
                        offset,
                        envelope: envelope.clone(),
                    };
                    Ok(Delivery::new(topic, envelope, acker))
                }
            },
            next = stream.next() => match next {
                None => break,
                Some(Err(e)) => Err(EventBusError::TransportError(format!("Failed to receive message: {e}"))),
                Some(Ok(message)) => {
                    let received = Received::read(&message);
                    offsets.track(&received.topic, received.partition, received.offset);
                    match received.envelope {
                        Ok(envelope) => {
                            tracing::trace!(
                                queue = %queue,
                                topic = %received.topic,
                                partition = received.partition,
                                offset = received.offset,
                                message_type = %envelope.message_type,
                                "Received message"
                            );
                            let acker = KafkaAcker {
                                settle: settle_tx.clone(),
                                topic: received.topic.clone(),
                                partition: received.partition,
                                offset: received.offset,
                                envelope: envelope.clone(),
                            };
                            Ok(Delivery::new(received.topic, envelope, acker))
                        }
                        Err(e) => {
                            // A poison record can never be handled; skip past it.
                            tracing::error!(
                                queue = %queue,
                                topic = %received.topic,
                                partition = received.partition,
                                offset = received.offset,
                                error = %e,
                                "Undecodable record skipped"
                            );
                            if let Some(next) = offsets.ack(&received.topic, received.partition, received.offset) {
                                commit(&consumer, &queue, &received.topic, received.partition, next);
                            }
                            Err(e)
                        }
                    }
                }
            },
        };

        if deliveries.send(outgoing).await.is_err() {
            break;
        }
    }

    tracing::debug!(queue = %queue, "Subscription task exiting");
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let encoded = encode_envelope(&topic, envelope);
        let key = envelope.aggregate_id.clone();
        let message_id = envelope.message_id;
        let timeout = self.timeout;

        Box::pin(async move {
            let payload = encoded?;
            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        message_id = %message_id,
                        "Message published"
                    );
                    Ok(())
                }
                Err((e, _)) => {
                    tracing::error!(topic = %topic, message_id = %message_id, error = %e, "Failed to publish message");
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: e.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        queue: &str,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let queue = queue.to_string();
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let failed = |reason: String| EventBusError::SubscriptionFailed {
                queue: queue.clone(),
                topics: topics.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &queue)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| failed(format!("Failed to subscribe to topics: {e}")))?;

            tracing::info!(
                queue = %queue,
                topics = ?topics,
                buffer_size = self.buffer_size,
                auto_offset_reset = %self.auto_offset_reset,
                "Queue bound"
            );

            let (tx, rx) = mpsc::channel(self.buffer_size);
            let (settle_tx, settle_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(consumer, queue, tx, settle_tx, settle_rx));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
