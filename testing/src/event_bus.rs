//! In-memory event bus with durable queues per consumer group.
//!
//! Models the broker semantics the runtime relies on:
//!
//! - publish routes a message to every queue bound to its topic
//! - each queue keeps messages until they are acknowledged
//! - a `nack` (or a dropped delivery) puts the message back at the head of its queue
//! - messages published before a queue is bound are not delivered to it
//!
//! Tests can make the broker unreachable or fail a number of publishes, and
//! inspect everything that was published.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use gavel_core::event_bus::{Acknowledger, Delivery, DeliveryStream, EventBus, EventBusError};
use gavel_core::message::MessageEnvelope;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct Queue {
    ready: VecDeque<(String, MessageEnvelope)>,
    unacked: usize,
    acked: usize,
    nacked: usize,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BusState {
    bindings: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, Queue>,
    published: Vec<(String, MessageEnvelope)>,
    unreachable: bool,
    failing_publishes: usize,
}

impl BusState {
    fn bind(&mut self, queue: &str, topics: &[&str]) {
        self.queues.entry(queue.to_string()).or_default();
        for topic in topics {
            self.bindings
                .entry((*topic).to_string())
                .or_default()
                .insert(queue.to_string());
        }
    }
}

/// Pops the next ready message of `queue`, counting it as unacked.
///
/// `None` when the queue is not declared.
#[allow(clippy::option_option)]
fn take_ready(
    state: &Mutex<BusState>,
    queue: &str,
) -> Option<Option<(String, MessageEnvelope)>> {
    let mut state = state.lock().unwrap();
    let q = state.queues.get_mut(queue)?;
    let item = q.ready.pop_front();
    if item.is_some() {
        q.unacked += 1;
    }
    Some(item)
}

/// In-memory broker for tests.
///
/// Cheap to clone; clones share the same broker.
///
/// # Example
///
/// ```
/// use gavel_testing::InMemoryEventBus;
///
/// let bus = InMemoryEventBus::new();
/// bus.bind("search", &["auction-created"]);
/// assert_eq!(bus.pending("search"), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryEventBus {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `queue` and bind it to `topics` without subscribing.
    pub fn bind(&self, queue: &str, topics: &[&str]) {
        self.state.lock().unwrap().bind(queue, topics);
    }

    /// Make every publish and subscribe fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Fail the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().unwrap().failing_publishes = count;
    }

    /// Every successfully published message, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, MessageEnvelope)> {
        self.state.lock().unwrap().published.clone()
    }

    /// Messages successfully published to `topic`, in publish order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<MessageEnvelope> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Messages waiting in `queue` (not yet delivered, or returned by `nack`).
    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    #[must_use]
    pub fn unacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked)
    }

    /// Total acknowledgements on `queue`.
    #[must_use]
    pub fn acked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.acked)
    }

    /// Total negative acknowledgements on `queue`.
    #[must_use]
    pub fn nacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.nacked)
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<BusState>>,
    queue: String,
    topic: String,
    envelope: MessageEnvelope,
}

impl Acknowledger for InMemoryAcker {
    fn ack(self: Box<Self>) {
        let mut state = self.state.lock().unwrap();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.unacked = queue.unacked.saturating_sub(1);
            queue.acked += 1;
        }
    }

    fn nack(self: Box<Self>) {
        let this = *self;
        let mut state = this.state.lock().unwrap();
        if let Some(queue) = state.queues.get_mut(&this.queue) {
            queue.unacked = queue.unacked.saturating_sub(1);
            queue.nacked += 1;
            queue.ready.push_front((this.topic, this.envelope));
            queue.notify.notify_one();
        }
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();

        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.unreachable {
                return Err(EventBusError::ConnectionFailed("broker unreachable".to_string()));
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "injected failure".to_string(),
                });
            }

            let queues: Vec<String> = state
                .bindings
                .get(&topic)
                .map(|qs| qs.iter().cloned().collect())
                .unwrap_or_default();
            for name in queues {
                if let Some(queue) = state.queues.get_mut(&name) {
                    queue.ready.push_back((topic.clone(), envelope.clone()));
                    queue.notify.notify_one();
                }
            }
            state.published.push((topic, envelope));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        queue: &str,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let queue = queue.to_string();
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let shared = Arc::clone(&self.state);

        Box::pin(async move {
            let notify = {
                let mut state = shared.lock().unwrap();
                if state.unreachable {
                    return Err(EventBusError::SubscriptionFailed {
                        queue,
                        topics,
                        reason: "broker unreachable".to_string(),
                    });
                }
                let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
                state.bind(&queue, &refs);
                state
                    .queues
                    .get(&queue)
                    .map(|q| Arc::clone(&q.notify))
                    .unwrap_or_default()
            };

            let stream = async_stream::stream! {
                // Ends once the queue no longer exists.
                while let Some(next) = take_ready(&shared, &queue) {
                    match next {
                        Some((topic, envelope)) => {
                            let acker = InMemoryAcker {
                                state: Arc::clone(&shared),
                                queue: queue.clone(),
                                topic: topic.clone(),
                                envelope: envelope.clone(),
                            };
                            yield Ok(Delivery::new(topic, envelope, acker));
                        }
                        None => notify.notified().await,
                    }
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn envelope(aggregate: &str) -> MessageEnvelope {
        MessageEnvelope {
            message_id: Uuid::new_v4(),
            message_type: "AuctionCreated".into(),
            aggregate_id: aggregate.into(),
            payload: b"{}".to_vec(),
            sent_at: Utc::now(),
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn each_queue_gets_its_own_copy() {
        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created"]);
        bus.bind("notifications", &["auction-created"]);

        bus.publish("auction-created", &envelope("a")).await.unwrap();

        assert_eq!(bus.pending("search"), 1);
        assert_eq!(bus.pending("notifications"), 1);
    }

    #[tokio::test]
    async fn unbound_topics_are_not_delivered() {
        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created"]);

        bus.publish("bid-placed", &envelope("a")).await.unwrap();

        assert_eq!(bus.pending("search"), 0);
        assert_eq!(bus.published_to("bid-placed").len(), 1);
    }

    #[tokio::test]
    async fn ack_removes_and_nack_requeues_at_head() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe("search", &["auction-created"]).await.unwrap();
        let first = envelope("a");
        let second = envelope("b");
        bus.publish("auction-created", &first).await.unwrap();
        bus.publish("auction-created", &second).await.unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.envelope().message_id, first.message_id);
        delivery.nack();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.envelope().message_id, first.message_id);
        again.ack();

        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.envelope().message_id, second.message_id);
        drop(next);

        assert_eq!(bus.acked("search"), 1);
        assert_eq!(bus.nacked("search"), 2);
        assert_eq!(bus.pending("search"), 1);
    }

    #[tokio::test]
    async fn stream_wakes_on_publish() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe("search", &["auction-created"]).await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish("auction-created", &envelope("a")).await.unwrap();
        });

        let delivery = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .expect("delivery should arrive")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope().aggregate_id, "a");
        delivery.ack();
    }

    #[tokio::test]
    async fn drained_stream_stays_open_for_later_messages() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe("search", &["auction-created"]).await.unwrap();
        bus.publish("auction-created", &envelope("a")).await.unwrap();
        stream.next().await.unwrap().unwrap().ack();

        let idle =
            tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await;
        assert!(idle.is_err(), "an empty queue should park the stream");

        bus.publish("auction-created", &envelope("b")).await.unwrap();
        let later = stream.next().await.unwrap().unwrap();
        assert_eq!(later.envelope().aggregate_id, "b");
        later.ack();
        assert_eq!(bus.acked("search"), 2);
    }

    #[tokio::test]
    async fn unreachable_broker_rejects_publish() {
        let bus = InMemoryEventBus::new();
        bus.set_unreachable(true);
        assert!(matches!(
            bus.publish("auction-created", &envelope("a")).await,
            Err(EventBusError::ConnectionFailed(_))
        ));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);
        assert!(bus.publish("t", &envelope("a")).await.is_err());
        assert!(bus.publish("t", &envelope("a")).await.is_ok());
    }
}
