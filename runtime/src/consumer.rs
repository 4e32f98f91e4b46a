//! Queue consumer with bounded redelivery and dead-lettering.
//!
//! `EventConsumer` owns the subscribe-process-reconnect loop for one queue and
//! gives every broker the same failure semantics:
//!
//! ```text
//! loop {
//!     subscribe(queue, topics)
//!     for each delivery (at most `prefetch` in flight):
//!         attempt handler
//!           Ok            → ack
//!           Err, n < max  → wait interval, attempt again
//!           Err, n == max → publish verbatim to <queue>-error with fault headers, ack
//!     stream ended → wait retry_delay, resubscribe
//! }
//! ```
//!
//! # Shutdown
//!
//! When the shutdown signal flips the consumer stops pulling new deliveries
//! and waits for running handlers to finish. A delivery that is waiting out
//! its redelivery interval is `nack`ed so the broker keeps it; no handler is
//! interrupted mid-write.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = HandlerRegistry::new()
//!     .on::<AuctionCreated, _>(projection.clone())
//!     .on::<AuctionUpdated, _>(projection);
//!
//! let handle = EventConsumer::new("search", event_bus, registry, shutdown_rx)
//!     .with_policy(RedeliveryPolicy::default())
//!     .with_prefetch(16)
//!     .spawn();
//! ```

use crate::delivery::{InFlight, Step};
use crate::handlers::{HandlerError, HandlerRegistry, MessageContext};
use crate::metrics::ConsumerMetrics;
use crate::retry::RedeliveryPolicy;
use futures::StreamExt;
use gavel_core::environment::{Clock, SystemClock};
use gavel_core::event_bus::{Delivery, DeliveryStream, EventBus};
use gavel_core::fault::FaultInfo;
use gavel_core::topic::error_topic;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Parts of a consumer shared with its per-delivery tasks.
struct Shared {
    queue: String,
    event_bus: Arc<dyn EventBus>,
    registry: HandlerRegistry,
    policy: RedeliveryPolicy,
    clock: Arc<dyn Clock>,
}

/// Consumer for one durable queue.
///
/// # Configuration
///
/// - `queue`: consumer group / queue name, also the inbox consumer id
/// - `topics`: defaults to the topics of the registry's message types
/// - `policy`: redelivery attempts and interval (default 5 × 5s)
/// - `prefetch`: maximum unacknowledged deliveries (default 16)
/// - `retry_delay`: wait before resubscribing after a failure (default 5s)
pub struct EventConsumer {
    queue: String,
    event_bus: Arc<dyn EventBus>,
    registry: HandlerRegistry,
    topics: Vec<String>,
    policy: RedeliveryPolicy,
    clock: Arc<dyn Clock>,
    prefetch: usize,
    retry_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl EventConsumer {
    /// Create a consumer for `queue` dispatching through `registry`.
    ///
    /// `shutdown` flips to `true` (or its sender is dropped) to stop the consumer.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        event_bus: Arc<dyn EventBus>,
        registry: HandlerRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let topics = registry.topics();
        Self {
            queue: queue.into(),
            event_bus,
            registry,
            topics,
            policy: RedeliveryPolicy::default(),
            clock: Arc::new(SystemClock),
            prefetch: 16,
            retry_delay: Duration::from_secs(5),
            shutdown,
        }
    }

    /// Subscribe to these topics instead of the registry's.
    #[must_use]
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    /// Set the redelivery policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the clock used for fault timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the maximum number of unacknowledged deliveries (minimum 1).
    #[must_use]
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the wait before resubscribing after the stream ends or subscribe fails.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Queue this consumer reads.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Topics this consumer binds.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown.
    pub async fn run(self) {
        let Self {
            queue,
            event_bus,
            registry,
            topics,
            policy,
            clock,
            prefetch,
            retry_delay,
            mut shutdown,
        } = self;

        let shared = Arc::new(Shared {
            queue,
            event_bus,
            registry,
            policy,
            clock,
        });
        let queue = shared.queue.as_str();
        info!(queue = %queue, topics = ?topics, "Event consumer started");

        while !is_shutting_down(&shutdown) {
            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            let subscription = tokio::select! {
                _ = shutdown.changed() => break,
                result = shared.event_bus.subscribe(queue, &topic_refs) => result,
            };

            match subscription {
                Ok(stream) => {
                    info!(queue = %queue, "Subscribed to event bus");
                    process_stream(&shared, stream, prefetch, &mut shutdown).await;
                    if is_shutting_down(&shutdown) {
                        break;
                    }
                    warn!(queue = %queue, retry_delay = ?retry_delay, "Event stream ended, resubscribing");
                }
                Err(e) => {
                    error!(
                        queue = %queue,
                        error = %e,
                        retry_delay = ?retry_delay,
                        "Failed to subscribe to event bus"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(retry_delay) => {}
            }
        }

        info!(queue = %queue, "Event consumer stopped");
    }
}

fn is_shutting_down(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Pull deliveries until the stream ends or shutdown, then drain in-flight tasks.
async fn process_stream(
    shared: &Arc<Shared>,
    mut stream: DeliveryStream,
    prefetch: usize,
    shutdown: &mut watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(prefetch));
    let mut tasks = JoinSet::new();

    loop {
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(queue = %shared.queue, error = %e, "Delivery task failed");
            }
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                let shared = Arc::clone(shared);
                let task_shutdown = shutdown.clone();
                tasks.spawn(async move {
                    process_delivery(&shared, delivery, task_shutdown).await;
                    drop(permit);
                });
            }
            Some(Err(e)) => {
                error!(queue = %shared.queue, error = %e, "Error receiving from event stream");
            }
            None => {
                warn!(queue = %shared.queue, "Event stream ended");
                break;
            }
        }
    }

    let in_flight = tasks.len();
    if in_flight > 0 {
        info!(queue = %shared.queue, in_flight, "Waiting for in-flight handlers");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(queue = %shared.queue, error = %e, "Delivery task failed");
        }
    }
}

/// Drive one delivery through its redelivery state machine.
async fn process_delivery(shared: &Shared, delivery: Delivery, mut shutdown: watch::Receiver<bool>) {
    let envelope = delivery.envelope().clone();
    let topic = delivery.topic().to_string();
    let mut inflight = InFlight::new(shared.policy, shared.queue.clone(), topic.clone());

    let Some(handler) = shared.registry.resolve(&envelope.message_type) else {
        let info = inflight.give_up(
            HandlerError::rejected(
                "NoHandler",
                format!("no handler for {} on queue {}", envelope.message_type, shared.queue),
            ),
            shared.clock.now(),
        );
        dead_letter(shared, delivery, info).await;
        return;
    };

    loop {
        let attempt = inflight.begin_attempt();
        let ctx = MessageContext::new(&envelope, &shared.queue, &topic, attempt);
        let started = Instant::now();
        let result = handler.handle(&ctx, &envelope).await;
        ConsumerMetrics::record_attempt(&shared.queue, started.elapsed());

        if let Err(e) = &result {
            warn!(
                queue = %shared.queue,
                message_id = %envelope.message_id,
                message_type = %envelope.message_type,
                attempt,
                kind = %e.kind,
                error = %e,
                "Handler failed"
            );
        }

        match inflight.complete(result, shared.clock.now()) {
            Step::Ack => {
                debug!(
                    queue = %shared.queue,
                    message_id = %envelope.message_id,
                    attempt,
                    "Message handled"
                );
                ConsumerMetrics::record_handled(&shared.queue);
                delivery.ack();
                return;
            }
            Step::Retry { after } => {
                ConsumerMetrics::record_redelivery(&shared.queue);
                if *shutdown.borrow() {
                    ConsumerMetrics::record_nack(&shared.queue);
                    delivery.nack();
                    return;
                }
                tokio::select! {
                    () = tokio::time::sleep(after) => {}
                    _ = shutdown.changed() => {
                        info!(
                            queue = %shared.queue,
                            message_id = %envelope.message_id,
                            "Shutdown during redelivery wait, returning message to broker"
                        );
                        ConsumerMetrics::record_nack(&shared.queue);
                        delivery.nack();
                        return;
                    }
                }
            }
            Step::DeadLetter(info) => {
                dead_letter(shared, delivery, info).await;
                return;
            }
        }
    }
}

/// Move a delivery verbatim to `<queue>-error`, then ack it.
///
/// If the dead-letter publish fails the delivery is `nack`ed instead, so the
/// message is never lost.
async fn dead_letter(shared: &Shared, delivery: Delivery, info: FaultInfo) {
    let topic = error_topic(&shared.queue);
    let tagged = info.tag(delivery.envelope().clone());

    match shared.event_bus.publish(&topic, &tagged).await {
        Ok(()) => {
            warn!(
                queue = %shared.queue,
                message_id = %tagged.message_id,
                message_type = %tagged.message_type,
                exception_type = %info.exception_type,
                attempts = info.attempts,
                dead_letter_topic = %topic,
                "Message dead-lettered"
            );
            ConsumerMetrics::record_dead_letter(&shared.queue, &info.exception_type);
            delivery.ack();
        }
        Err(e) => {
            error!(
                queue = %shared.queue,
                message_id = %tagged.message_id,
                error = %e,
                "Failed to dead-letter message, returning it to the broker"
            );
            ConsumerMetrics::record_nack(&shared.queue);
            delivery.nack();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handlers::{Handler, MessageHandler};
    use async_trait::async_trait;
    use gavel_core::fault::{FaultKind, headers};
    use gavel_core::message::{Message, MessageEnvelope};
    use gavel_testing::InMemoryEventBus;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct AuctionCreated {
        id: String,
    }

    impl Message for AuctionCreated {
        const MESSAGE_TYPE: &'static str = "AuctionCreated";
        fn aggregate_id(&self) -> String {
            self.id.clone()
        }
    }

    /// Fails the first `failures` attempts.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Handler<AuctionCreated> for Flaky {
        async fn handle(&self, _ctx: &MessageContext, _message: AuctionCreated) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(HandlerError::invalid_argument("Foo is not allowed"))
            } else {
                Ok(())
            }
        }
    }

    async fn publish_created(bus: &InMemoryEventBus, id: &str) -> MessageEnvelope {
        let envelope =
            MessageEnvelope::encode(Uuid::new_v4(), &AuctionCreated { id: id.into() }, chrono::Utc::now())
                .unwrap();
        bus.publish("auction-created", &envelope).await.unwrap();
        envelope
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handled_message_is_acked() {
        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created"]);
        let handler = Flaky::new(0);
        let (tx, rx) = watch::channel(false);

        let consumer = EventConsumer::new(
            "search",
            Arc::new(bus.clone()),
            HandlerRegistry::new().on::<AuctionCreated, _>(Arc::clone(&handler)),
            rx,
        )
        .spawn();

        publish_created(&bus, "a1").await;
        settle().await;

        assert_eq!(bus.acked("search"), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_handler_dead_letters_exactly_once() {
        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created"]);
        let handler = Flaky::new(u32::MAX);
        let (tx, rx) = watch::channel(false);

        let consumer = EventConsumer::new(
            "search",
            Arc::new(bus.clone()),
            HandlerRegistry::new().on::<AuctionCreated, _>(Arc::clone(&handler)),
            rx,
        )
        .with_policy(RedeliveryPolicy::new(5, Duration::from_secs(5)))
        .spawn();

        let original = publish_created(&bus, "a1").await;

        // 4 waits of 5s between 5 attempts
        for _ in 0..4 {
            settle().await;
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        let dead = bus.published_to("search-error");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, original.message_id);
        assert_eq!(dead[0].payload, original.payload);
        assert_eq!(dead[0].header(headers::EXCEPTION_TYPE), Some("InvalidArgument"));
        assert_eq!(dead[0].header(headers::ATTEMPTS), Some("5"));
        assert_eq!(dead[0].header(headers::KIND), Some(FaultKind::Rejected.as_str()));
        assert_eq!(bus.acked("search"), 1);
        assert_eq!(bus.pending("search"), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(bus.published_to("search-error").len(), 1);

        tx.send(true).unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_redelivery() {
        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created"]);
        let handler = Flaky::new(2);
        let (tx, rx) = watch::channel(false);

        let consumer = EventConsumer::new(
            "search",
            Arc::new(bus.clone()),
            HandlerRegistry::new().on::<AuctionCreated, _>(Arc::clone(&handler)),
            rx,
        )
        .spawn();

        publish_created(&bus, "a1").await;
        for _ in 0..2 {
            settle().await;
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.acked("search"), 1);
        assert!(bus.published_to("search-error").is_empty());

        tx.send(true).unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dead_letter_publish_returns_message() {
        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created"]);
        let handler = Flaky::new(u32::MAX);
        let (tx, rx) = watch::channel(false);

        let consumer = EventConsumer::new(
            "search",
            Arc::new(bus.clone()),
            HandlerRegistry::new().on::<AuctionCreated, _>(Arc::clone(&handler)),
            rx,
        )
        .with_policy(RedeliveryPolicy::new(1, Duration::from_secs(5)))
        .spawn();

        let original = publish_created(&bus, "a1").await;
        bus.fail_next_publishes(1);
        settle().await;

        // First dead-letter publish failed, so the broker redelivered the message
        // and the second round reached the error topic.
        assert_eq!(bus.nacked("search"), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let dead = bus.published_to("search-error");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, original.message_id);
        assert_eq!(bus.acked("search"), 1);

        tx.send(true).unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_redelivery_wait_nacks() {
        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created"]);
        let handler = Flaky::new(u32::MAX);
        let (tx, rx) = watch::channel(false);

        let consumer = EventConsumer::new(
            "search",
            Arc::new(bus.clone()),
            HandlerRegistry::new().on::<AuctionCreated, _>(Arc::clone(&handler)),
            rx,
        )
        .spawn();

        publish_created(&bus, "a1").await;
        settle().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        consumer.await.unwrap();

        assert_eq!(bus.pending("search"), 1);
        assert_eq!(bus.acked("search"), 0);
        assert!(bus.published_to("search-error").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unrouted_message_type_is_dead_lettered_without_retry() {
        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created", "mystery-happened"]);
        let (tx, rx) = watch::channel(false);

        let consumer = EventConsumer::new(
            "search",
            Arc::new(bus.clone()),
            HandlerRegistry::new().on::<AuctionCreated, _>(Flaky::new(0)),
            rx,
        )
        .with_topics(vec!["auction-created".into(), "mystery-happened".into()])
        .spawn();

        let mut envelope = publish_created(&bus, "a1").await;
        envelope.message_id = Uuid::new_v4();
        envelope.message_type = "MysteryHappened".into();
        bus.publish("mystery-happened", &envelope).await.unwrap();
        settle().await;

        let dead = bus.published_to("search-error");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header(headers::EXCEPTION_TYPE), Some("NoHandler"));
        assert_eq!(bus.acked("search"), 2);

        tx.send(true).unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_bounds_unacked_deliveries() {
        struct Stuck;

        #[async_trait]
        impl MessageHandler for Stuck {
            async fn handle(&self, _ctx: &MessageContext, _envelope: &MessageEnvelope) -> Result<(), HandlerError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let bus = InMemoryEventBus::new();
        bus.bind("search", &["auction-created"]);
        let (tx, rx) = watch::channel(false);

        let consumer = EventConsumer::new(
            "search",
            Arc::new(bus.clone()),
            HandlerRegistry::new().on_raw("AuctionCreated", Arc::new(Stuck)),
            rx,
        )
        .with_prefetch(2)
        .spawn();

        for i in 0..5 {
            publish_created(&bus, &format!("a{i}")).await;
        }
        settle().await;

        assert_eq!(bus.unacked("search"), 2);
        assert_eq!(bus.pending("search"), 3);

        tx.send(true).unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        consumer.await.unwrap();
        assert_eq!(bus.acked("search"), 2);
    }
}
