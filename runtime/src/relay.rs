//! Outbox relay.
//!
//! Drains unsent outbox records into the event bus on a fixed interval.
//!
//! ```text
//! every interval:
//!     try_acquire_lease(instance)         ── not held → skip tick
//!     fetch_unsent(batch_size)            ── oldest first
//!     for record:
//!         aggregate blocked this tick?    ── defer
//!         publish(topic_for(type), env)   ── broker down → defer rest of batch
//!         mark_sent(id)                   ── failure → block aggregate
//!     purge_sent_before(now - retention)
//! ```
//!
//! Delivery is at-least-once: a crash between publish and `mark_sent` means
//! the record is published again on the next tick with the same message id,
//! and consumers discard it through their inbox. Records of one aggregate are
//! never published out of enqueue order; once one fails, the rest of that
//! aggregate waits for the next tick.

use crate::metrics::OutboxMetrics;
use chrono::{DateTime, Utc};
use gavel_core::environment::{Clock, SystemClock};
use gavel_core::event_bus::{EventBus, EventBusError};
use gavel_core::outbox::{OutboxError, OutboxStore};
use gavel_core::topic::topic_for;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors that abort a relay tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Outbox could not be read or the lease could not be taken
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Relay configuration.
///
/// # Default Values
///
/// - `interval`: 10 seconds
/// - `batch_size`: 100
/// - `retention`: 7 days (`None` keeps sent records forever)
/// - `lease_ttl`: 30 seconds
/// - `instance_id`: `relay-<random uuid>`
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Time between ticks
    pub interval: Duration,
    /// Maximum records fetched per tick
    pub batch_size: usize,
    /// How long sent records are kept
    pub retention: Option<Duration>,
    /// Lease duration; must exceed `interval` for the holder to keep it
    pub lease_ttl: Duration,
    /// Lease holder name for this process
    pub instance_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 100,
            retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            lease_ttl: Duration::from_secs(30),
            instance_id: format!("relay-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl RelayConfig {
    /// Set the tick interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the batch size (minimum 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the retention for sent records.
    #[must_use]
    pub const fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Set the lease holder name.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }
}

/// Outcome of one relay tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Whether this instance held the lease (nothing else happens without it)
    pub lease_held: bool,
    /// Records published and marked sent
    pub published: usize,
    /// Records whose publish or mark-sent failed
    pub failed: usize,
    /// Records left for the next tick to keep per-aggregate order
    pub deferred: usize,
    /// Sent records removed by retention
    pub purged: u64,
}

/// Periodic outbox drainer.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl OutboxRelay {
    /// Create a relay over `store` publishing to `event_bus`.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, event_bus: Arc<dyn EventBus>, config: RelayConfig) -> Self {
        Self {
            store,
            event_bus,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Use `clock` for sent timestamps, lease expiry and retention.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Relay configuration.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run a single tick.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Outbox`] if the lease cannot be taken or unsent
    /// records cannot be read. Publish and mark-sent failures are not errors;
    /// they are counted in the report and retried next tick.
    pub async fn run_once(&self) -> Result<RelayReport, RelayError> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = RelayReport::default();

        report.lease_held = self
            .store
            .try_acquire_lease(&self.config.instance_id, self.config.lease_ttl, now)
            .await?;
        if !report.lease_held {
            debug!(instance = %self.config.instance_id, "Relay lease held elsewhere, skipping tick");
            return Ok(report);
        }

        let records = self.store.fetch_unsent(self.config.batch_size).await?;
        let mut blocked: HashSet<String> = HashSet::new();
        let mut broker_down = false;

        for record in records {
            if broker_down || blocked.contains(&record.aggregate_id) {
                report.deferred += 1;
                continue;
            }

            let topic = topic_for(&record.message_type);
            let envelope = record.to_envelope(self.clock.now());

            match self.event_bus.publish(&topic, &envelope).await {
                Ok(()) => {}
                Err(EventBusError::ConnectionFailed(reason)) => {
                    warn!(
                        record_id = %record.id,
                        topic = %topic,
                        reason = %reason,
                        "Broker unreachable, deferring remaining outbox records"
                    );
                    report.failed += 1;
                    broker_down = true;
                    continue;
                }
                Err(e) => {
                    warn!(
                        record_id = %record.id,
                        aggregate_id = %record.aggregate_id,
                        topic = %topic,
                        error = %e,
                        "Failed to publish outbox record"
                    );
                    report.failed += 1;
                    blocked.insert(record.aggregate_id);
                    continue;
                }
            }

            match self.store.mark_sent(record.id, envelope.sent_at).await {
                Ok(()) => {
                    debug!(record_id = %record.id, topic = %topic, "Outbox record published");
                    report.published += 1;
                }
                Err(e) => {
                    // Already published: the next tick publishes it again and
                    // consumers drop the duplicate.
                    warn!(
                        record_id = %record.id,
                        aggregate_id = %record.aggregate_id,
                        error = %e,
                        "Failed to mark outbox record sent"
                    );
                    report.failed += 1;
                    blocked.insert(record.aggregate_id);
                }
            }
        }

        if let Some(cutoff) = self.retention_cutoff(now) {
            match self.store.purge_sent_before(cutoff).await {
                Ok(purged) => {
                    report.purged = purged;
                    if purged > 0 {
                        info!(purged, cutoff = %cutoff, "Purged sent outbox records");
                        OutboxMetrics::record_purged(purged);
                    }
                }
                Err(e) => warn!(error = %e, "Failed to purge sent outbox records"),
            }
        }

        OutboxMetrics::record_tick(report.published, report.failed, report.deferred, started.elapsed());
        Ok(report)
    }

    fn retention_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let retention = chrono::Duration::from_std(self.config.retention?).ok()?;
        now.checked_sub_signed(retention)
    }

    /// Spawn the relay loop as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Tick until shutdown. A tick in progress always completes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance = %self.config.instance_id,
            interval = ?self.config.interval,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(report) if report.published > 0 || report.failed > 0 => {
                    info!(
                        published = report.published,
                        failed = report.failed,
                        deferred = report.deferred,
                        "Relay tick"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Relay tick failed"),
            }
        }

        info!(instance = %self.config.instance_id, "Outbox relay stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use gavel_core::outbox::OutboxRecord;
    use gavel_testing::{InMemoryEventBus, InMemoryOutboxStore, ManualClock, test_epoch};
    use uuid::Uuid;

    fn record(aggregate: &str, message_type: &str) -> OutboxRecord {
        OutboxRecord {
            id: Uuid::new_v4(),
            aggregate_id: aggregate.into(),
            message_type: message_type.into(),
            payload: br#"{"id":"x"}"#.to_vec(),
            enqueued_at: test_epoch(),
            sent_at: None,
        }
    }

    struct Fixture {
        store: InMemoryOutboxStore,
        bus: InMemoryEventBus,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryOutboxStore::new(),
                bus: InMemoryEventBus::new(),
                clock: ManualClock::new(test_epoch()),
            }
        }

        fn relay(&self, instance: &str) -> OutboxRelay {
            OutboxRelay::new(
                Arc::new(self.store.clone()),
                Arc::new(self.bus.clone()),
                RelayConfig::default().with_instance_id(instance),
            )
            .with_clock(Arc::new(self.clock.clone()))
        }
    }

    #[tokio::test]
    async fn publishes_to_kebab_topic_and_marks_sent() {
        let fx = Fixture::new();
        let r = record("a1", "AuctionCreated");
        fx.store.append(r.clone()).await.unwrap();

        let report = fx.relay("r1").run_once().await.unwrap();

        assert_eq!(report.published, 1);
        let published = fx.bus.published_to("auction-created");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id, r.id);
        assert_eq!(published[0].aggregate_id, "a1");
        assert_eq!(fx.store.unsent_count(), 0);
    }

    #[tokio::test]
    async fn broker_outage_defers_everything_and_loses_nothing() {
        let fx = Fixture::new();
        for i in 0..3 {
            fx.store.append(record(&format!("a{i}"), "AuctionCreated")).await.unwrap();
        }
        let relay = fx.relay("r1");

        fx.bus.set_unreachable(true);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(fx.store.unsent_count(), 3);

        fx.bus.set_unreachable(false);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(fx.bus.published_to("auction-created").len(), 3);
    }

    #[tokio::test]
    async fn failed_publish_defers_later_records_of_same_aggregate() {
        let fx = Fixture::new();
        let created = record("a1", "AuctionCreated");
        let updated = record("a1", "AuctionUpdated");
        let other = record("a2", "AuctionCreated");
        for r in [&created, &updated, &other] {
            fx.store.append(r.clone()).await.unwrap();
        }
        let relay = fx.relay("r1");

        fx.bus.fail_next_publishes(1);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.published, 1);
        assert!(fx.bus.published_to("auction-updated").is_empty());

        relay.run_once().await.unwrap();
        let order: Vec<Uuid> = fx
            .bus
            .published()
            .into_iter()
            .filter(|(_, e)| e.aggregate_id == "a1")
            .map(|(_, e)| e.message_id)
            .collect();
        assert_eq!(order, vec![created.id, updated.id]);
    }

    #[tokio::test]
    async fn failed_mark_sent_republishes_same_message_id() {
        let fx = Fixture::new();
        let r = record("a1", "AuctionCreated");
        let later = record("a1", "AuctionUpdated");
        fx.store.append(r.clone()).await.unwrap();
        fx.store.append(later.clone()).await.unwrap();
        let relay = fx.relay("r1");

        fx.store.fail_next_marks(1);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);

        relay.run_once().await.unwrap();
        let created = fx.bus.published_to("auction-created");
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|e| e.message_id == r.id));
        assert_eq!(fx.bus.published_to("auction-updated").len(), 1);
        assert_eq!(fx.store.unsent_count(), 0);
    }

    #[tokio::test]
    async fn only_lease_holder_drains() {
        let fx = Fixture::new();
        fx.store.append(record("a1", "AuctionCreated")).await.unwrap();

        let first = fx.relay("r1");
        let second = fx.relay("r2");

        let report = first.run_once().await.unwrap();
        assert!(report.lease_held);

        fx.store.append(record("a2", "AuctionCreated")).await.unwrap();
        let report = second.run_once().await.unwrap();
        assert!(!report.lease_held);
        assert_eq!(fx.store.unsent_count(), 1);

        fx.clock.advance(chrono::Duration::seconds(31));
        let report = second.run_once().await.unwrap();
        assert!(report.lease_held);
        assert_eq!(report.published, 1);
    }

    #[tokio::test]
    async fn purges_sent_records_past_retention() {
        let fx = Fixture::new();
        fx.store.append(record("a1", "AuctionCreated")).await.unwrap();
        let relay = fx.relay("r1");
        relay.run_once().await.unwrap();
        assert_eq!(fx.store.records().len(), 1);

        fx.clock.advance(chrono::Duration::days(8));
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(fx.store.records().is_empty());
    }

    #[tokio::test]
    async fn storage_outage_fails_the_tick() {
        let fx = Fixture::new();
        fx.store.set_unavailable(true);
        assert!(matches!(
            fx.relay("r1").run_once().await,
            Err(RelayError::Outbox(OutboxError::Storage(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_on_interval_and_stops_on_shutdown() {
        let fx = Fixture::new();
        let relay = OutboxRelay::new(
            Arc::new(fx.store.clone()),
            Arc::new(fx.bus.clone()),
            RelayConfig::default()
                .with_instance_id("r1")
                .with_interval(Duration::from_secs(10)),
        )
        .with_clock(Arc::new(fx.clock.clone()));

        let (tx, rx) = watch::channel(false);
        let handle = relay.spawn(rx);

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(1)).await;
        fx.store.append(record("a1", "AuctionCreated")).await.unwrap();
        assert!(fx.bus.published().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.bus.published_to("auction-created").len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
