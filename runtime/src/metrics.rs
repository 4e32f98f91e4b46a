//! Prometheus metrics for the consistency pipeline.
//!
//! This module provides metric collection for:
//! - Outbox relay (published, failed, deferred, purged)
//! - Consumers (handled, retried, dead-lettered, handler latency)
//! - Fault compensation (republished, escalated)
//! - Retries of catch-up calls
//!
//! # Example
//!
//! ```rust,no_run
//! use gavel_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Serve `server.render()` from an HTTP route for Prometheus to scrape.
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other crates
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the address it is advertised on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. in tests) this logs a warning
    /// and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address metrics are advertised on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Outbox relay
    describe_counter!(
        "outbox_records_published_total",
        "Outbox records published and marked sent"
    );
    describe_counter!(
        "outbox_publish_failures_total",
        "Outbox records whose publish or mark-sent failed"
    );
    describe_counter!(
        "outbox_records_deferred_total",
        "Outbox records deferred to keep per-aggregate order"
    );
    describe_counter!(
        "outbox_records_purged_total",
        "Sent outbox records removed by retention"
    );
    describe_histogram!(
        "outbox_relay_tick_duration_seconds",
        "Time taken by one relay tick"
    );

    // Consumers
    describe_counter!(
        "consumer_messages_handled_total",
        "Messages handled and acknowledged"
    );
    describe_counter!(
        "consumer_redeliveries_total",
        "Handler attempts that failed and were scheduled for redelivery"
    );
    describe_counter!(
        "consumer_dead_letters_total",
        "Messages moved to a dead-letter topic"
    );
    describe_counter!(
        "consumer_nacks_total",
        "Messages returned to the broker unhandled"
    );
    describe_histogram!(
        "consumer_handler_duration_seconds",
        "Time taken by a single handler attempt"
    );

    // Compensation
    describe_counter!(
        "compensation_republished_total",
        "Dead-lettered messages corrected and republished"
    );
    describe_counter!(
        "compensation_escalated_total",
        "Dead-lettered messages escalated to the fault ledger"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted max retries"
    );
}

/// Outbox relay metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a relay tick.
    pub fn record_tick(published: usize, failed: usize, deferred: usize, duration: Duration) {
        counter!("outbox_records_published_total").increment(published as u64);
        counter!("outbox_publish_failures_total").increment(failed as u64);
        counter!("outbox_records_deferred_total").increment(deferred as u64);
        histogram!("outbox_relay_tick_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a retention purge.
    pub fn record_purged(count: u64) {
        counter!("outbox_records_purged_total").increment(count);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record one handler attempt.
    pub fn record_attempt(queue: &str, duration: Duration) {
        histogram!("consumer_handler_duration_seconds", "queue" => queue.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record an acknowledged message.
    pub fn record_handled(queue: &str) {
        counter!("consumer_messages_handled_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a scheduled redelivery.
    pub fn record_redelivery(queue: &str) {
        counter!("consumer_redeliveries_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_letter(queue: &str, exception_type: &str) {
        counter!(
            "consumer_dead_letters_total",
            "queue" => queue.to_string(),
            "exception_type" => exception_type.to_string()
        )
        .increment(1);
    }

    /// Record a message returned to the broker.
    pub fn record_nack(queue: &str) {
        counter!("consumer_nacks_total", "queue" => queue.to_string()).increment(1);
    }
}

/// Fault compensation metrics recorder.
pub struct CompensationMetrics;

impl CompensationMetrics {
    /// Record a corrected and republished message.
    pub fn record_republished(message_type: &str) {
        counter!("compensation_republished_total", "message_type" => message_type.to_string())
            .increment(1);
    }

    /// Record an escalated fault.
    pub fn record_escalated(message_type: &str) {
        counter!("compensation_escalated_total", "message_type" => message_type.to_string())
            .increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn metrics_server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn recorded_metrics_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        OutboxMetrics::record_tick(3, 1, 2, Duration::from_millis(20));
        ConsumerMetrics::record_handled("search");
        ConsumerMetrics::record_dead_letter("search", "InvalidArgument");

        // Another test may have installed the recorder first; then there is no handle.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("outbox_records_published_total"));
            assert!(rendered.contains("consumer_dead_letters_total"));
        }
    }
}
