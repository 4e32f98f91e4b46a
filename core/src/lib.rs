//! # Gavel Core
//!
//! Core traits and types for the Gavel event-driven consistency protocol.
//!
//! The auction marketplace is split into services that each own a data store.
//! This crate defines the vocabulary they share so that every store converges
//! despite crashes, broker outages and consumer failures:
//!
//! - **Messages**: typed domain events and the [`MessageEnvelope`](message::MessageEnvelope)
//!   they travel in
//! - **Outbox**: records written in the same transaction as the aggregate change
//! - **Event bus**: topic-routed publish and acknowledged, queue-bound subscriptions
//! - **Inbox**: consumer-side ledger that turns at-least-once delivery into
//!   at-most-once application
//! - **Faults**: classification and bookkeeping for dead-lettered messages
//!
//! ## Data Flow
//!
//! ```text
//! aggregate change ──┐
//!                    ├── one transaction
//! outbox record ─────┘
//!        │
//!        ▼  relay (periodic)
//!   event bus ──► consumers (inbox dedup) ──► projections / authority
//!        │
//!        ▼  redelivery exhausted
//!  <queue>-error ──► compensation ──► outbox (republish) | fault ledger
//! ```

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod event_bus;
pub mod fault;
pub mod inbox;
pub mod message;
pub mod outbox;
pub mod topic;

/// Environment module - injected dependencies
///
/// Traits here abstract side effects (currently time) so that delivery
/// intervals, retention windows and timestamps can be tested deterministically.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Example
    ///
    /// ```
    /// use gavel_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
