//! # Gavel Runtime
//!
//! Runtime machinery for the Gavel consistency protocol.
//!
//! This crate moves messages between the stores defined by `gavel-core`:
//!
//! ## Core Components
//!
//! - **Outbox relay** ([`relay::OutboxRelay`]): drains unsent outbox records
//!   into the event bus on an interval, in per-aggregate order
//! - **Event consumer** ([`consumer::EventConsumer`]): subscribe-process-reconnect
//!   loop for one queue with bounded redelivery and dead-lettering
//! - **Delivery state machine** ([`delivery::InFlight`]): per-message attempt
//!   accounting that decides ack, retry or dead-letter
//! - **Handlers** ([`handlers::HandlerRegistry`]): explicit message-type → handler table
//! - **Fault compensation** ([`compensation::FaultCompensator`]): corrects and
//!   republishes dead letters, or escalates them
//!
//! ## Example
//!
//! ```ignore
//! use gavel_runtime::{EventConsumer, HandlerRegistry, OutboxRelay, RelayConfig};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! let relay = OutboxRelay::new(outbox, event_bus.clone(), RelayConfig::default())
//!     .spawn(shutdown_rx.clone());
//!
//! let search = EventConsumer::new(
//!     "search",
//!     event_bus,
//!     HandlerRegistry::new().on::<AuctionCreated, _>(projection),
//!     shutdown_rx,
//! )
//! .spawn();
//!
//! shutdown_tx.send(true)?;
//! ```

/// Dead-letter correction and escalation
pub mod compensation;

/// Queue consumers with redelivery and dead-lettering
pub mod consumer;

/// Per-message redelivery state machine
pub mod delivery;

/// Message handlers and the registration table
pub mod handlers;

/// Prometheus metrics for observability
pub mod metrics;

/// Periodic outbox relay
pub mod relay;

/// Redelivery and backoff policies
pub mod retry;

pub use compensation::{CorrectionRule, CorrectionTable, FaultCompensator, Outcome, republish_id};
pub use consumer::EventConsumer;
pub use delivery::{DeliveryState, InFlight, Step};
pub use handlers::{Handler, HandlerError, HandlerRegistry, MessageContext, MessageHandler};
pub use relay::{OutboxRelay, RelayConfig, RelayError, RelayReport};
pub use retry::{RedeliveryPolicy, RetryPolicy};
