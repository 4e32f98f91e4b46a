//! Per-message redelivery state machine.
//!
//! Every delivery a consumer pulls is tracked by an [`InFlight`] value:
//!
//! ```text
//!            begin_attempt            Ok
//! Received ───────────────► Attempting ──────────► Handled        (ack)
//!                               │  ▲
//!                          Err  │  │ interval elapsed
//!                               ▼  │
//!                           AwaitingRetry
//!                               │
//!              attempts == max  ▼
//!                           Exhausted                              (dead-letter)
//! ```
//!
//! The machine is pure: it decides, the consumer acts (sleeps, acks,
//! publishes to the dead-letter topic). Keeping the decision separate makes
//! the attempt accounting testable without a broker or a clock.

use crate::handlers::HandlerError;
use crate::retry::RedeliveryPolicy;
use chrono::{DateTime, Utc};
use gavel_core::fault::FaultInfo;
use std::time::Duration;

/// Where a message is in its delivery lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    /// Pulled from the queue, not yet handled
    Received,
    /// Handler running for the given 1-based attempt
    Attempting {
        /// Current attempt
        attempt: u32,
    },
    /// Last attempt failed; waiting for the redelivery interval
    AwaitingRetry {
        /// Attempts made so far
        attempts: u32,
        /// Error from the last attempt
        last_error: HandlerError,
    },
    /// Handler succeeded
    Handled {
        /// Attempts it took
        attempts: u32,
    },
    /// All attempts failed
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: HandlerError,
    },
}

/// What the consumer must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Acknowledge the delivery
    Ack,
    /// Wait `after`, then call [`InFlight::begin_attempt`] again
    Retry {
        /// Pause before the next attempt
        after: Duration,
    },
    /// Publish to the dead-letter topic with this fault description, then acknowledge
    DeadLetter(FaultInfo),
}

/// Redelivery bookkeeping for one message.
#[derive(Debug, Clone)]
pub struct InFlight {
    policy: RedeliveryPolicy,
    queue: String,
    topic: String,
    state: DeliveryState,
    first_failed_at: Option<DateTime<Utc>>,
}

impl InFlight {
    /// Start tracking a message delivered on `queue` from `topic`.
    #[must_use]
    pub fn new(policy: RedeliveryPolicy, queue: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            policy,
            queue: queue.into(),
            topic: topic.into(),
            state: DeliveryState::Received,
            first_failed_at: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &DeliveryState {
        &self.state
    }

    /// Attempts started so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match &self.state {
            DeliveryState::Received => 0,
            DeliveryState::Attempting { attempt } => *attempt,
            DeliveryState::AwaitingRetry { attempts, .. }
            | DeliveryState::Handled { attempts }
            | DeliveryState::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Enter the next attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt = self.attempts() + 1;
        self.state = DeliveryState::Attempting { attempt };
        attempt
    }

    /// Record the handler result of the current attempt.
    pub fn complete(&mut self, result: Result<(), HandlerError>, now: DateTime<Utc>) -> Step {
        let attempts = self.attempts().max(1);
        match result {
            Ok(()) => {
                self.state = DeliveryState::Handled { attempts };
                Step::Ack
            }
            Err(error) => {
                let first_failed_at = *self.first_failed_at.get_or_insert(now);
                if attempts >= self.policy.max_attempts {
                    let info = self.fault_info(&error, attempts, first_failed_at);
                    self.state = DeliveryState::Exhausted {
                        attempts,
                        last_error: error,
                    };
                    Step::DeadLetter(info)
                } else {
                    self.state = DeliveryState::AwaitingRetry {
                        attempts,
                        last_error: error,
                    };
                    Step::Retry {
                        after: self.policy.interval,
                    }
                }
            }
        }
    }

    /// Dead-letter without further attempts (e.g. no handler for the message type).
    pub fn give_up(&mut self, error: HandlerError, now: DateTime<Utc>) -> FaultInfo {
        let attempts = self.attempts();
        let first_failed_at = *self.first_failed_at.get_or_insert(now);
        let info = self.fault_info(&error, attempts, first_failed_at);
        self.state = DeliveryState::Exhausted {
            attempts,
            last_error: error,
        };
        info
    }

    fn fault_info(&self, error: &HandlerError, attempts: u32, first_failed_at: DateTime<Utc>) -> FaultInfo {
        FaultInfo {
            kind: error.kind,
            exception_type: error.exception_type.clone(),
            reason: error.message.clone(),
            attempts,
            first_failed_at,
            queue: self.queue.clone(),
            original_topic: self.topic.clone(),
        }
    }
}
