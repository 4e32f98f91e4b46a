//! Fault compensation for dead-lettered messages.
//!
//! A compensator consumes a `<queue>-error` topic. Each dead letter runs
//! through an explicit state machine:
//!
//! ```text
//! Received ──► Classified ──┬─► Corrected ──► Republished   (through the outbox)
//!                           │
//!                           └─► Escalated                   (fault ledger, manual)
//! ```
//!
//! Classification reads the exception type the failing consumer wrote into
//! the envelope headers. A [`CorrectionTable`] keyed by
//! `(message_type, exception_type)` decides whether the payload can be
//! repaired. Repaired payloads are appended to the outbox under a record id
//! derived from the dead-lettered message id, so the relay republishes the
//! original message type and a repeated dead letter can never produce a
//! second correction.

use crate::handlers::{HandlerError, MessageContext, MessageHandler};
use crate::metrics::CompensationMetrics;
use async_trait::async_trait;
use gavel_core::environment::{Clock, SystemClock};
use gavel_core::fault::{FaultInfo, FaultLedger, FaultLedgerError, FaultRecord};
use gavel_core::message::MessageEnvelope;
use gavel_core::outbox::{OutboxError, OutboxRecord, OutboxStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Namespace for republished record ids.
pub const REPUBLISH_NAMESPACE: Uuid = Uuid::from_u128(0x6761_7665_6c2d_7265_7075_626c_6973_6800);

/// Record id a corrected copy of `message_id` is republished under.
#[must_use]
pub fn republish_id(message_id: Uuid) -> Uuid {
    Uuid::new_v5(&REPUBLISH_NAMESPACE, message_id.as_bytes())
}

/// Repairs a payload in place.
pub trait CorrectionRule: Send + Sync {
    /// Rewrite the offending field(s) of `payload`.
    ///
    /// Returns `false` if the payload does not have the shape the rule expects;
    /// the fault is then escalated instead of republished.
    fn apply(&self, payload: &mut Value) -> bool;
}

impl<F> CorrectionRule for F
where
    F: Fn(&mut Value) -> bool + Send + Sync,
{
    fn apply(&self, payload: &mut Value) -> bool {
        self(payload)
    }
}

/// Correctable defects keyed by `(message_type, exception_type)`.
#[derive(Clone, Default)]
pub struct CorrectionTable {
    rules: HashMap<(String, String), Arc<dyn CorrectionRule>>,
}

impl CorrectionTable {
    /// Create an empty table. Every fault escalates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `rule` for `message_type` failing with `exception_type`.
    #[must_use]
    pub fn with_rule(
        mut self,
        message_type: impl Into<String>,
        exception_type: impl Into<String>,
        rule: impl CorrectionRule + 'static,
    ) -> Self {
        self.rules
            .insert((message_type.into(), exception_type.into()), Arc::new(rule));
        self
    }

    /// Rule for this defect, if any.
    #[must_use]
    pub fn rule_for(&self, message_type: &str, exception_type: &str) -> Option<&Arc<dyn CorrectionRule>> {
        self.rules
            .get(&(message_type.to_string(), exception_type.to_string()))
    }

    /// Number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Where a dead letter is in compensation.
#[derive(Debug, Clone, PartialEq)]
pub enum CompensationState {
    /// Pulled from the error queue
    Received,
    /// Exception type read from the headers
    Classified {
        /// Error name from the failing consumer
        exception_type: String,
    },
    /// A rule repaired the payload
    Corrected {
        /// Repaired JSON payload
        payload: Value,
    },
    /// Repaired copy appended to the outbox
    Republished {
        /// Outbox record id of the copy
        republished_id: Uuid,
    },
    /// Handed to the fault ledger
    Escalated {
        /// Why no correction was possible
        reason: String,
    },
}

/// Terminal result of compensating one dead letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A corrected copy was appended to the outbox
    Republished {
        /// Outbox record id of the copy
        republished_id: Uuid,
    },
    /// A fault record was written (or already existed)
    Escalated {
        /// Why no correction was possible
        reason: String,
        /// `false` if this message was escalated before
        newly_recorded: bool,
    },
    /// This message was corrected by an earlier delivery
    AlreadyCorrected,
}

/// Storage failures during compensation. The dead letter is redelivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompensationError {
    /// Outbox append failed
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    /// Fault ledger read or write failed
    #[error(transparent)]
    Ledger(#[from] FaultLedgerError),
    /// Corrected payload could not be serialized
    #[error("Failed to encode corrected payload: {0}")]
    Encode(String),
}

impl From<CompensationError> for HandlerError {
    fn from(err: CompensationError) -> Self {
        match err {
            CompensationError::Encode(reason) => Self::rejected("EncodeFailed", reason),
            other => Self::transient("StoreUnavailable", other.to_string()),
        }
    }
}

/// Dead-letter consumer that corrects or escalates.
pub struct FaultCompensator {
    table: CorrectionTable,
    outbox: Arc<dyn OutboxStore>,
    ledger: Arc<dyn FaultLedger>,
    clock: Arc<dyn Clock>,
}

impl FaultCompensator {
    /// Create a compensator republishing through `outbox` and escalating to `ledger`.
    #[must_use]
    pub fn new(table: CorrectionTable, outbox: Arc<dyn OutboxStore>, ledger: Arc<dyn FaultLedger>) -> Self {
        Self {
            table,
            outbox,
            ledger,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for record timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Compensate one dead-lettered envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CompensationError`] if the outbox or the ledger is unavailable;
    /// no state is left half-written that a retry could not finish.
    pub async fn compensate(&self, envelope: &MessageEnvelope) -> Result<Outcome, CompensationError> {
        let message_id = envelope.message_id;
        if self.ledger.is_corrected(message_id).await? {
            info!(message_id = %message_id, "Dead letter already corrected, skipping");
            return Ok(Outcome::AlreadyCorrected);
        }

        let mut state = CompensationState::Received;
        loop {
            state = match state {
                CompensationState::Received => CompensationState::Classified {
                    exception_type: FaultInfo::read(envelope)
                        .map_or_else(|| "Unknown".to_string(), |info| info.exception_type),
                },
                CompensationState::Classified { exception_type } => {
                    self.correct(envelope, &exception_type)
                }
                CompensationState::Corrected { payload } => {
                    let republished_id = self.republish(envelope, &payload).await?;
                    CompensationState::Republished { republished_id }
                }
                CompensationState::Republished { republished_id } => {
                    info!(
                        message_id = %message_id,
                        message_type = %envelope.message_type,
                        republished_id = %republished_id,
                        "Dead letter corrected and republished"
                    );
                    CompensationMetrics::record_republished(&envelope.message_type);
                    return Ok(Outcome::Republished { republished_id });
                }
                CompensationState::Escalated { reason } => {
                    let record = FaultRecord::pending(envelope.clone(), reason.clone(), self.clock.now());
                    let newly_recorded = self.ledger.escalate(record).await?;
                    if newly_recorded {
                        warn!(
                            message_id = %message_id,
                            message_type = %envelope.message_type,
                            reason = %reason,
                            "Dead letter escalated for manual intervention"
                        );
                        CompensationMetrics::record_escalated(&envelope.message_type);
                    }
                    return Ok(Outcome::Escalated { reason, newly_recorded });
                }
            };
        }
    }

    fn correct(&self, envelope: &MessageEnvelope, exception_type: &str) -> CompensationState {
        let Some(rule) = self.table.rule_for(&envelope.message_type, exception_type) else {
            return CompensationState::Escalated {
                reason: format!(
                    "no correction rule for {} failing with {exception_type}",
                    envelope.message_type
                ),
            };
        };

        let mut payload = match envelope.payload_json() {
            Ok(payload) => payload,
            Err(e) => {
                return CompensationState::Escalated {
                    reason: format!("payload is not correctable: {e}"),
                };
            }
        };

        if rule.apply(&mut payload) {
            CompensationState::Corrected { payload }
        } else {
            CompensationState::Escalated {
                reason: format!("correction rule for {exception_type} did not match the payload"),
            }
        }
    }

    async fn republish(&self, envelope: &MessageEnvelope, payload: &Value) -> Result<Uuid, CompensationError> {
        let now = self.clock.now();
        let republished_id = republish_id(envelope.message_id);
        let record = OutboxRecord {
            id: republished_id,
            aggregate_id: envelope.aggregate_id.clone(),
            message_type: envelope.message_type.clone(),
            payload: serde_json::to_vec(payload).map_err(|e| CompensationError::Encode(e.to_string()))?,
            enqueued_at: now,
            sent_at: None,
        };

        // Appending is idempotent on the derived id, so a crash before
        // mark_corrected is finished by the redelivery without a second copy.
        self.outbox.append(record).await?;
        self.ledger
            .mark_corrected(envelope.message_id, republished_id, now)
            .await?;
        Ok(republished_id)
    }
}

#[async_trait]
impl MessageHandler for FaultCompensator {
    async fn handle(&self, _ctx: &MessageContext, envelope: &MessageEnvelope) -> Result<(), HandlerError> {
        self.compensate(envelope).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gavel_core::fault::{FaultKind, FaultStatus};
    use gavel_testing::{InMemoryFaultLedger, InMemoryOutboxStore, test_clock, test_epoch};
    use std::collections::BTreeMap;

    fn dead_letter(model: &str, exception_type: &str) -> MessageEnvelope {
        let envelope = MessageEnvelope {
            message_id: Uuid::new_v4(),
            message_type: "AuctionCreated".into(),
            aggregate_id: "a1".into(),
            payload: serde_json::to_vec(&serde_json::json!({"id": "a1", "model": model})).unwrap(),
            sent_at: test_epoch(),
            headers: BTreeMap::new(),
        };
        FaultInfo {
            kind: FaultKind::Rejected,
            exception_type: exception_type.into(),
            reason: "Foo is not allowed".into(),
            attempts: 5,
            first_failed_at: test_epoch(),
            queue: "search".into(),
            original_topic: "auction-created".into(),
        }
        .tag(envelope)
    }

    fn table() -> CorrectionTable {
        CorrectionTable::new().with_rule("AuctionCreated", "InvalidArgument", |payload: &mut Value| {
            match payload.get_mut("model") {
                Some(model) if *model == "Foo" => {
                    *model = Value::String("FooBar".into());
                    true
                }
                _ => false,
            }
        })
    }

    struct Fixture {
        outbox: InMemoryOutboxStore,
        ledger: InMemoryFaultLedger,
        compensator: FaultCompensator,
    }

    fn fixture(table: CorrectionTable) -> Fixture {
        let outbox = InMemoryOutboxStore::new();
        let ledger = InMemoryFaultLedger::new();
        let compensator = FaultCompensator::new(table, Arc::new(outbox.clone()), Arc::new(ledger.clone()))
            .with_clock(Arc::new(test_clock()));
        Fixture {
            outbox,
            ledger,
            compensator,
        }
    }

    #[tokio::test]
    async fn known_defect_is_corrected_and_republished_through_outbox() {
        let fx = fixture(table());
        let envelope = dead_letter("Foo", "InvalidArgument");

        let outcome = fx.compensator.compensate(&envelope).await.unwrap();

        let expected_id = republish_id(envelope.message_id);
        assert_eq!(outcome, Outcome::Republished { republished_id: expected_id });
        let records = fx.outbox.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, expected_id);
        assert_eq!(records[0].message_type, "AuctionCreated");
        assert_eq!(records[0].aggregate_id, "a1");
        let payload: Value = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(payload["model"], "FooBar");
        assert_eq!(fx.ledger.republished_id(envelope.message_id), Some(expected_id));
    }

    #[tokio::test]
    async fn duplicate_dead_letter_republishes_once() {
        let fx = fixture(table());
        let envelope = dead_letter("Foo", "InvalidArgument");

        fx.compensator.compensate(&envelope).await.unwrap();
        let again = fx.compensator.compensate(&envelope).await.unwrap();

        assert_eq!(again, Outcome::AlreadyCorrected);
        assert_eq!(fx.outbox.records().len(), 1);
        assert_eq!(fx.ledger.corrected_count(), 1);
    }

    #[tokio::test]
    async fn crash_between_republish_and_bookkeeping_does_not_double_correct() {
        let fx = fixture(table());
        let envelope = dead_letter("Foo", "InvalidArgument");

        // Simulate the first attempt reaching the outbox but not the ledger.
        let record = OutboxRecord {
            id: republish_id(envelope.message_id),
            aggregate_id: "a1".into(),
            message_type: "AuctionCreated".into(),
            payload: b"{}".to_vec(),
            enqueued_at: Utc::now(),
            sent_at: None,
        };
        fx.outbox.append(record).await.unwrap();

        fx.compensator.compensate(&envelope).await.unwrap();
        assert_eq!(fx.outbox.records().len(), 1);
        assert_eq!(fx.ledger.corrected_count(), 1);
    }

    #[tokio::test]
    async fn unknown_exception_type_is_escalated() {
        let fx = fixture(table());
        let envelope = dead_letter("Foo", "NullReference");

        let outcome = fx.compensator.compensate(&envelope).await.unwrap();

        assert!(matches!(outcome, Outcome::Escalated { newly_recorded: true, .. }));
        assert!(fx.outbox.records().is_empty());
        let pending = fx.ledger.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].exception_type, "NullReference");
        assert_eq!(pending[0].attempt_count, 5);
        assert_eq!(pending[0].queue, "search");
        assert_eq!(pending[0].status, FaultStatus::Pending);
        assert_eq!(pending[0].original_message, envelope);
    }

    #[tokio::test]
    async fn rule_that_cannot_fix_payload_escalates() {
        let fx = fixture(table());
        let envelope = dead_letter("Civic", "InvalidArgument");

        let outcome = fx.compensator.compensate(&envelope).await.unwrap();

        assert!(matches!(outcome, Outcome::Escalated { .. }));
        assert_eq!(fx.ledger.count_pending(), 1);
    }

    #[tokio::test]
    async fn repeated_escalation_records_once() {
        let fx = fixture(CorrectionTable::new());
        let envelope = dead_letter("Foo", "InvalidArgument");

        fx.compensator.compensate(&envelope).await.unwrap();
        let again = fx.compensator.compensate(&envelope).await.unwrap();

        assert!(matches!(again, Outcome::Escalated { newly_recorded: false, .. }));
        assert_eq!(fx.ledger.count_pending(), 1);
    }

    #[tokio::test]
    async fn storage_outage_is_transient_for_redelivery() {
        let fx = fixture(table());
        fx.outbox.set_unavailable(true);
        let envelope = dead_letter("Foo", "InvalidArgument");
        let ctx = MessageContext::new(&envelope, "search-error-compensation", "search-error", 1);

        let err = fx.compensator.handle(&ctx, &envelope).await.unwrap_err();

        assert_eq!(err.kind, FaultKind::Transient);
        assert_eq!(fx.ledger.corrected_count(), 0);
    }

    #[test]
    fn republish_id_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(republish_id(id), republish_id(id));
        assert_ne!(republish_id(id), id);
    }
}
