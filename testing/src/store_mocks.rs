//! In-memory outbox store and fault ledger.
//!
//! - [`InMemoryOutboxStore`]: [`OutboxLog`] behind a mutex, with failure injection
//! - [`InMemoryFaultLedger`]: corrected-id set plus escalated faults

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use chrono::{DateTime, Utc};
use gavel_core::fault::{FaultLedger, FaultLedgerError, FaultRecord, FaultStatus};
use gavel_core::outbox::{OutboxError, OutboxLog, OutboxRecord, OutboxStore};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct OutboxState {
    log: OutboxLog,
    unavailable: bool,
    failing_marks: usize,
}

/// Standalone in-memory outbox.
///
/// Cheap to clone; clones share the same log.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<OutboxState>>,
}

impl InMemoryOutboxStore {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Fail the next `count` calls to `mark_sent`.
    pub fn fail_next_marks(&self, count: usize) {
        self.state.lock().unwrap().failing_marks = count;
    }

    /// Snapshot of every record, in enqueue order.
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.state.lock().unwrap().log.records().to_vec()
    }

    /// Number of unsent records.
    #[must_use]
    pub fn unsent_count(&self) -> usize {
        self.state.lock().unwrap().log.unsent(usize::MAX).len()
    }

    fn check(state: &OutboxState) -> Result<(), OutboxError> {
        if state.unavailable {
            return Err(OutboxError::Storage("outbox unavailable".to_string()));
        }
        Ok(())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn append(
        &self,
        record: OutboxRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            Ok(state.log.append(record))
        })
    }

    fn fetch_unsent(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Self::check(&state)?;
            Ok(state.log.unsent(limit))
        })
    }

    fn mark_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            if state.failing_marks > 0 {
                state.failing_marks -= 1;
                return Err(OutboxError::Storage("injected mark failure".to_string()));
            }
            state.log.mark_sent(id, sent_at)
        })
    }

    fn purge_sent_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            Ok(state.log.purge_sent_before(cutoff))
        })
    }

    fn try_acquire_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        let holder = holder.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            Ok(state.log.try_acquire_lease(&holder, ttl, now))
        })
    }
}

#[derive(Default)]
struct LedgerState {
    corrected: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
    faults: Vec<FaultRecord>,
    unavailable: bool,
}

/// In-memory operational sink for dead-lettered messages.
#[derive(Clone, Default)]
pub struct InMemoryFaultLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryFaultLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Escalated faults in the given status, oldest first.
    #[must_use]
    pub fn list_by_status(&self, status: FaultStatus) -> Vec<FaultRecord> {
        self.state
            .lock()
            .unwrap()
            .faults
            .iter()
            .filter(|f| f.status == status)
            .cloned()
            .collect()
    }

    /// Escalated faults awaiting an operator.
    #[must_use]
    pub fn list_pending(&self) -> Vec<FaultRecord> {
        self.list_by_status(FaultStatus::Pending)
    }

    /// Number of escalated faults awaiting an operator.
    #[must_use]
    pub fn count_pending(&self) -> usize {
        self.list_pending().len()
    }

    /// Number of corrected messages.
    #[must_use]
    pub fn corrected_count(&self) -> usize {
        self.state.lock().unwrap().corrected.len()
    }

    /// Id the correction of `message_id` was republished under.
    #[must_use]
    pub fn republished_id(&self, message_id: Uuid) -> Option<Uuid> {
        self.state
            .lock()
            .unwrap()
            .corrected
            .get(&message_id)
            .map(|(id, _)| *id)
    }

    /// Move an escalated fault to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::NotFound`] if no fault has that message id.
    pub fn update_status(&self, message_id: Uuid, status: FaultStatus) -> Result<(), FaultLedgerError> {
        let mut state = self.state.lock().unwrap();
        let fault = state
            .faults
            .iter_mut()
            .find(|f| f.message_id() == message_id)
            .ok_or(FaultLedgerError::NotFound(message_id))?;
        fault.status = status;
        Ok(())
    }

    fn check(state: &LedgerState) -> Result<(), FaultLedgerError> {
        if state.unavailable {
            return Err(FaultLedgerError::Storage("ledger unavailable".to_string()));
        }
        Ok(())
    }
}

impl FaultLedger for InMemoryFaultLedger {
    fn is_corrected(
        &self,
        message_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Self::check(&state)?;
            Ok(state.corrected.contains_key(&message_id))
        })
    }

    fn mark_corrected(
        &self,
        message_id: Uuid,
        republished_id: Uuid,
        corrected_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            if state.corrected.contains_key(&message_id) {
                return Ok(false);
            }
            state
                .corrected
                .insert(message_id, (republished_id, corrected_at));
            Ok(true)
        })
    }

    fn escalate(
        &self,
        record: FaultRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            if state
                .faults
                .iter()
                .any(|f| f.message_id() == record.message_id())
            {
                return Ok(false);
            }
            state.faults.push(record);
            Ok(true)
        })
    }
}
