//! Startup catch-up from the authority store.
//!
//! Before the projection consumer starts, items the projection may have missed
//! (events dropped while it had no queue, or a freshly created database) are
//! copied from the authority. Paging follows the authority's
//! `(updated_at, id)` order from the projection's newest `updated_at`, so
//! auctions sharing a timestamp are never skipped; every authority call is
//! retried with exponential backoff.

use crate::search::model::SearchItem;
use crate::search::store::{ApplyOutcome, SearchError, SearchStore};
use crate::store::{AuctionStore, StoreError};
use gavel_runtime::RetryPolicy;
use gavel_runtime::retry::retry_with_predicate;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Errors that stop catch-up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatchUpError {
    /// The authority could not be read
    #[error("Authority unavailable: {0}")]
    Authority(#[from] StoreError),

    /// The projection could not be written
    #[error(transparent)]
    Search(#[from] SearchError),
}

/// Copies authority auctions newer than the projection's cursor.
pub struct CatchUp {
    search: Arc<dyn SearchStore>,
    authority: Arc<dyn AuctionStore>,
    policy: RetryPolicy,
    batch_size: usize,
}

impl CatchUp {
    /// Create a catch-up with the default retry policy and a batch size of 100.
    #[must_use]
    pub fn new(search: Arc<dyn SearchStore>, authority: Arc<dyn AuctionStore>) -> Self {
        Self {
            search,
            authority,
            policy: RetryPolicy::default(),
            batch_size: 100,
        }
    }

    /// Retry authority reads with this policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Read this many auctions per call (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run to completion. Returns how many items were inserted or replaced.
    ///
    /// # Errors
    ///
    /// Returns [`CatchUpError::Authority`] once retries are exhausted (or at
    /// once for a non-transient error), or [`CatchUpError::Search`] if the
    /// projection cannot be read or written.
    pub async fn run(&self) -> Result<usize, CatchUpError> {
        // The nil id sorts first, so every auction at the newest timestamp is revisited.
        let mut cursor = self
            .search
            .latest_updated_at()
            .await?
            .map(|updated_at| (updated_at, Uuid::nil()));
        let mut applied = 0;

        loop {
            let batch = retry_with_predicate(
                &self.policy,
                || self.authority.updated_after(cursor, self.batch_size),
                StoreError::is_transient,
            )
            .await?;

            let fetched = batch.len();
            for auction in &batch {
                if self.search.upsert(SearchItem::from(auction)).await? == ApplyOutcome::Applied {
                    applied += 1;
                }
            }

            match batch.last() {
                Some(last) if fetched == self.batch_size => cursor = Some((last.updated_at, last.id)),
                _ => break,
            }
        }

        info!(applied, "Search catch-up complete");
        Ok(applied)
    }
}
