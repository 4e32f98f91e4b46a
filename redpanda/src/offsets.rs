//! Per-partition commit watermarks.
//!
//! Kafka commits are cumulative: committing offset `n` acknowledges every
//! earlier offset of the partition. Deliveries are settled out of order, so
//! the committed offset may only advance over a contiguous run of acked
//! offsets.
//!
//! ```text
//! partition 0:  40 ✓  41 ✓  42 ·  43 ✓
//!                          ▲
//!                          commit 42 (next offset to read)
//! ```

use std::collections::{BTreeMap, HashMap};

/// Tracks in-flight offsets and computes what may be committed.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), BTreeMap<i64, bool>>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was handed out. Tracking it again is a no-op.
    pub fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .entry(offset)
            .or_insert(false);
    }

    /// Mark `offset` acknowledged.
    ///
    /// Returns the offset to commit (one past the last contiguously acked
    /// offset) when the watermark moved, `None` otherwise.
    pub fn ack(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let pending = self.partitions.get_mut(&(topic.to_string(), partition))?;
        *pending.get_mut(&offset)? = true;

        let mut commit = None;
        while let Some(entry) = pending.first_entry() {
            if !*entry.get() {
                break;
            }
            commit = Some(*entry.key() + 1);
            entry.remove();
        }
        commit
    }

    /// Offsets of the partition that are tracked and not yet committable.
    #[must_use]
    pub fn pending(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .get(&(topic.to_string(), partition))
            .map_or(0, BTreeMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_acks_commit_each_offset() {
        let mut offsets = OffsetTracker::new();
        offsets.track("bid-placed", 0, 7);
        offsets.track("bid-placed", 0, 8);

        assert_eq!(offsets.ack("bid-placed", 0, 7), Some(8));
        assert_eq!(offsets.ack("bid-placed", 0, 8), Some(9));
        assert_eq!(offsets.pending("bid-placed", 0), 0);
    }

    #[test]
    fn gap_holds_the_watermark() {
        let mut offsets = OffsetTracker::new();
        for offset in 40..44 {
            offsets.track("auction-created", 0, offset);
        }

        assert_eq!(offsets.ack("auction-created", 0, 41), None);
        assert_eq!(offsets.ack("auction-created", 0, 43), None);
        assert_eq!(offsets.ack("auction-created", 0, 40), Some(42));
        assert_eq!(offsets.pending("auction-created", 0), 2);
        assert_eq!(offsets.ack("auction-created", 0, 42), Some(44));
    }

    #[test]
    fn partitions_are_independent() {
        let mut offsets = OffsetTracker::new();
        offsets.track("auction-created", 0, 1);
        offsets.track("auction-created", 1, 1);

        assert_eq!(offsets.ack("auction-created", 1, 1), Some(2));
        assert_eq!(offsets.pending("auction-created", 0), 1);
    }

    #[test]
    fn untracked_and_repeated_acks_are_ignored() {
        let mut offsets = OffsetTracker::new();
        assert_eq!(offsets.ack("auction-created", 0, 5), None);

        offsets.track("auction-created", 0, 5);
        assert_eq!(offsets.ack("auction-created", 0, 5), Some(6));
        assert_eq!(offsets.ack("auction-created", 0, 5), None);
    }
}
