//! Offset Tracker - which offsets of each partition are safe to commit
//!
//! Handlers finish out of order, so an offset is only committable once every
//! offset before it on the same partition has been resolved (processed or
//! dead-lettered). The committable position is the first unresolved offset,
//! or one past the highest resolved offset when nothing is outstanding.

use std::collections::{BTreeSet, HashMap};

use common_kafka::Partition;
use tracing::debug;

#[derive(Default, Debug)]
struct PartitionState {
    /// Tracked but not yet resolved
    outstanding: BTreeSet<i64>,
    lowest_resolved: Option<i64>,
    highest_resolved: Option<i64>,
    committed: Option<i64>,
}

impl PartitionState {
    fn next_offset(&self) -> Option<i64> {
        match self.outstanding.first() {
            Some(first_unresolved) => self
                .lowest_resolved
                .filter(|resolved| resolved < first_unresolved)
                .map(|_| *first_unresolved),
            None => self.highest_resolved.map(|resolved| resolved + 1),
        }
    }
}

#[derive(Default, Debug)]
pub struct OffsetTracker {
    partitions: HashMap<Partition, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a received offset as in flight.
    pub fn track(&mut self, partition: &Partition, offset: i64) {
        self.partitions
            .entry(partition.clone())
            .or_default()
            .outstanding
            .insert(offset);
    }

    pub fn resolve(&mut self, partition: &Partition, offset: i64) {
        let state = self.partitions.entry(partition.clone()).or_default();
        state.outstanding.remove(&offset);
        if state.highest_resolved.map_or(true, |highest| offset > highest) {
            state.highest_resolved = Some(offset);
        }
        if state.lowest_resolved.map_or(true, |lowest| offset < lowest) {
            state.lowest_resolved = Some(offset);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.partitions.values().map(|s| s.outstanding.len()).sum()
    }

    /// Next offset to consume per partition, for partitions that moved since the last commit.
    pub fn committable(&self) -> HashMap<Partition, i64> {
        self.partitions
            .iter()
            .filter_map(|(partition, state)| {
                let next = state.next_offset()?;
                if state.committed.map_or(true, |committed| next > committed) {
                    Some((partition.clone(), next))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn mark_committed(&mut self, offsets: &HashMap<Partition, i64>) {
        for (partition, next) in offsets {
            if let Some(state) = self.partitions.get_mut(partition) {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = next,
                    "committed offset"
                );
                state.committed = Some(*next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i32) -> Partition {
        Partition::new("raw".to_string(), n)
    }

    #[test]
    fn test_commits_only_contiguous_prefix() {
        let mut tracker = OffsetTracker::new();
        for offset in 10..15 {
            tracker.track(&p(0), offset);
        }

        tracker.resolve(&p(0), 12);
        tracker.resolve(&p(0), 13);
        assert!(tracker.committable().is_empty());

        tracker.resolve(&p(0), 10);
        tracker.resolve(&p(0), 11);
        assert_eq!(tracker.committable(), HashMap::from([(p(0), 14)]));

        tracker.resolve(&p(0), 14);
        assert_eq!(tracker.committable(), HashMap::from([(p(0), 15)]));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.track(&p(0), 0);
        tracker.track(&p(1), 7);
        tracker.resolve(&p(1), 7);

        assert_eq!(tracker.committable(), HashMap::from([(p(1), 8)]));
    }

    #[test]
    fn test_unchanged_partitions_are_not_recommitted() {
        let mut tracker = OffsetTracker::new();
        tracker.track(&p(0), 3);
        tracker.resolve(&p(0), 3);

        let offsets = tracker.committable();
        tracker.mark_committed(&offsets);
        assert!(tracker.committable().is_empty());

        tracker.track(&p(0), 4);
        tracker.resolve(&p(0), 4);
        assert_eq!(tracker.committable(), HashMap::from([(p(0), 5)]));
    }

    #[test]
    fn test_stuck_offset_holds_back_later_batches() {
        let mut tracker = OffsetTracker::new();
        tracker.track(&p(0), 0);
        tracker.track(&p(0), 1);
        tracker.resolve(&p(0), 0);
        let offsets = tracker.committable();
        assert_eq!(offsets, HashMap::from([(p(0), 1)]));
        tracker.mark_committed(&offsets);

        tracker.track(&p(0), 2);
        tracker.resolve(&p(0), 2);
        assert!(tracker.committable().is_empty());
    }

    #[test]
    fn test_gap_commits_up_to_first_unresolved() {
        let mut tracker = OffsetTracker::new();
        for offset in 0..3 {
            tracker.track(&p(0), offset);
        }
        tracker.resolve(&p(0), 2);
        tracker.resolve(&p(0), 0);

        assert_eq!(tracker.committable(), HashMap::from([(p(0), 1)]));
        assert_eq!(tracker.outstanding(), 1);

        tracker.resolve(&p(0), 1);
        assert_eq!(tracker.committable(), HashMap::from([(p(0), 3)]));
    }
}
