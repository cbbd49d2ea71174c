use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
struct PartitionOffsets {
    next: u64,
    in_flight: BTreeSet<u64>,
    committed: Option<u64>,
}

impl PartitionOffsets {
    fn watermark(&self) -> u64 {
        self.in_flight.first().copied().unwrap_or(self.next)
    }
}

/// Read progress for the partitions owned by one reader.
///
/// Messages complete out of order across keys, so the committable offset is
/// the lowest offset still in flight. Everything below it has finished.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<u32, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `partition` from `offset`. The starting position is
    /// reported by [`uncommitted`](Self::uncommitted) until marked.
    pub fn assign(&mut self, partition: u32, offset: u64) {
        self.partitions.insert(
            partition,
            PartitionOffsets {
                next: offset,
                ..PartitionOffsets::default()
            },
        );
    }

    pub fn partitions(&self) -> impl Iterator<Item = u32> + '_ {
        self.partitions.keys().copied()
    }

    /// Offset of the next fetch for `partition`.
    pub fn next_offset(&self, partition: u32) -> u64 {
        self.partitions.get(&partition).map_or(0, |p| p.next)
    }

    /// Record that `offset` was handed to the mailbox.
    pub fn begin(&mut self, partition: u32, offset: u64) {
        let state = self.partitions.entry(partition).or_default();
        state.in_flight.insert(offset);
        state.next = state.next.max(offset + 1);
    }

    /// Record that `offset` finished, successfully or not.
    pub fn complete(&mut self, partition: u32, offset: u64) {
        if let Some(state) = self.partitions.get_mut(&partition) {
            state.in_flight.remove(&offset);
        }
    }

    /// Offset a commit for `partition` would store.
    pub fn watermark(&self, partition: u32) -> u64 {
        self.partitions
            .get(&partition)
            .map_or(0, PartitionOffsets::watermark)
    }

    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }

    /// Partitions whose watermark moved since the last commit.
    pub fn uncommitted(&self) -> Vec<(u32, u64)> {
        self.partitions
            .iter()
            .filter_map(|(&partition, state)| {
                let watermark = state.watermark();
                (state.committed != Some(watermark)).then_some((partition, watermark))
            })
            .collect()
    }

    pub fn mark_committed(&mut self, partition: u32, offset: u64) {
        if let Some(state) = self.partitions.get_mut(&partition) {
            state.committed = Some(offset);
        }
    }
}
