use std::collections::{BTreeMap, BTreeSet};

/// Where a message sits on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessagePosition {
    pub partition: i32,
    pub offset: i64,
}

impl MessagePosition {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

#[derive(Debug)]
struct PartitionOffsets {
    pending: BTreeSet<i64>,
    latest: i64,
    stored: i64,
}

/// Tracks which consumed messages are done with, per partition.
///
/// A message is done once nothing downstream still needs it: straight away for the raw feed,
/// or once its history window has been processed. Only the offset below the oldest message
/// still in flight is committable, so a crash redelivers everything not yet done.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, position: MessagePosition) {
        let partition = self
            .partitions
            .entry(position.partition)
            .or_insert_with(|| PartitionOffsets {
                pending: BTreeSet::new(),
                latest: position.offset - 1,
                stored: position.offset - 1,
            });
        partition.pending.insert(position.offset);
        partition.latest = partition.latest.max(position.offset);
    }

    pub fn complete(&mut self, position: MessagePosition) {
        if let Some(partition) = self.partitions.get_mut(&position.partition) {
            partition.pending.remove(&position.offset);
        }
    }

    /// The last committable message of every partition that advanced since the previous call.
    pub fn take_committable(&mut self) -> Vec<MessagePosition> {
        let mut committable = Vec::new();
        for (&partition, offsets) in self.partitions.iter_mut() {
            let candidate = match offsets.pending.first() {
                Some(oldest) => oldest - 1,
                None => offsets.latest,
            };
            if candidate > offsets.stored {
                offsets.stored = candidate;
                committable.push(MessagePosition::new(partition, candidate));
            }
        }
        committable
    }

    /// Number of messages still in flight.
    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.pending.len()).sum()
    }
}
