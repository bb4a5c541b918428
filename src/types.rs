//! Core types used throughout the grid core.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Partition identifier. Negative values mark generic (partition-less) work.
pub type PartitionId = i32;

/// Partition ID carried by generic operations.
pub const GENERIC_PARTITION_ID: PartitionId = -1;

/// Default number of partitions in the grid.
pub const DEFAULT_PARTITION_COUNT: usize = 271;

/// Identifier correlating a request with its response.
pub type CallId = i64;

/// Identifier of a live connection.
pub type ConnectionId = u64;

/// Returns true when the partition ID denotes generic work.
#[inline]
pub fn is_generic(partition_id: PartitionId) -> bool {
    partition_id < 0
}

/// Map a key to its partition.
///
/// The result is stable for a given partition count and always in `0..partition_count`.
pub fn partition_for_key(key: &[u8], partition_count: usize) -> PartitionId {
    debug_assert!(partition_count > 0);
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    (hasher.finish() % partition_count.max(1) as u64) as PartitionId
}

/// Result produced by an operation.
///
/// The payload is opaque to the core; encoding belongs to the service that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Response {
    /// The operation produced no value.
    #[default]
    Empty,
    /// Encoded response value.
    Value(Bytes),
}

impl Response {
    /// Create a response carrying a value.
    pub fn value(bytes: impl Into<Bytes>) -> Self {
        Response::Value(bytes.into())
    }

    /// Borrow the payload, if any.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Response::Empty => None,
            Response::Value(b) => Some(b),
        }
    }

    /// Returns true when there is no payload.
    pub fn is_empty(&self) -> bool {
        matches!(self, Response::Empty)
    }
}

/// A fixed-size set of partition IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionIdSet {
    partition_count: usize,
    words: Vec<u64>,
}

impl PartitionIdSet {
    /// Create an empty set for `partition_count` partitions.
    pub fn new(partition_count: usize) -> Self {
        Self {
            partition_count,
            words: vec![0; partition_count.div_ceil(64)],
        }
    }

    /// Create a set containing every partition.
    pub fn all(partition_count: usize) -> Self {
        let mut set = Self::new(partition_count);
        for pid in 0..partition_count {
            set.insert(pid as PartitionId);
        }
        set
    }

    /// Number of partitions this set was sized for.
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Add a partition. Returns true only if it was not already present;
    /// out-of-range IDs are ignored.
    pub fn insert(&mut self, partition_id: PartitionId) -> bool {
        match self.index(partition_id) {
            Some((word, bit)) => {
                let mask = 1 << bit;
                let added = self.words[word] & mask == 0;
                self.words[word] |= mask;
                added
            }
            None => false,
        }
    }

    /// Remove a partition.
    pub fn remove(&mut self, partition_id: PartitionId) {
        if let Some((word, bit)) = self.index(partition_id) {
            self.words[word] &= !(1 << bit);
        }
    }

    /// Check membership.
    pub fn contains(&self, partition_id: PartitionId) -> bool {
        self.index(partition_id)
            .map(|(word, bit)| self.words[word] & (1 << bit) != 0)
            .unwrap_or(false)
    }

    /// Number of partitions in the set.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate over the partitions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        (0..self.partition_count)
            .map(|pid| pid as PartitionId)
            .filter(move |pid| self.contains(*pid))
    }

    fn index(&self, partition_id: PartitionId) -> Option<(usize, u32)> {
        if partition_id < 0 || partition_id as usize >= self.partition_count {
            return None;
        }
        let pid = partition_id as usize;
        Some((pid / 64, (pid % 64) as u32))
    }
}

impl FromIterator<PartitionId> for PartitionIdSet {
    /// Builds a set sized to the largest ID seen.
    fn from_iter<I: IntoIterator<Item = PartitionId>>(iter: I) -> Self {
        let ids: Vec<PartitionId> = iter.into_iter().filter(|p| *p >= 0).collect();
        let count = ids.iter().max().map(|m| *m as usize + 1).unwrap_or(0);
        let mut set = Self::new(count);
        for id in ids {
            set.insert(id);
        }
        set
    }
}
