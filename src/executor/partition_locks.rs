//! Per-partition mutual exclusion for the caller-runs path.
//!
//! Each slot holds the owner token of the thread currently executing on the
//! partition, or zero when the partition is free. Slots are cache-line padded
//! so contention on one partition does not slow down its neighbours.

use crossbeam::utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::PartitionId;

/// Token identifying a lock owner. Zero is reserved for "unlocked".
pub type OwnerToken = u64;

const UNLOCKED: OwnerToken = 0;

/// One lock slot per partition.
pub struct PartitionLocks {
    slots: Box<[CachePadded<AtomicU64>]>,
}

impl PartitionLocks {
    /// Create locks for `partition_count` partitions, all unlocked.
    pub fn new(partition_count: usize) -> Self {
        let slots = (0..partition_count)
            .map(|_| CachePadded::new(AtomicU64::new(UNLOCKED)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    /// Number of partitions covered.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no partitions are covered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Try to take the lock without waiting.
    pub fn try_lock(&self, partition_id: PartitionId, owner: OwnerToken) -> bool {
        debug_assert_ne!(owner, UNLOCKED);
        self.slot(partition_id)
            .compare_exchange(UNLOCKED, owner, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Take the lock, spinning and then yielding while it is held by someone else.
    ///
    /// Holders never block while holding a partition, so the wait is short.
    pub fn lock(&self, partition_id: PartitionId, owner: OwnerToken) {
        let backoff = Backoff::new();
        while !self.try_lock(partition_id, owner) {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Release the lock.
    pub fn unlock(&self, partition_id: PartitionId, owner: OwnerToken) {
        let prev = self.slot(partition_id).swap(UNLOCKED, Ordering::Release);
        debug_assert_eq!(prev, owner, "partition {partition_id} unlocked by non-owner");
    }

    /// Current owner, if locked.
    pub fn owner(&self, partition_id: PartitionId) -> Option<OwnerToken> {
        match self.slot(partition_id).load(Ordering::Acquire) {
            UNLOCKED => None,
            owner => Some(owner),
        }
    }

    /// Returns true if some thread holds the partition.
    pub fn is_locked(&self, partition_id: PartitionId) -> bool {
        self.owner(partition_id).is_some()
    }

    /// Take the lock and return a guard releasing it on drop.
    pub fn lock_guard(&self, partition_id: PartitionId, owner: OwnerToken) -> PartitionGuard<'_> {
        self.lock(partition_id, owner);
        PartitionGuard {
            locks: self,
            partition_id,
            owner,
        }
    }

    /// Try to take the lock, returning a guard on success.
    pub fn try_lock_guard(
        &self,
        partition_id: PartitionId,
        owner: OwnerToken,
    ) -> Option<PartitionGuard<'_>> {
        if !self.try_lock(partition_id, owner) {
            return None;
        }
        Some(PartitionGuard {
            locks: self,
            partition_id,
            owner,
        })
    }

    fn slot(&self, partition_id: PartitionId) -> &AtomicU64 {
        &self.slots[partition_id as usize]
    }
}

impl std::fmt::Debug for PartitionLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let locked = self
            .slots
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != UNLOCKED)
            .count();
        f.debug_struct("PartitionLocks")
            .field("partitions", &self.slots.len())
            .field("locked", &locked)
            .finish()
    }
}

/// Holds a partition lock until dropped, including during unwinding.
#[must_use = "the partition is unlocked as soon as the guard is dropped"]
pub struct PartitionGuard<'a> {
    locks: &'a PartitionLocks,
    partition_id: PartitionId,
    owner: OwnerToken,
}

impl PartitionGuard<'_> {
    /// The locked partition.
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }
}

impl Drop for PartitionGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(self.partition_id, self.owner);
    }
}
