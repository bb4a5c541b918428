//! Partition replication and migration contract.
//!
//! A migration copies a partition's replica from a source member to a
//! destination member:
//!
//! ```text
//!  source                                   destination
//!  ──────                                   ───────────
//!  before_migration                         before_migration
//!  prepare_replication(pid, idx) ─snapshot─▶ apply_replication
//!                  ┌──────── success ────────┐
//!  commit_migration                         commit_migration
//!                  └──────── failure ────────┘
//!  rollback_migration                       rollback_migration
//! ```
//!
//! Commit on the source and rollback on the destination discard every
//! container whose backup count no longer covers the surviving replica
//! index. Both are idempotent.

use bytes::Bytes;
use crossbeam::channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ReplicationError, Result};
use crate::executor::{OperationExecutor, PartitionRunnable, Task};
use crate::replication::vector_clock::VectorClock;
use crate::types::PartitionId;

/// Which side of a migration a member is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationEndpoint {
    Source,
    Destination,
}

/// A migration step as seen by one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMigrationEvent {
    pub endpoint: MigrationEndpoint,
    pub partition_id: PartitionId,
    /// Replica index the member held before the migration, -1 for none.
    pub current_replica_index: i32,
    /// Replica index the member holds after the migration, -1 for none.
    pub new_replica_index: i32,
    pub migration_id: Uuid,
}

impl PartitionMigrationEvent {
    pub fn new(
        endpoint: MigrationEndpoint,
        partition_id: PartitionId,
        current_replica_index: i32,
        new_replica_index: i32,
    ) -> Self {
        Self {
            endpoint,
            partition_id,
            current_replica_index,
            new_replica_index,
            migration_id: Uuid::new_v4(),
        }
    }

    /// The same migration seen from the other endpoint.
    pub fn counterpart(&self, current_replica_index: i32, new_replica_index: i32) -> Self {
        let endpoint = match self.endpoint {
            MigrationEndpoint::Source => MigrationEndpoint::Destination,
            MigrationEndpoint::Destination => MigrationEndpoint::Source,
        };
        Self {
            endpoint,
            partition_id: self.partition_id,
            current_replica_index,
            new_replica_index,
            migration_id: self.migration_id,
        }
    }
}

impl fmt::Display for PartitionMigrationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "migration {} partition={} endpoint={:?} replica {} -> {}",
            self.migration_id,
            self.partition_id,
            self.endpoint,
            self.current_replica_index,
            self.new_replica_index
        )
    }
}

/// Request for the state replicas up to `replica_index` need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionReplicationEvent {
    pub partition_id: PartitionId,
    pub replica_index: i32,
}

impl PartitionReplicationEvent {
    pub fn new(partition_id: PartitionId, replica_index: i32) -> Self {
        Self {
            partition_id,
            replica_index,
        }
    }
}

/// True if a container with `backup_count` backups must be dropped by a
/// member left at `replica_index`.
pub fn is_outside_replica_range(replica_index: i32, backup_count: i32) -> bool {
    replica_index < 0 || replica_index > backup_count
}

/// One replicated object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub value: Bytes,
    pub clock: VectorClock,
    pub backup_count: i32,
}

/// Immutable copy of a service's state for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    service_name: String,
    partition_id: PartitionId,
    replica_index: i32,
    entries: BTreeMap<String, SnapshotEntry>,
}

impl PartitionSnapshot {
    pub fn new(
        service_name: impl Into<String>,
        partition_id: PartitionId,
        replica_index: i32,
        entries: BTreeMap<String, SnapshotEntry>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            partition_id,
            replica_index,
            entries,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn replica_index(&self) -> i32 {
        self.replica_index
    }

    pub fn entries(&self) -> &BTreeMap<String, SnapshotEntry> {
        &self.entries
    }

    pub fn into_entries(self) -> BTreeMap<String, SnapshotEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A partitioned service whose state follows partition replicas around.
pub trait MigrationAwareService: Send + Sync + 'static {
    fn service_name(&self) -> &str;

    /// State of `partition_id` needed by replicas up to `replica_index`, or
    /// `None` if the service holds nothing for it.
    ///
    /// Runs on the partition's thread.
    fn prepare_replication(&self, event: &PartitionReplicationEvent) -> Result<Option<PartitionSnapshot>>;

    /// Install a snapshot produced by `prepare_replication` on another member.
    fn apply_replication(&self, snapshot: PartitionSnapshot) -> Result<()>;

    fn before_migration(&self, _event: &PartitionMigrationEvent) {}

    fn commit_migration(&self, event: &PartitionMigrationEvent);

    fn rollback_migration(&self, event: &PartitionMigrationEvent);
}

/// A deferred split-brain merge. Returns what it accomplished.
pub type MergeRunnable = Box<dyn FnOnce() -> crate::replication::MergeReport + Send>;

/// A service that can reconcile its state after a split-brain heals.
pub trait SplitBrainHandlerService: Send + Sync + 'static {
    /// Collect local state to merge and clear it.
    ///
    /// The returned task blocks until the merge finishes or times out, so it
    /// must not run on a partition thread.
    fn prepare_merge_runnable(&self) -> Option<MergeRunnable>;
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Run `f` on the partition's thread and wait for its result.
///
/// If the wait times out before `f` starts, `f` is cancelled and never runs.
/// Once `f` has started the wait continues until it finishes, so a timeout
/// never leaves work running behind the caller's back.
fn on_partition<T, F>(
    executor: &OperationExecutor,
    partition_id: PartitionId,
    timeout: Duration,
    f: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let state = Arc::new(AtomicU8::new(PENDING));
    let task_state = state.clone();
    executor.execute(Task::PartitionRunnable(PartitionRunnable::new(
        partition_id,
        move |_ctx| {
            if task_state
                .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _ = tx.send(f());
            }
        },
    )))?;
    let timed_out = || -> Result<T> {
        Err(ReplicationError::PartitionTimeout {
            partition_id,
            waited_ms: timeout.as_millis() as u64,
        }
        .into())
    };
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            if state
                .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return timed_out();
            }
            debug!(partition_id, "partition task already started, waiting for it");
            rx.recv().unwrap_or_else(|_| timed_out())
        }
        Err(RecvTimeoutError::Disconnected) => timed_out(),
    }
}

/// Outcome of [`migrate_partition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub migration_id: Uuid,
    pub committed: bool,
    /// Entries copied to the destination.
    pub entries: usize,
}

/// Copy one partition replica from `source` to `destination` and commit, or
/// roll back both sides if the copy fails.
///
/// `source_event` describes the move from the source's point of view.
/// Snapshot preparation and application both run on the partition's thread.
pub fn migrate_partition(
    executor: &OperationExecutor,
    source: Arc<dyn MigrationAwareService>,
    destination: Arc<dyn MigrationAwareService>,
    source_event: PartitionMigrationEvent,
    destination_replica_index: i32,
    timeout: Duration,
) -> Result<MigrationOutcome> {
    let partition_id = source_event.partition_id;
    let destination_event = source_event.counterpart(-1, destination_replica_index);
    source.before_migration(&source_event);
    destination.before_migration(&destination_event);

    let request = PartitionReplicationEvent::new(partition_id, destination_replica_index);
    let preparing = source.clone();
    let applying = destination.clone();
    let copied = on_partition(executor, partition_id, timeout, move || {
        match preparing.prepare_replication(&request)? {
            Some(snapshot) => {
                let entries = snapshot.len();
                applying.apply_replication(snapshot)?;
                Ok(entries)
            }
            None => Ok(0),
        }
    });

    match copied {
        Ok(entries) => {
            source.commit_migration(&source_event);
            destination.commit_migration(&destination_event);
            debug!(%source_event, entries, "migration committed");
            Ok(MigrationOutcome {
                migration_id: source_event.migration_id,
                committed: true,
                entries,
            })
        }
        Err(e) => {
            warn!(%source_event, error = %e, "migration failed, rolling back");
            source.rollback_migration(&source_event);
            destination.rollback_migration(&destination_event);
            Ok(MigrationOutcome {
                migration_id: source_event.migration_id,
                committed: false,
                entries: 0,
            })
        }
    }
}
