//! Replica state transfer, split-brain merging and vector clocks.

mod container_service;
mod merge;
mod migration;
mod vector_clock;

pub use container_service::{ContainerConfig, GetOperation, PutOperation, ReplicatedContainerService};
pub use merge::{
    merge_policy_by_name, DiscardMergePolicy, LatestUpdateMergePolicy, MergeBatch, MergePolicy,
    MergeReport, MergeTarget, Merger, PassThroughMergePolicy, PutIfAbsentMergePolicy,
    TIMEOUT_FACTOR,
};
pub use migration::{
    is_outside_replica_range, migrate_partition, MergeRunnable, MigrationAwareService,
    MigrationEndpoint, MigrationOutcome, PartitionMigrationEvent, PartitionReplicationEvent,
    PartitionSnapshot, SnapshotEntry, SplitBrainHandlerService,
};
pub use vector_clock::VectorClock;
