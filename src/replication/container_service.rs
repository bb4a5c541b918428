//! A partitioned service of named, replicated values.
//!
//! Each container holds one value with the vector clock of its updates and
//! lives in the partition its name hashes to. The service implements the
//! migration and split-brain contracts and is the reference user of both.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::error::{Error, ReplicationError, Result};
use crate::executor::{CallContext, Operation, OperationExecutor, PartitionRunnable};
use crate::replication::merge::{
    merge_policy_by_name, MergeBatch, MergePolicy, MergeTarget, Merger, PutIfAbsentMergePolicy,
};
use crate::replication::migration::{
    is_outside_replica_range, MergeRunnable, MigrationAwareService, MigrationEndpoint,
    PartitionMigrationEvent, PartitionReplicationEvent, PartitionSnapshot, SnapshotEntry,
    SplitBrainHandlerService,
};
use crate::replication::vector_clock::VectorClock;
use crate::types::{partition_for_key, PartitionId, PartitionIdSet, Response};

/// Settings of one container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Number of backup replicas.
    pub backup_count: i32,
    pub merge_policy: Arc<dyn MergePolicy>,
    /// Entries per merge operation.
    pub merge_batch_size: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            backup_count: 1,
            merge_policy: Arc::new(PutIfAbsentMergePolicy),
            merge_batch_size: 100,
        }
    }
}

impl ContainerConfig {
    pub fn with_backup_count(mut self, backup_count: i32) -> Self {
        self.backup_count = backup_count;
        self
    }

    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Select the merge policy by name.
    pub fn with_merge_policy_name(self, name: &str) -> Result<Self> {
        let policy = merge_policy_by_name(name)
            .ok_or_else(|| Error::Config(format!("unknown merge policy: {name}")))?;
        Ok(self.with_merge_policy(policy))
    }
}

#[derive(Debug, Clone)]
struct Container {
    partition_id: PartitionId,
    entry: SnapshotEntry,
}

/// Named replicated values grouped by partition.
pub struct ReplicatedContainerService {
    name: String,
    replica_id: String,
    partition_count: usize,
    containers: DashMap<String, Container>,
    configs: DashMap<String, ContainerConfig>,
    default_config: ContainerConfig,
    owned_partitions: RwLock<PartitionIdSet>,
    executor: RwLock<Option<Arc<OperationExecutor>>>,
    merge_target: RwLock<Option<Arc<dyn MergeTarget>>>,
    self_ref: Weak<ReplicatedContainerService>,
}

impl ReplicatedContainerService {
    /// `replica_id` identifies this member in vector clocks. The service
    /// starts out owning every partition.
    pub fn new(
        name: impl Into<String>,
        replica_id: impl Into<String>,
        partition_count: usize,
    ) -> Arc<Self> {
        Self::with_default_config(name, replica_id, partition_count, ContainerConfig::default())
    }

    pub fn with_default_config(
        name: impl Into<String>,
        replica_id: impl Into<String>,
        partition_count: usize,
        default_config: ContainerConfig,
    ) -> Arc<Self> {
        let name = name.into();
        let replica_id = replica_id.into();
        Arc::new_cyclic(|self_ref| Self {
            name,
            replica_id,
            partition_count,
            containers: DashMap::new(),
            configs: DashMap::new(),
            default_config,
            owned_partitions: RwLock::new(PartitionIdSet::all(partition_count)),
            executor: RwLock::new(None),
            merge_target: RwLock::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Executor used to run merge operations.
    pub fn attach_executor(&self, executor: Arc<OperationExecutor>) {
        *self.executor.write() = Some(executor);
    }

    /// Apply merges somewhere other than this service, typically the
    /// cluster this member rejoins.
    pub fn set_merge_target(&self, target: Arc<dyn MergeTarget>) {
        *self.merge_target.write() = Some(target);
    }

    pub fn set_config(&self, container: impl Into<String>, config: ContainerConfig) {
        self.configs.insert(container.into(), config);
    }

    fn config(&self, container: &str) -> ContainerConfig {
        self.configs
            .get(container)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn partition_of(&self, container: &str) -> PartitionId {
        partition_for_key(container.as_bytes(), self.partition_count)
    }

    /// Store a value, advancing this replica's clock entry.
    pub fn put(&self, container: &str, value: impl Into<Bytes>) -> VectorClock {
        let partition_id = self.partition_of(container);
        let backup_count = self.config(container).backup_count;
        let mut slot = self
            .containers
            .entry(container.to_string())
            .or_insert_with(|| Container {
                partition_id,
                entry: SnapshotEntry {
                    value: Bytes::new(),
                    clock: VectorClock::new(),
                    backup_count,
                },
            });
        slot.entry.value = value.into();
        slot.entry.clock.increment(&self.replica_id);
        slot.entry.clock.clone()
    }

    pub fn get(&self, container: &str) -> Option<Bytes> {
        self.containers.get(container).map(|c| c.entry.value.clone())
    }

    pub fn entry(&self, container: &str) -> Option<SnapshotEntry> {
        self.containers.get(container).map(|c| c.entry.clone())
    }

    pub fn remove(&self, container: &str) -> bool {
        self.containers.remove(container).is_some()
    }

    pub fn contains(&self, container: &str) -> bool {
        self.containers.contains_key(container)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Container names in one partition, sorted.
    pub fn containers_in(&self, partition_id: PartitionId) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .iter()
            .filter(|c| c.partition_id == partition_id)
            .map(|c| c.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn owns_partition(&self, partition_id: PartitionId) -> bool {
        self.owned_partitions.read().contains(partition_id)
    }

    pub fn set_owned_partitions(&self, partitions: PartitionIdSet) {
        *self.owned_partitions.write() = partitions;
    }

    /// This member became the primary owner of `partition_id`.
    pub fn promote(&self, partition_id: PartitionId) {
        if self.owned_partitions.write().insert(partition_id) {
            debug!(service = %self.name, partition_id, "partition promoted");
        }
    }

    /// Promote this member for every partition in `partitions`.
    ///
    /// Each promotion runs on its partition's thread, ordered after the
    /// operations already queued for that partition.
    pub fn promote_partitions(&self, executor: &OperationExecutor, partitions: &PartitionIdSet) -> Result<()> {
        let service = self.self_ref.clone();
        executor.execute_on_partitions(partitions, |partition_id| {
            let service = service.clone();
            PartitionRunnable::new(partition_id, move |_ctx| {
                if let Some(service) = service.upgrade() {
                    service.promote(partition_id);
                }
            })
        })
    }

    /// This member is no longer the primary owner of `partition_id`.
    pub fn demote(&self, partition_id: PartitionId) {
        self.owned_partitions.write().remove(partition_id);
    }

    /// Drop every container of `partition_id` whose backup count does not
    /// reach `replica_index`. Returns how many were dropped.
    pub fn dispose_obsolete_replicas(&self, partition_id: PartitionId, replica_index: i32) -> usize {
        let before = self.containers.len();
        self.containers.retain(|_, c| {
            c.partition_id != partition_id
                || !is_outside_replica_range(replica_index, c.entry.backup_count)
        });
        let dropped = before.saturating_sub(self.containers.len());
        if dropped > 0 {
            debug!(service = %self.name, partition_id, replica_index, dropped, "disposed replicas");
        }
        dropped
    }

    /// Snapshot of every container in a partition, for inspection.
    pub fn snapshot(&self, partition_id: PartitionId) -> PartitionSnapshot {
        let entries = self
            .containers
            .iter()
            .filter(|c| c.partition_id == partition_id)
            .map(|c| (c.key().clone(), c.entry.clone()))
            .collect();
        PartitionSnapshot::new(self.name.clone(), partition_id, 0, entries)
    }
}

impl MigrationAwareService for ReplicatedContainerService {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn prepare_replication(&self, event: &PartitionReplicationEvent) -> Result<Option<PartitionSnapshot>> {
        let entries: BTreeMap<String, SnapshotEntry> = self
            .containers
            .iter()
            .filter(|c| {
                c.partition_id == event.partition_id && c.entry.backup_count >= event.replica_index
            })
            .map(|c| (c.key().clone(), c.entry.clone()))
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(PartitionSnapshot::new(
            self.name.clone(),
            event.partition_id,
            event.replica_index,
            entries,
        )))
    }

    fn apply_replication(&self, snapshot: PartitionSnapshot) -> Result<()> {
        if snapshot.service_name() != self.name {
            return Err(ReplicationError::SnapshotRejected(format!(
                "snapshot of service {} applied to {}",
                snapshot.service_name(),
                self.name
            ))
            .into());
        }
        let partition_id = snapshot.partition_id();
        for (name, entry) in snapshot.into_entries() {
            let actual = self.partition_of(&name);
            if actual != partition_id {
                return Err(ReplicationError::SnapshotRejected(format!(
                    "container {name} belongs to partition {actual}, not {partition_id}"
                ))
                .into());
            }
            self.containers.insert(name, Container { partition_id, entry });
        }
        Ok(())
    }

    fn commit_migration(&self, event: &PartitionMigrationEvent) {
        if event.endpoint == MigrationEndpoint::Source {
            self.dispose_obsolete_replicas(event.partition_id, event.new_replica_index);
        }
    }

    fn rollback_migration(&self, event: &PartitionMigrationEvent) {
        if event.endpoint == MigrationEndpoint::Destination {
            self.dispose_obsolete_replicas(event.partition_id, event.current_replica_index);
        }
    }
}

impl MergeTarget for ReplicatedContainerService {
    fn apply_merge(
        &self,
        partition_id: PartitionId,
        name: &str,
        entry: SnapshotEntry,
        policy: &dyn MergePolicy,
    ) -> Result<()> {
        let existing = self.containers.get(name).map(|c| c.entry.clone());
        match policy.merge(&entry, existing.as_ref()) {
            Some(merged) => {
                self.containers.insert(
                    name.to_string(),
                    Container {
                        partition_id,
                        entry: merged,
                    },
                );
            }
            None => {
                self.containers.remove(name);
            }
        }
        Ok(())
    }
}

impl SplitBrainHandlerService for ReplicatedContainerService {
    fn prepare_merge_runnable(&self) -> Option<MergeRunnable> {
        let Some(executor) = self.executor.read().clone() else {
            warn!(service = %self.name, "no executor attached, skipping split-brain merge");
            return None;
        };
        let target = match self.merge_target.read().clone() {
            Some(target) => target,
            None => self.self_ref.upgrade()? as Arc<dyn MergeTarget>,
        };

        let mut batches: BTreeMap<PartitionId, Vec<MergeBatch>> = BTreeMap::new();
        let mut batch_size = usize::MAX;
        {
            let owned = self.owned_partitions.read();
            for c in self.containers.iter() {
                let config = self.config(c.key());
                if config.merge_policy.is_discard() || !owned.contains(c.partition_id) {
                    continue;
                }
                batch_size = batch_size.min(config.merge_batch_size);
                let partition_batches = batches.entry(c.partition_id).or_default();
                let item = (c.key().clone(), c.entry.clone());
                match partition_batches
                    .iter_mut()
                    .find(|b| b.policy.name() == config.merge_policy.name())
                {
                    Some(batch) => batch.entries.push(item),
                    None => partition_batches.push(MergeBatch {
                        partition_id: c.partition_id,
                        policy: config.merge_policy.clone(),
                        entries: vec![item],
                    }),
                }
            }
        }
        // Owned or backup, local state is replaced by the merged result.
        let cleared = self.containers.len();
        self.containers.clear();
        info!(
            service = %self.name,
            partitions = batches.len(),
            cleared,
            "prepared split-brain merge"
        );

        let merger = Merger::new(executor, target).with_batch_size(if batch_size == usize::MAX {
            self.default_config.merge_batch_size
        } else {
            batch_size
        });
        Some(Box::new(move || merger.run(batches)))
    }
}

impl fmt::Debug for ReplicatedContainerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedContainerService")
            .field("name", &self.name)
            .field("replica_id", &self.replica_id)
            .field("containers", &self.containers.len())
            .finish()
    }
}

/// Store a value in a container from the container's partition thread.
#[derive(Debug)]
pub struct PutOperation {
    service: Arc<ReplicatedContainerService>,
    container: String,
    value: Bytes,
}

impl PutOperation {
    pub fn new(service: Arc<ReplicatedContainerService>, container: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            service,
            container: container.into(),
            value: value.into(),
        }
    }
}

impl Operation for PutOperation {
    fn partition_id(&self) -> PartitionId {
        self.service.partition_of(&self.container)
    }

    fn service_name(&self) -> &str {
        self.service.name()
    }

    fn run(self: Box<Self>, _ctx: &CallContext<'_>) -> Result<Response> {
        let clock = self.service.put(&self.container, self.value);
        Ok(Response::value(bincode::serialize(&clock)?))
    }
}

/// Read a container's value from its partition thread.
#[derive(Debug)]
pub struct GetOperation {
    service: Arc<ReplicatedContainerService>,
    container: String,
}

impl GetOperation {
    pub fn new(service: Arc<ReplicatedContainerService>, container: impl Into<String>) -> Self {
        Self {
            service,
            container: container.into(),
        }
    }
}

impl Operation for GetOperation {
    fn partition_id(&self) -> PartitionId {
        self.service.partition_of(&self.container)
    }

    fn service_name(&self) -> &str {
        self.service.name()
    }

    fn run(self: Box<Self>, _ctx: &CallContext<'_>) -> Result<Response> {
        Ok(match self.service.get(&self.container) {
            Some(value) => Response::value(value),
            None => Response::Empty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::merge::{DiscardMergePolicy, LatestUpdateMergePolicy};

    const PARTITIONS: usize = 16;

    fn names_in_same_partition(service: &ReplicatedContainerService, n: usize) -> Vec<String> {
        let target = service.partition_of("c-0");
        (0..)
            .map(|i| format!("c-{i}"))
            .filter(|name| service.partition_of(name) == target)
            .take(n)
            .collect()
    }

    #[test]
    fn test_put_advances_clock() {
        let service = ReplicatedContainerService::new("containers", "m1", PARTITIONS);
        service.put("a", &b"1"[..]);
        let clock = service.put("a", &b"2"[..]);
        assert_eq!(clock.replica_timestamp("m1"), Some(2));
        assert_eq!(service.get("a"), Some(Bytes::from_static(b"2")));
        assert_eq!(service.containers_in(service.partition_of("a")), vec!["a".to_string()]);
    }

    #[test]
    fn test_prepare_replication_filters_by_backup_count() {
        let service = ReplicatedContainerService::new("containers", "m1", PARTITIONS);
        let names = names_in_same_partition(&service, 2);
        service.set_config(names[1].clone(), ContainerConfig::default().with_backup_count(0));
        for name in &names {
            service.put(name, &b"v"[..]);
        }
        let pid = service.partition_of(&names[0]);

        let snapshot = service
            .prepare_replication(&PartitionReplicationEvent::new(pid, 1))
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.entries().keys().cloned().collect::<Vec<_>>(), vec![names[0].clone()]);

        let other = (pid + 1) % PARTITIONS as PartitionId;
        if service.containers_in(other).is_empty() {
            assert!(service
                .prepare_replication(&PartitionReplicationEvent::new(other, 0))
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_commit_on_source_is_idempotent() {
        let service = ReplicatedContainerService::new("containers", "m1", PARTITIONS);
        let names = names_in_same_partition(&service, 3);
        service.set_config(names[2].clone(), ContainerConfig::default().with_backup_count(2));
        for name in &names {
            service.put(name, &b"v"[..]);
        }
        let pid = service.partition_of(&names[0]);

        // The source drops to replica 2: only the container with two backups stays.
        let event = PartitionMigrationEvent::new(MigrationEndpoint::Source, pid, 0, 2);
        service.commit_migration(&event);
        let once = service.snapshot(pid);
        service.commit_migration(&event);
        assert_eq!(service.snapshot(pid), once);
        assert_eq!(service.containers_in(pid), vec![names[2].clone()]);

        // Leaving the replica set drops everything.
        service.commit_migration(&PartitionMigrationEvent::new(MigrationEndpoint::Source, pid, 2, -1));
        assert!(service.containers_in(pid).is_empty());
    }

    #[test]
    fn test_rollback_only_on_destination() {
        let service = ReplicatedContainerService::new("containers", "m1", PARTITIONS);
        service.put("x", &b"v"[..]);
        let pid = service.partition_of("x");

        service.rollback_migration(&PartitionMigrationEvent::new(MigrationEndpoint::Source, pid, -1, 0));
        assert!(service.contains("x"));
        service.rollback_migration(&PartitionMigrationEvent::new(MigrationEndpoint::Destination, pid, -1, 0));
        assert!(!service.contains("x"));
        service.rollback_migration(&PartitionMigrationEvent::new(MigrationEndpoint::Destination, pid, -1, 0));
        assert!(!service.contains("x"));
    }

    #[test]
    fn test_apply_replication_rejects_foreign_snapshots() {
        let source = ReplicatedContainerService::new("containers", "m1", PARTITIONS);
        let other = ReplicatedContainerService::new("queues", "m2", PARTITIONS);
        source.put("x", &b"v"[..]);
        let pid = source.partition_of("x");
        let snapshot = source
            .prepare_replication(&PartitionReplicationEvent::new(pid, 0))
            .unwrap()
            .unwrap();
        assert!(other.apply_replication(snapshot).is_err());
    }

    #[test]
    fn test_apply_merge_honours_policy() {
        let service = ReplicatedContainerService::new("containers", "m1", PARTITIONS);
        service.put("x", &b"local"[..]);
        let pid = service.partition_of("x");
        let mut clock = service.entry("x").unwrap().clock;
        clock.increment("m1");
        let newer = SnapshotEntry {
            value: Bytes::from_static(b"remote"),
            clock,
            backup_count: 1,
        };

        service.apply_merge(pid, "x", newer.clone(), &DiscardMergePolicy).unwrap();
        assert_eq!(service.get("x"), Some(Bytes::from_static(b"local")));
        service.apply_merge(pid, "x", newer, &LatestUpdateMergePolicy).unwrap();
        assert_eq!(service.get("x"), Some(Bytes::from_static(b"remote")));
    }

    #[test]
    fn test_merge_requires_executor() {
        let service = ReplicatedContainerService::new("containers", "m1", PARTITIONS);
        service.put("x", &b"v"[..]);
        assert!(service.prepare_merge_runnable().is_none());
        assert!(service.contains("x"));
    }

    #[test]
    fn test_merge_policy_name_lookup() {
        assert!(ContainerConfig::default()
            .with_merge_policy_name("PassThroughMergePolicy")
            .is_ok());
        assert!(ContainerConfig::default().with_merge_policy_name("nope").is_err());
    }
}
