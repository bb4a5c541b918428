//! Split-brain merge policies and the merger that applies them.

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, ReplicationError, Result};
use crate::executor::{CallContext, Operation, OperationExecutor, Task};
use crate::replication::migration::SnapshotEntry;
use crate::types::{PartitionId, Response};

/// Per-entry wait granted to a merge.
pub const TIMEOUT_FACTOR: Duration = Duration::from_millis(500);

/// Decides which value survives when a merging entry meets the local one.
pub trait MergePolicy: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    /// The entry to keep, or `None` to keep nothing.
    fn merge(&self, merging: &SnapshotEntry, existing: Option<&SnapshotEntry>) -> Option<SnapshotEntry>;

    /// Containers with a discarding policy are not merged at all.
    fn is_discard(&self) -> bool {
        false
    }
}

/// The merging entry always wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughMergePolicy;

impl MergePolicy for PassThroughMergePolicy {
    fn name(&self) -> &'static str {
        "PassThroughMergePolicy"
    }

    fn merge(&self, merging: &SnapshotEntry, _existing: Option<&SnapshotEntry>) -> Option<SnapshotEntry> {
        Some(merging.clone())
    }
}

/// The merging entry is only taken if there is no local one.
#[derive(Debug, Default, Clone, Copy)]
pub struct PutIfAbsentMergePolicy;

impl MergePolicy for PutIfAbsentMergePolicy {
    fn name(&self) -> &'static str {
        "PutIfAbsentMergePolicy"
    }

    fn merge(&self, merging: &SnapshotEntry, existing: Option<&SnapshotEntry>) -> Option<SnapshotEntry> {
        Some(existing.unwrap_or(merging).clone())
    }
}

/// The entry whose vector clock dominates wins. On concurrent updates the
/// local value is kept and the clocks are merged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestUpdateMergePolicy;

impl MergePolicy for LatestUpdateMergePolicy {
    fn name(&self) -> &'static str {
        "LatestUpdateMergePolicy"
    }

    fn merge(&self, merging: &SnapshotEntry, existing: Option<&SnapshotEntry>) -> Option<SnapshotEntry> {
        let Some(existing) = existing else {
            return Some(merging.clone());
        };
        if merging.clock.is_after(&existing.clock) {
            return Some(merging.clone());
        }
        let mut kept = existing.clone();
        kept.clock.merge(&merging.clock);
        Some(kept)
    }
}

/// Local state is kept and nothing is merged.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardMergePolicy;

impl MergePolicy for DiscardMergePolicy {
    fn name(&self) -> &'static str {
        "DiscardMergePolicy"
    }

    fn merge(&self, _merging: &SnapshotEntry, existing: Option<&SnapshotEntry>) -> Option<SnapshotEntry> {
        existing.cloned()
    }

    fn is_discard(&self) -> bool {
        true
    }
}

/// Look a policy up by its name.
pub fn merge_policy_by_name(name: &str) -> Option<Arc<dyn MergePolicy>> {
    let policy: Arc<dyn MergePolicy> = match name {
        "PassThroughMergePolicy" => Arc::new(PassThroughMergePolicy),
        "PutIfAbsentMergePolicy" => Arc::new(PutIfAbsentMergePolicy),
        "LatestUpdateMergePolicy" => Arc::new(LatestUpdateMergePolicy),
        "DiscardMergePolicy" => Arc::new(DiscardMergePolicy),
        _ => return None,
    };
    Some(policy)
}

/// Where merge operations apply their entries.
pub trait MergeTarget: Send + Sync + 'static {
    /// Merge one entry into partition-local state. Runs on the partition's thread.
    fn apply_merge(
        &self,
        partition_id: PartitionId,
        name: &str,
        entry: SnapshotEntry,
        policy: &dyn MergePolicy,
    ) -> Result<()>;
}

/// Entries of one container waiting to be merged.
#[derive(Debug, Clone)]
pub struct MergeBatch {
    pub partition_id: PartitionId,
    pub policy: Arc<dyn MergePolicy>,
    pub entries: Vec<(String, SnapshotEntry)>,
}

/// What a merge run accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub partitions: usize,
    pub operations: usize,
    pub entries: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: bool,
}

impl MergeReport {
    /// Operations that never reported back.
    pub fn pending(&self) -> usize {
        self.operations - self.succeeded - self.failed
    }
}

/// Reports the outcome of one merge operation exactly once, counting a
/// dropped or panicked operation as failed.
struct Completion {
    tx: Option<Sender<bool>>,
}

impl Completion {
    fn complete(mut self, ok: bool) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ok);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(false);
        }
    }
}

struct MergeOperation {
    partition_id: PartitionId,
    policy: Arc<dyn MergePolicy>,
    entries: Vec<(String, SnapshotEntry)>,
    target: Arc<dyn MergeTarget>,
    completion: Completion,
}

impl fmt::Debug for MergeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeOperation")
            .field("partition_id", &self.partition_id)
            .field("policy", &self.policy.name())
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Operation for MergeOperation {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn service_name(&self) -> &str {
        "merge"
    }

    fn run(self: Box<Self>, _ctx: &CallContext<'_>) -> Result<Response> {
        let MergeOperation {
            partition_id,
            policy,
            entries,
            target,
            completion,
        } = *self;
        let mut failure = None;
        for (name, entry) in entries {
            if let Err(e) = target.apply_merge(partition_id, &name, entry, policy.as_ref()) {
                warn!(partition_id, %name, error = %e, "error while running merge operation");
                failure = Some(e);
            }
        }
        completion.complete(failure.is_none());
        match failure {
            Some(e) => Err(e),
            None => Ok(Response::Empty),
        }
    }
}

/// Sends merge operations through the executor and waits for them.
///
/// The wait is bounded by [`TIMEOUT_FACTOR`] per entry. A timeout is logged
/// and the partial result returned.
pub struct Merger {
    executor: Arc<OperationExecutor>,
    target: Arc<dyn MergeTarget>,
    batch_size: usize,
    timeout_factor: Duration,
}

impl Merger {
    pub fn new(executor: Arc<OperationExecutor>, target: Arc<dyn MergeTarget>) -> Self {
        Self {
            executor,
            target,
            batch_size: 100,
            timeout_factor: TIMEOUT_FACTOR,
        }
    }

    /// Entries per merge operation.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeout_factor(mut self, factor: Duration) -> Self {
        self.timeout_factor = factor;
        self
    }

    /// Merge everything in `batches`, keyed by partition.
    pub fn run(&self, batches: BTreeMap<PartitionId, Vec<MergeBatch>>) -> MergeReport {
        let (tx, rx) = unbounded();
        let mut report = MergeReport {
            partitions: batches.len(),
            ..MergeReport::default()
        };

        for (partition_id, container_batches) in batches {
            for batch in container_batches {
                if batch.policy.is_discard() {
                    continue;
                }
                let mut entries = batch.entries.into_iter().peekable();
                while entries.peek().is_some() {
                    let chunk: Vec<_> = entries.by_ref().take(self.batch_size).collect();
                    report.entries += chunk.len();
                    report.operations += 1;
                    let op = MergeOperation {
                        partition_id,
                        policy: batch.policy.clone(),
                        entries: chunk,
                        target: self.target.clone(),
                        completion: Completion {
                            tx: Some(tx.clone()),
                        },
                    };
                    // A rejected task drops the operation, which reports failure.
                    if let Err(e) = self.executor.execute(Task::Operation(Box::new(op))) {
                        warn!(partition_id, error = %e, "failed to submit merge operation");
                    }
                }
            }
        }
        drop(tx);

        let waited = self.timeout_factor * report.entries as u32;
        let deadline = Instant::now() + waited;
        while report.succeeded + report.failed < report.operations {
            match rx.recv_deadline(deadline) {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.failed += 1,
                Err(RecvTimeoutError::Timeout) => {
                    report.timed_out = true;
                    let e = Error::from(ReplicationError::MergeTimeout {
                        pending: report.pending(),
                        waited_ms: waited.as_millis() as u64,
                    });
                    warn!(error = %e, "split-brain healing didn't finish within the timeout");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if report.operations > 0 {
            info!(
                partitions = report.partitions,
                operations = report.operations,
                entries = report.entries,
                succeeded = report.succeeded,
                failed = report.failed,
                "split-brain merge finished"
            );
        } else {
            debug!("nothing to merge");
        }
        report
    }
}

impl fmt::Debug for Merger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merger")
            .field("batch_size", &self.batch_size)
            .field("timeout_factor", &self.timeout_factor)
            .finish_non_exhaustive()
    }
}
