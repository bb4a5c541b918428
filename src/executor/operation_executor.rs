//! The partition-aware operation executor.
//!
//! Routing is `partition_id % partition_thread_count` for partition tasks and
//! the shared generic queue for everything else. The mapping is fixed for the
//! lifetime of the executor.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::executor::context::{CallContext, ThreadRole};
use crate::executor::partition_locks::{OwnerToken, PartitionLocks};
use crate::executor::queue::OperationQueue;
use crate::executor::runner::{
    HandlerRunnerFactory, OperationHandler, OperationRunner, OperationRunnerFactory,
};
use crate::executor::task::{Operation, PartitionRunnable, Task, TaskKind};
use crate::executor::thread::{
    spawn_worker, LoggingOutOfMemoryHandler, OutOfMemoryHandler, WorkerKind,
};
use crate::metrics::{Counter, ExecutorMetrics, OperationThreadStats};
use crate::types::{CallId, PartitionId, PartitionIdSet, Response};

/// Result of [`OperationExecutor::run_or_execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The operation ran on the calling thread.
    Completed(Response),
    /// The operation was queued on its partition thread.
    Offloaded,
}

impl RunOutcome {
    /// The inline response, if the operation ran on the calling thread.
    pub fn into_response(self) -> Option<Response> {
        match self {
            RunOutcome::Completed(r) => Some(r),
            RunOutcome::Offloaded => None,
        }
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self, RunOutcome::Offloaded)
    }
}

/// An operation observed in flight by [`OperationExecutor::scan_live_operations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveOperation {
    pub partition_id: PartitionId,
    pub caller: Option<SocketAddr>,
    pub call_id: CallId,
}

/// State shared between the executor handle and its threads.
pub(crate) struct ExecutorInner {
    config: ExecutorConfig,
    partition_runners: Box<[OperationRunner]>,
    generic_runners: Box<[OperationRunner]>,
    ad_hoc_runner: OperationRunner,
    partition_queues: Box<[OperationQueue]>,
    generic_queue: OperationQueue,
    partition_locks: Option<PartitionLocks>,
    partition_stats: Box<[OperationThreadStats]>,
    generic_stats: Box<[OperationThreadStats]>,
    conflict_count: Counter,
    next_owner: AtomicU64,
    shutdown: AtomicBool,
    oom_handler: Arc<dyn OutOfMemoryHandler>,
}

impl ExecutorInner {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn next_owner_token(&self) -> OwnerToken {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn partition_queue(&self, thread_id: usize) -> &OperationQueue {
        &self.partition_queues[thread_id]
    }

    pub(crate) fn generic_queue(&self) -> &OperationQueue {
        &self.generic_queue
    }

    pub(crate) fn partition_thread_stats(&self, thread_id: usize) -> &OperationThreadStats {
        &self.partition_stats[thread_id]
    }

    pub(crate) fn generic_thread_stats(&self, index: usize) -> &OperationThreadStats {
        &self.generic_stats[index]
    }

    pub(crate) fn out_of_memory_handler(&self) -> &dyn OutOfMemoryHandler {
        self.oom_handler.as_ref()
    }

    pub(crate) fn thread_name(&self, kind: WorkerKind) -> String {
        let prefix = &self.config.thread_name_prefix;
        match kind {
            WorkerKind::Partition { thread_id } => format!("{prefix}-partition-operation-{thread_id}"),
            WorkerKind::Generic { index, priority: true } => {
                format!("{prefix}-priority-generic-operation-{index}")
            }
            WorkerKind::Generic { index, priority: false } => {
                format!("{prefix}-generic-operation-{index}")
            }
        }
    }

    fn partition_thread_count(&self) -> usize {
        self.partition_queues.len()
    }

    fn thread_index(&self, partition_id: PartitionId) -> usize {
        partition_id as usize % self.partition_thread_count()
    }

    fn check_partition(&self, partition_id: PartitionId) -> Result<()> {
        if partition_id as usize >= self.partition_runners.len() {
            return Err(Error::InvalidPartition {
                partition_id,
                partition_count: self.partition_runners.len(),
            });
        }
        Ok(())
    }

    fn check_context(&self, ctx: &CallContext<'_>) -> Result<()> {
        if !ctx.belongs_to(self) {
            return Err(Error::illegal_thread_state(
                "call context belongs to a different executor",
            ));
        }
        Ok(())
    }

    pub(crate) fn execute(&self, task: Task) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let partition_id = task.partition_id();
        let urgent = task.is_urgent();
        if partition_id < 0 {
            self.generic_queue.add(task, urgent);
        } else {
            self.check_partition(partition_id)?;
            self.partition_queues[self.thread_index(partition_id)].add(task, urgent);
        }
        Ok(())
    }

    pub(crate) fn is_run_allowed(&self, ctx: &CallContext<'_>, partition_id: PartitionId) -> bool {
        match ctx.role() {
            ThreadRole::Io => false,
            _ if partition_id < 0 => !ctx.is_nested(),
            ThreadRole::PartitionOperation { thread_id } => {
                thread_id == self.thread_index(partition_id)
                    && ctx.bound_partition().map_or(true, |bound| bound == partition_id)
            }
            // Only nested calls for the partition the caller already holds.
            ThreadRole::GenericOperation { .. } | ThreadRole::Caller => {
                ctx.bound_partition() == Some(partition_id)
            }
        }
    }

    pub(crate) fn is_invocation_allowed(
        &self,
        ctx: &CallContext<'_>,
        partition_id: PartitionId,
        is_async: bool,
    ) -> bool {
        match ctx.role() {
            ThreadRole::Io => false,
            _ if is_async || partition_id < 0 => true,
            ThreadRole::PartitionOperation { thread_id } => match ctx.bound_partition() {
                Some(bound) => bound == partition_id,
                None => thread_id == self.thread_index(partition_id),
            },
            ThreadRole::GenericOperation { .. } | ThreadRole::Caller => true,
        }
    }

    pub(crate) fn run(&self, ctx: &CallContext<'_>, op: Box<dyn Operation>) -> Result<Response> {
        self.check_context(ctx)?;
        let partition_id = op.partition_id();
        if !self.is_run_allowed(ctx, partition_id) {
            return Err(Error::illegal_thread_state(format!(
                "{} thread (bound to {:?}) is not allowed to run {:?}",
                ctx.role(),
                ctx.bound_partition(),
                op
            )));
        }

        if partition_id < 0 {
            let runner = match ctx.role() {
                ThreadRole::GenericOperation { index } => &self.generic_runners[index],
                _ => &self.ad_hoc_runner,
            };
            return runner.run_operation(op, ctx);
        }

        self.check_partition(partition_id)?;
        if ctx.bound_partition() == Some(partition_id) {
            return self.partition_runners[partition_id as usize].run_operation(op, ctx);
        }
        self.with_partition(ctx, partition_id, |runner| runner.run_operation(op, ctx))
    }

    pub(crate) fn run_or_execute(
        &self,
        ctx: &CallContext<'_>,
        op: Box<dyn Operation>,
    ) -> Result<RunOutcome> {
        self.check_context(ctx)?;
        if ctx.role() == ThreadRole::Io {
            return Err(Error::illegal_thread_state(format!(
                "I/O thread is not allowed to run {op:?}"
            )));
        }

        let partition_id = op.partition_id();
        if let Some(bound) = ctx.bound_partition() {
            if partition_id != bound {
                return Err(Error::illegal_thread_state(format!(
                    "nested call for partition {partition_id} from a runner bound to partition {bound}: {op:?}"
                )));
            }
            let response = self.partition_runners[bound as usize].run_operation(op, ctx)?;
            return Ok(RunOutcome::Completed(response));
        }

        if partition_id < 0 {
            return self.run(ctx, op).map(RunOutcome::Completed);
        }
        self.check_partition(partition_id)?;

        let Some(locks) = self.partition_locks.as_ref().filter(|_| op.allows_caller_runs()) else {
            self.execute(Task::Operation(op))?;
            return Ok(RunOutcome::Offloaded);
        };

        match locks.try_lock_guard(partition_id, ctx.owner()) {
            Some(_guard) => {
                let _bound = ctx.bind(partition_id);
                let response = self.partition_runners[partition_id as usize].run_operation(op, ctx)?;
                Ok(RunOutcome::Completed(response))
            }
            None => {
                self.conflict_count.inc();
                self.execute(Task::Operation(op))?;
                Ok(RunOutcome::Offloaded)
            }
        }
    }

    /// Run `f` against a partition runner while holding the partition's slot.
    fn with_partition<R>(
        &self,
        ctx: &CallContext<'_>,
        partition_id: PartitionId,
        f: impl FnOnce(&OperationRunner) -> R,
    ) -> R {
        let _guard = self
            .partition_locks
            .as_ref()
            .map(|locks| locks.lock_guard(partition_id, ctx.owner()));
        let _bound = ctx.bind(partition_id);
        f(&self.partition_runners[partition_id as usize])
    }

    /// Execute a task taken from a queue on an operation thread.
    pub(crate) fn dispatch(&self, ctx: &CallContext<'_>, task: Task) -> Result<()> {
        let partition_id = task.partition_id();
        if partition_id >= 0 {
            self.check_partition(partition_id)?;
            return self.with_partition(ctx, partition_id, |r| r.run_task(task, ctx));
        }

        let runner = match ctx.role() {
            ThreadRole::GenericOperation { index } => &self.generic_runners[index],
            _ => &self.ad_hoc_runner,
        };
        runner.run_task(task, ctx)
    }
}

/// Owns the operation threads, their queues and the runners.
///
/// # Example
///
/// ```rust,ignore
/// let executor = OperationExecutor::with_handler(ExecutorConfig::default(), handler)?;
/// executor.start()?;
///
/// let ctx = executor.caller_context();
/// match ctx.run_or_execute(Box::new(op))? {
///     RunOutcome::Completed(response) => println!("{response:?}"),
///     RunOutcome::Offloaded => println!("queued"),
/// }
/// ```
pub struct OperationExecutor {
    inner: Arc<ExecutorInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    done_rx: Mutex<Option<Receiver<()>>>,
    started: AtomicBool,
}

impl OperationExecutor {
    /// Create an executor. Threads are spawned by [`OperationExecutor::start`].
    pub fn new(config: ExecutorConfig, factory: &dyn OperationRunnerFactory) -> Result<Self> {
        Self::with_out_of_memory_handler(config, factory, Arc::new(LoggingOutOfMemoryHandler))
    }

    /// Create an executor whose runners all share one handler.
    pub fn with_handler(config: ExecutorConfig, handler: Arc<dyn OperationHandler>) -> Result<Self> {
        Self::new(config, &HandlerRunnerFactory::new(handler))
    }

    /// Create an executor with a custom out-of-memory handler.
    pub fn with_out_of_memory_handler(
        config: ExecutorConfig,
        factory: &dyn OperationRunnerFactory,
        oom_handler: Arc<dyn OutOfMemoryHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let partition_runners = (0..config.partition_count)
            .map(|pid| factory.create_partition_runner(pid as PartitionId))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let generic_runners = (0..config.generic_thread_count)
            .map(|_| factory.create_generic_runner())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let partition_queues = (0..config.partition_thread_count)
            .map(|_| OperationQueue::with_idle_strategy(config.idle_strategy))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let partition_stats = (0..config.partition_thread_count)
            .map(|_| OperationThreadStats::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let generic_stats = (0..config.generic_thread_count)
            .map(|_| OperationThreadStats::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let partition_locks = config
            .caller_runs_enabled
            .then(|| PartitionLocks::new(config.partition_count));

        let inner = ExecutorInner {
            partition_runners,
            generic_runners,
            ad_hoc_runner: factory.create_ad_hoc_runner(),
            partition_queues,
            generic_queue: OperationQueue::new(),
            partition_locks,
            partition_stats,
            generic_stats,
            conflict_count: Counter::new("conflict_count", "Caller-runs attempts that found the partition locked"),
            next_owner: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            oom_handler,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
            threads: Mutex::new(Vec::new()),
            done_rx: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn all operation threads. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let config = &self.inner.config;
        let total = config.partition_thread_count + config.generic_thread_count;
        let (done_tx, done_rx) = bounded::<()>(0);

        let mut threads = self.threads.lock();
        for thread_id in 0..config.partition_thread_count {
            let kind = WorkerKind::Partition { thread_id };
            threads.push(spawn_worker(self.inner.clone(), kind, done_tx.clone())?);
        }
        for index in 0..config.generic_thread_count {
            let priority = index < config.priority_generic_thread_count;
            let kind = WorkerKind::Generic { index, priority };
            threads.push(spawn_worker(self.inner.clone(), kind, done_tx.clone())?);
        }
        *self.done_rx.lock() = Some(done_rx);

        info!(
            partition_threads = config.partition_thread_count,
            generic_threads = config.generic_thread_count,
            priority_generic_threads = config.priority_generic_thread_count,
            partitions = config.partition_count,
            caller_runs = config.caller_runs_enabled,
            total,
            "operation executor started"
        );
        Ok(())
    }

    /// Stop all threads, drop queued tasks and wait up to the configured grace period.
    ///
    /// Returns true if every thread terminated in time.
    pub fn shutdown(&self) -> bool {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return true;
        }
        let inner = &self.inner;
        for queue in inner.partition_queues.iter() {
            queue.wake(1);
        }
        inner.generic_queue.wake(inner.generic_runners.len());

        let deadline = Instant::now() + inner.config.shutdown_timeout;
        let terminated = match self.done_rx.lock().take() {
            Some(done_rx) => loop {
                match done_rx.recv_deadline(deadline) {
                    Ok(()) => continue,
                    Err(RecvTimeoutError::Disconnected) => break true,
                    Err(RecvTimeoutError::Timeout) => break false,
                }
            },
            None => true,
        };

        let mut dropped = inner.generic_queue.clear();
        for queue in inner.partition_queues.iter() {
            dropped += queue.clear();
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        if terminated {
            for handle in threads {
                let _ = handle.join();
            }
            info!(dropped_tasks = dropped, "operation executor shut down");
        } else {
            warn!(
                timeout_ms = inner.config.shutdown_timeout.as_millis() as u64,
                dropped_tasks = dropped,
                "operation threads did not terminate in time"
            );
        }
        terminated
    }

    /// Context for an application thread.
    pub fn caller_context(&self) -> CallContext<'_> {
        CallContext::new(&self.inner, ThreadRole::Caller, self.inner.next_owner_token())
    }

    /// Context for a network I/O thread. It may queue tasks but never run them.
    pub fn io_context(&self) -> CallContext<'_> {
        CallContext::new(&self.inner, ThreadRole::Io, self.inner.next_owner_token())
    }

    /// Queue a task on the thread that owns its partition.
    pub fn execute(&self, task: Task) -> Result<()> {
        self.inner.execute(task)
    }

    /// Queue an operation on the thread that owns its partition.
    pub fn execute_operation<O: Operation>(&self, op: O) -> Result<()> {
        self.inner.execute(Task::operation(op))
    }

    /// Run an operation synchronously on the calling thread.
    pub fn run(&self, ctx: &CallContext<'_>, op: Box<dyn Operation>) -> Result<Response> {
        self.inner.run(ctx, op)
    }

    /// Run inline when allowed and the partition is free, otherwise queue it.
    pub fn run_or_execute(&self, ctx: &CallContext<'_>, op: Box<dyn Operation>) -> Result<RunOutcome> {
        self.inner.run_or_execute(ctx, op)
    }

    /// Whether the context's thread may run an operation for the partition right now.
    pub fn is_run_allowed(&self, ctx: &CallContext<'_>, partition_id: PartitionId) -> bool {
        ctx.belongs_to(&self.inner) && self.inner.is_run_allowed(ctx, partition_id)
    }

    /// Whether the context's thread may issue an invocation for the partition.
    pub fn is_invocation_allowed(
        &self,
        ctx: &CallContext<'_>,
        partition_id: PartitionId,
        is_async: bool,
    ) -> bool {
        ctx.belongs_to(&self.inner) && self.inner.is_invocation_allowed(ctx, partition_id, is_async)
    }

    /// Run `task` once on every partition thread, through the priority lane.
    pub fn execute_on_partition_threads<F>(&self, task: F) -> Result<()>
    where
        F: Fn(&CallContext<'_>) + Send + Sync + 'static,
    {
        if self.inner.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let task = Arc::new(task);
        for queue in self.inner.partition_queues.iter() {
            let task = task.clone();
            queue.add(Task::runnable(move |ctx| task(ctx)), true);
        }
        Ok(())
    }

    /// Run a task created by `factory` for every partition in `partitions`,
    /// each under its partition's lock on the owning thread.
    pub fn execute_on_partitions<F>(&self, partitions: &PartitionIdSet, factory: F) -> Result<()>
    where
        F: Fn(PartitionId) -> PartitionRunnable,
    {
        for partition_id in partitions.iter() {
            let task = factory(partition_id);
            debug_assert_eq!(task.partition_id(), partition_id);
            self.inner.execute(Task::PartitionRunnable(task))?;
        }
        Ok(())
    }

    /// Partition thread serving `partition_id`.
    pub fn partition_thread_index(&self, partition_id: PartitionId) -> usize {
        self.inner.thread_index(partition_id)
    }

    pub fn partition_count(&self) -> usize {
        self.inner.partition_runners.len()
    }

    pub fn partition_thread_count(&self) -> usize {
        self.inner.partition_thread_count()
    }

    pub fn generic_thread_count(&self) -> usize {
        self.inner.generic_runners.len()
    }

    pub fn priority_generic_thread_count(&self) -> usize {
        self.inner.config.priority_generic_thread_count
    }

    /// Number of caller-runs attempts that found the partition locked.
    pub fn conflict_count(&self) -> u64 {
        self.inner.conflict_count.get()
    }

    /// Runner of a partition.
    pub fn partition_runner(&self, partition_id: PartitionId) -> Option<&OperationRunner> {
        usize::try_from(partition_id)
            .ok()
            .and_then(|pid| self.inner.partition_runners.get(pid))
    }

    /// Every operation currently executing in a partition or generic runner,
    /// excluding backups.
    pub fn scan_live_operations(&self) -> Vec<LiveOperation> {
        self.inner
            .partition_runners
            .iter()
            .chain(self.inner.generic_runners.iter())
            .filter_map(|runner| runner.current_task())
            .filter(|task| task.kind == TaskKind::Operation && !task.is_backup)
            .map(|task| LiveOperation {
                partition_id: task.partition_id,
                caller: task.caller,
                call_id: task.call_id,
            })
            .collect()
    }

    /// Snapshot of queue depths, thread counters and contention.
    pub fn metrics(&self) -> ExecutorMetrics {
        let inner = &self.inner;
        let partition_threads: Vec<_> = inner
            .partition_stats
            .iter()
            .enumerate()
            .map(|(thread_id, stats)| {
                let queue = &inner.partition_queues[thread_id];
                stats.snapshot(
                    inner.thread_name(WorkerKind::Partition { thread_id }),
                    queue.normal_size(),
                    queue.priority_size(),
                )
            })
            .collect();
        let generic_threads: Vec<_> = inner
            .generic_stats
            .iter()
            .enumerate()
            .map(|(index, stats)| {
                let priority = index < inner.config.priority_generic_thread_count;
                stats.snapshot(
                    inner.thread_name(WorkerKind::Generic { index, priority }),
                    inner.generic_queue.normal_size(),
                    inner.generic_queue.priority_size(),
                )
            })
            .collect();
        let running_count = inner
            .partition_runners
            .iter()
            .chain(inner.generic_runners.iter())
            .filter(|r| r.current_task().is_some())
            .count();
        let all = partition_threads.iter().chain(generic_threads.iter());

        ExecutorMetrics {
            partition_count: inner.partition_runners.len(),
            partition_thread_count: inner.partition_thread_count(),
            generic_thread_count: inner.generic_runners.len(),
            priority_generic_thread_count: inner.config.priority_generic_thread_count,
            queue_size: inner.partition_queues.iter().map(|q| q.normal_size()).sum(),
            priority_queue_size: inner.partition_queues.iter().map(|q| q.priority_size()).sum(),
            generic_queue_size: inner.generic_queue.normal_size(),
            generic_priority_queue_size: inner.generic_queue.priority_size(),
            running_count,
            completed_count: all.clone().map(|t| t.completed_total).sum(),
            error_count: all.map(|t| t.errors).sum(),
            conflict_count: inner.conflict_count.get(),
            partition_threads,
            generic_threads,
        }
    }
}

impl Drop for OperationExecutor {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) && !self.inner.is_shutdown() {
            debug!("operation executor dropped without shutdown, stopping threads");
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("partitions", &self.partition_count())
            .field("partition_threads", &self.partition_thread_count())
            .field("generic_threads", &self.generic_thread_count())
            .field("caller_runs", &self.inner.partition_locks.is_some())
            .field("shutdown", &self.inner.is_shutdown())
            .finish()
    }
}
