//! Runners execute single tasks against the owning service.
//!
//! There is one runner per partition, one per generic thread and one ad-hoc
//! runner for threads that are not operation threads. A partition runner is
//! only ever invoked by a thread holding that partition's slot.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, NetworkError, Result};
use crate::executor::context::CallContext;
use crate::executor::task::{Operation, PartitionRunnable, Task, TaskDescriptor, TaskKind};
use crate::network::Packet;
use crate::types::{PartitionId, Response, GENERIC_PARTITION_ID};

/// Service-side hooks invoked by runners.
pub trait OperationHandler: Send + Sync + 'static {
    /// Decode an inbound packet into an operation.
    fn decode(&self, packet: &Packet) -> Result<Box<dyn Operation>>;

    /// Execute an operation against partition-local state.
    fn execute(&self, op: Box<dyn Operation>, ctx: &CallContext<'_>) -> Result<Response> {
        op.run(ctx)
    }

    /// Deliver the response of an operation that was executed from a queue.
    fn on_response(&self, _task: &TaskDescriptor, _response: Response) {}
}

/// Handler for executors that never receive packets.
#[derive(Debug, Default)]
pub struct LocalOperationHandler;

impl OperationHandler for LocalOperationHandler {
    fn decode(&self, packet: &Packet) -> Result<Box<dyn Operation>> {
        Err(NetworkError::MalformedFrame(format!(
            "no decoder registered for packet on partition {}",
            packet.partition_id()
        ))
        .into())
    }
}

/// Executes tasks for one partition, one generic thread, or ad-hoc callers.
pub struct OperationRunner {
    partition_id: PartitionId,
    handler: Arc<dyn OperationHandler>,
    current: Mutex<Option<TaskDescriptor>>,
    tracks_current: bool,
    executed: AtomicU64,
}

impl OperationRunner {
    /// Create a runner for the given partition (negative for generic runners).
    pub fn new(partition_id: PartitionId, handler: Arc<dyn OperationHandler>) -> Self {
        Self {
            partition_id,
            handler,
            current: Mutex::new(None),
            tracks_current: true,
            executed: AtomicU64::new(0),
        }
    }

    /// Create a runner shared by arbitrary calling threads.
    ///
    /// Several threads may use it at once, so it does not publish a current task.
    pub fn ad_hoc(handler: Arc<dyn OperationHandler>) -> Self {
        Self {
            tracks_current: false,
            ..Self::new(GENERIC_PARTITION_ID, handler)
        }
    }

    /// The partition this runner serves, negative for generic and ad-hoc runners.
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// What the runner is executing right now.
    pub fn current_task(&self) -> Option<TaskDescriptor> {
        self.current.lock().clone()
    }

    /// Number of tasks this runner has executed.
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Execute an operation and return its response to the caller.
    pub fn run_operation(&self, op: Box<dyn Operation>, ctx: &CallContext<'_>) -> Result<Response> {
        self.check_partition(op.partition_id())?;
        self.executed.fetch_add(1, Ordering::Relaxed);
        let _current = self.enter(TaskDescriptor::of_operation(op.as_ref()));
        self.handler.execute(op, ctx)
    }

    /// Execute an operation taken from a queue; the response goes to the handler.
    pub(crate) fn run_queued_operation(
        &self,
        op: Box<dyn Operation>,
        ctx: &CallContext<'_>,
    ) -> Result<()> {
        let descriptor = TaskDescriptor::of_operation(op.as_ref());
        let response = self.run_operation(op, ctx)?;
        self.handler.on_response(&descriptor, response);
        Ok(())
    }

    /// Decode and execute an inbound packet.
    pub fn run_packet(&self, packet: Packet, ctx: &CallContext<'_>) -> Result<()> {
        let op = {
            let _current = self.enter(TaskDescriptor::of_packet(&packet));
            self.handler.decode(&packet)?
        };
        self.run_queued_operation(op, ctx)
    }

    /// Execute any queued task.
    pub(crate) fn run_task(&self, task: Task, ctx: &CallContext<'_>) -> Result<()> {
        match task {
            Task::Packet(packet) => self.run_packet(packet, ctx),
            Task::Operation(op) => self.run_queued_operation(op, ctx),
            Task::PartitionRunnable(task) => {
                self.run_partition_runnable(task, ctx);
                Ok(())
            }
            Task::Runnable(f) => {
                f(ctx);
                Ok(())
            }
        }
    }

    /// Execute a partition-bound closure.
    pub fn run_partition_runnable(&self, task: PartitionRunnable, ctx: &CallContext<'_>) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        let _current = self.enter(TaskDescriptor::of_kind(
            TaskKind::PartitionRunnable,
            task.partition_id(),
        ));
        task.run(ctx);
    }

    /// Partition runners only run their own partition; generic and ad-hoc
    /// runners only run generic operations, since they hold no partition slot.
    fn check_partition(&self, partition_id: PartitionId) -> Result<()> {
        if self.partition_id >= 0 && partition_id != self.partition_id {
            return Err(Error::illegal_thread_state(format!(
                "runner for partition {} asked to run an operation for partition {}",
                self.partition_id, partition_id
            )));
        }
        if self.partition_id < 0 && partition_id >= 0 {
            return Err(Error::illegal_thread_state(format!(
                "generic runner asked to run an operation for partition {partition_id}"
            )));
        }
        Ok(())
    }

    fn enter(&self, descriptor: TaskDescriptor) -> Option<CurrentTask<'_>> {
        if !self.tracks_current {
            return None;
        }
        let previous = self.current.lock().replace(descriptor);
        Some(CurrentTask {
            runner: self,
            previous,
        })
    }
}

impl std::fmt::Debug for OperationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRunner")
            .field("partition_id", &self.partition_id)
            .field("executed", &self.executed_count())
            .field("current", &self.current_task())
            .finish()
    }
}

/// Restores the previous "current task" when a (possibly nested) execution ends.
struct CurrentTask<'a> {
    runner: &'a OperationRunner,
    previous: Option<TaskDescriptor>,
}

impl Drop for CurrentTask<'_> {
    fn drop(&mut self) {
        *self.runner.current.lock() = self.previous.take();
    }
}

/// Creates the runners an executor needs.
pub trait OperationRunnerFactory: Send + Sync {
    /// Runner for one partition.
    fn create_partition_runner(&self, partition_id: PartitionId) -> OperationRunner;

    /// Runner owned by one generic operation thread.
    fn create_generic_runner(&self) -> OperationRunner;

    /// Runner used by threads that are not operation threads.
    fn create_ad_hoc_runner(&self) -> OperationRunner;
}

/// Factory handing the same handler to every runner.
#[derive(Clone)]
pub struct HandlerRunnerFactory {
    handler: Arc<dyn OperationHandler>,
}

impl HandlerRunnerFactory {
    pub fn new(handler: Arc<dyn OperationHandler>) -> Self {
        Self { handler }
    }
}

impl OperationRunnerFactory for HandlerRunnerFactory {
    fn create_partition_runner(&self, partition_id: PartitionId) -> OperationRunner {
        OperationRunner::new(partition_id, self.handler.clone())
    }

    fn create_generic_runner(&self) -> OperationRunner {
        OperationRunner::new(GENERIC_PARTITION_ID, self.handler.clone())
    }

    fn create_ad_hoc_runner(&self) -> OperationRunner {
        OperationRunner::ad_hoc(self.handler.clone())
    }
}
