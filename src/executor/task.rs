//! Units of work accepted by the executor.

use std::fmt;
use std::net::SocketAddr;

use crate::error::Result;
use crate::executor::context::CallContext;
use crate::network::Packet;
use crate::types::{is_generic, CallId, PartitionId, Response};

/// A unit of work routed by partition.
///
/// The target partition must not change once the operation has been created.
pub trait Operation: Send + fmt::Debug + 'static {
    /// Target partition, negative for generic operations.
    fn partition_id(&self) -> PartitionId;

    /// Urgent operations use the priority lane.
    fn is_urgent(&self) -> bool {
        false
    }

    /// Address of the member or client that issued the call.
    fn caller(&self) -> Option<SocketAddr> {
        None
    }

    /// Call ID used to correlate the response.
    fn call_id(&self) -> CallId {
        0
    }

    /// Backup operations are skipped by liveness scans.
    fn is_backup(&self) -> bool {
        false
    }

    /// Whether a calling thread may execute this operation inline.
    fn allows_caller_runs(&self) -> bool {
        true
    }

    /// Name of the owning service, used in logs.
    fn service_name(&self) -> &str {
        "unknown"
    }

    /// Execute against partition-local state.
    ///
    /// Nested calls go through `ctx`, which knows the partition this call is bound to.
    fn run(self: Box<Self>, ctx: &CallContext<'_>) -> Result<Response>;
}

/// A closure bound to a partition, executed under that partition's lock.
pub struct PartitionRunnable {
    partition_id: PartitionId,
    task: Box<dyn FnOnce(&CallContext<'_>) + Send>,
}

impl PartitionRunnable {
    /// Wrap a closure targeting the given partition.
    pub fn new<F>(partition_id: PartitionId, task: F) -> Self
    where
        F: FnOnce(&CallContext<'_>) + Send + 'static,
    {
        Self {
            partition_id,
            task: Box::new(task),
        }
    }

    /// Target partition.
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub(crate) fn run(self, ctx: &CallContext<'_>) {
        (self.task)(ctx)
    }
}

impl fmt::Debug for PartitionRunnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRunnable")
            .field("partition_id", &self.partition_id)
            .finish_non_exhaustive()
    }
}

/// Everything an operation thread can be handed.
pub enum Task {
    /// An inbound wire frame, decoded by the runner.
    Packet(Packet),
    /// A deserialized or locally created operation.
    Operation(Box<dyn Operation>),
    /// A closure bound to one partition.
    PartitionRunnable(PartitionRunnable),
    /// A closure without partition affinity.
    Runnable(Box<dyn FnOnce(&CallContext<'_>) + Send>),
}

impl Task {
    /// Wrap an operation.
    pub fn operation<O: Operation>(op: O) -> Self {
        Task::Operation(Box::new(op))
    }

    /// Wrap a closure without partition affinity.
    pub fn runnable<F>(f: F) -> Self
    where
        F: FnOnce(&CallContext<'_>) + Send + 'static,
    {
        Task::Runnable(Box::new(f))
    }

    /// Target partition. Runnables are generic.
    pub fn partition_id(&self) -> PartitionId {
        match self {
            Task::Packet(p) => p.partition_id(),
            Task::Operation(op) => op.partition_id(),
            Task::PartitionRunnable(r) => r.partition_id(),
            Task::Runnable(_) => crate::types::GENERIC_PARTITION_ID,
        }
    }

    /// Whether the task belongs in the priority lane.
    pub fn is_urgent(&self) -> bool {
        match self {
            Task::Packet(p) => p.is_urgent(),
            Task::Operation(op) => op.is_urgent(),
            Task::PartitionRunnable(_) | Task::Runnable(_) => false,
        }
    }

    /// The task discriminant.
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Packet(_) => TaskKind::Packet,
            Task::Operation(_) => TaskKind::Operation,
            Task::PartitionRunnable(_) => TaskKind::PartitionRunnable,
            Task::Runnable(_) => TaskKind::Runnable,
        }
    }

    /// Returns true if the task has no partition affinity.
    pub fn is_generic(&self) -> bool {
        is_generic(self.partition_id())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Packet(p) => f.debug_tuple("Packet").field(p).finish(),
            Task::Operation(op) => f.debug_tuple("Operation").field(op).finish(),
            Task::PartitionRunnable(r) => f.debug_tuple("PartitionRunnable").field(r).finish(),
            Task::Runnable(_) => f.write_str("Runnable"),
        }
    }
}

/// Discriminant of [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Packet,
    Operation,
    PartitionRunnable,
    Runnable,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Packet => write!(f, "packet"),
            TaskKind::Operation => write!(f, "operation"),
            TaskKind::PartitionRunnable => write!(f, "partition-runnable"),
            TaskKind::Runnable => write!(f, "runnable"),
        }
    }
}

/// What a runner is currently executing, as seen by monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub kind: TaskKind,
    pub partition_id: PartitionId,
    pub caller: Option<SocketAddr>,
    pub call_id: CallId,
    pub is_backup: bool,
}

impl TaskDescriptor {
    pub(crate) fn of_operation(op: &dyn Operation) -> Self {
        Self {
            kind: TaskKind::Operation,
            partition_id: op.partition_id(),
            caller: op.caller(),
            call_id: op.call_id(),
            is_backup: op.is_backup(),
        }
    }

    pub(crate) fn of_packet(packet: &Packet) -> Self {
        Self {
            kind: TaskKind::Packet,
            partition_id: packet.partition_id(),
            caller: None,
            call_id: 0,
            is_backup: false,
        }
    }

    pub(crate) fn of_kind(kind: TaskKind, partition_id: PartitionId) -> Self {
        Self {
            kind,
            partition_id,
            caller: None,
            call_id: 0,
            is_backup: false,
        }
    }
}
