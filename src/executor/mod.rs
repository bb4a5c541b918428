//! Partition-aware operation execution.
//!
//! Every task is routed to exactly one execution context:
//!
//! ```text
//!                 execute(task)
//!                       │
//!         ┌─────────────┴──────────────┐
//!   partition_id < 0             partition_id >= 0
//!         │                            │
//!         ▼                            ▼
//! ┌───────────────┐     ┌──────────────────────────────────┐
//! │ generic queue │     │ partition queue[pid % threads]    │
//! │ (shared)      │     │ (one per partition thread)        │
//! └───────┬───────┘     └────────────────┬─────────────────┘
//!         ▼                              ▼
//!  generic threads              partition threads ──lock──┐
//!  (first N: priority lane)                               │
//!                                                         ▼
//!                                             ┌──────────────────┐
//!  run_or_execute (caller-runs) ──try_lock──▶ │ PartitionLocks   │
//!                                             └──────────────────┘
//! ```
//!
//! A partition is never executing on more than one thread. Partition threads
//! and caller-runs borrowers both take the partition's lock before touching
//! its runner, and release it on every exit path.
//!
//! Nested calls are checked against the explicit [`CallContext`]: a call made
//! from inside a partition-bound runner may only target that same partition.

mod context;
mod operation_executor;
mod partition_locks;
mod queue;
mod runner;
mod task;
mod thread;

pub use context::{CallContext, ThreadRole};
pub use operation_executor::{LiveOperation, OperationExecutor, RunOutcome};
pub use partition_locks::{OwnerToken, PartitionGuard, PartitionLocks};
pub use queue::OperationQueue;
pub use runner::{
    HandlerRunnerFactory, LocalOperationHandler, OperationHandler, OperationRunner,
    OperationRunnerFactory,
};
pub use task::{Operation, PartitionRunnable, Task, TaskDescriptor, TaskKind};
pub use thread::{LoggingOutOfMemoryHandler, OutOfMemoryHandler};
