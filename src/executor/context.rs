//! Explicit execution context threaded through every execution entry point.
//!
//! A context records which role the current thread plays for one executor and
//! which partition runner, if any, the current call is bound to. Nested calls
//! consult it to decide whether they may run inline.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use crate::error::Result;
use crate::executor::operation_executor::{ExecutorInner, RunOutcome};
use crate::executor::partition_locks::OwnerToken;
use crate::executor::task::{Operation, Task};
use crate::types::{PartitionId, Response};

/// Role of the thread that owns a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// An application thread issuing requests.
    Caller,
    /// A partition operation thread.
    PartitionOperation { thread_id: usize },
    /// A generic operation thread.
    GenericOperation { index: usize },
    /// A network I/O thread. Never runs operations.
    Io,
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadRole::Caller => write!(f, "caller"),
            ThreadRole::PartitionOperation { thread_id } => {
                write!(f, "partition-operation-{thread_id}")
            }
            ThreadRole::GenericOperation { index } => write!(f, "generic-operation-{index}"),
            ThreadRole::Io => write!(f, "io"),
        }
    }
}

/// Per-thread view of one executor.
///
/// Contexts are confined to the thread that created them.
pub struct CallContext<'e> {
    executor: &'e ExecutorInner,
    role: ThreadRole,
    owner: OwnerToken,
    bound: Cell<Option<PartitionId>>,
    _not_send: PhantomData<*const ()>,
}

impl<'e> CallContext<'e> {
    pub(crate) fn new(executor: &'e ExecutorInner, role: ThreadRole, owner: OwnerToken) -> Self {
        Self {
            executor,
            role,
            owner,
            bound: Cell::new(None),
            _not_send: PhantomData,
        }
    }

    /// Role of the owning thread.
    pub fn role(&self) -> ThreadRole {
        self.role
    }

    /// Partition of the runner the current call is bound to.
    pub fn bound_partition(&self) -> Option<PartitionId> {
        self.bound.get()
    }

    /// Returns true while executing inside a partition-bound runner.
    pub fn is_nested(&self) -> bool {
        self.bound.get().is_some()
    }

    /// Run an operation synchronously on this thread.
    pub fn run(&self, op: Box<dyn Operation>) -> Result<Response> {
        self.executor.run(self, op)
    }

    /// Run inline when possible, otherwise hand the operation to its partition thread.
    pub fn run_or_execute(&self, op: Box<dyn Operation>) -> Result<RunOutcome> {
        self.executor.run_or_execute(self, op)
    }

    /// Queue a task on the thread owning its partition.
    pub fn execute(&self, task: Task) -> Result<()> {
        self.executor.execute(task)
    }

    pub(crate) fn owner(&self) -> OwnerToken {
        self.owner
    }

    pub(crate) fn belongs_to(&self, executor: &ExecutorInner) -> bool {
        std::ptr::eq(self.executor, executor)
    }

    /// Bind the context to a partition runner until the guard drops.
    pub(crate) fn bind(&self, partition_id: PartitionId) -> BoundRunner<'_, 'e> {
        let previous = self.bound.replace(Some(partition_id));
        BoundRunner {
            ctx: self,
            previous,
        }
    }
}

impl fmt::Debug for CallContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("role", &self.role)
            .field("owner", &self.owner)
            .field("bound", &self.bound.get())
            .finish()
    }
}

/// Restores the previous binding on drop, also while unwinding.
pub(crate) struct BoundRunner<'c, 'e> {
    ctx: &'c CallContext<'e>,
    previous: Option<PartitionId>,
}

impl Drop for BoundRunner<'_, '_> {
    fn drop(&mut self) {
        self.ctx.bound.set(self.previous);
    }
}
