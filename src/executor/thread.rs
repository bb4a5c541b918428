//! Operation worker threads.
//!
//! Partition threads drain their own queue and execute every partition task
//! under that partition's lock. Generic threads share one queue; the first
//! `priority_generic_thread_count` of them only serve its priority lane.

use crossbeam::channel::Sender;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::executor::context::{CallContext, ThreadRole};
use crate::executor::operation_executor::ExecutorInner;
use crate::executor::task::Task;
use crate::metrics::OperationThreadStats;

/// Receives memory exhaustion reported by operations.
pub trait OutOfMemoryHandler: Send + Sync + 'static {
    /// Called on the thread that observed the condition.
    fn on_out_of_memory(&self, thread_name: &str, error: &Error);
}

/// Logs the condition at error level. Embedders usually replace it with one
/// that shuts the node down.
#[derive(Debug, Default)]
pub struct LoggingOutOfMemoryHandler;

impl OutOfMemoryHandler for LoggingOutOfMemoryHandler {
    fn on_out_of_memory(&self, thread_name: &str, error: &Error) {
        error!(thread = %thread_name, error = %error, "out of memory while executing task");
    }
}

/// Which pool a worker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerKind {
    Partition { thread_id: usize },
    Generic { index: usize, priority: bool },
}

/// Spawn one operation thread. The `done` sender is dropped when the thread exits.
pub(crate) fn spawn_worker(
    inner: Arc<ExecutorInner>,
    kind: WorkerKind,
    done: Sender<()>,
) -> Result<JoinHandle<()>> {
    let name = inner.thread_name(kind);
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let _done = done;
            debug!(thread = %name, "operation thread started");
            match kind {
                WorkerKind::Partition { thread_id } => {
                    run_partition_loop(&inner, &name, thread_id)
                }
                WorkerKind::Generic { index, priority } => {
                    run_generic_loop(&inner, &name, index, priority)
                }
            }
            debug!(thread = %name, "operation thread stopped");
        })?;
    Ok(handle)
}

fn run_partition_loop(inner: &ExecutorInner, name: &str, thread_id: usize) {
    let ctx = CallContext::new(
        inner,
        ThreadRole::PartitionOperation { thread_id },
        inner.next_owner_token(),
    );
    let queue = inner.partition_queue(thread_id);
    let stats = inner.partition_thread_stats(thread_id);

    while !inner.is_shutdown() {
        let Some(task) = queue.take(false) else {
            continue;
        };
        process(inner, &ctx, name, stats, task);
    }
}

fn run_generic_loop(inner: &ExecutorInner, name: &str, index: usize, priority: bool) {
    let ctx = CallContext::new(
        inner,
        ThreadRole::GenericOperation { index },
        inner.next_owner_token(),
    );
    let queue = inner.generic_queue();
    let stats = inner.generic_thread_stats(index);

    while !inner.is_shutdown() {
        let Some(task) = queue.take(priority) else {
            continue;
        };
        process(inner, &ctx, name, stats, task);
    }
}

/// Execute one task, keeping the thread alive whatever the task does.
fn process(
    inner: &ExecutorInner,
    ctx: &CallContext<'_>,
    name: &str,
    stats: &OperationThreadStats,
    task: Task,
) {
    let kind = task.kind();
    let partition_id = task.partition_id();

    let outcome = catch_unwind(AssertUnwindSafe(|| inner.dispatch(ctx, task)));
    stats.record_completed(kind);

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e @ Error::OutOfMemory(_))) => {
            stats.errors.inc();
            inner.out_of_memory_handler().on_out_of_memory(name, &e);
        }
        Ok(Err(e)) => {
            stats.errors.inc();
            warn!(thread = %name, %kind, partition_id, error = %e, "task failed");
        }
        Err(panic) => {
            stats.errors.inc();
            let msg = panic_message(panic.as_ref());
            error!(thread = %name, %kind, partition_id, panic = %msg, "task panicked");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
