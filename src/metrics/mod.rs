//! Metrics for monitoring the executor and the I/O layer.
//!
//! Live counters are updated on the hot path with relaxed atomics. Callers read
//! them through snapshot structs, which are plain data and can be exported by
//! whatever registry the embedding application uses.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ExecutorMetrics                        │
//! │  queue sizes ─ running ops ─ conflicts ─ per-thread stats │
//! └──────────────────────────────────────────────────────────┘
//! ┌──────────────────────────────────────────────────────────┐
//! │                    IoThreadMetrics                        │
//! │  events ─ tasks ─ selector errors ─ idle time ─ handlers  │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod counters;

pub use counters::{Counter, Gauge, Timestamp};

use std::time::Duration;

use crate::executor::TaskKind;

/// Live counters of one operation thread.
#[derive(Debug)]
pub struct OperationThreadStats {
    pub completed_total: Counter,
    pub completed_packets: Counter,
    pub completed_operations: Counter,
    pub completed_partition_runnables: Counter,
    pub completed_runnables: Counter,
    pub errors: Counter,
}

impl OperationThreadStats {
    pub fn new() -> Self {
        Self {
            completed_total: Counter::new("completed_total", "Tasks completed"),
            completed_packets: Counter::new("completed_packets", "Packets completed"),
            completed_operations: Counter::new("completed_operations", "Operations completed"),
            completed_partition_runnables: Counter::new(
                "completed_partition_runnables",
                "Partition runnables completed",
            ),
            completed_runnables: Counter::new("completed_runnables", "Runnables completed"),
            errors: Counter::new("errors", "Tasks that failed or panicked"),
        }
    }

    /// Count a finished task.
    pub fn record_completed(&self, kind: TaskKind) {
        self.completed_total.inc();
        match kind {
            TaskKind::Packet => self.completed_packets.inc(),
            TaskKind::Operation => self.completed_operations.inc(),
            TaskKind::PartitionRunnable => self.completed_partition_runnables.inc(),
            TaskKind::Runnable => self.completed_runnables.inc(),
        }
    }

    pub(crate) fn snapshot(
        &self,
        name: String,
        normal_queue_size: usize,
        priority_queue_size: usize,
    ) -> OperationThreadMetrics {
        OperationThreadMetrics {
            name,
            normal_queue_size,
            priority_queue_size,
            completed_total: self.completed_total.get(),
            completed_packets: self.completed_packets.get(),
            completed_operations: self.completed_operations.get(),
            completed_partition_runnables: self.completed_partition_runnables.get(),
            completed_runnables: self.completed_runnables.get(),
            errors: self.errors.get(),
        }
    }
}

impl Default for OperationThreadStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one operation thread.
#[derive(Debug, Clone, Default)]
pub struct OperationThreadMetrics {
    pub name: String,
    /// Normal lane of the queue the thread consumes. Shared for generic threads.
    pub normal_queue_size: usize,
    /// Priority lane of the queue the thread consumes.
    pub priority_queue_size: usize,
    pub completed_total: u64,
    pub completed_packets: u64,
    pub completed_operations: u64,
    pub completed_partition_runnables: u64,
    pub completed_runnables: u64,
    pub errors: u64,
}

/// Point-in-time view of the operation executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorMetrics {
    pub partition_count: usize,
    pub partition_thread_count: usize,
    pub generic_thread_count: usize,
    pub priority_generic_thread_count: usize,
    /// Normal tasks queued over all partition threads.
    pub queue_size: usize,
    /// Priority tasks queued over all partition threads.
    pub priority_queue_size: usize,
    pub generic_queue_size: usize,
    pub generic_priority_queue_size: usize,
    /// Runners currently executing something.
    pub running_count: usize,
    pub completed_count: u64,
    pub error_count: u64,
    /// Caller-runs attempts that found the partition locked.
    pub conflict_count: u64,
    pub partition_threads: Vec<OperationThreadMetrics>,
    pub generic_threads: Vec<OperationThreadMetrics>,
}

/// Live counters of one I/O thread.
#[derive(Debug)]
pub struct IoThreadStats {
    pub event_count: Counter,
    pub completed_task_count: Counter,
    pub selector_io_exception_count: Counter,
    pub handler_count: Gauge,
    pub last_select: Timestamp,
}

impl IoThreadStats {
    pub fn new() -> Self {
        Self {
            event_count: Counter::new("event_count", "Readiness events dispatched"),
            completed_task_count: Counter::new("completed_task_count", "Tasks run from the task queue"),
            selector_io_exception_count: Counter::new(
                "selector_io_exception_count",
                "Failed selects",
            ),
            handler_count: Gauge::new("handler_count"),
            last_select: Timestamp::now(),
        }
    }

    pub(crate) fn snapshot(&self, name: String) -> IoThreadMetrics {
        IoThreadMetrics {
            name,
            event_count: self.event_count.get(),
            completed_task_count: self.completed_task_count.get(),
            selector_io_exception_count: self.selector_io_exception_count.get(),
            handler_count: self.handler_count.get().max(0) as usize,
            idle_time: self.last_select.elapsed(),
        }
    }
}

impl Default for IoThreadStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one I/O thread.
#[derive(Debug, Clone, Default)]
pub struct IoThreadMetrics {
    pub name: String,
    pub event_count: u64,
    pub completed_task_count: u64,
    pub selector_io_exception_count: u64,
    pub handler_count: usize,
    /// Time since the last select returned with ready keys.
    pub idle_time: Duration,
}

/// Live counters of one connection.
#[derive(Debug)]
pub struct ConnectionStats {
    pub bytes_read: Counter,
    pub bytes_written: Counter,
    pub normal_frames_read: Counter,
    pub priority_frames_read: Counter,
    pub frames_written: Counter,
    pub last_read: Timestamp,
    pub last_write: Timestamp,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            bytes_read: Counter::new("bytes_read", "Bytes read from the socket"),
            bytes_written: Counter::new("bytes_written", "Bytes written to the socket"),
            normal_frames_read: Counter::new("normal_frames_read", "Normal frames read"),
            priority_frames_read: Counter::new("priority_frames_read", "Urgent frames read"),
            frames_written: Counter::new("frames_written", "Frames written"),
            last_read: Timestamp::now(),
            last_write: Timestamp::now(),
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}
