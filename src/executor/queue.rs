//! Dual-lane task queue backing every operation thread.
//!
//! Priority tasks are always handed out before normal ones. Adding a priority
//! task also drops a trigger into the normal lane so a consumer blocked on the
//! normal lane wakes up and drains the priority lane first.

use crossbeam::channel::{unbounded, Receiver, RecvError, Sender, TryRecvError};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::IdleStrategy;
use crate::executor::task::Task;

enum Slot {
    Task(Task),
    /// A priority task was added.
    Trigger,
    /// Shutdown wake-up.
    Wake,
}

/// A normal and a priority lane behind a single `add`/`take` contract.
///
/// Multi-producer. The generic queue is shared by several consumers; partition
/// queues have exactly one.
pub struct OperationQueue {
    normal_tx: Sender<Slot>,
    normal_rx: Receiver<Slot>,
    priority_tx: Sender<Slot>,
    priority_rx: Receiver<Slot>,
    normal_size: AtomicUsize,
    priority_size: AtomicUsize,
    idle_strategy: IdleStrategy,
}

impl OperationQueue {
    /// Create a queue whose consumers block when idle.
    pub fn new() -> Self {
        Self::with_idle_strategy(IdleStrategy::Block)
    }

    /// Create a queue with the given idle strategy.
    pub fn with_idle_strategy(idle_strategy: IdleStrategy) -> Self {
        let (normal_tx, normal_rx) = unbounded();
        let (priority_tx, priority_rx) = unbounded();
        Self {
            normal_tx,
            normal_rx,
            priority_tx,
            priority_rx,
            normal_size: AtomicUsize::new(0),
            priority_size: AtomicUsize::new(0),
            idle_strategy,
        }
    }

    /// Add a task to the normal or the priority lane.
    pub fn add(&self, task: Task, priority: bool) {
        if priority {
            self.priority_size.fetch_add(1, Ordering::Relaxed);
            // Both senders live as long as the receivers, so sending cannot fail.
            let _ = self.priority_tx.send(Slot::Task(task));
            let _ = self.normal_tx.send(Slot::Trigger);
        } else {
            self.normal_size.fetch_add(1, Ordering::Relaxed);
            let _ = self.normal_tx.send(Slot::Task(task));
        }
    }

    /// Block until a task is available.
    ///
    /// With `priority_only` the caller only ever waits on the priority lane.
    /// Returns `None` when woken by [`OperationQueue::wake`].
    pub fn take(&self, priority_only: bool) -> Option<Task> {
        if priority_only {
            return match self.priority_rx.recv() {
                Ok(slot) => self.unwrap_priority(slot),
                Err(RecvError) => None,
            };
        }

        loop {
            match self.priority_rx.try_recv() {
                Ok(Slot::Task(task)) => {
                    self.priority_size.fetch_sub(1, Ordering::Relaxed);
                    return Some(task);
                }
                Ok(Slot::Wake) => return None,
                Ok(Slot::Trigger) | Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return None,
            }

            let slot = match self.idle_strategy {
                IdleStrategy::Block => self.normal_rx.recv(),
                IdleStrategy::BackoffThenBlock => self.spin_recv(),
            };
            match slot {
                Ok(Slot::Task(task)) => {
                    self.normal_size.fetch_sub(1, Ordering::Relaxed);
                    return Some(task);
                }
                Ok(Slot::Trigger) => continue,
                Ok(Slot::Wake) | Err(RecvError) => return None,
            }
        }
    }

    /// Take a task without blocking, priority lane first.
    pub fn poll(&self) -> Option<Task> {
        loop {
            match self.priority_rx.try_recv() {
                Ok(Slot::Task(task)) => {
                    self.priority_size.fetch_sub(1, Ordering::Relaxed);
                    return Some(task);
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        loop {
            match self.normal_rx.try_recv() {
                Ok(Slot::Task(task)) => {
                    self.normal_size.fetch_sub(1, Ordering::Relaxed);
                    return Some(task);
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wake up to `consumers` blocked takers on each lane.
    pub(crate) fn wake(&self, consumers: usize) {
        for _ in 0..consumers {
            let _ = self.normal_tx.send(Slot::Wake);
            let _ = self.priority_tx.send(Slot::Wake);
        }
    }

    /// Drop all queued tasks. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        for rx in [&self.priority_rx, &self.normal_rx] {
            while let Ok(slot) = rx.try_recv() {
                if matches!(slot, Slot::Task(_)) {
                    dropped += 1;
                }
            }
        }
        self.normal_size.store(0, Ordering::Relaxed);
        self.priority_size.store(0, Ordering::Relaxed);
        dropped
    }

    /// Approximate number of normal tasks.
    pub fn normal_size(&self) -> usize {
        self.normal_size.load(Ordering::Relaxed)
    }

    /// Approximate number of priority tasks.
    pub fn priority_size(&self) -> usize {
        self.priority_size.load(Ordering::Relaxed)
    }

    /// Approximate total number of tasks.
    pub fn size(&self) -> usize {
        self.normal_size() + self.priority_size()
    }

    fn unwrap_priority(&self, slot: Slot) -> Option<Task> {
        match slot {
            Slot::Task(task) => {
                self.priority_size.fetch_sub(1, Ordering::Relaxed);
                Some(task)
            }
            Slot::Trigger | Slot::Wake => None,
        }
    }

    /// Spin on the normal lane, then block. A pending priority task ends the
    /// spin early so the caller can take it.
    fn spin_recv(&self) -> Result<Slot, RecvError> {
        let backoff = Backoff::new();
        loop {
            match self.normal_rx.try_recv() {
                Ok(slot) => return Ok(slot),
                Err(TryRecvError::Disconnected) => return Err(RecvError),
                Err(TryRecvError::Empty) => {}
            }
            if !self.priority_rx.is_empty() {
                return Ok(Slot::Trigger);
            }
            if backoff.is_completed() {
                return self.normal_rx.recv();
            }
            backoff.snooze();
        }
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("normal_size", &self.normal_size())
            .field("priority_size", &self.priority_size())
            .field("idle_strategy", &self.idle_strategy)
            .finish()
    }
}
