//! Testing utilities for the grid core.
//!
//! This module provides tools for exercising the executor and the network
//! layer end to end:
//! - Probe operations that detect concurrent execution within a partition
//! - Recording dispatchers and protocol handlers for loopback connections
//! - Polling assertions for asynchronous outcomes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Testing Framework                          │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │                    OverlapProbe                            │ │
//! │  │  - Per-partition occupancy                                 │ │
//! │  │  - Executing thread per partition                          │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! │                             │                                   │
//! │                             ▼                                   │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │     ProbeOperation / FnOperation / RecordingDispatcher     │ │
//! │  │  - Driven through OperationExecutor or ConnectionManager   │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gridcore::testing::{OverlapProbe, ProbeOperation, TestAssertions};
//!
//! let probe = OverlapProbe::new(executor.partition_count());
//! let ctx = executor.caller_context();
//! for pid in 0..16 {
//!     ctx.run_or_execute(Box::new(ProbeOperation::new(pid, probe.clone())))?;
//! }
//! TestAssertions::assert_eventually(|| probe.executions() == 16, Duration::from_secs(5), "all ran");
//! assert_eq!(probe.violations(), 0);
//! ```

mod probes;

#[cfg(test)]
pub(crate) mod utils;

mod executor_tests;
mod network_tests;

pub use probes::{
    EchoTextHandler, FnOperation, OverlapProbe, ProbeOperation, RecordingClientHandler,
    RecordingDispatcher,
};

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Polling assertions for outcomes produced on other threads.
pub struct TestAssertions;

impl TestAssertions {
    /// Assert that a condition eventually holds.
    pub fn assert_eventually<F>(check: F, timeout: Duration, message: &str)
    where
        F: Fn() -> bool,
    {
        if !Self::wait_for(check, timeout) {
            panic!("Assertion failed after {:?}: {}", timeout, message);
        }
    }

    /// Wait until a condition becomes true. Returns false on timeout.
    pub fn wait_for<F>(condition: F, timeout: Duration) -> bool
    where
        F: Fn() -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }
}

/// Collects latencies and errors of a test run.
#[derive(Debug, Default)]
pub struct TestMetrics {
    latencies: Vec<Duration>,
    errors: HashMap<String, u64>,
}

impl TestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&mut self, latency: Duration) {
        self.latencies.push(latency);
    }

    pub fn record_error(&mut self, error_type: &str) {
        *self.errors.entry(error_type.to_string()).or_insert(0) += 1;
    }

    pub fn operations(&self) -> usize {
        self.latencies.len()
    }

    pub fn avg_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().sum();
        total / self.latencies.len() as u32
    }

    pub fn p99_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort();
        let idx = (sorted.len() as f64 * 0.99) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }

    /// Human-readable summary, logged at the end of stress tests.
    pub fn report(&self) -> String {
        let mut output = String::new();
        output.push_str("=== Test Metrics Report ===\n");
        output.push_str(&format!("Operations: {}\n", self.latencies.len()));
        output.push_str(&format!("Avg latency: {:?}\n", self.avg_latency()));
        output.push_str(&format!("P99 latency: {:?}\n", self.p99_latency()));
        output.push_str(&format!("Total errors: {}\n", self.total_errors()));
        if !self.errors.is_empty() {
            output.push_str("Errors by type:\n");
            let mut errors: Vec<_> = self.errors.iter().collect();
            errors.sort();
            for (error_type, count) in errors {
                output.push_str(&format!("  {}: {}\n", error_type, count));
            }
        }
        output
    }
}
