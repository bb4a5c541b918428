//! Configuration types for the grid core.

use crate::error::{Error, Result};
use crate::types::DEFAULT_PARTITION_COUNT;
use std::net::SocketAddr;
use std::time::Duration;

/// How an idle partition thread waits for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleStrategy {
    /// Park in a blocking queue poll.
    #[default]
    Block,
    /// Spin with exponential backoff before falling back to a blocking poll.
    BackoffThenBlock,
}

/// Top-level configuration aggregating the executor and network settings.
#[derive(Debug, Clone, Default)]
pub struct GridConfig {
    /// Operation executor configuration.
    pub executor: ExecutorConfig,

    /// Network I/O configuration.
    pub network: NetworkConfig,
}

impl GridConfig {
    /// Create a configuration bound to the given address.
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            executor: ExecutorConfig::default(),
            network: NetworkConfig::new(bind_address),
        }
    }

    /// Set the executor configuration.
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Set the network configuration.
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Validate both sections.
    pub fn validate(&self) -> Result<()> {
        self.executor.validate()?;
        self.network.validate()
    }
}

/// Configuration for the partition-aware operation executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Total number of partitions. Fixed for the lifetime of the executor.
    pub partition_count: usize,

    /// Number of partition operation threads.
    pub partition_thread_count: usize,

    /// Number of generic operation threads, including the priority ones.
    pub generic_thread_count: usize,

    /// How many of the generic threads only serve the priority lane.
    pub priority_generic_thread_count: usize,

    /// Allow calling threads to execute partition operations inline.
    pub caller_runs_enabled: bool,

    /// Idle strategy for partition threads.
    pub idle_strategy: IdleStrategy,

    /// How long shutdown waits for threads to terminate.
    pub shutdown_timeout: Duration,

    /// Prefix used when naming operation threads.
    pub thread_name_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cores = available_cores();
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            partition_thread_count: cores.max(2),
            generic_thread_count: (cores / 2).max(2),
            priority_generic_thread_count: 1,
            caller_runs_enabled: true,
            idle_strategy: IdleStrategy::Block,
            shutdown_timeout: Duration::from_secs(3),
            thread_name_prefix: "grid".to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Create a configuration with defaults derived from the core count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the partition count.
    pub fn with_partition_count(mut self, count: usize) -> Self {
        self.partition_count = count;
        self
    }

    /// Set the number of partition threads.
    pub fn with_partition_threads(mut self, count: usize) -> Self {
        self.partition_thread_count = count;
        self
    }

    /// Set the number of generic threads.
    pub fn with_generic_threads(mut self, count: usize) -> Self {
        self.generic_thread_count = count;
        self
    }

    /// Set the number of priority generic threads.
    pub fn with_priority_generic_threads(mut self, count: usize) -> Self {
        self.priority_generic_thread_count = count;
        self
    }

    /// Enable or disable the caller-runs optimization.
    pub fn with_caller_runs(mut self, enabled: bool) -> Self {
        self.caller_runs_enabled = enabled;
        self
    }

    /// Set the idle strategy of partition threads.
    pub fn with_idle_strategy(mut self, strategy: IdleStrategy) -> Self {
        self.idle_strategy = strategy;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Check the configuration for values the executor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 || self.partition_count > i32::MAX as usize {
            return Err(Error::Config(format!(
                "partition_count must be in 1..={}, got {}",
                i32::MAX,
                self.partition_count
            )));
        }
        if self.partition_thread_count == 0 {
            return Err(Error::Config("partition_thread_count must be > 0".into()));
        }
        if self.generic_thread_count == 0 {
            return Err(Error::Config("generic_thread_count must be > 0".into()));
        }
        if self.priority_generic_thread_count >= self.generic_thread_count {
            return Err(Error::Config(format!(
                "priority_generic_thread_count ({}) must be below generic_thread_count ({})",
                self.priority_generic_thread_count, self.generic_thread_count
            )));
        }
        Ok(())
    }
}

/// Configuration for the non-blocking network layer.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the acceptor binds to.
    pub bind_address: SocketAddr,

    /// Number of I/O threads serving read handlers.
    pub input_thread_count: usize,

    /// Number of I/O threads serving write handlers.
    pub output_thread_count: usize,

    /// Upper bound for a single blocking select.
    pub select_timeout: Duration,

    /// Poll with a zero timeout instead of blocking (busy loop).
    pub select_now: bool,

    /// Pause after a failed select before trying again.
    pub selector_error_cooldown: Duration,

    /// Size of the per-connection input buffer.
    pub receive_buffer_size: usize,

    /// Size of the per-connection output buffer.
    pub send_buffer_size: usize,

    /// Largest frame accepted from the wire.
    pub max_frame_size: usize,

    /// Disable Nagle's algorithm on new sockets.
    pub tcp_nodelay: bool,

    /// Interval of the I/O balancer. `None` disables automatic balancing.
    pub balancer_interval: Option<Duration>,

    /// How long shutdown waits for I/O threads to terminate.
    pub shutdown_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 5701)),
            input_thread_count: 1,
            output_thread_count: 1,
            select_timeout: Duration::from_millis(5000),
            select_now: false,
            selector_error_cooldown: Duration::from_millis(1000),
            receive_buffer_size: 128 * 1024,
            send_buffer_size: 128 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            tcp_nodelay: true,
            balancer_interval: None,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl NetworkConfig {
    /// Create a configuration bound to the given address.
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }

    /// Set the number of input threads.
    pub fn with_input_threads(mut self, count: usize) -> Self {
        self.input_thread_count = count;
        self
    }

    /// Set the number of output threads.
    pub fn with_output_threads(mut self, count: usize) -> Self {
        self.output_thread_count = count;
        self
    }

    /// Set the select timeout.
    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    /// Enable busy polling.
    pub fn with_select_now(mut self, enabled: bool) -> Self {
        self.select_now = enabled;
        self
    }

    /// Set the per-connection buffer sizes.
    pub fn with_buffer_sizes(mut self, receive: usize, send: usize) -> Self {
        self.receive_buffer_size = receive;
        self.send_buffer_size = send;
        self
    }

    /// Set the maximum accepted frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Enable periodic handler balancing.
    pub fn with_balancer_interval(mut self, interval: Duration) -> Self {
        self.balancer_interval = Some(interval);
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Check the configuration for values the network layer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.input_thread_count == 0 || self.output_thread_count == 0 {
            return Err(Error::Config("I/O thread counts must be > 0".into()));
        }
        if self.receive_buffer_size < 16 || self.send_buffer_size < 16 {
            return Err(Error::Config("buffer sizes must be at least 16 bytes".into()));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must be > 0".into()));
        }
        Ok(())
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
