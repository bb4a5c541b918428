//! Partition-aware execution core of an in-memory data grid.
//!
//! This crate provides the threading and networking heart of a partitioned
//! data grid node:
//! - **Operation executor** routing every task to the single thread that owns
//!   its partition, with an optional caller-runs fast path
//! - **Non-blocking I/O** on a small pool of mio event loops, with protocol
//!   negotiation and handler migration between threads
//! - **Replication primitives**: migration contract, split-brain merge
//!   policies and vector clocks
//!
//! # Example
//!
//! ```rust,no_run
//! use gridcore::executor::{HandlerRunnerFactory, LocalOperationHandler, OperationExecutor};
//! use gridcore::replication::{PutOperation, ReplicatedContainerService};
//! use gridcore::ExecutorConfig;
//! use std::sync::Arc;
//!
//! fn main() -> gridcore::Result<()> {
//!     let config = ExecutorConfig::default().with_partition_count(271);
//!     let factory = HandlerRunnerFactory::new(Arc::new(LocalOperationHandler));
//!     let executor = OperationExecutor::new(config, &factory)?;
//!     executor.start()?;
//!
//!     let service = ReplicatedContainerService::new("containers", "member-1", 271);
//!     let ctx = executor.caller_context();
//!     ctx.run_or_execute(Box::new(PutOperation::new(service.clone(), "greeting", "hello")))?;
//!
//!     executor.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │   Application threads (caller-runs)   ConnectionManager  │
//! └──────────────────────────────────────────────────────────┘
//!          │                                  │
//!          │                 ┌────────────────┴─────────────┐
//!          │                 ▼                              ▼
//!          │          input I/O threads            output I/O threads
//!          │          (read + decode)              (encode + write)
//!          │                 │
//!          ▼                 ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   OperationExecutor                       │
//! │  partition threads ── PartitionLocks ── generic threads   │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  Services: MigrationAwareService, SplitBrainHandlerService│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Threading model
//!
//! - **Partition threads** each own a fixed subset of partitions
//!   (`partition_id % partition_thread_count`) and run their tasks in FIFO
//!   order, urgent tasks first.
//! - **Generic threads** share one queue for tasks without a partition.
//! - **I/O threads** never run operations: they only decode frames and hand
//!   them to the executor.
//!
//! Nested calls are checked against an explicit [`executor::CallContext`]
//! instead of thread-local state.

pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod network;
pub mod replication;
pub mod testing;
pub mod types;

pub use config::{ExecutorConfig, GridConfig, IdleStrategy, NetworkConfig};
pub use error::{Error, NetworkError, ReplicationError, Result};
pub use types::{
    partition_for_key, CallId, ConnectionId, PartitionId, PartitionIdSet, Response,
    DEFAULT_PARTITION_COUNT, GENERIC_PARTITION_ID,
};

// Re-export executor types
pub use executor::{
    CallContext, Operation, OperationExecutor, OperationHandler, OperationRunner,
    OperationRunnerFactory, PartitionRunnable, RunOutcome, Task, ThreadRole,
};

// Re-export network types
pub use network::{
    ChannelInitializer, Connection, ConnectionListener, ConnectionManager,
    ExecutorPacketDispatcher, Packet, PacketDispatcher, Protocol, ProtocolInitializer,
};

// Re-export metrics types
pub use metrics::{
    Counter, ExecutorMetrics, Gauge, IoThreadMetrics, OperationThreadMetrics, Timestamp,
};

// Re-export replication types
pub use replication::{
    MergePolicy, MergeReport, MigrationAwareService, PartitionMigrationEvent, PartitionSnapshot,
    ReplicatedContainerService, SplitBrainHandlerService, VectorClock,
};
