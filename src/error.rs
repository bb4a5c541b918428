//! Error types for the grid core.

use std::io;
use thiserror::Error;

use crate::types::PartitionId;

/// Result type alias for grid core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the grid core.
#[derive(Error, Debug)]
pub enum Error {
    /// The calling thread is not permitted to run or invoke the operation.
    ///
    /// Callers one layer up are expected to turn this into a retryable response.
    #[error("illegal thread state: {0}")]
    IllegalThreadState(String),

    /// Partition ID outside of `0..partition_count`.
    #[error("invalid partition {partition_id}, partition count is {partition_count}")]
    InvalidPartition {
        partition_id: PartitionId,
        partition_count: usize,
    },

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Replication and merge errors.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Memory exhaustion reported by a service. Routed to the OOM handler.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The component has been shut down.
    #[error("shut down")]
    Shutdown,

    /// A service operation failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Create an illegal thread state error.
    pub fn illegal_thread_state(msg: impl Into<String>) -> Self {
        Error::IllegalThreadState(msg.into())
    }

    /// Returns true for [`Error::IllegalThreadState`].
    pub fn is_illegal_thread_state(&self) -> bool {
        matches!(self, Error::IllegalThreadState(_))
    }

    /// Whether a caller one layer up may retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::IllegalThreadState(_))
            || matches!(
                self,
                Error::Replication(
                    ReplicationError::MergeTimeout { .. } | ReplicationError::PartitionTimeout { .. }
                )
            )
    }

    /// Returns true for errors raised by the network layer.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The remote side closed the stream.
    #[error("end of stream reached")]
    EndOfStream,

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame header announced a size above the configured maximum.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Protocol negotiation failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Connecting to a remote address failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },
}

/// Replication, migration and merge errors.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Merge operations did not complete within the bounded wait.
    #[error("merge timed out with {pending} operations pending after {waited_ms}ms")]
    MergeTimeout { pending: usize, waited_ms: u64 },

    /// A partition thread did not answer a replication request in time.
    #[error("replication of partition {partition_id} timed out after {waited_ms}ms")]
    PartitionTimeout {
        partition_id: PartitionId,
        waited_ms: u64,
    },

    /// A snapshot could not be applied on the destination.
    #[error("snapshot rejected: {0}")]
    SnapshotRejected(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
