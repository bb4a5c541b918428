use mio::Token;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::{ExecutorConfig, NetworkConfig};
use crate::executor::{LocalOperationHandler, OperationExecutor};
use crate::network::{
    Connection, HandlerRole, HandlerShared, IoThreadConfig, NonBlockingIoThread, WriteQueue,
};

static TRACING: Once = Once::new();

/// Install a test subscriber once. Honours `RUST_LOG`.
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A small started executor with caller-runs enabled.
pub(crate) fn started_executor(partitions: usize, partition_threads: usize) -> Arc<OperationExecutor> {
    let config = ExecutorConfig::new()
        .with_partition_count(partitions)
        .with_partition_threads(partition_threads)
        .with_generic_threads(2)
        .with_priority_generic_threads(1)
        .with_thread_name_prefix("test")
        .with_shutdown_timeout(Duration::from_secs(5));
    started_executor_with(config)
}

pub(crate) fn started_executor_with(config: ExecutorConfig) -> Arc<OperationExecutor> {
    init_tracing();
    let executor = OperationExecutor::with_handler(config, Arc::new(LocalOperationHandler)).unwrap();
    executor.start().unwrap();
    Arc::new(executor)
}

/// Network configuration on an OS-assigned loopback port.
pub(crate) fn loopback_config(input_threads: usize, output_threads: usize) -> NetworkConfig {
    NetworkConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_input_threads(input_threads)
        .with_output_threads(output_threads)
        .with_select_timeout(Duration::from_millis(100))
        .with_buffer_sizes(4096, 4096)
        .with_shutdown_timeout(Duration::from_secs(5))
}

/// Connected pair of blocking std sockets.
pub(crate) fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

/// A connection that is never registered with a running I/O thread.
///
/// The returned thread must outlive the connection; its task queue absorbs
/// wakeups.
pub(crate) fn detached_connection(client_mode: bool) -> (Arc<Connection>, NonBlockingIoThread, TcpStream) {
    let (server, peer) = socket_pair();
    let io_thread = NonBlockingIoThread::new(0, "detached-io", IoThreadConfig::default()).unwrap();
    let reader = HandlerShared::new(Token(2), HandlerRole::Reader, io_thread.handle());
    let writer = HandlerShared::new(Token(3), HandlerRole::Writer, io_thread.handle());
    let connection = Connection::new(1, server, client_mode, reader, Arc::new(WriteQueue::new(writer)), None).unwrap();
    (Arc::new(connection), io_thread, peer)
}

/// A source that yields its bytes one at a time, reporting `WouldBlock`
/// between them.
pub(crate) struct TrickleReader {
    data: Vec<u8>,
    position: usize,
    ready: bool,
}

impl TrickleReader {
    pub(crate) fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            position: 0,
            ready: true,
        }
    }

    /// Make the next byte available.
    pub(crate) fn arm(&mut self) {
        self.ready = true;
    }
}

impl Read for TrickleReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.ready || self.position >= self.data.len() || buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.ready = false;
        buf[0] = self.data[self.position];
        self.position += 1;
        Ok(1)
    }
}
