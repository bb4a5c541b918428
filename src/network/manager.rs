//! Owns the I/O thread pools, the acceptor and every live connection.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::IoThreadMetrics;
use crate::network::balancer::IoBalancer;
use crate::network::connection::{Connection, ConnectionLifecycle};
use crate::network::initializer::ChannelInitializer;
use crate::network::io_thread::{
    HandlerRole, HandlerShared, IoTask, IoThreadConfig, IoThreadHandle, NonBlockingIoThread,
};
use crate::network::reader::ChannelReader;
use crate::network::writer::{ChannelWriter, WriteQueue};
use crate::types::ConnectionId;

const LISTENER_TOKEN: Token = Token(0);
const ACCEPTOR_WAKE_TOKEN: Token = Token(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Notified when connections come and go.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_added(&self, _connection: &Arc<Connection>) {}

    fn on_connection_closed(&self, connection: &Arc<Connection>, reason: &str);
}

struct ManagerInner {
    config: NetworkConfig,
    initializer: Arc<dyn ChannelInitializer>,
    input_threads: Vec<IoThreadHandle>,
    output_threads: Vec<IoThreadHandle>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    next_connection_id: AtomicU64,
    next_input: AtomicUsize,
    next_output: AtomicUsize,
    running: AtomicBool,
    self_ref: Weak<ManagerInner>,
}

impl ManagerInner {
    fn next_thread<'a>(threads: &'a [IoThreadHandle], counter: &AtomicUsize) -> &'a IoThreadHandle {
        let index = counter.fetch_add(1, Ordering::Relaxed) % threads.len();
        &threads[index]
    }

    fn register_connection(&self, socket: TcpStream, client_mode: bool) -> Result<Arc<Connection>> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        socket.set_nonblocking(true)?;
        socket.set_nodelay(self.config.tcp_nodelay)?;

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let input = Self::next_thread(&self.input_threads, &self.next_input).clone();
        let output = Self::next_thread(&self.output_threads, &self.next_output).clone();

        let base = (id as usize) << 1;
        let reader_shared = HandlerShared::new(Token(base), HandlerRole::Reader, input.clone());
        let writer_shared = HandlerShared::new(Token(base | 1), HandlerRole::Writer, output.clone());
        let queue = Arc::new(WriteQueue::new(writer_shared));

        let read_stream = MioTcpStream::from_std(socket.try_clone()?);
        let write_stream = MioTcpStream::from_std(socket.try_clone()?);
        let lifecycle: Weak<dyn ConnectionLifecycle> = self.self_ref.clone();
        let connection = Arc::new(Connection::new(
            id,
            socket,
            client_mode,
            reader_shared,
            queue,
            Some(lifecycle),
        )?);

        self.connections.insert(id, connection.clone());
        for listener in self.listeners.read().iter() {
            listener.on_connection_added(&connection);
        }

        let reader = ChannelReader::new(
            connection.clone(),
            read_stream,
            self.initializer.clone(),
            self.config.receive_buffer_size,
        );
        let writer = ChannelWriter::new(
            connection.clone(),
            write_stream,
            self.initializer.clone(),
            self.config.send_buffer_size,
        );
        input.add_task_and_wakeup(IoTask::Register(Box::new(reader)));
        output.add_task_and_wakeup(IoTask::Register(Box::new(writer)));

        debug!(
            connection = id,
            remote = %connection.remote_address(),
            client_mode,
            input = %input.name(),
            output = %output.name(),
            "connection registered"
        );
        Ok(connection)
    }

    fn handlers(&self, role: HandlerRole) -> Vec<Arc<HandlerShared>> {
        self.connections
            .iter()
            .map(|entry| match role {
                HandlerRole::Reader => entry.value().reader_handler().clone(),
                HandlerRole::Writer => entry.value().writer_handler().clone(),
            })
            .collect()
    }
}

impl ConnectionLifecycle for ManagerInner {
    fn on_connection_closed(&self, connection: &Arc<Connection>, reason: &str) {
        self.connections.remove(&connection.id());
        for listener in self.listeners.read().iter() {
            listener.on_connection_closed(connection, reason);
        }
    }
}

struct Balancers {
    input: IoBalancer,
    output: IoBalancer,
}

/// Accepts and opens member connections and spreads them over the I/O threads.
///
/// Reading and writing of one connection are served by different pools; each
/// new connection takes the next input and the next output thread in turn.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    pending_threads: Mutex<Vec<NonBlockingIoThread>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    done_rx: Mutex<Option<Receiver<()>>>,
    acceptor_waker: Mutex<Option<Arc<Waker>>>,
    balancer_stop: Mutex<Option<Sender<()>>>,
    balancers: Arc<Mutex<Balancers>>,
    local_address: RwLock<Option<SocketAddr>>,
}

impl ConnectionManager {
    /// Create the manager and its I/O threads. Nothing runs until [`ConnectionManager::start`].
    pub fn new(config: NetworkConfig, initializer: Arc<dyn ChannelInitializer>) -> Result<Self> {
        config.validate()?;
        let io_config = IoThreadConfig {
            select_timeout: config.select_timeout,
            select_now: config.select_now,
            selector_error_cooldown: config.selector_error_cooldown,
        };

        let mut pending = Vec::with_capacity(config.input_thread_count + config.output_thread_count);
        for i in 0..config.input_thread_count {
            pending.push(NonBlockingIoThread::new(i, format!("gridcore-io-in-{i}"), io_config.clone())?);
        }
        for i in 0..config.output_thread_count {
            let index = config.input_thread_count + i;
            pending.push(NonBlockingIoThread::new(index, format!("gridcore-io-out-{i}"), io_config.clone())?);
        }
        let input_threads: Vec<IoThreadHandle> = pending[..config.input_thread_count]
            .iter()
            .map(NonBlockingIoThread::handle)
            .collect();
        let output_threads: Vec<IoThreadHandle> = pending[config.input_thread_count..]
            .iter()
            .map(NonBlockingIoThread::handle)
            .collect();

        let balancers = Balancers {
            input: IoBalancer::new(input_threads.clone()),
            output: IoBalancer::new(output_threads.clone()),
        };

        let inner = Arc::new_cyclic(|self_ref| ManagerInner {
            config,
            initializer,
            input_threads,
            output_threads,
            connections: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
            next_input: AtomicUsize::new(0),
            next_output: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        Ok(Self {
            inner,
            pending_threads: Mutex::new(pending),
            threads: Mutex::new(Vec::new()),
            done_rx: Mutex::new(None),
            acceptor_waker: Mutex::new(None),
            balancer_stop: Mutex::new(None),
            balancers: Arc::new(Mutex::new(balancers)),
            local_address: RwLock::new(None),
        })
    }

    /// Spawn the I/O threads and the acceptor, and bind the listener.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub fn start(&self) -> Result<SocketAddr> {
        let pending = std::mem::take(&mut *self.pending_threads.lock());
        if pending.is_empty() {
            return self.local_address().ok_or(Error::Shutdown);
        }

        let listener = TcpListener::bind(self.inner.config.bind_address)?;
        listener.set_nonblocking(true)?;
        let local_address = listener.local_addr()?;

        self.inner.running.store(true, Ordering::Release);
        let (done_tx, done_rx) = bounded::<()>(0);
        let mut threads = self.threads.lock();
        for io_thread in pending {
            let (_, join) = io_thread.spawn(done_tx.clone())?;
            threads.push(join);
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), ACCEPTOR_WAKE_TOKEN)?);
        let inner = self.inner.clone();
        let acceptor_done = done_tx.clone();
        threads.push(
            thread::Builder::new()
                .name("gridcore-acceptor".to_string())
                .spawn(move || {
                    let _done = acceptor_done;
                    run_acceptor(&inner, listener, poll);
                })?,
        );
        *self.acceptor_waker.lock() = Some(waker);

        if let Some(interval) = self.inner.config.balancer_interval {
            let (stop_tx, stop_rx) = bounded::<()>(0);
            let inner = self.inner.clone();
            let balancers = self.balancers.clone();
            let balancer_done = done_tx.clone();
            threads.push(
                thread::Builder::new()
                    .name("gridcore-io-balancer".to_string())
                    .spawn(move || {
                        let _done = balancer_done;
                        loop {
                            match stop_rx.recv_timeout(interval) {
                                Err(RecvTimeoutError::Timeout) => {
                                    rebalance(&inner, &mut balancers.lock());
                                }
                                _ => break,
                            }
                        }
                    })?,
            );
            *self.balancer_stop.lock() = Some(stop_tx);
        }

        *self.done_rx.lock() = Some(done_rx);
        *self.local_address.write() = Some(local_address);
        info!(
            address = %local_address,
            input_threads = self.inner.input_threads.len(),
            output_threads = self.inner.output_threads.len(),
            "connection manager started"
        );
        Ok(local_address)
    }

    /// Address the acceptor is bound to, once started.
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.local_address.read()
    }

    /// Open a member connection to `address`.
    pub fn connect(&self, address: SocketAddr) -> Result<Arc<Connection>> {
        let socket = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).map_err(|e| {
            NetworkError::ConnectionFailed {
                addr: address.to_string(),
                reason: e.to_string(),
            }
        })?;
        let connection = self.inner.register_connection(socket, true)?;
        connection.set_endpoint(address);
        Ok(connection)
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.connections.get(&id).map(|e| e.value().clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn input_threads(&self) -> &[IoThreadHandle] {
        &self.inner.input_threads
    }

    pub fn output_threads(&self) -> &[IoThreadHandle] {
        &self.inner.output_threads
    }

    /// Metrics of every I/O thread, inputs first.
    pub fn io_metrics(&self) -> Vec<IoThreadMetrics> {
        self.inner
            .input_threads
            .iter()
            .chain(self.inner.output_threads.iter())
            .map(IoThreadHandle::metrics)
            .collect()
    }

    /// Run one balancing round on both pools now.
    pub fn rebalance(&self) -> usize {
        rebalance(&self.inner, &mut self.balancers.lock())
    }

    /// Close every connection and stop all threads, waiting up to the configured timeout.
    ///
    /// Returns true if every thread terminated in time.
    pub fn shutdown(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return true;
        }
        drop(self.balancer_stop.lock().take());
        if let Some(waker) = self.acceptor_waker.lock().take() {
            let _ = waker.wake();
        }

        for connection in self.connections() {
            connection.close("connection manager shut down", None);
        }
        for io_thread in self.inner.input_threads.iter().chain(self.inner.output_threads.iter()) {
            io_thread.shutdown();
        }

        let timeout = self.inner.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        let terminated = match self.done_rx.lock().take() {
            Some(done_rx) => loop {
                match done_rx.recv_deadline(deadline) {
                    Ok(()) => continue,
                    Err(RecvTimeoutError::Disconnected) => break true,
                    Err(RecvTimeoutError::Timeout) => break false,
                }
            },
            None => true,
        };

        let threads = std::mem::take(&mut *self.threads.lock());
        if terminated {
            for handle in threads {
                let _ = handle.join();
            }
            info!("connection manager shut down");
        } else {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "I/O threads did not terminate in time"
            );
        }
        terminated
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_address", &self.local_address())
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn rebalance(inner: &ManagerInner, balancers: &mut Balancers) -> usize {
    let mut migrated = 0;
    if balancers.input.rebalance(&inner.handlers(HandlerRole::Reader)).is_some() {
        migrated += 1;
    }
    if balancers.output.rebalance(&inner.handlers(HandlerRole::Writer)).is_some() {
        migrated += 1;
    }
    migrated
}

fn run_acceptor(inner: &ManagerInner, listener: TcpListener, mut poll: Poll) {
    let registered = listener
        .try_clone()
        .map(MioTcpListener::from_std)
        .and_then(|mut source| {
            poll.registry()
                .register(&mut source, LISTENER_TOKEN, Interest::READABLE)
                .map(|()| source)
        });
    let _source = match registered {
        Ok(source) => source,
        Err(e) => {
            warn!(error = %e, "failed to register acceptor");
            return;
        }
    };

    let mut events = Events::with_capacity(64);
    info!(address = ?listener.local_addr().ok(), "acceptor started");
    while inner.running.load(Ordering::Acquire) {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "acceptor select failed");
                thread::sleep(inner.config.selector_error_cooldown);
                continue;
            }
        }
        if !events.iter().any(|e| e.token() == LISTENER_TOKEN) {
            continue;
        }
        loop {
            match listener.accept() {
                Ok((socket, remote)) => {
                    debug!(%remote, "accepted connection");
                    if let Err(e) = inner.register_connection(socket, false) {
                        warn!(%remote, error = %e, "failed to register accepted connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
    info!("acceptor stopped");
}
