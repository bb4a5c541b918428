//! A TCP connection and its per-channel state.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::error::Error;
use crate::metrics::ConnectionStats;
use crate::network::io_thread::HandlerShared;
use crate::network::writer::{OutboundFrame, WriteQueue};
use crate::network::Packet;
use crate::types::ConnectionId;

/// Typed key/value state attached to a channel.
///
/// Handlers keep handshake progress and similar state here instead of in
/// their own fields, so it survives handler replacement.
#[derive(Default)]
pub struct AttributeMap {
    inner: DashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: &'static str, value: T) {
        self.inner.insert(key, Box::new(value));
    }

    /// Clone of the value stored under `key`, if it has type `T`.
    pub fn get<T: Any + Clone>(&self, key: &'static str) -> Option<T> {
        self.inner
            .get(key)
            .and_then(|v| v.value().downcast_ref::<T>().cloned())
    }

    pub fn contains(&self, key: &'static str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&self, key: &'static str) -> bool {
        self.inner.remove(key).is_some()
    }

    /// Run `f` against the value under `key`, creating a default first if the
    /// key is missing or holds another type.
    pub fn with_mut<T, R>(&self, key: &'static str, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Send + Sync + Default,
    {
        let mut entry = self
            .inner
            .entry(key)
            .or_insert_with(|| Box::new(T::default()));
        if let Some(value) = entry.value_mut().downcast_mut::<T>() {
            return f(value);
        }
        let mut fresh = T::default();
        let result = f(&mut fresh);
        *entry.value_mut() = Box::new(fresh);
        result
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.inner.iter().map(|e| *e.key()).collect();
        f.debug_struct("AttributeMap").field("keys", &keys).finish()
    }
}

/// Callbacks into whoever owns the connection.
pub(crate) trait ConnectionLifecycle: Send + Sync {
    fn on_connection_closed(&self, connection: &Arc<Connection>, reason: &str);
}

/// One TCP connection with its reader and writer halves.
pub struct Connection {
    id: ConnectionId,
    remote_address: SocketAddr,
    local_address: Option<SocketAddr>,
    client_mode: bool,
    socket: TcpStream,
    attributes: AttributeMap,
    endpoint: RwLock<Option<SocketAddr>>,
    alive: AtomicBool,
    stats: ConnectionStats,
    reader: Arc<HandlerShared>,
    writer: Arc<WriteQueue>,
    lifecycle: Option<Weak<dyn ConnectionLifecycle>>,
}

impl Connection {
    /// `socket` is kept for shutdown only. Reading and writing go through the
    /// handlers, which own their own clones of it.
    pub(crate) fn new(
        id: ConnectionId,
        socket: TcpStream,
        client_mode: bool,
        reader: Arc<HandlerShared>,
        writer: Arc<WriteQueue>,
        lifecycle: Option<Weak<dyn ConnectionLifecycle>>,
    ) -> std::io::Result<Self> {
        let remote_address = socket.peer_addr()?;
        let local_address = socket.local_addr().ok();
        Ok(Self {
            id,
            remote_address,
            local_address,
            client_mode,
            socket,
            attributes: AttributeMap::new(),
            endpoint: RwLock::new(None),
            alive: AtomicBool::new(true),
            stats: ConnectionStats::new(),
            reader,
            writer,
            lifecycle,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    /// True when this side initiated the connection.
    pub fn is_client_mode(&self) -> bool {
        self.client_mode
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Member address the connection has been bound to.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.write() = Some(endpoint);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn reader_handler(&self) -> &Arc<HandlerShared> {
        &self.reader
    }

    pub(crate) fn writer_handler(&self) -> &Arc<HandlerShared> {
        self.writer.handler()
    }

    pub(crate) fn write_queue(&self) -> &Arc<WriteQueue> {
        &self.writer
    }

    /// Queue a frame for writing. Returns false if the connection is closed.
    pub fn write(&self, frame: impl Into<OutboundFrame>) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.writer.enqueue(frame.into());
        true
    }

    /// Queue a packet for writing.
    pub fn write_packet(&self, packet: Packet) -> bool {
        self.write(OutboundFrame::Packet(packet))
    }

    /// Make the writer look at the connection again even if nothing was queued.
    pub(crate) fn flush(&self) {
        self.writer.schedule();
    }

    /// Close the connection. Only the first call has an effect.
    pub fn close(self: &Arc<Self>, reason: &str, cause: Option<&Error>) {
        if self
            .alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match cause {
            Some(e) if e.is_io() => {
                debug!(connection = self.id, remote = %self.remote_address, %reason, error = %e, "connection closed")
            }
            Some(e) => {
                info!(connection = self.id, remote = %self.remote_address, %reason, error = %e, "connection closed")
            }
            None => info!(connection = self.id, remote = %self.remote_address, %reason, "connection closed"),
        }

        self.reader.close();
        self.writer.handler().close();
        self.writer.clear();
        let _ = self.socket.shutdown(Shutdown::Both);

        if let Some(lifecycle) = self.lifecycle.as_ref().and_then(Weak::upgrade) {
            lifecycle.on_connection_closed(self, reason);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote_address)
            .field("client_mode", &self.client_mode)
            .field("alive", &self.is_alive())
            .finish()
    }
}
