//! Write side of a connection.
//!
//! Any thread may enqueue frames. Only the owning I/O thread drains them.
//! The `scheduled` flag records whether the writer is queued on or running
//! in its I/O thread:
//!
//! ```text
//!   enqueue:     push frame ─▶ scheduled? ─yes─▶ done
//!                                 │no
//!                                 ▼
//!                     CAS false→true ─won─▶ wake owner
//!
//!   unschedule:  scheduled = false ─▶ work left? ─no─▶ done
//!                                         │yes
//!                                         ▼
//!                          CAS false→true ─won─▶ requeue self
//! ```
//!
//! Re-checking for work after clearing the flag closes the window where an
//! enqueue saw `scheduled == true` just before the writer went idle.

use bytes::{Buf, Bytes, BytesMut};
use crossbeam::queue::SegQueue;
use mio::net::TcpStream;
use mio::{Interest, Registry};
use std::io::{self, Write};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::network::connection::Connection;
use crate::network::handlers::OutboundHandler;
use crate::network::initializer::ChannelInitializer;
use crate::network::io_thread::{HandlerShared, IoTask, SelectionHandler};
use crate::network::Packet;

/// A frame waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A member packet, encoded while it is written.
    Packet(Packet),
    /// Pre-encoded bytes.
    Bytes(Bytes),
}

impl OutboundFrame {
    pub fn is_urgent(&self) -> bool {
        match self {
            OutboundFrame::Packet(p) => p.is_urgent(),
            OutboundFrame::Bytes(_) => false,
        }
    }

    /// Size on the wire.
    pub fn len(&self) -> usize {
        match self {
            OutboundFrame::Packet(p) => p.frame_len(),
            OutboundFrame::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Packet> for OutboundFrame {
    fn from(packet: Packet) -> Self {
        OutboundFrame::Packet(packet)
    }
}

impl From<Bytes> for OutboundFrame {
    fn from(bytes: Bytes) -> Self {
        OutboundFrame::Bytes(bytes)
    }
}

impl From<&'static [u8]> for OutboundFrame {
    fn from(bytes: &'static [u8]) -> Self {
        OutboundFrame::Bytes(Bytes::from_static(bytes))
    }
}

/// Frames pending for one connection, plus the writer's scheduling flag.
#[derive(Debug)]
pub struct WriteQueue {
    handler: Arc<HandlerShared>,
    normal: SegQueue<OutboundFrame>,
    urgent: SegQueue<OutboundFrame>,
    scheduled: AtomicBool,
}

impl WriteQueue {
    /// Starts scheduled: the writer runs once when it is registered.
    pub fn new(handler: Arc<HandlerShared>) -> Self {
        Self {
            handler,
            normal: SegQueue::new(),
            urgent: SegQueue::new(),
            scheduled: AtomicBool::new(true),
        }
    }

    pub fn handler(&self) -> &Arc<HandlerShared> {
        &self.handler
    }

    pub fn enqueue(&self, frame: OutboundFrame) {
        if frame.is_urgent() {
            self.urgent.push(frame);
        } else {
            self.normal.push(frame);
        }
        self.schedule();
    }

    /// Make sure the writer will run, waking its owner if it was idle.
    pub fn schedule(&self) {
        // Pairs with the fence in `unschedule`: either this load sees the
        // flag cleared or the writer's re-check sees the pushed frame.
        fence(Ordering::SeqCst);
        if self.scheduled.load(Ordering::SeqCst) {
            return;
        }
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.handler.wake();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Pending frames, urgent ones included.
    pub fn len(&self) -> usize {
        self.normal.len() + self.urgent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.urgent.is_empty()
    }

    pub(crate) fn clear(&self) {
        while self.urgent.pop().is_some() {}
        while self.normal.pop().is_some() {}
    }

    fn poll(&self) -> Option<OutboundFrame> {
        self.urgent.pop().or_else(|| self.normal.pop())
    }

    fn unschedule(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    fn try_reschedule(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Drains a [`WriteQueue`] into the socket on the owning I/O thread.
pub struct ChannelWriter {
    connection: Arc<Connection>,
    queue: Arc<WriteQueue>,
    stream: TcpStream,
    initializer: Arc<dyn ChannelInitializer>,
    outbound: Option<Box<dyn OutboundHandler>>,
    output: BytesMut,
    current: Option<(OutboundFrame, usize)>,
    buffer_size: usize,
    writable_registered: bool,
}

impl ChannelWriter {
    pub(crate) fn new(
        connection: Arc<Connection>,
        stream: TcpStream,
        initializer: Arc<dyn ChannelInitializer>,
        buffer_size: usize,
    ) -> Self {
        let queue = connection.write_queue().clone();
        Self {
            connection,
            queue,
            stream,
            initializer,
            outbound: None,
            output: BytesMut::with_capacity(buffer_size),
            current: None,
            buffer_size,
            writable_registered: false,
        }
    }

    /// Move frames into the output buffer until it is full or nothing is left.
    fn fill_output(&mut self) -> Result<()> {
        let Some(outbound) = self.outbound.as_mut() else {
            return Ok(());
        };
        while self.output.len() < self.buffer_size {
            let (frame, offset) = match self.current.take() {
                Some(current) => current,
                None => match self.queue.poll() {
                    Some(frame) => (frame, 0),
                    None => break,
                },
            };
            match outbound.on_write(&frame, offset, &mut self.output, self.buffer_size)? {
                None => self.connection.stats().frames_written.inc(),
                Some(next) => {
                    self.current = Some((frame, next));
                    break;
                }
            }
        }
        Ok(())
    }

    fn flush_output(&mut self) -> Result<()> {
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.output.advance(n);
                    let stats = self.connection.stats();
                    stats.bytes_written.inc_by(n as u64);
                    stats.last_write.touch();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn has_work(&self) -> bool {
        match self.outbound {
            Some(_) => !self.queue.is_empty(),
            None => self.initializer.is_outbound_ready(&self.connection),
        }
    }

    fn unschedule(&mut self, registry: &Registry) -> Result<()> {
        if !self.output.is_empty() || self.current.is_some() {
            // The socket is full: resume on writability, stay scheduled.
            if !self.writable_registered {
                registry.register(&mut self.stream, self.queue.handler().token(), Interest::WRITABLE)?;
                self.writable_registered = true;
            }
            return Ok(());
        }

        if self.writable_registered {
            let _ = registry.deregister(&mut self.stream);
            self.writable_registered = false;
        }

        self.queue.unschedule();
        if !self.has_work() {
            return Ok(());
        }
        if self.queue.try_reschedule() {
            trace!(connection = self.connection.id(), "writer rescheduled after race");
            let handler = self.queue.handler().clone();
            handler.owner().add_task(IoTask::Handle(handler.clone()));
        }
        Ok(())
    }
}

impl SelectionHandler for ChannelWriter {
    fn shared(&self) -> &Arc<HandlerShared> {
        self.queue.handler()
    }

    fn register(&mut self, registry: &Registry) -> Result<()> {
        self.handle(registry)
    }

    fn deregister(&mut self, registry: &Registry) {
        if self.writable_registered {
            let _ = registry.deregister(&mut self.stream);
            self.writable_registered = false;
        }
    }

    fn handle(&mut self, registry: &Registry) -> Result<()> {
        if self.outbound.is_none() {
            match self.initializer.init_outbound(&self.connection)? {
                None => return self.unschedule(registry),
                Some(init) => {
                    self.output.extend_from_slice(&init.prefix);
                    self.outbound = Some(init.handler);
                }
            }
        }
        self.fill_output()?;
        self.flush_output()?;
        self.unschedule(registry)
    }

    fn on_failure(&mut self, error: Error) {
        self.connection.close("write failed", Some(&error));
    }
}
