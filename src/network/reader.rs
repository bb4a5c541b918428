//! Read side of a connection.

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry};
use std::io::{self, Read};
use std::sync::Arc;

use crate::error::{Error, NetworkError, Result};
use crate::network::connection::Connection;
use crate::network::handlers::InboundHandler;
use crate::network::initializer::ChannelInitializer;
use crate::network::io_thread::{HandlerShared, SelectionHandler};

/// Reads everything available on readiness and feeds it to the inbound handler.
///
/// The handler is chosen by the [`ChannelInitializer`] once the protocol is known.
pub struct ChannelReader {
    connection: Arc<Connection>,
    shared: Arc<HandlerShared>,
    stream: TcpStream,
    initializer: Arc<dyn ChannelInitializer>,
    inbound: Option<Box<dyn InboundHandler>>,
    input: BytesMut,
    scratch: Box<[u8]>,
}

impl ChannelReader {
    pub(crate) fn new(
        connection: Arc<Connection>,
        stream: TcpStream,
        initializer: Arc<dyn ChannelInitializer>,
        buffer_size: usize,
    ) -> Self {
        let shared = connection.reader_handler().clone();
        Self {
            connection,
            shared,
            stream,
            initializer,
            inbound: None,
            input: BytesMut::with_capacity(buffer_size),
            scratch: vec![0; buffer_size.max(1)].into_boxed_slice(),
        }
    }

    /// Returns false while the protocol is still unknown.
    fn init(&mut self) -> Result<bool> {
        if self.inbound.is_some() {
            return Ok(true);
        }
        let Some(init) = self.initializer.init_inbound(&self.connection, &mut self.stream)? else {
            return Ok(false);
        };
        self.input = init.buffer;
        let mut handler = init.handler;
        // The writer may have been waiting for the protocol.
        self.connection.flush();
        if !self.input.is_empty() {
            handler.on_read(&mut self.input)?;
        }
        self.inbound = Some(handler);
        Ok(true)
    }

    fn read_available(&mut self) -> Result<()> {
        let Some(inbound) = self.inbound.as_mut() else {
            return Ok(());
        };
        loop {
            match read_into(&mut self.stream, &mut self.scratch, &mut self.input) {
                Ok(0) => return Err(NetworkError::EndOfStream.into()),
                Ok(n) => {
                    let stats = self.connection.stats();
                    stats.bytes_read.inc_by(n as u64);
                    stats.last_read.touch();
                    inbound.on_read(&mut self.input)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Read once from `source` and append what arrived to `input`.
fn read_into(source: &mut impl Read, scratch: &mut [u8], input: &mut BytesMut) -> io::Result<usize> {
    let n = source.read(scratch)?;
    input.extend_from_slice(&scratch[..n]);
    Ok(n)
}

impl SelectionHandler for ChannelReader {
    fn shared(&self) -> &Arc<HandlerShared> {
        &self.shared
    }

    fn register(&mut self, registry: &Registry) -> Result<()> {
        registry.register(&mut self.stream, self.shared.token(), Interest::READABLE)?;
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
    }

    fn handle(&mut self, _registry: &Registry) -> Result<()> {
        if !self.init()? {
            return Ok(());
        }
        self.read_available()
    }

    fn on_failure(&mut self, error: Error) {
        let reason = match &error {
            Error::Network(NetworkError::EndOfStream) => "connection closed by peer",
            _ => "read failed",
        };
        self.connection.close(reason, Some(&error));
    }
}
