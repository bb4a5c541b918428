//! Protocol negotiation.
//!
//! The first three bytes on an accepted connection select the protocol:
//!
//! | tag   | protocol               |
//! |-------|------------------------|
//! | `HZC` | member packets         |
//! | `CB2` | binary client messages |
//! | other | text commands          |
//!
//! For text the tag bytes are the start of the first command and are fed
//! back to the text handler. A connecting member sends `HZC` right away;
//! an accepting side only answers once it knows what the peer speaks.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use tracing::debug;

use crate::error::{NetworkError, Result};
use crate::network::connection::Connection;
use crate::network::dispatcher::{ClientMessageHandler, PacketDispatcher, TextCommandHandler};
use crate::network::handlers::{
    ClientInboundHandler, InboundHandler, OutboundHandler, PacketInboundHandler,
    PacketOutboundHandler, StreamOutboundHandler, TextInboundHandler,
};

/// Length of the protocol tag.
pub const PROTOCOL_LENGTH: usize = 3;

/// Tag of member-to-member connections.
pub const CLUSTER: &[u8; PROTOCOL_LENGTH] = b"HZC";

/// Tag of binary client connections.
pub const CLIENT_BINARY: &[u8; PROTOCOL_LENGTH] = b"CB2";

/// Attribute holding the bytes of a partially received tag.
pub const PROTOCOL_BUFFER: &str = "protocol-buffer";

/// Attribute holding the negotiated [`Protocol`].
pub const PROTOCOL: &str = "protocol";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Cluster,
    ClientBinary,
    Text,
}

impl Protocol {
    pub fn from_tag(tag: &[u8]) -> Protocol {
        if tag == CLUSTER {
            Protocol::Cluster
        } else if tag == CLIENT_BINARY {
            Protocol::ClientBinary
        } else {
            Protocol::Text
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Cluster => write!(f, "cluster"),
            Protocol::ClientBinary => write!(f, "client-binary"),
            Protocol::Text => write!(f, "text"),
        }
    }
}

/// Result of inbound initialization.
pub struct InboundInit {
    pub handler: Box<dyn InboundHandler>,
    /// Bytes already read that belong to the protocol.
    pub buffer: BytesMut,
}

impl fmt::Debug for InboundInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundInit")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// Result of outbound initialization.
pub struct OutboundInit {
    pub handler: Box<dyn OutboundHandler>,
    /// Bytes written before any frame.
    pub prefix: Bytes,
}

/// Chooses the handler pair of a connection.
pub trait ChannelInitializer: Send + Sync {
    /// Called on every read readiness until it returns a handler.
    fn init_inbound(
        &self,
        connection: &Arc<Connection>,
        src: &mut dyn Read,
    ) -> Result<Option<InboundInit>>;

    /// Called on every writer run until it returns a handler.
    fn init_outbound(&self, connection: &Arc<Connection>) -> Result<Option<OutboundInit>>;

    /// Whether `init_outbound` would now return a handler.
    fn is_outbound_ready(&self, connection: &Connection) -> bool;
}

/// Negotiates the protocol from the 3-byte tag.
pub struct ProtocolInitializer {
    dispatcher: Arc<dyn PacketDispatcher>,
    client_handler: Option<Arc<dyn ClientMessageHandler>>,
    text_handler: Option<Arc<dyn TextCommandHandler>>,
    max_frame_size: usize,
}

impl ProtocolInitializer {
    pub fn new(dispatcher: Arc<dyn PacketDispatcher>, max_frame_size: usize) -> Self {
        Self {
            dispatcher,
            client_handler: None,
            text_handler: None,
            max_frame_size,
        }
    }

    pub fn with_client_handler(mut self, handler: Arc<dyn ClientMessageHandler>) -> Self {
        self.client_handler = Some(handler);
        self
    }

    pub fn with_text_handler(mut self, handler: Arc<dyn TextCommandHandler>) -> Self {
        self.text_handler = Some(handler);
        self
    }

    /// Read until the tag is complete. Returns `None` when the socket runs dry first.
    fn read_tag(connection: &Connection, src: &mut dyn Read) -> Result<Option<[u8; PROTOCOL_LENGTH]>> {
        connection
            .attributes()
            .with_mut::<BytesMut, _>(PROTOCOL_BUFFER, |buffer| {
                let mut chunk = [0u8; PROTOCOL_LENGTH];
                while buffer.len() < PROTOCOL_LENGTH {
                    let want = PROTOCOL_LENGTH - buffer.len();
                    match src.read(&mut chunk[..want]) {
                        Ok(0) => return Err(NetworkError::EndOfStream.into()),
                        Ok(n) => {
                            buffer.extend_from_slice(&chunk[..n]);
                            connection.stats().bytes_read.inc_by(n as u64);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                let mut tag = [0u8; PROTOCOL_LENGTH];
                tag.copy_from_slice(&buffer[..PROTOCOL_LENGTH]);
                Ok(Some(tag))
            })
    }
}

impl ChannelInitializer for ProtocolInitializer {
    fn init_inbound(
        &self,
        connection: &Arc<Connection>,
        src: &mut dyn Read,
    ) -> Result<Option<InboundInit>> {
        let Some(tag) = Self::read_tag(connection, src)? else {
            return Ok(None);
        };
        connection.attributes().remove(PROTOCOL_BUFFER);

        let protocol = Protocol::from_tag(&tag);
        let mut buffer = BytesMut::new();
        let handler: Box<dyn InboundHandler> = match protocol {
            Protocol::Cluster => Box::new(PacketInboundHandler::new(
                connection.clone(),
                self.dispatcher.clone(),
                self.max_frame_size,
            )),
            Protocol::ClientBinary => {
                let handler = self.client_handler.clone().ok_or_else(|| {
                    NetworkError::HandshakeFailed("binary client protocol is not enabled".into())
                })?;
                Box::new(ClientInboundHandler::new(
                    connection.clone(),
                    handler,
                    self.max_frame_size,
                ))
            }
            Protocol::Text => {
                let handler = self.text_handler.clone().ok_or_else(|| {
                    NetworkError::HandshakeFailed(format!(
                        "unknown protocol {:?}",
                        String::from_utf8_lossy(&tag)
                    ))
                })?;
                buffer.extend_from_slice(&tag);
                Box::new(TextInboundHandler::new(
                    connection.clone(),
                    handler,
                    self.max_frame_size,
                ))
            }
        };

        debug!(connection = connection.id(), %protocol, "protocol negotiated");
        connection.attributes().insert(PROTOCOL, protocol);
        Ok(Some(InboundInit { handler, buffer }))
    }

    fn init_outbound(&self, connection: &Arc<Connection>) -> Result<Option<OutboundInit>> {
        let protocol = connection.attributes().get::<Protocol>(PROTOCOL);
        let init = match protocol {
            // A connecting member speaks first.
            None if connection.is_client_mode() => OutboundInit {
                handler: Box::new(PacketOutboundHandler),
                prefix: Bytes::from_static(CLUSTER),
            },
            None => return Ok(None),
            Some(Protocol::Cluster) => OutboundInit {
                handler: Box::new(PacketOutboundHandler),
                prefix: Bytes::from_static(CLUSTER),
            },
            Some(Protocol::ClientBinary) | Some(Protocol::Text) => OutboundInit {
                handler: Box::new(StreamOutboundHandler),
                prefix: Bytes::new(),
            },
        };
        Ok(Some(init))
    }

    fn is_outbound_ready(&self, connection: &Connection) -> bool {
        connection.is_client_mode() || connection.attributes().contains(PROTOCOL)
    }
}
