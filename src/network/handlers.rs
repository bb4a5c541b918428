//! Protocol-specific frame handlers.
//!
//! Inbound handlers decode complete frames from the front of the input
//! buffer and leave a trailing partial frame in place. Outbound handlers
//! copy frames into the output buffer in chunks no larger than its limit.

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tracing::trace;

use crate::error::{NetworkError, Result};
use crate::network::connection::Connection;
use crate::network::dispatcher::{ClientMessageHandler, PacketDispatcher, TextCommandHandler};
use crate::network::packet::HEADER_SIZE;
use crate::network::writer::OutboundFrame;
use crate::network::Packet;

/// Decodes frames read from a connection.
pub trait InboundHandler: Send {
    /// Consume every complete frame in `src`.
    fn on_read(&mut self, src: &mut BytesMut) -> Result<()>;
}

/// Encodes frames written to a connection.
pub trait OutboundHandler: Send {
    /// Copy `frame`, starting at byte `offset` of its encoding, into `dst`
    /// without growing it past `limit`.
    ///
    /// Returns the offset to resume from, or `None` once the frame is complete.
    fn on_write(
        &mut self,
        frame: &OutboundFrame,
        offset: usize,
        dst: &mut BytesMut,
        limit: usize,
    ) -> Result<Option<usize>>;
}

/// Member-to-member packets.
pub struct PacketInboundHandler {
    connection: Arc<Connection>,
    dispatcher: Arc<dyn PacketDispatcher>,
    max_frame_size: usize,
    responses: Vec<Packet>,
}

impl PacketInboundHandler {
    pub fn new(
        connection: Arc<Connection>,
        dispatcher: Arc<dyn PacketDispatcher>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            connection,
            dispatcher,
            max_frame_size,
            responses: Vec::new(),
        }
    }
}

impl InboundHandler for PacketInboundHandler {
    fn on_read(&mut self, src: &mut BytesMut) -> Result<()> {
        while let Some(mut packet) = Packet::decode(src, self.max_frame_size)? {
            packet.set_connection(self.connection.id());
            let stats = self.connection.stats();
            if packet.is_urgent() {
                stats.priority_frames_read.inc();
            } else {
                stats.normal_frames_read.inc();
            }
            if packet.is_response() {
                self.responses.push(packet);
            } else {
                self.dispatcher.dispatch(packet)?;
            }
        }
        if !self.responses.is_empty() {
            let batch = std::mem::take(&mut self.responses);
            trace!(connection = self.connection.id(), count = batch.len(), "dispatching responses");
            self.dispatcher.dispatch_responses(batch)?;
        }
        Ok(())
    }
}

/// Binary client messages, each prefixed with a little-endian `u32` length.
pub struct ClientInboundHandler {
    connection: Arc<Connection>,
    handler: Arc<dyn ClientMessageHandler>,
    max_frame_size: usize,
}

impl ClientInboundHandler {
    pub fn new(
        connection: Arc<Connection>,
        handler: Arc<dyn ClientMessageHandler>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            connection,
            handler,
            max_frame_size,
        }
    }
}

impl InboundHandler for ClientInboundHandler {
    fn on_read(&mut self, src: &mut BytesMut) -> Result<()> {
        while src.len() >= 4 {
            let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if len > self.max_frame_size {
                return Err(NetworkError::FrameTooLarge {
                    size: len,
                    max: self.max_frame_size,
                }
                .into());
            }
            if src.len() < 4 + len {
                break;
            }
            src.advance(4);
            let message = src.split_to(len).freeze();
            self.connection.stats().normal_frames_read.inc();
            self.handler.on_message(&self.connection, message)?;
        }
        Ok(())
    }
}

/// Line-oriented text commands terminated by LF or CRLF.
pub struct TextInboundHandler {
    connection: Arc<Connection>,
    handler: Arc<dyn TextCommandHandler>,
    max_line_length: usize,
}

impl TextInboundHandler {
    pub fn new(
        connection: Arc<Connection>,
        handler: Arc<dyn TextCommandHandler>,
        max_line_length: usize,
    ) -> Self {
        Self {
            connection,
            handler,
            max_line_length,
        }
    }
}

impl InboundHandler for TextInboundHandler {
    fn on_read(&mut self, src: &mut BytesMut) -> Result<()> {
        while let Some(pos) = src.iter().position(|b| *b == b'\n') {
            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            let command = String::from_utf8(line.to_vec())
                .map_err(|e| NetworkError::MalformedFrame(format!("invalid text command: {e}")))?;
            self.connection.stats().normal_frames_read.inc();
            self.handler.on_command(&self.connection, command)?;
        }
        if src.len() > self.max_line_length {
            return Err(NetworkError::FrameTooLarge {
                size: src.len(),
                max: self.max_line_length,
            }
            .into());
        }
        Ok(())
    }
}

/// Copies `bytes[offset..]` into `dst` up to `limit`. Returns the new offset.
fn copy_chunk(bytes: &[u8], offset: usize, dst: &mut BytesMut, limit: usize) -> usize {
    let room = limit.saturating_sub(dst.len());
    let end = bytes.len().min(offset + room);
    dst.extend_from_slice(&bytes[offset..end]);
    end
}

fn progress(offset: usize, total: usize) -> Option<usize> {
    (offset < total).then_some(offset)
}

/// Encodes packets for member connections. Raw bytes are written unchanged.
#[derive(Debug, Default)]
pub struct PacketOutboundHandler;

impl OutboundHandler for PacketOutboundHandler {
    fn on_write(
        &mut self,
        frame: &OutboundFrame,
        offset: usize,
        dst: &mut BytesMut,
        limit: usize,
    ) -> Result<Option<usize>> {
        match frame {
            OutboundFrame::Bytes(bytes) => {
                let next = copy_chunk(bytes, offset, dst, limit);
                Ok(progress(next, bytes.len()))
            }
            OutboundFrame::Packet(packet) => {
                let header = packet.header_bytes()?;
                let payload = packet.payload();
                let mut pos = offset;
                if pos < HEADER_SIZE {
                    pos = copy_chunk(&header, pos, dst, limit);
                }
                if pos >= HEADER_SIZE {
                    pos = HEADER_SIZE + copy_chunk(payload, pos - HEADER_SIZE, dst, limit);
                }
                Ok(progress(pos, packet.frame_len()))
            }
        }
    }
}

/// Writes pre-encoded frames for client and text connections.
#[derive(Debug, Default)]
pub struct StreamOutboundHandler;

impl OutboundHandler for StreamOutboundHandler {
    fn on_write(
        &mut self,
        frame: &OutboundFrame,
        offset: usize,
        dst: &mut BytesMut,
        limit: usize,
    ) -> Result<Option<usize>> {
        match frame {
            OutboundFrame::Bytes(bytes) => {
                let next = copy_chunk(bytes, offset, dst, limit);
                Ok(progress(next, bytes.len()))
            }
            OutboundFrame::Packet(_) => Err(NetworkError::MalformedFrame(
                "member packet written to a non-member connection".to_string(),
            )
            .into()),
        }
    }
}
