//! Member-to-member wire frame.
//!
//! ```text
//! ┌─────────┬───────────┬──────────────┬────────────┬─────────────┐
//! │ version │ flags     │ partition id │ length     │ payload     │
//! │ u8      │ u16 BE    │ i32 BE       │ u32 BE     │ length bytes│
//! └─────────┴───────────┴──────────────┴────────────┴─────────────┘
//! ```
//!
//! The payload is opaque to the core. Only the partition, urgency and
//! request/response classification are interpreted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{NetworkError, Result};
use crate::types::{ConnectionId, PartitionId, GENERIC_PARTITION_ID};

/// Current frame version.
pub const PACKET_VERSION: u8 = 4;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 1 + 2 + 4 + 4;

/// Frame flags.
pub mod flags {
    /// The payload is an operation or an operation response.
    pub const OP: u16 = 1 << 0;
    /// The payload is a response to an earlier request.
    pub const RESPONSE: u16 = 1 << 1;
    /// The payload is an event.
    pub const EVENT: u16 = 1 << 2;
    /// The frame skips the normal queues.
    pub const URGENT: u16 = 1 << 4;
    /// The frame binds a connection to a member identity.
    pub const BIND: u16 = 1 << 5;
}

/// A decoded frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    flags: u16,
    partition_id: PartitionId,
    payload: Bytes,
    connection: Option<ConnectionId>,
}

impl Packet {
    /// Create a frame for the given partition.
    pub fn new(payload: impl Into<Bytes>, partition_id: PartitionId) -> Self {
        Self {
            flags: 0,
            partition_id,
            payload: payload.into(),
            connection: None,
        }
    }

    /// Create an operation frame.
    pub fn operation(payload: impl Into<Bytes>, partition_id: PartitionId) -> Self {
        Self::new(payload, partition_id).with_flags(flags::OP)
    }

    /// Create a response frame. Responses carry no partition.
    pub fn response(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, GENERIC_PARTITION_ID).with_flags(flags::OP | flags::RESPONSE)
    }

    /// Set additional flags.
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags |= flags;
        self
    }

    /// Mark the frame urgent.
    pub fn urgent(self) -> Self {
        self.with_flags(flags::URGENT)
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn is_flag_set(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_urgent(&self) -> bool {
        self.is_flag_set(flags::URGENT)
    }

    /// An operation response, which is handled outside the executor queues.
    pub fn is_response(&self) -> bool {
        self.is_flag_set(flags::OP) && self.is_flag_set(flags::RESPONSE)
    }

    /// Connection the frame arrived on.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub(crate) fn set_connection(&mut self, connection: ConnectionId) {
        self.connection = Some(connection);
    }

    /// Encoded size in bytes.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// The encoded header alone. Fails if the payload does not fit the
    /// 32-bit length field.
    pub fn header_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let length = payload_length(self.payload.len())?;
        let mut header = [0u8; HEADER_SIZE];
        let mut dst = &mut header[..];
        dst.put_u8(PACKET_VERSION);
        dst.put_u16(self.flags);
        dst.put_i32(self.partition_id);
        dst.put_u32(length);
        Ok(header)
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let header = self.header_bytes()?;
        dst.reserve(self.frame_len());
        dst.put_slice(&header);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a standalone buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while the frame is incomplete.
    pub fn decode(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Packet>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &src[..HEADER_SIZE];
        let version = header.get_u8();
        if version != PACKET_VERSION {
            return Err(NetworkError::MalformedFrame(format!(
                "unsupported packet version {version}, expected {PACKET_VERSION}"
            ))
            .into());
        }
        let flags = header.get_u16();
        let partition_id = header.get_i32();
        let len = header.get_u32() as usize;
        if len > max_frame_size {
            return Err(NetworkError::FrameTooLarge {
                size: len,
                max: max_frame_size,
            }
            .into());
        }
        if src.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        Ok(Some(Packet {
            flags,
            partition_id,
            payload,
            connection: None,
        }))
    }

    /// Bytes needed to complete the frame at the front of `src`, if the header is there.
    pub fn pending_frame_len(src: &[u8]) -> Option<usize> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        let len = u32::from_be_bytes([src[7], src[8], src[9], src[10]]) as usize;
        Some(HEADER_SIZE + len)
    }
}

fn payload_length(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        NetworkError::FrameTooLarge {
            size: len,
            max: u32::MAX as usize,
        }
        .into()
    })
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("flags", &format_args!("{:#06x}", self.flags))
            .field("partition_id", &self.partition_id)
            .field("payload_len", &self.payload.len())
            .field("connection", &self.connection)
            .finish()
    }
}
