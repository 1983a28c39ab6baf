//! Outer frame envelope.
//!
//! Frame layout (6 bytes header + payload):
//!
//! ```text
//! +--------+---------+----------+--------+------------------+
//! | marker | channel | sequence | length | payload          |
//! | 1 byte | 1 byte  | 2 bytes  | 2 bytes| length bytes     |
//! +--------+---------+----------+--------+------------------+
//! ```
//!
//! All multi-byte fields are big endian. The marker is always `0x2a`.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Start-of-frame marker.
pub const FRAME_MARKER: u8 = 0x2a;

/// Size of the fixed frame header in bytes (1+1+2+2 = 6).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Maximum payload carried by one frame.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frame channel identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel(pub u8);

impl Channel {
    /// Sign-on handshake (version + login TLVs).
    pub const SIGN_ON: Channel = Channel(1);
    /// Typed commands.
    pub const DATA: Channel = Channel(2);
    /// Frame-level error.
    pub const ERROR: Channel = Channel(3);
    /// Sign-off / connection close, also carries the login reply.
    pub const SIGN_OFF: Channel = Channel(4);
    /// Keep-alive.
    pub const KEEP_ALIVE: Channel = Channel(5);

    pub fn name(&self) -> &'static str {
        match self.0 {
            1 => "sign-on",
            2 => "data",
            3 => "error",
            4 => "sign-off",
            5 => "keep-alive",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({}:{})", self.0, self.name())
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel the payload belongs to.
    pub channel: Channel,
    /// Per-connection sequence number, wrapping mod 65536.
    pub sequence: u16,
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: Channel, sequence: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            sequence,
            payload: payload.into(),
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        Self::encode_parts(self.channel, self.sequence, &self.payload, &mut buf)?;
        Ok(buf)
    }

    /// Writes a frame without building a `Frame` value first.
    pub fn encode_parts(
        channel: Channel,
        sequence: u16,
        payload: &[u8],
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }

        buf.reserve(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(FRAME_MARKER);
        buf.put_u8(channel.0);
        buf.put_u16(sequence);
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
        Ok(())
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on a bad marker.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.is_empty() {
            return Ok(None);
        }

        // Reject garbage as soon as the first byte is in
        if buf[0] != FRAME_MARKER {
            return Err(ProtocolError::InvalidMarker(buf[0]));
        }

        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let channel = Channel(buf[1]);
        let sequence = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;

        if buf.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Self {
            channel,
            sequence,
            payload,
        }))
    }
}

/// Payload of the channel-1 hello each side sends first: a u32 version, then
/// optional TLVs.
pub const SIGN_ON_VERSION: u32 = 1;
