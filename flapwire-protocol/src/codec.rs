//! Streaming encoder and decoder for frames and the commands inside them.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::frame::{Channel, Frame};
use bytes::{Bytes, BytesMut};

/// Encodes frames and commands.
pub struct Encoder;

impl Encoder {
    /// Encodes a frame.
    pub fn encode_frame(channel: Channel, sequence: u16, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        Frame::encode_parts(channel, sequence, payload, &mut buf)?;
        Ok(buf)
    }

    /// Encodes a command into a data-channel frame.
    pub fn encode_command(command: &Command, sequence: u16) -> Result<BytesMut, ProtocolError> {
        let payload = command.encode()?;
        Self::encode_frame(Channel::DATA, sequence, &payload)
    }
}

/// Buffers incoming bytes and yields whole frames.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Decodes the next frame and, for data frames, the command inside it.
    pub fn decode_command(&mut self) -> Result<Option<(Frame, Option<Command>)>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) if frame.channel == Channel::DATA => {
                let command = Command::decode(&frame.payload)?;
                Ok(Some((frame, Some(command))))
            }
            Some(frame) => Ok(Some((frame, None))),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Gives the buffer to a reader that fills it directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::family;

    #[test]
    fn test_byte_at_a_time() {
        let cmd = Command::new(family::SERVICE, 0x0006, Bytes::new()).with_request_id(7);
        let encoded = Encoder::encode_command(&cmd, 100).unwrap();

        let mut decoder = Decoder::new();
        let mut decoded = None;
        for b in encoded.iter() {
            assert!(decoded.is_none());
            decoder.extend(&[*b]);
            decoded = decoder.decode_command().unwrap();
        }

        let (frame, command) = decoded.unwrap();
        assert_eq!(frame.sequence, 100);
        assert_eq!(command.unwrap(), cmd);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_non_data_frame_has_no_command() {
        let mut decoder = Decoder::new();
        decoder.extend(&Encoder::encode_frame(Channel::SIGN_ON, 1, &[0, 0, 0, 1]).unwrap());
        let (frame, command) = decoder.decode_command().unwrap().unwrap();
        assert_eq!(frame.channel, Channel::SIGN_ON);
        assert!(command.is_none());
    }

    #[test]
    fn test_short_data_frame_is_error() {
        let mut decoder = Decoder::new();
        decoder.extend(&Encoder::encode_frame(Channel::DATA, 1, &[0, 1]).unwrap());
        assert!(decoder.decode_command().is_err());
    }
}
