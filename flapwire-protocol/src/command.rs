//! Inner command envelope carried in data-channel frames.
//!
//! ```text
//! +--------+---------+--------+------------+------------------+
//! | family | subtype | flags  | request_id | body             |
//! | 2 bytes| 2 bytes | 2 bytes|  4 bytes   | rest of payload  |
//! +--------+---------+--------+------------+------------------+
//! ```

use crate::error::ProtocolError;
use crate::frame::MAX_FRAME_PAYLOAD;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the command header in bytes (2+2+2+4 = 10).
pub const COMMAND_HEADER_SIZE: usize = 10;

/// Largest body that still fits in a single frame.
pub const MAX_COMMAND_BODY: usize = MAX_FRAME_PAYLOAD - COMMAND_HEADER_SIZE;

/// Command flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags(u16);

impl CommandFlags {
    /// More responses for the same request follow this one.
    pub const MORE_REPLIES: u16 = 0x0001;
    /// Body starts with a length-prefixed extra-info block.
    pub const EXTRA_INFO: u16 = 0x8000;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn with_more_replies(mut self) -> Self {
        self.0 |= Self::MORE_REPLIES;
        self
    }

    pub fn has_more_replies(&self) -> bool {
        self.0 & Self::MORE_REPLIES != 0
    }

    pub fn has_extra_info(&self) -> bool {
        self.0 & Self::EXTRA_INFO != 0
    }
}

/// Well-known family codes.
pub mod family {
    /// Generic service controls (negotiation, rates, redirects).
    pub const SERVICE: u16 = 0x0001;
    pub const LOCATION: u16 = 0x0002;
    pub const BUDDY: u16 = 0x0003;
    /// Messaging, including rendezvous ICBMs.
    pub const ICBM: u16 = 0x0004;
    pub const ADVERT: u16 = 0x0005;
    pub const INVITE: u16 = 0x0006;
    pub const ADMIN: u16 = 0x0007;
    pub const POPUP: u16 = 0x0008;
    pub const BOS: u16 = 0x0009;
    pub const USER_LOOKUP: u16 = 0x000a;
    pub const STATS: u16 = 0x000b;
    pub const TRANSLATE: u16 = 0x000c;
    pub const CHAT_NAV: u16 = 0x000d;
    pub const CHAT: u16 = 0x000e;
    pub const SEARCH: u16 = 0x000f;
    /// Buddy icon uploads and downloads.
    pub const ICON: u16 = 0x0010;
    pub const SSI: u16 = 0x0013;
    pub const ICQ: u16 = 0x0015;
    /// Authorization (MD5 login) family.
    pub const AUTH: u16 = 0x0017;

    /// Human-readable name used in logs.
    pub fn name(family: u16) -> &'static str {
        match family {
            SERVICE => "service",
            LOCATION => "location",
            BUDDY => "buddy",
            ICBM => "icbm",
            ADVERT => "advert",
            INVITE => "invite",
            ADMIN => "admin",
            POPUP => "popup",
            BOS => "bos",
            USER_LOOKUP => "user-lookup",
            STATS => "stats",
            TRANSLATE => "translate",
            CHAT_NAV => "chat-nav",
            CHAT => "chat",
            SEARCH => "search",
            ICON => "icon",
            SSI => "ssi",
            ICQ => "icq",
            AUTH => "auth",
            _ => "unknown",
        }
    }
}

/// A typed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub family: u16,
    pub subtype: u16,
    pub flags: CommandFlags,
    /// Correlation key; 0 for unsolicited commands.
    pub request_id: u32,
    /// Extra-info block stripped from the front of the body when the
    /// `EXTRA_INFO` flag is set.
    pub extra_info: Option<Bytes>,
    pub body: Bytes,
}

impl Command {
    pub fn new(family: u16, subtype: u16, body: impl Into<Bytes>) -> Self {
        Self {
            family,
            subtype,
            flags: CommandFlags::new(),
            request_id: 0,
            extra_info: None,
            body: body.into(),
        }
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Subtype `0x0001` is the error reply in every family.
    pub fn is_error(&self) -> bool {
        self.subtype == 0x0001
    }

    /// Returns the (family, subtype) pair.
    pub fn code(&self) -> (u16, u16) {
        (self.family, self.subtype)
    }

    /// Encodes header and body into a frame payload.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let extra_len = self.extra_info.as_ref().map_or(0, |e| 2 + e.len());
        let total = COMMAND_HEADER_SIZE + extra_len + self.body.len();
        if total > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let mut flags = self.flags.bits();
        if self.extra_info.is_some() {
            flags |= CommandFlags::EXTRA_INFO;
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(self.family);
        buf.put_u16(self.subtype);
        buf.put_u16(flags);
        buf.put_u32(self.request_id);
        if let Some(ref extra) = self.extra_info {
            buf.put_u16(extra.len() as u16);
            buf.put_slice(extra);
        }
        buf.put_slice(&self.body);
        Ok(buf)
    }

    /// Decodes a command from a data-channel frame payload.
    pub fn decode(payload: &Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < COMMAND_HEADER_SIZE {
            return Err(ProtocolError::truncated(
                "command header",
                COMMAND_HEADER_SIZE,
                payload.len(),
            ));
        }

        let family = u16::from_be_bytes([payload[0], payload[1]]);
        let subtype = u16::from_be_bytes([payload[2], payload[3]]);
        let flags = CommandFlags::from_bits(u16::from_be_bytes([payload[4], payload[5]]));
        let request_id = u32::from_be_bytes([payload[6], payload[7], payload[8], payload[9]]);

        let mut body = payload.slice(COMMAND_HEADER_SIZE..);
        let mut extra_info = None;

        if flags.has_extra_info() && body.len() >= 2 {
            let len = u16::from_be_bytes([body[0], body[1]]) as usize;
            if body.len() >= 2 + len {
                extra_info = Some(body.slice(2..2 + len));
                body = body.slice(2 + len..);
            }
        }

        Ok(Self {
            family,
            subtype,
            flags,
            request_id,
            extra_info,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let cmd = Command::new(family::ICBM, 0x0006, Bytes::from_static(b"hello"))
            .with_request_id(0x0102_0304);
        let encoded = cmd.encode().unwrap();
        assert_eq!(
            &encoded[..COMMAND_HEADER_SIZE],
            &[0x00, 0x04, 0x00, 0x06, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04]
        );

        let decoded = Command::decode(&encoded.freeze()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_truncated_header() {
        let result = Command::decode(&Bytes::from_static(b"\x00\x01\x00"));
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_extra_info_is_stripped() {
        let payload = Bytes::from_static(
            b"\x00\x01\x00\x18\x80\x00\x00\x00\x00\x07\x00\x02\xaa\xbbBODY",
        );
        let cmd = Command::decode(&payload).unwrap();
        assert!(cmd.flags.has_extra_info());
        assert_eq!(cmd.extra_info.as_deref(), Some(&b"\xaa\xbb"[..]));
        assert_eq!(cmd.body.as_ref(), b"BODY");

        // re-encoding reproduces the payload
        assert_eq!(cmd.encode().unwrap().as_ref(), payload.as_ref());
    }

    #[test]
    fn test_body_too_large() {
        let cmd = Command::new(family::ICON, 0x0002, vec![0u8; MAX_COMMAND_BODY + 1]);
        assert!(matches!(
            cmd.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));

        let cmd = Command::new(family::ICON, 0x0002, vec![0u8; MAX_COMMAND_BODY]);
        assert!(cmd.encode().is_ok());
    }

    #[test]
    fn test_flags() {
        let flags = CommandFlags::new().with_more_replies();
        assert!(flags.has_more_replies());
        assert!(!flags.has_extra_info());
        assert_eq!(family::name(family::SSI), "ssi");
        assert_eq!(family::name(0x7777), "unknown");
    }
}
