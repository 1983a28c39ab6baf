//! Relay ("rendezvous proxy") packets.
//!
//! ```text
//! length:u16 | version:u16 = 0x044a | command:u16 | zero:u32 | flags:u16 | body
//! ```
//!
//! `length` counts every byte after itself. Once the relay reports
//! [`ProxyMessage::Ready`] the socket carries the raw transfer stream.

use crate::error::ProtocolError;
use crate::rendezvous::Cookie;
use crate::tlv::{Tlv, TlvChain};
use crate::wire::{put_short_string, WireReader};
use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Relay protocol version.
pub const PROXY_VERSION: u16 = 0x044a;

/// Fixed bytes after the length field.
const PROXY_HEADER_SIZE: usize = 10;

/// Capability TLV type in init bodies.
const CAPABILITY_TLV: u16 = 0x0001;

/// Relay command codes.
pub mod proxy_command {
    pub const ERROR: u16 = 0x0001;
    pub const INIT_SEND: u16 = 0x0002;
    pub const ACK: u16 = 0x0003;
    pub const INIT_RECV: u16 = 0x0004;
    pub const READY: u16 = 0x0005;
}

/// A relay control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMessage {
    Error {
        code: u16,
    },
    /// Opens a relay session as the side that proposed it.
    InitSend {
        screen_name: String,
        cookie: Cookie,
        capability: Uuid,
    },
    /// The relay's answer to `InitSend`: where the peer should join.
    Ack {
        port: u16,
        ip: Ipv4Addr,
    },
    /// Joins an existing relay session.
    InitRecv {
        screen_name: String,
        port: u16,
        cookie: Cookie,
        capability: Uuid,
    },
    /// Both sides are attached.
    Ready,
}

impl ProxyMessage {
    pub fn command(&self) -> u16 {
        match self {
            ProxyMessage::Error { .. } => proxy_command::ERROR,
            ProxyMessage::InitSend { .. } => proxy_command::INIT_SEND,
            ProxyMessage::Ack { .. } => proxy_command::ACK,
            ProxyMessage::InitRecv { .. } => proxy_command::INIT_RECV,
            ProxyMessage::Ready => proxy_command::READY,
        }
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut body = BytesMut::new();
        match self {
            ProxyMessage::Error { code } => body.put_u16(*code),
            ProxyMessage::InitSend {
                screen_name,
                cookie,
                capability,
            } => {
                put_short_string(&mut body, "screen name", screen_name)?;
                body.put_slice(cookie.as_bytes());
                capability_tlv(capability).write(&mut body)?;
            }
            ProxyMessage::Ack { port, ip } => {
                body.put_u16(*port);
                body.put_u32(u32::from(*ip));
            }
            ProxyMessage::InitRecv {
                screen_name,
                port,
                cookie,
                capability,
            } => {
                put_short_string(&mut body, "screen name", screen_name)?;
                body.put_u16(*port);
                body.put_slice(cookie.as_bytes());
                capability_tlv(capability).write(&mut body)?;
            }
            ProxyMessage::Ready => {}
        }

        let mut buf = BytesMut::with_capacity(2 + PROXY_HEADER_SIZE + body.len());
        buf.put_u16((PROXY_HEADER_SIZE + body.len()) as u16);
        buf.put_u16(PROXY_VERSION);
        buf.put_u16(self.command());
        buf.put_u32(0);
        buf.put_u16(0);
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Decodes one message from the front of `buf`, `Ok(None)` while incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if length < PROXY_HEADER_SIZE {
            return Err(ProtocolError::truncated("relay header", PROXY_HEADER_SIZE, length));
        }
        if buf.len() < 2 + length {
            return Ok(None);
        }
        buf.advance(2);
        let packet = buf.split_to(length);

        let mut r = WireReader::new(&packet, "relay packet");
        let version = r.u16()?;
        if version != PROXY_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                what: "relay",
                version: version as u32,
            });
        }
        let command = r.u16()?;
        r.u32()?;
        r.u16()?;

        let message = match command {
            proxy_command::ERROR => ProxyMessage::Error { code: r.u16()? },
            proxy_command::INIT_SEND => {
                let screen_name = r.short_string()?;
                let cookie = Cookie(r.array::<8>()?);
                let capability = read_capability(&mut r)?;
                ProxyMessage::InitSend {
                    screen_name,
                    cookie,
                    capability,
                }
            }
            proxy_command::ACK => ProxyMessage::Ack {
                port: r.u16()?,
                ip: Ipv4Addr::from(r.u32()?),
            },
            proxy_command::INIT_RECV => {
                let screen_name = r.short_string()?;
                let port = r.u16()?;
                let cookie = Cookie(r.array::<8>()?);
                let capability = read_capability(&mut r)?;
                ProxyMessage::InitRecv {
                    screen_name,
                    port,
                    cookie,
                    capability,
                }
            }
            proxy_command::READY => ProxyMessage::Ready,
            other => {
                return Err(ProtocolError::UnknownCode {
                    what: "relay command",
                    code: other,
                })
            }
        };
        Ok(Some(message))
    }
}

fn capability_tlv(capability: &Uuid) -> Tlv {
    Tlv::new(CAPABILITY_TLV, capability.as_bytes().to_vec())
}

fn read_capability(r: &mut WireReader<'_>) -> Result<Uuid, ProtocolError> {
    let tlvs: TlvChain = r.rest_tlvs();
    let raw = tlvs
        .get_bytes(CAPABILITY_TLV)
        .ok_or(ProtocolError::MissingField("relay capability"))?;
    Uuid::from_slice(raw).map_err(|_| ProtocolError::MissingField("relay capability"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::CAP_SEND_FILE;

    #[test]
    fn test_ready_layout() {
        let encoded = ProxyMessage::Ready.encode().unwrap();
        assert_eq!(
            encoded.as_ref(),
            &[0x00, 0x0a, 0x04, 0x4a, 0x00, 0x05, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_init_send_roundtrip() {
        let msg = ProxyMessage::InitSend {
            screen_name: "alice".to_string(),
            cookie: Cookie([3; 8]),
            capability: CAP_SEND_FILE,
        };
        let mut buf = msg.encode().unwrap();
        assert_eq!(ProxyMessage::decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_init_recv_and_ack() {
        let recv = ProxyMessage::InitRecv {
            screen_name: "bob".to_string(),
            port: 4443,
            cookie: Cookie([4; 8]),
            capability: CAP_SEND_FILE,
        };
        let ack = ProxyMessage::Ack {
            port: 4443,
            ip: Ipv4Addr::new(205, 188, 1, 2),
        };
        let mut buf = recv.encode().unwrap();
        buf.extend_from_slice(&ack.encode().unwrap());

        assert_eq!(ProxyMessage::decode(&mut buf).unwrap(), Some(recv));
        assert_eq!(ProxyMessage::decode(&mut buf).unwrap(), Some(ack));
        assert_eq!(ProxyMessage::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_incomplete_and_bad_version() {
        let full = ProxyMessage::Error { code: 0x1a }.encode().unwrap();
        let mut partial = BytesMut::from(&full[..5]);
        assert_eq!(ProxyMessage::decode(&mut partial).unwrap(), None);

        let mut bad = BytesMut::from(&[0x00, 0x0a, 0x04, 0x4b, 0x00, 0x05, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            ProxyMessage::decode(&mut bad),
            Err(ProtocolError::UnsupportedVersion { .. })
        ));
    }
}
