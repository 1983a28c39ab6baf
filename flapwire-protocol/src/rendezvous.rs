//! Rendezvous negotiation blocks carried in channel-2 messages.
//!
//! Outgoing message body (`0x0004/0x0006`):
//!
//! ```text
//! cookie[8] channel:u16 sn_len:u8 sn  TLV(0x05 rendezvous block) [TLV(0x03)]
//! ```
//!
//! Incoming message body (`0x0004/0x0007`):
//!
//! ```text
//! cookie[8] channel:u16 sn_len:u8 sn warning:u16 count:u16 user-info-TLVs*count  TLVs...
//! ```
//!
//! Rendezvous block:
//!
//! ```text
//! kind:u16 cookie[8] capability[16] TLVs...
//! ```

use crate::error::ProtocolError;
use crate::tlv::{Charset, Tlv, TlvChain};
use crate::wire::{put_short_string, WireReader};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Message channel used for rendezvous.
pub const RENDEZVOUS_CHANNEL: u16 = 2;

/// Message-level TLV types.
pub mod icbm_tlv {
    /// Requests a server acknowledgement.
    pub const ACK_REQUEST: u16 = 0x0003;
    /// Rendezvous block.
    pub const RENDEZVOUS: u16 = 0x0005;
}

/// TLV types inside a rendezvous block.
pub mod rv_tlv {
    pub const PROXY_IP: u16 = 0x0002;
    pub const CLIENT_IP: u16 = 0x0003;
    pub const VERIFIED_IP: u16 = 0x0004;
    pub const PORT: u16 = 0x0005;
    pub const REQUEST_INDEX: u16 = 0x000a;
    pub const INVITE_MESSAGE: u16 = 0x000c;
    pub const USE_PROXY: u16 = 0x0010;
    pub const IP_CHECK: u16 = 0x0016;
    pub const PORT_CHECK: u16 = 0x0017;
    pub const FILE_INFO: u16 = 0x2711;
    pub const FILENAME_CHARSET: u16 = 0x2712;
}

/// Capability identifying a "send file" rendezvous.
pub const CAP_SEND_FILE: Uuid = Uuid::from_u128(0x0946_1343_4c7f_11d1_8222_4445_5354_0000);

/// Capability identifying a "get file" (directory listing) rendezvous.
pub const CAP_GET_FILE: Uuid = Uuid::from_u128(0x0946_1348_4c7f_11d1_8222_4445_5354_0000);

/// Eight-byte session cookie shared by both peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cookie(pub [u8; 8]);

impl Cookie {
    /// Generates a random cookie.
    pub fn random() -> Self {
        Cookie(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({})", self)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Rendezvous block kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousKind {
    Propose,
    Cancel,
    Accept,
}

impl RendezvousKind {
    pub fn code(&self) -> u16 {
        match self {
            RendezvousKind::Propose => 0,
            RendezvousKind::Cancel => 1,
            RendezvousKind::Accept => 2,
        }
    }

    pub fn from_code(code: u16) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(RendezvousKind::Propose),
            1 => Ok(RendezvousKind::Cancel),
            2 => Ok(RendezvousKind::Accept),
            other => Err(ProtocolError::UnknownCode {
                what: "rendezvous kind",
                code: other,
            }),
        }
    }
}

/// Where a peer can be reached, as advertised in a proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// 1 for the first proposal, incremented on every redirect.
    pub request_index: u16,
    pub client_ip: Option<Ipv4Addr>,
    pub verified_ip: Option<Ipv4Addr>,
    pub proxy_ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
    /// Peer asks the other side to meet on a relay.
    pub use_proxy: bool,
}

impl ConnectionInfo {
    fn from_tlvs(tlvs: &TlvChain) -> Self {
        let ip = |t| tlvs.get_uint(t).map(Ipv4Addr::from);
        Self {
            request_index: tlvs.get_ushort(rv_tlv::REQUEST_INDEX).unwrap_or(1),
            client_ip: ip(rv_tlv::CLIENT_IP),
            verified_ip: ip(rv_tlv::VERIFIED_IP),
            proxy_ip: ip(rv_tlv::PROXY_IP),
            port: tlvs.get_ushort(rv_tlv::PORT),
            use_proxy: tlvs.has(rv_tlv::USE_PROXY),
        }
    }

    fn append_to(&self, tlvs: &mut TlvChain) {
        tlvs.push(Tlv::from_u16(rv_tlv::REQUEST_INDEX, self.request_index));
        if let Some(ip) = self.proxy_ip {
            tlvs.push(Tlv::from_u32(rv_tlv::PROXY_IP, u32::from(ip)));
            tlvs.push(Tlv::from_u32(rv_tlv::IP_CHECK, !u32::from(ip)));
        }
        if let Some(ip) = self.client_ip {
            tlvs.push(Tlv::from_u32(rv_tlv::CLIENT_IP, u32::from(ip)));
        }
        if let Some(ip) = self.verified_ip {
            tlvs.push(Tlv::from_u32(rv_tlv::VERIFIED_IP, u32::from(ip)));
        }
        if let Some(port) = self.port {
            tlvs.push(Tlv::from_u16(rv_tlv::PORT, port));
            tlvs.push(Tlv::from_u16(rv_tlv::PORT_CHECK, !port));
        }
        if self.use_proxy {
            tlvs.push(Tlv::empty(rv_tlv::USE_PROXY));
        }
    }
}

/// File description attached to a send-file proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSendInfo {
    /// Set for folder transfers.
    pub multiple: bool,
    pub file_count: u16,
    pub total_size: u32,
    pub filename: String,
}

impl FileSendInfo {
    pub fn single(filename: impl Into<String>, size: u32) -> Self {
        Self {
            multiple: false,
            file_count: 1,
            total_size: size,
            filename: filename.into(),
        }
    }

    pub fn encode(&self, charset: Charset) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(if self.multiple { 2 } else { 1 });
        buf.put_u16(self.file_count);
        buf.put_u32(self.total_size);
        buf.put_slice(&charset.encode(&self.filename));
        buf.put_u8(0);
        buf.freeze()
    }

    pub fn decode(data: &[u8], charset: Charset) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(data, "file info");
        let multiple = reader.u16()? == 2;
        let file_count = reader.u16()?;
        let total_size = reader.u32()?;
        let rest = reader.rest();
        let name_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Ok(Self {
            multiple,
            file_count,
            total_size,
            filename: charset.decode(&rest[..name_end]),
        })
    }
}

/// Negotiation block exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousBlock {
    pub kind: RendezvousKind,
    pub cookie: Cookie,
    pub capability: Uuid,
    pub tlvs: TlvChain,
}

impl RendezvousBlock {
    pub fn new(kind: RendezvousKind, cookie: Cookie, capability: Uuid) -> Self {
        Self {
            kind,
            cookie,
            capability,
            tlvs: TlvChain::new(),
        }
    }

    /// Builds a proposal advertising `info`.
    pub fn propose(cookie: Cookie, capability: Uuid, info: &ConnectionInfo) -> Self {
        let mut block = Self::new(RendezvousKind::Propose, cookie, capability);
        info.append_to(&mut block.tlvs);
        block
    }

    pub fn with_file_info(mut self, file: &FileSendInfo, charset: Charset) -> Self {
        self.tlvs
            .push(Tlv::new(rv_tlv::FILE_INFO, file.encode(charset)));
        self.tlvs.push(Tlv::from_string(
            rv_tlv::FILENAME_CHARSET,
            charset.name(),
        ));
        self
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::from_tlvs(&self.tlvs)
    }

    /// File description, if this is a send-file proposal.
    pub fn file_info(&self) -> Option<FileSendInfo> {
        let charset = self
            .tlvs
            .get_string(rv_tlv::FILENAME_CHARSET, Some(Charset::Ascii))
            .and_then(|name| Charset::from_name(&name))
            .unwrap_or(Charset::Latin1);
        self.tlvs
            .get_bytes(rv_tlv::FILE_INFO)
            .and_then(|raw| FileSendInfo::decode(raw, charset).ok())
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(26 + self.tlvs.encoded_len());
        buf.put_u16(self.kind.code());
        buf.put_slice(self.cookie.as_bytes());
        buf.put_slice(self.capability.as_bytes());
        self.tlvs.write(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(data, "rendezvous block");
        let kind = RendezvousKind::from_code(reader.u16()?)?;
        let cookie = Cookie(reader.array::<8>()?);
        let capability = Uuid::from_bytes(reader.array::<16>()?);
        let tlvs = reader.rest_tlvs();
        Ok(Self {
            kind,
            cookie,
            capability,
            tlvs,
        })
    }
}

/// Message sent by this client (`0x0004/0x0006`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingIcbm {
    pub cookie: Cookie,
    pub channel: u16,
    pub screen_name: String,
    pub tlvs: TlvChain,
}

impl OutgoingIcbm {
    /// Wraps a rendezvous block for `screen_name`.
    pub fn rendezvous(screen_name: impl Into<String>, block: &RendezvousBlock) -> Result<Self, ProtocolError> {
        let tlvs = TlvChain::new()
            .with(Tlv::new(icbm_tlv::RENDEZVOUS, block.encode()?))
            .with(Tlv::empty(icbm_tlv::ACK_REQUEST));
        Ok(Self {
            cookie: block.cookie,
            channel: RENDEZVOUS_CHANNEL,
            screen_name: screen_name.into(),
            tlvs,
        })
    }

    pub fn rendezvous_block(&self) -> Option<Result<RendezvousBlock, ProtocolError>> {
        self.tlvs
            .get_bytes(icbm_tlv::RENDEZVOUS)
            .map(|raw| RendezvousBlock::decode(raw))
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_slice(self.cookie.as_bytes());
        buf.put_u16(self.channel);
        put_short_string(&mut buf, "screen name", &self.screen_name)?;
        self.tlvs.write(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(data, "outgoing message");
        let cookie = Cookie(reader.array::<8>()?);
        let channel = reader.u16()?;
        let screen_name = reader.short_string()?;
        let tlvs = reader.rest_tlvs();
        Ok(Self {
            cookie,
            channel,
            screen_name,
            tlvs,
        })
    }
}

/// Message delivered to this client (`0x0004/0x0007`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingIcbm {
    pub cookie: Cookie,
    pub channel: u16,
    pub sender: String,
    pub warning_level: u16,
    pub user_info: TlvChain,
    pub tlvs: TlvChain,
}

impl IncomingIcbm {
    pub fn rendezvous_block(&self) -> Option<Result<RendezvousBlock, ProtocolError>> {
        self.tlvs
            .get_bytes(icbm_tlv::RENDEZVOUS)
            .map(|raw| RendezvousBlock::decode(raw))
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_slice(self.cookie.as_bytes());
        buf.put_u16(self.channel);
        put_short_string(&mut buf, "sender", &self.sender)?;
        buf.put_u16(self.warning_level);
        buf.put_u16(self.user_info.len() as u16);
        self.user_info.write(&mut buf)?;
        self.tlvs.write(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(data, "incoming message");
        let cookie = Cookie(reader.array::<8>()?);
        let channel = reader.u16()?;
        let sender = reader.short_string()?;
        let warning_level = reader.u16()?;
        let user_info = reader.counted_tlvs()?;
        let tlvs = reader.rest_tlvs();
        Ok(Self {
            cookie,
            channel,
            sender,
            warning_level,
            user_info,
            tlvs,
        })
    }
}
