//! Typed command bodies.
//!
//! [`CommandBody::decode`] is a closed table keyed by `(family, subtype)`.
//! Pairs the table does not know decode to [`CommandBody::Unrecognized`]
//! with the raw body kept intact, so callers never see a null result.

use crate::command::{family, Command};
use crate::error::ProtocolError;
use crate::rendezvous::{IncomingIcbm, OutgoingIcbm};
use crate::tlv::{Charset, Tlv, TlvChain};
use crate::wire::WireReader;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

/// Subtypes of the service family.
pub mod service {
    pub const ERROR: u16 = 0x0001;
    pub const CLIENT_READY: u16 = 0x0002;
    pub const SERVER_READY: u16 = 0x0003;
    pub const SERVICE_REQUEST: u16 = 0x0004;
    pub const SERVICE_REDIRECT: u16 = 0x0005;
    pub const RATE_INFO_REQUEST: u16 = 0x0006;
    pub const RATE_INFO: u16 = 0x0007;
    pub const RATE_ACK: u16 = 0x0008;
    pub const RATE_CHANGE: u16 = 0x000a;
    pub const CLIENT_VERSIONS: u16 = 0x0017;
    pub const SERVER_VERSIONS: u16 = 0x0018;
}

/// Subtypes of the messaging family.
pub mod icbm {
    pub const ERROR: u16 = 0x0001;
    pub const SEND: u16 = 0x0006;
    pub const RECEIVE: u16 = 0x0007;
}

/// Error subtype shared by every family.
pub const ERROR_SUBTYPE: u16 = 0x0001;

/// Service redirect TLV types.
pub mod redirect_tlv {
    pub const SERVER: u16 = 0x0005;
    pub const COOKIE: u16 = 0x0006;
    pub const FAMILY: u16 = 0x000d;
}

/// Size of one rate class record on the wire.
pub const RATE_CLASS_SIZE: usize = 35;

/// A family and the dialect version spoken for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FamilyVersion {
    pub family: u16,
    pub version: u16,
}

/// Per-family entry of the client-ready command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FamilyToolInfo {
    pub family: u16,
    pub version: u16,
    pub tool_id: u16,
    pub tool_version: u16,
}

/// Server-announced parameters of one rate class. Averages are in
/// milliseconds between sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateClassInfo {
    pub class_id: u16,
    pub window_size: u32,
    pub clear_avg: u32,
    pub alert_avg: u32,
    pub limited_avg: u32,
    pub disconnect_avg: u32,
    pub current_avg: u32,
    pub max_avg: u32,
    pub last_time: u32,
    pub state: u8,
}

impl RateClassInfo {
    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            class_id: reader.u16()?,
            window_size: reader.u32()?,
            clear_avg: reader.u32()?,
            alert_avg: reader.u32()?,
            limited_avg: reader.u32()?,
            disconnect_avg: reader.u32()?,
            current_avg: reader.u32()?,
            max_avg: reader.u32()?,
            last_time: reader.u32()?,
            state: reader.u8()?,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.class_id);
        buf.put_u32(self.window_size);
        buf.put_u32(self.clear_avg);
        buf.put_u32(self.alert_avg);
        buf.put_u32(self.limited_avg);
        buf.put_u32(self.disconnect_avg);
        buf.put_u32(self.current_avg);
        buf.put_u32(self.max_avg);
        buf.put_u32(self.last_time);
        buf.put_u8(self.state);
    }
}

/// Which commands belong to a rate class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateClassMembers {
    pub class_id: u16,
    pub commands: Vec<(u16, u16)>,
}

/// Rate information reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateInfo {
    pub classes: Vec<RateClassInfo>,
    pub members: Vec<RateClassMembers>,
}

impl RateInfo {
    /// Class that `(family, subtype)` is a member of.
    pub fn class_for(&self, family: u16, subtype: u16) -> Option<u16> {
        self.members
            .iter()
            .find(|m| m.commands.contains(&(family, subtype)))
            .map(|m| m.class_id)
    }

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(body, "rate info");
        let count = reader.u16()? as usize;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(RateClassInfo::read(&mut reader)?);
        }
        // Member groups are optional on some servers
        let mut members = Vec::new();
        while !reader.is_empty() {
            let class_id = reader.u16()?;
            let n = reader.u16()? as usize;
            let mut commands = Vec::with_capacity(n);
            for _ in 0..n {
                commands.push((reader.u16()?, reader.u16()?));
            }
            members.push(RateClassMembers { class_id, commands });
        }
        Ok(Self { classes, members })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.classes.len() as u16);
        for class in &self.classes {
            class.write(buf);
        }
        for group in &self.members {
            buf.put_u16(group.class_id);
            buf.put_u16(group.commands.len() as u16);
            for (family, subtype) in &group.commands {
                buf.put_u16(*family);
                buf.put_u16(*subtype);
            }
        }
    }
}

/// Reason code of a rate-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateChangeCode {
    Changed,
    Warning,
    Limited,
    Clear,
}

impl RateChangeCode {
    pub fn code(&self) -> u16 {
        match self {
            RateChangeCode::Changed => 1,
            RateChangeCode::Warning => 2,
            RateChangeCode::Limited => 3,
            RateChangeCode::Clear => 4,
        }
    }

    pub fn from_code(code: u16) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(RateChangeCode::Changed),
            2 => Ok(RateChangeCode::Warning),
            3 => Ok(RateChangeCode::Limited),
            4 => Ok(RateChangeCode::Clear),
            other => Err(ProtocolError::UnknownCode {
                what: "rate change",
                code: other,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateChange {
    pub code: RateChangeCode,
    pub class: RateClassInfo,
}

/// Where to connect for a family this connection does not serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRedirect {
    pub family: u16,
    /// `host` or `host:port`.
    pub server: String,
    pub cookie: Bytes,
}

/// Error response carried as subtype 1 of any family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub family: u16,
    pub code: u16,
    pub tlvs: TlvChain,
}

/// A decoded command body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    ServerReady(Vec<u16>),
    ClientVersions(Vec<FamilyVersion>),
    ServerVersions(Vec<FamilyVersion>),
    RateInfoRequest,
    RateInfo(RateInfo),
    RateAck(Vec<u16>),
    RateChange(RateChange),
    ClientReady(Vec<FamilyToolInfo>),
    ServiceRequest { family: u16 },
    ServiceRedirect(ServiceRedirect),
    OutgoingIcbm(OutgoingIcbm),
    IncomingIcbm(IncomingIcbm),
    Error(ErrorReply),
    Unrecognized { family: u16, subtype: u16, raw: Bytes },
}

impl CommandBody {
    /// Decodes `body` according to `(family, subtype)`.
    pub fn decode(family: u16, subtype: u16, body: &Bytes) -> Result<Self, ProtocolError> {
        use CommandBody as B;

        if subtype == ERROR_SUBTYPE {
            let mut reader = WireReader::new(body, "error reply");
            let code = reader.u16()?;
            return Ok(B::Error(ErrorReply {
                family,
                code,
                tlvs: reader.rest_tlvs(),
            }));
        }

        let decoded = match (family, subtype) {
            (family::SERVICE, service::SERVER_READY) => B::ServerReady(read_u16_list(body, "server ready")?),
            (family::SERVICE, service::CLIENT_VERSIONS) => {
                B::ClientVersions(read_versions(body, "client versions")?)
            }
            (family::SERVICE, service::SERVER_VERSIONS) => {
                B::ServerVersions(read_versions(body, "server versions")?)
            }
            (family::SERVICE, service::RATE_INFO_REQUEST) => B::RateInfoRequest,
            (family::SERVICE, service::RATE_INFO) => B::RateInfo(RateInfo::decode(body)?),
            (family::SERVICE, service::RATE_ACK) => B::RateAck(read_u16_list(body, "rate ack")?),
            (family::SERVICE, service::RATE_CHANGE) => {
                let mut reader = WireReader::new(body, "rate change");
                let code = RateChangeCode::from_code(reader.u16()?)?;
                let class = RateClassInfo::read(&mut reader)?;
                B::RateChange(RateChange { code, class })
            }
            (family::SERVICE, service::CLIENT_READY) => {
                let mut reader = WireReader::new(body, "client ready");
                let mut entries = Vec::new();
                while !reader.is_empty() {
                    entries.push(FamilyToolInfo {
                        family: reader.u16()?,
                        version: reader.u16()?,
                        tool_id: reader.u16()?,
                        tool_version: reader.u16()?,
                    });
                }
                B::ClientReady(entries)
            }
            (family::SERVICE, service::SERVICE_REQUEST) => {
                let mut reader = WireReader::new(body, "service request");
                B::ServiceRequest {
                    family: reader.u16()?,
                }
            }
            (family::SERVICE, service::SERVICE_REDIRECT) => {
                let tlvs = TlvChain::read_all(body);
                B::ServiceRedirect(ServiceRedirect {
                    family: tlvs
                        .get_ushort(redirect_tlv::FAMILY)
                        .ok_or(ProtocolError::MissingField("redirect family"))?,
                    server: tlvs
                        .get_string(redirect_tlv::SERVER, Some(Charset::Ascii))
                        .ok_or(ProtocolError::MissingField("redirect server"))?,
                    cookie: tlvs
                        .get_bytes(redirect_tlv::COOKIE)
                        .cloned()
                        .ok_or(ProtocolError::MissingField("redirect cookie"))?,
                })
            }
            (family::ICBM, icbm::SEND) => B::OutgoingIcbm(OutgoingIcbm::decode(body)?),
            (family::ICBM, icbm::RECEIVE) => B::IncomingIcbm(IncomingIcbm::decode(body)?),
            _ => B::Unrecognized {
                family,
                subtype,
                raw: body.clone(),
            },
        };
        Ok(decoded)
    }

    /// Decodes the body of an already-parsed command.
    pub fn from_command(command: &Command) -> Result<Self, ProtocolError> {
        Self::decode(command.family, command.subtype, &command.body)
    }

    /// Returns the (family, subtype) pair this body is sent as.
    pub fn code(&self) -> (u16, u16) {
        use CommandBody as B;
        match self {
            B::ServerReady(_) => (family::SERVICE, service::SERVER_READY),
            B::ClientVersions(_) => (family::SERVICE, service::CLIENT_VERSIONS),
            B::ServerVersions(_) => (family::SERVICE, service::SERVER_VERSIONS),
            B::RateInfoRequest => (family::SERVICE, service::RATE_INFO_REQUEST),
            B::RateInfo(_) => (family::SERVICE, service::RATE_INFO),
            B::RateAck(_) => (family::SERVICE, service::RATE_ACK),
            B::RateChange(_) => (family::SERVICE, service::RATE_CHANGE),
            B::ClientReady(_) => (family::SERVICE, service::CLIENT_READY),
            B::ServiceRequest { .. } => (family::SERVICE, service::SERVICE_REQUEST),
            B::ServiceRedirect(_) => (family::SERVICE, service::SERVICE_REDIRECT),
            B::OutgoingIcbm(_) => (family::ICBM, icbm::SEND),
            B::IncomingIcbm(_) => (family::ICBM, icbm::RECEIVE),
            B::Error(e) => (e.family, ERROR_SUBTYPE),
            B::Unrecognized {
                family, subtype, ..
            } => (*family, *subtype),
        }
    }

    /// Encodes the body bytes (without the command header).
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        use CommandBody as B;
        let mut buf = BytesMut::new();
        match self {
            B::ServerReady(families) | B::RateAck(families) => {
                for f in families {
                    buf.put_u16(*f);
                }
            }
            B::ClientVersions(versions) | B::ServerVersions(versions) => {
                for v in versions {
                    buf.put_u16(v.family);
                    buf.put_u16(v.version);
                }
            }
            B::RateInfoRequest => {}
            B::RateInfo(info) => info.encode(&mut buf),
            B::RateChange(change) => {
                buf.put_u16(change.code.code());
                change.class.write(&mut buf);
            }
            B::ClientReady(entries) => {
                for e in entries {
                    buf.put_u16(e.family);
                    buf.put_u16(e.version);
                    buf.put_u16(e.tool_id);
                    buf.put_u16(e.tool_version);
                }
            }
            B::ServiceRequest { family } => buf.put_u16(*family),
            B::ServiceRedirect(redirect) => {
                TlvChain::new()
                    .with(Tlv::from_u16(redirect_tlv::FAMILY, redirect.family))
                    .with(Tlv::from_string(redirect_tlv::SERVER, &redirect.server))
                    .with(Tlv::new(redirect_tlv::COOKIE, redirect.cookie.clone()))
                    .write(&mut buf)?;
            }
            B::OutgoingIcbm(msg) => return msg.encode(),
            B::IncomingIcbm(msg) => return msg.encode(),
            B::Error(e) => {
                buf.put_u16(e.code);
                e.tlvs.write(&mut buf)?;
            }
            B::Unrecognized { raw, .. } => return Ok(raw.clone()),
        }
        Ok(buf.freeze())
    }

    /// Wraps the body in a command with request id 0.
    pub fn into_command(&self) -> Result<Command, ProtocolError> {
        let (family, subtype) = self.code();
        Ok(Command::new(family, subtype, self.encode()?))
    }
}

fn read_u16_list(body: &[u8], what: &'static str) -> Result<Vec<u16>, ProtocolError> {
    let mut reader = WireReader::new(body, what);
    let mut out = Vec::with_capacity(body.len() / 2);
    while reader.remaining() >= 2 {
        out.push(reader.u16()?);
    }
    Ok(out)
}

fn read_versions(body: &[u8], what: &'static str) -> Result<Vec<FamilyVersion>, ProtocolError> {
    let mut reader = WireReader::new(body, what);
    let mut out = Vec::with_capacity(body.len() / 4);
    while reader.remaining() >= 4 {
        out.push(FamilyVersion {
            family: reader.u16()?,
            version: reader.u16()?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_class(id: u16) -> RateClassInfo {
        RateClassInfo {
            class_id: id,
            window_size: 80,
            clear_avg: 2500,
            alert_avg: 2000,
            limited_avg: 1500,
            disconnect_avg: 800,
            current_avg: 5000,
            max_avg: 6000,
            last_time: 0,
            state: 0,
        }
    }

    #[test]
    fn test_server_ready() {
        let body = Bytes::from_static(&[0x00, 0x01, 0x00, 0x04, 0x00, 0x13]);
        let decoded = CommandBody::decode(family::SERVICE, service::SERVER_READY, &body).unwrap();
        assert_eq!(decoded, CommandBody::ServerReady(vec![1, 4, 0x13]));
        assert_eq!(decoded.encode().unwrap(), body);
    }

    #[test]
    fn test_rate_info_layout() {
        let info = RateInfo {
            classes: vec![sample_class(1), sample_class(2)],
            members: vec![
                RateClassMembers {
                    class_id: 1,
                    commands: vec![(0x0001, 0x0006), (0x0004, 0x0006)],
                },
                RateClassMembers {
                    class_id: 2,
                    commands: vec![(0x0010, 0x0002)],
                },
            ],
        };
        let body = CommandBody::RateInfo(info.clone()).encode().unwrap();
        assert_eq!(body.len(), 2 + 2 * RATE_CLASS_SIZE + (4 + 8) + (4 + 4));

        let decoded = CommandBody::decode(family::SERVICE, service::RATE_INFO, &body).unwrap();
        let CommandBody::RateInfo(decoded) = decoded else {
            panic!("expected rate info");
        };
        assert_eq!(decoded, info);
        assert_eq!(decoded.class_for(0x0004, 0x0006), Some(1));
        assert_eq!(decoded.class_for(0x0010, 0x0002), Some(2));
        assert_eq!(decoded.class_for(0x0002, 0x0002), None);
    }

    #[test]
    fn test_rate_info_truncated_class() {
        let body = Bytes::from_static(&[0x00, 0x01, 0x00, 0x01, 0x00]);
        assert!(matches!(
            CommandBody::decode(family::SERVICE, service::RATE_INFO, &body),
            Err(ProtocolError::Truncated { what: "rate info", .. })
        ));
    }

    #[test]
    fn test_rate_change() {
        let change = CommandBody::RateChange(RateChange {
            code: RateChangeCode::Limited,
            class: sample_class(3),
        });
        let body = change.encode().unwrap();
        assert_eq!(body.len(), 2 + RATE_CLASS_SIZE);
        let decoded = CommandBody::decode(family::SERVICE, service::RATE_CHANGE, &body).unwrap();
        assert_eq!(decoded, change);
    }

    #[test]
    fn test_error_in_any_family() {
        let body = Bytes::from_static(&[0x00, 0x04, 0x00, 0x08, 0x00, 0x02, 0x00, 0x0e]);
        let decoded = CommandBody::decode(family::ICBM, ERROR_SUBTYPE, &body).unwrap();
        match &decoded {
            CommandBody::Error(e) => {
                assert_eq!(e.family, family::ICBM);
                assert_eq!(e.code, 4);
                assert_eq!(e.tlvs.get_ushort(0x0008), Some(0x000e));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(decoded.code(), (family::ICBM, ERROR_SUBTYPE));
    }

    #[test]
    fn test_redirect() {
        let redirect = ServiceRedirect {
            family: family::ICON,
            server: "10.0.0.5:5190".to_string(),
            cookie: Bytes::from_static(b"cookie-bytes"),
        };
        let cmd = CommandBody::ServiceRedirect(redirect.clone())
            .into_command()
            .unwrap();
        assert_eq!(cmd.code(), (family::SERVICE, service::SERVICE_REDIRECT));
        assert_eq!(
            CommandBody::from_command(&cmd).unwrap(),
            CommandBody::ServiceRedirect(redirect)
        );

        let missing = Bytes::from_static(&[0x00, 0x0d, 0x00, 0x02, 0x00, 0x10]);
        assert!(matches!(
            CommandBody::decode(family::SERVICE, service::SERVICE_REDIRECT, &missing),
            Err(ProtocolError::MissingField("redirect server"))
        ));
    }

    #[test]
    fn test_unknown_pair_is_unrecognized() {
        let body = Bytes::from_static(b"\x01\x02\x03");
        let decoded = CommandBody::decode(family::SSI, 0x0009, &body).unwrap();
        assert_eq!(
            decoded,
            CommandBody::Unrecognized {
                family: family::SSI,
                subtype: 0x0009,
                raw: body.clone(),
            }
        );
        assert_eq!(decoded.encode().unwrap(), body);
    }

    #[test]
    fn test_client_ready() {
        let entries = vec![
            FamilyToolInfo {
                family: 1,
                version: 4,
                tool_id: 0x0110,
                tool_version: 0x08e5,
            },
            FamilyToolInfo {
                family: 4,
                version: 1,
                tool_id: 0x0110,
                tool_version: 0x08e5,
            },
        ];
        let body = CommandBody::ClientReady(entries.clone()).encode().unwrap();
        assert_eq!(body.len(), 16);
        assert_eq!(
            CommandBody::decode(family::SERVICE, service::CLIENT_READY, &body).unwrap(),
            CommandBody::ClientReady(entries)
        );
    }
}
