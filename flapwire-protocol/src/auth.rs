//! Sign-on TLVs exchanged on channels 1 and 4.

use crate::error::ProtocolError;
use crate::frame::SIGN_ON_VERSION;
use crate::tlv::{Charset, Tlv, TlvChain};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Sign-on TLV types.
pub mod login_tlv {
    pub const SCREEN_NAME: u16 = 0x0001;
    pub const ROASTED_PASSWORD: u16 = 0x0002;
    pub const CLIENT_ID_STRING: u16 = 0x0003;
    pub const ERROR_URL: u16 = 0x0004;
    pub const BOS_ADDRESS: u16 = 0x0005;
    pub const COOKIE: u16 = 0x0006;
    pub const ERROR_CODE: u16 = 0x0008;
    pub const COUNTRY: u16 = 0x000e;
    pub const LANGUAGE: u16 = 0x000f;
    pub const DISTRIBUTION: u16 = 0x0014;
    pub const CLIENT_ID: u16 = 0x0016;
    pub const MAJOR: u16 = 0x0017;
    pub const MINOR: u16 = 0x0018;
    pub const POINT: u16 = 0x0019;
    pub const BUILD: u16 = 0x001a;
}

const ROAST_TABLE: [u8; 16] = [
    0xf3, 0x26, 0x81, 0xc4, 0x39, 0x86, 0xdb, 0x92, 0x71, 0xa3, 0xb9, 0xe6, 0x53, 0x7a, 0x95, 0x7c,
];

/// Obfuscates a password with the fixed roast table. Applying it twice
/// returns the input.
pub fn roast_password(password: &[u8]) -> Vec<u8> {
    password
        .iter()
        .zip(ROAST_TABLE.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

/// Identification sent while signing on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientVersionInfo {
    pub id_string: String,
    pub client_id: u16,
    pub major: u16,
    pub minor: u16,
    pub point: u16,
    pub build: u16,
    pub distribution: u32,
}

impl Default for ClientVersionInfo {
    fn default() -> Self {
        Self {
            id_string: "AOL Instant Messenger, version 5.1.3036/WIN32".to_string(),
            client_id: 0x0109,
            major: 5,
            minor: 1,
            point: 0,
            build: 3036,
            distribution: 0x00d2,
        }
    }
}

/// Credentials and locale for the channel-1 login frame.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub screen_name: String,
    pub password: String,
    pub version: ClientVersionInfo,
    pub language: String,
    pub country: String,
}

impl LoginRequest {
    pub fn tlvs(&self) -> TlvChain {
        let v = &self.version;
        TlvChain::new()
            .with(Tlv::from_string_in(
                login_tlv::SCREEN_NAME,
                &self.screen_name,
                Charset::Ascii,
            ))
            .with(Tlv::new(
                login_tlv::ROASTED_PASSWORD,
                roast_password(self.password.as_bytes()),
            ))
            .with(Tlv::from_string(login_tlv::CLIENT_ID_STRING, &v.id_string))
            .with(Tlv::from_u16(login_tlv::CLIENT_ID, v.client_id))
            .with(Tlv::from_u16(login_tlv::MAJOR, v.major))
            .with(Tlv::from_u16(login_tlv::MINOR, v.minor))
            .with(Tlv::from_u16(login_tlv::POINT, v.point))
            .with(Tlv::from_u16(login_tlv::BUILD, v.build))
            .with(Tlv::from_u32(login_tlv::DISTRIBUTION, v.distribution))
            .with(Tlv::from_string(login_tlv::LANGUAGE, &self.language))
            .with(Tlv::from_string(login_tlv::COUNTRY, &self.country))
    }

    /// Channel-1 payload: version followed by the login TLVs.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        sign_on_payload(&self.tlvs())
    }
}

/// Builds a channel-1 payload of `version 1` plus `tlvs`.
pub fn sign_on_payload(tlvs: &TlvChain) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(4 + tlvs.encoded_len());
    buf.put_u32(SIGN_ON_VERSION);
    tlvs.write(&mut buf)?;
    Ok(buf.freeze())
}

/// Channel-1 payload presenting a login cookie to a service host.
pub fn cookie_sign_on(cookie: &[u8]) -> Result<Bytes, ProtocolError> {
    sign_on_payload(&TlvChain::new().with(Tlv::new(
        login_tlv::COOKIE,
        Bytes::copy_from_slice(cookie),
    )))
}

/// Parses a channel-1 hello, returning its version and trailing TLVs.
pub fn parse_sign_on(payload: &[u8]) -> Result<(u32, TlvChain), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Truncated {
            what: "sign-on hello",
            needed: 4,
            available: payload.len(),
        });
    }
    let version = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((version, TlvChain::read_all(&payload[4..])))
}

/// Outcome carried by the channel-4 login reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginReply {
    Success {
        screen_name: Option<String>,
        bos_address: String,
        cookie: Bytes,
    },
    Failure {
        code: u16,
        url: Option<String>,
    },
}

impl LoginReply {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let tlvs = TlvChain::read_all(payload);
        if let Some(code) = tlvs.get_ushort(login_tlv::ERROR_CODE) {
            return Ok(LoginReply::Failure {
                code,
                url: tlvs.get_string(login_tlv::ERROR_URL, Some(Charset::Ascii)),
            });
        }
        let bos_address = tlvs
            .get_string(login_tlv::BOS_ADDRESS, Some(Charset::Ascii))
            .ok_or(ProtocolError::MissingField("BOS address"))?;
        let cookie = tlvs
            .get_bytes(login_tlv::COOKIE)
            .cloned()
            .ok_or(ProtocolError::MissingField("login cookie"))?;
        Ok(LoginReply::Success {
            screen_name: tlvs.get_string(login_tlv::SCREEN_NAME, Some(Charset::Ascii)),
            bos_address,
            cookie,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roast_is_involution() {
        let roasted = roast_password(b"hunter2");
        assert_eq!(roasted[0], b'h' ^ 0xf3);
        assert_eq!(roast_password(&roasted), b"hunter2");

        let long = vec![0u8; 20];
        let roasted = roast_password(&long);
        assert_eq!(roasted[16], 0xf3);
    }

    #[test]
    fn test_login_payload() {
        let request = LoginRequest {
            screen_name: "alice".to_string(),
            password: "secret".to_string(),
            version: ClientVersionInfo::default(),
            language: "en".to_string(),
            country: "us".to_string(),
        };
        let payload = request.encode().unwrap();
        let (version, tlvs) = parse_sign_on(&payload).unwrap();
        assert_eq!(version, 1);
        assert_eq!(
            tlvs.get_string(login_tlv::SCREEN_NAME, None).as_deref(),
            Some("alice")
        );
        assert_eq!(
            tlvs.get_bytes(login_tlv::ROASTED_PASSWORD).unwrap().as_ref(),
            roast_password(b"secret").as_slice()
        );
        assert_eq!(tlvs.get_ushort(login_tlv::BUILD), Some(3036));
        assert_eq!(tlvs.get_uint(login_tlv::DISTRIBUTION), Some(0xd2));
    }

    #[test]
    fn test_reply_success() {
        let payload = TlvChain::new()
            .with(Tlv::from_string(login_tlv::SCREEN_NAME, "Alice"))
            .with(Tlv::from_string(login_tlv::BOS_ADDRESS, "64.12.0.1:5190"))
            .with(Tlv::new(login_tlv::COOKIE, Bytes::from_static(b"\x01\x02")))
            .to_bytes()
            .unwrap();
        match LoginReply::parse(&payload).unwrap() {
            LoginReply::Success {
                screen_name,
                bos_address,
                cookie,
            } => {
                assert_eq!(screen_name.as_deref(), Some("Alice"));
                assert_eq!(bos_address, "64.12.0.1:5190");
                assert_eq!(cookie.as_ref(), b"\x01\x02");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reply_failure() {
        let payload = TlvChain::new()
            .with(Tlv::from_u16(login_tlv::ERROR_CODE, 5))
            .with(Tlv::from_string(login_tlv::ERROR_URL, "http://example.invalid/e5"))
            .to_bytes()
            .unwrap();
        assert_eq!(
            LoginReply::parse(&payload).unwrap(),
            LoginReply::Failure {
                code: 5,
                url: Some("http://example.invalid/e5".to_string()),
            }
        );
    }

    #[test]
    fn test_reply_missing_cookie() {
        let payload = TlvChain::new()
            .with(Tlv::from_string(login_tlv::BOS_ADDRESS, "host"))
            .to_bytes()
            .unwrap();
        assert!(matches!(
            LoginReply::parse(&payload),
            Err(ProtocolError::MissingField("login cookie"))
        ));
    }

    #[test]
    fn test_short_hello() {
        assert!(parse_sign_on(&[0, 0]).is_err());
        let (version, tlvs) = parse_sign_on(&cookie_sign_on(b"abc").unwrap()).unwrap();
        assert_eq!(version, 1);
        assert_eq!(tlvs.get_bytes(login_tlv::COOKIE).unwrap().as_ref(), b"abc");
    }
}
