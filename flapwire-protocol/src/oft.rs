//! Peer file transfer (OFT2) headers and checksum.
//!
//! Each file is preceded by a header exchange over the peer connection:
//!
//! ```text
//! magic "OFT2" | length:u16 | type:u16 | cookie[8] | encrypt:u16 | compress:u16
//! | total_files:u16 | files_left:u16 | total_parts:u16 | parts_left:u16
//! | total_size:u32 | size:u32 | mtime:u32 | checksum:u32
//! | rfork_recv_checksum:u32 | rfork_size:u32 | ctime:u32 | rfork_checksum:u32
//! | bytes_received:u32 | recv_checksum:u32 | id_string[32]
//! | flags:u8 | name_offset:u8 | size_offset:u8 | dummy[69] | mac_info[16]
//! | name_encoding:u16 | name_language:u16 | name[>=64]
//! ```

use crate::error::ProtocolError;
use crate::rendezvous::Cookie;
use crate::tlv::Charset;
use crate::wire::WireReader;
use bytes::{BufMut, BytesMut};

/// Header magic.
pub const OFT_MAGIC: &[u8; 4] = b"OFT2";

/// Length of a header whose name fits in the minimum name field.
pub const OFT_HEADER_SIZE: usize = 256;

/// Offset of the name field.
const NAME_OFFSET: usize = 192;

/// Minimum width of the name field.
const MIN_NAME_LEN: usize = 64;

/// Identification string written by this client.
pub const OFT_ID_STRING: &str = "Cool FileXfer";

/// Checksum of zero bytes.
pub const CHECKSUM_SEED: u32 = 0xffff_0000;

/// Header type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OftType {
    /// Sender announces a file.
    Prompt,
    /// Receiver accepts it.
    Ack,
    /// Receiver confirms the full file arrived.
    Done,
    /// Receiver holds a partial copy and asks to resume.
    Resume,
    /// Sender agrees on a resume offset.
    ResumeAccept,
    /// Receiver confirms the resume offset.
    ResumeAck,
}

impl OftType {
    pub fn code(&self) -> u16 {
        match self {
            OftType::Prompt => 0x0101,
            OftType::Ack => 0x0202,
            OftType::Done => 0x0204,
            OftType::Resume => 0x0205,
            OftType::ResumeAccept => 0x0106,
            OftType::ResumeAck => 0x0207,
        }
    }

    pub fn from_code(code: u16) -> Result<Self, ProtocolError> {
        Ok(match code {
            0x0101 => OftType::Prompt,
            0x0202 => OftType::Ack,
            0x0204 => OftType::Done,
            0x0205 => OftType::Resume,
            0x0106 => OftType::ResumeAccept,
            0x0207 => OftType::ResumeAck,
            other => {
                return Err(ProtocolError::UnknownCode {
                    what: "transfer header",
                    code: other,
                })
            }
        })
    }
}

/// Name encoding field values.
fn charset_for(encoding: u16) -> Charset {
    match encoding {
        0x0002 => Charset::Ucs2Be,
        0x0003 => Charset::Latin1,
        _ => Charset::Ascii,
    }
}

fn encoding_for(charset: Charset) -> u16 {
    match charset {
        Charset::Ucs2Be => 0x0002,
        Charset::Latin1 => 0x0003,
        Charset::Ascii | Charset::Utf8 => 0x0000,
    }
}

/// A decoded transfer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OftHeader {
    pub kind: OftType,
    pub cookie: Cookie,
    pub encrypt: u16,
    pub compress: u16,
    pub total_files: u16,
    pub files_left: u16,
    pub total_parts: u16,
    pub parts_left: u16,
    pub total_size: u32,
    pub size: u32,
    pub modified_time: u32,
    pub checksum: u32,
    pub resource_received_checksum: u32,
    pub resource_size: u32,
    pub creation_time: u32,
    pub resource_checksum: u32,
    pub bytes_received: u32,
    pub received_checksum: u32,
    pub id_string: String,
    pub flags: u8,
    pub name_offset: u8,
    pub size_offset: u8,
    pub mac_file_info: [u8; 16],
    pub name_charset: Charset,
    pub name_language: u16,
    pub filename: String,
}

impl OftHeader {
    /// Builds a prompt for one file.
    pub fn prompt(
        cookie: Cookie,
        filename: impl Into<String>,
        size: u32,
        modified_time: u32,
        checksum: u32,
    ) -> Self {
        Self {
            kind: OftType::Prompt,
            cookie,
            encrypt: 0,
            compress: 0,
            total_files: 1,
            files_left: 1,
            total_parts: 1,
            parts_left: 1,
            total_size: size,
            size,
            modified_time,
            checksum,
            resource_received_checksum: CHECKSUM_SEED,
            resource_size: 0,
            creation_time: 0,
            resource_checksum: CHECKSUM_SEED,
            bytes_received: 0,
            received_checksum: CHECKSUM_SEED,
            id_string: OFT_ID_STRING.to_string(),
            flags: 0x20,
            name_offset: 0x1c,
            size_offset: 0x11,
            mac_file_info: [0u8; 16],
            name_charset: Charset::Ascii,
            name_language: 0,
            filename: filename.into(),
        }
    }

    /// Copy of this header with another type, used for replies.
    pub fn reply(&self, kind: OftType) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> BytesMut {
        let name = self.name_charset.encode(&self.filename);
        let name_field = (name.len() + 1).max(MIN_NAME_LEN);
        let total = NAME_OFFSET + name_field;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(OFT_MAGIC);
        buf.put_u16(total as u16);
        buf.put_u16(self.kind.code());
        buf.put_slice(self.cookie.as_bytes());
        buf.put_u16(self.encrypt);
        buf.put_u16(self.compress);
        buf.put_u16(self.total_files);
        buf.put_u16(self.files_left);
        buf.put_u16(self.total_parts);
        buf.put_u16(self.parts_left);
        buf.put_u32(self.total_size);
        buf.put_u32(self.size);
        buf.put_u32(self.modified_time);
        buf.put_u32(self.checksum);
        buf.put_u32(self.resource_received_checksum);
        buf.put_u32(self.resource_size);
        buf.put_u32(self.creation_time);
        buf.put_u32(self.resource_checksum);
        buf.put_u32(self.bytes_received);
        buf.put_u32(self.received_checksum);
        put_padded(&mut buf, self.id_string.as_bytes(), 32);
        buf.put_u8(self.flags);
        buf.put_u8(self.name_offset);
        buf.put_u8(self.size_offset);
        buf.put_bytes(0, 69);
        buf.put_slice(&self.mac_file_info);
        buf.put_u16(encoding_for(self.name_charset));
        buf.put_u16(self.name_language);
        put_padded(&mut buf, &name, name_field);
        buf
    }

    /// Decodes one header from the front of `buf`.
    ///
    /// Returns `Ok(None)` until the whole header has arrived.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < 6 {
            return Ok(None);
        }
        if &buf[..4] != OFT_MAGIC {
            return Err(ProtocolError::InvalidMagic {
                what: "transfer header",
                found: buf[..4].to_vec(),
            });
        }
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if length < NAME_OFFSET {
            return Err(ProtocolError::truncated("transfer header", NAME_OFFSET, length));
        }
        if buf.len() < length {
            return Ok(None);
        }

        let raw = buf.split_to(length);
        let mut r = WireReader::new(&raw[6..], "transfer header");
        let kind = OftType::from_code(r.u16()?)?;
        let cookie = Cookie(r.array::<8>()?);
        let encrypt = r.u16()?;
        let compress = r.u16()?;
        let total_files = r.u16()?;
        let files_left = r.u16()?;
        let total_parts = r.u16()?;
        let parts_left = r.u16()?;
        let total_size = r.u32()?;
        let size = r.u32()?;
        let modified_time = r.u32()?;
        let checksum = r.u32()?;
        let resource_received_checksum = r.u32()?;
        let resource_size = r.u32()?;
        let creation_time = r.u32()?;
        let resource_checksum = r.u32()?;
        let bytes_received = r.u32()?;
        let received_checksum = r.u32()?;
        let id_string = trim_nul(r.bytes(32)?);
        let flags = r.u8()?;
        let name_offset = r.u8()?;
        let size_offset = r.u8()?;
        r.bytes(69)?;
        let mac_file_info = r.array::<16>()?;
        let name_charset = charset_for(r.u16()?);
        let name_language = r.u16()?;
        let name_raw = r.rest();
        let filename = decode_name(&name_raw, name_charset);

        Ok(Some(Self {
            kind,
            cookie,
            encrypt,
            compress,
            total_files,
            files_left,
            total_parts,
            parts_left,
            total_size,
            size,
            modified_time,
            checksum,
            resource_received_checksum,
            resource_size,
            creation_time,
            resource_checksum,
            bytes_received,
            received_checksum,
            id_string: String::from_utf8_lossy(&id_string).into_owned(),
            flags,
            name_offset,
            size_offset,
            mac_file_info,
            name_charset,
            name_language,
            filename,
        }))
    }
}

fn put_padded(buf: &mut BytesMut, value: &[u8], width: usize) {
    let n = value.len().min(width);
    buf.put_slice(&value[..n]);
    buf.put_bytes(0, width - n);
}

fn trim_nul(raw: &[u8]) -> Vec<u8> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    raw[..end].to_vec()
}

fn decode_name(raw: &[u8], charset: Charset) -> String {
    match charset {
        Charset::Ucs2Be => {
            let mut units = raw.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
            let mut bytes = Vec::new();
            for unit in units.by_ref() {
                if unit == 0 {
                    break;
                }
                bytes.extend_from_slice(&unit.to_be_bytes());
            }
            charset.decode(&bytes)
        }
        _ => charset.decode(&trim_nul(raw)),
    }
}

/// Incremental 16-bit folded checksum over a byte stream.
///
/// Byte parity is tracked across calls to [`FileChecksum::update`], so
/// feeding a file in arbitrary chunks gives the same value as one call.
#[derive(Debug, Clone, Copy)]
pub struct FileChecksum {
    value: u32,
    odd: bool,
}

impl Default for FileChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl FileChecksum {
    pub fn new() -> Self {
        Self {
            value: CHECKSUM_SEED,
            odd: false,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut check = (self.value >> 16) & 0xffff;
        for &b in data {
            let old = check;
            let delta = if self.odd { b as u32 } else { (b as u32) << 8 };
            check = check.wrapping_sub(delta);
            if check > old {
                check = check.wrapping_sub(1);
            }
            self.odd = !self.odd;
        }
        check = (check & 0xffff) + (check >> 16);
        check = (check & 0xffff) + (check >> 16);
        self.value = check << 16;
    }

    pub fn value(&self) -> u32 {
        self.value
    }
}

/// Checksum of a whole buffer.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum = FileChecksum::new();
    sum.update(data);
    sum.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = OftHeader::prompt(Cookie([7; 8]), "report.pdf", 1000, 1_600_000_000, 0xabcd_0000);
        let encoded = header.encode();
        assert_eq!(encoded.len(), OFT_HEADER_SIZE);
        assert_eq!(&encoded[..4], b"OFT2");
        assert_eq!(&encoded[4..8], &[0x01, 0x00, 0x01, 0x01]);
        assert_eq!(&encoded[68..81], b"Cool FileXfer");
        assert_eq!(&encoded[192..202], b"report.pdf");
    }

    #[test]
    fn test_header_roundtrip() {
        let mut header = OftHeader::prompt(Cookie::random(), "a.txt", 5, 42, checksum(b"hello"));
        header.files_left = 0;
        header.bytes_received = 3;
        let mut buf = header.encode();
        let decoded = OftHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_long_name_grows_header() {
        let name = "n".repeat(100);
        let header = OftHeader::prompt(Cookie::default(), name.clone(), 0, 0, CHECKSUM_SEED);
        let mut buf = header.encode();
        assert_eq!(buf.len(), NAME_OFFSET + 101);
        let decoded = OftHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.filename, name);
    }

    #[test]
    fn test_partial_and_bad_magic() {
        let full = OftHeader::prompt(Cookie::default(), "x", 1, 0, CHECKSUM_SEED).encode();
        let mut partial = BytesMut::from(&full[..100]);
        assert!(OftHeader::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 100);

        let mut bad = BytesMut::from(&b"OFT3\x01\x00"[..]);
        assert!(matches!(
            OftHeader::decode(&mut bad),
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_reply_keeps_fields() {
        let prompt = OftHeader::prompt(Cookie([1; 8]), "f", 9, 0, CHECKSUM_SEED);
        let ack = prompt.reply(OftType::Ack);
        assert_eq!(ack.kind, OftType::Ack);
        assert_eq!(ack.size, 9);
        assert_eq!(ack.cookie, prompt.cookie);
    }

    #[test]
    fn test_checksum_values() {
        assert_eq!(checksum(b""), CHECKSUM_SEED);
        assert_eq!(checksum(&[0x01]), 0xfeff_0000);
        assert_eq!(checksum(&[0x00, 0x01]), 0xfffe_0000);
    }

    #[test]
    fn test_checksum_streaming_matches_whole() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 251) as u8).collect();
        let whole = checksum(&data);

        let mut sum = FileChecksum::new();
        for chunk in data.chunks(333) {
            sum.update(chunk);
        }
        assert_eq!(sum.value(), whole);
    }

    #[test]
    fn test_unknown_type() {
        assert!(OftType::from_code(0x0999).is_err());
        assert_eq!(OftType::from_code(0x0205).unwrap(), OftType::Resume);
    }
}
