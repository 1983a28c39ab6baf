//! Type-length-value codec.
//!
//! ```text
//! +--------+--------+-----------------+
//! |  type  | length | value           |
//! | 2 bytes| 2 bytes| length bytes    |
//! +--------+--------+-----------------+
//! ```
//!
//! A chain is a plain concatenation of elements. Types are not unique within a
//! chain, so lookups come in first / last / all flavours.
//!
//! Reading is lenient: peers are known to send truncated blocks, so
//! [`TlvChain::read`] stops at the first element that does not fit in the
//! remaining bytes and returns the chain parsed so far together with the number
//! of bytes it consumed.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of an element header (type + length).
pub const TLV_HEADER_SIZE: usize = 4;

/// Largest value a single element can carry.
pub const MAX_TLV_VALUE: usize = u16::MAX as usize;

/// Character sets used by string-valued elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// 7-bit ASCII; high bytes decode as U+FFFD.
    Ascii,
    /// ISO-8859-1, one byte per code point.
    Latin1,
    /// UTF-8, decoded lossily.
    #[default]
    Utf8,
    /// UCS-2 big endian.
    Ucs2Be,
}

impl Charset {
    /// Resolves a charset name as sent in rendezvous and message blocks.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "us-ascii" | "ascii" => Some(Charset::Ascii),
            "iso-8859-1" | "latin1" => Some(Charset::Latin1),
            "utf-8" | "utf8" => Some(Charset::Utf8),
            "unicode-2-0" | "utf-16be" | "ucs-2" | "ucs-2be" => Some(Charset::Ucs2Be),
            _ => None,
        }
    }

    /// Wire name of this charset.
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Ascii => "us-ascii",
            Charset::Latin1 => "iso-8859-1",
            Charset::Utf8 => "utf-8",
            Charset::Ucs2Be => "unicode-2-0",
        }
    }

    /// Decodes bytes in this charset.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                .collect(),
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Ucs2Be => {
                let units = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
                char::decode_utf16(units)
                    .map(|c| c.unwrap_or('\u{FFFD}'))
                    .collect()
            }
        }
    }

    /// Encodes a string in this charset. Unrepresentable characters become `?`.
    pub fn encode(&self, s: &str) -> Vec<u8> {
        match self {
            Charset::Ascii => s
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Charset::Latin1 => s
                .chars()
                .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
                .collect(),
            Charset::Utf8 => s.as_bytes().to_vec(),
            Charset::Ucs2Be => s.encode_utf16().flat_map(|u| u.to_be_bytes()).collect(),
        }
    }
}

/// A single type-length-value element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    /// Element type.
    pub tlv_type: u16,
    /// Raw value bytes.
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tlv_type: u16, value: impl Into<Bytes>) -> Self {
        Self {
            tlv_type,
            value: value.into(),
        }
    }

    /// Creates an element with no value (a flag).
    pub fn empty(tlv_type: u16) -> Self {
        Self::new(tlv_type, Bytes::new())
    }

    pub fn from_u8(tlv_type: u16, value: u8) -> Self {
        Self::new(tlv_type, vec![value])
    }

    pub fn from_u16(tlv_type: u16, value: u16) -> Self {
        Self::new(tlv_type, value.to_be_bytes().to_vec())
    }

    pub fn from_u32(tlv_type: u16, value: u32) -> Self {
        Self::new(tlv_type, value.to_be_bytes().to_vec())
    }

    pub fn from_string(tlv_type: u16, value: &str) -> Self {
        Self::new(tlv_type, value.as_bytes().to_vec())
    }

    pub fn from_string_in(tlv_type: u16, value: &str, charset: Charset) -> Self {
        Self::new(tlv_type, charset.encode(value))
    }

    /// Reads the value as a big-endian u16; `None` if it is shorter than 2 bytes.
    pub fn as_u16(&self) -> Option<u16> {
        match self.value.as_ref() {
            [a, b, ..] => Some(u16::from_be_bytes([*a, *b])),
            _ => None,
        }
    }

    /// Reads the value as a big-endian u32; `None` if it is shorter than 4 bytes.
    pub fn as_u32(&self) -> Option<u32> {
        match self.value.as_ref() {
            [a, b, c, d, ..] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => None,
        }
    }

    pub fn as_string(&self, charset: Charset) -> String {
        charset.decode(&self.value)
    }

    /// Encoded size including the header.
    pub fn encoded_len(&self) -> usize {
        TLV_HEADER_SIZE + self.value.len()
    }

    /// Appends this element to `buf`.
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.value.len() > MAX_TLV_VALUE {
            return Err(ProtocolError::TlvTooLarge {
                tlv_type: self.tlv_type,
                size: self.value.len(),
            });
        }
        buf.reserve(self.encoded_len());
        buf.put_u16(self.tlv_type);
        buf.put_u16(self.value.len() as u16);
        buf.put_slice(&self.value);
        Ok(())
    }

    /// Parses one element from the front of `data`.
    ///
    /// Returns `None` when `data` is too short for the header or for the
    /// declared value length.
    pub fn read(data: &[u8]) -> Option<(Tlv, usize)> {
        if data.len() < TLV_HEADER_SIZE {
            return None;
        }
        let tlv_type = u16::from_be_bytes([data[0], data[1]]);
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let end = TLV_HEADER_SIZE + len;
        if data.len() < end {
            return None;
        }
        let value = Bytes::copy_from_slice(&data[TLV_HEADER_SIZE..end]);
        Some((Tlv { tlv_type, value }, end))
    }
}

/// An ordered sequence of elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvChain {
    tlvs: Vec<Tlv>,
}

impl TlvChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads elements from `data` until it runs out or `max_elements` is hit.
    ///
    /// Returns the chain and the number of bytes consumed. Trailing bytes that
    /// do not form a whole element are left unconsumed.
    pub fn read(data: &[u8], max_elements: Option<usize>) -> (TlvChain, usize) {
        let mut tlvs = Vec::new();
        let mut offset = 0;

        while max_elements.map_or(true, |max| tlvs.len() < max) {
            match Tlv::read(&data[offset..]) {
                Some((tlv, used)) => {
                    tlvs.push(tlv);
                    offset += used;
                }
                None => break,
            }
        }

        (TlvChain { tlvs }, offset)
    }

    /// Reads the whole buffer, ignoring any truncated tail.
    pub fn read_all(data: &[u8]) -> TlvChain {
        Self::read(data, None).0
    }

    pub fn push(&mut self, tlv: Tlv) {
        self.tlvs.push(tlv);
    }

    /// Builder-style append.
    pub fn with(mut self, tlv: Tlv) -> Self {
        self.tlvs.push(tlv);
        self
    }

    /// Removes every element of the given type.
    pub fn remove_all(&mut self, tlv_type: u16) -> usize {
        let before = self.tlvs.len();
        self.tlvs.retain(|t| t.tlv_type != tlv_type);
        before - self.tlvs.len()
    }

    pub fn len(&self) -> usize {
        self.tlvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tlvs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tlv> {
        self.tlvs.iter()
    }

    pub fn has(&self, tlv_type: u16) -> bool {
        self.first(tlv_type).is_some()
    }

    pub fn first(&self, tlv_type: u16) -> Option<&Tlv> {
        self.tlvs.iter().find(|t| t.tlv_type == tlv_type)
    }

    pub fn last(&self, tlv_type: u16) -> Option<&Tlv> {
        self.tlvs.iter().rev().find(|t| t.tlv_type == tlv_type)
    }

    pub fn all(&self, tlv_type: u16) -> impl Iterator<Item = &Tlv> {
        self.tlvs.iter().filter(move |t| t.tlv_type == tlv_type)
    }

    /// First element of `tlv_type` decoded as a string (UTF-8 unless given).
    pub fn get_string(&self, tlv_type: u16, charset: Option<Charset>) -> Option<String> {
        self.first(tlv_type)
            .map(|t| t.as_string(charset.unwrap_or_default()))
    }

    /// First element of `tlv_type` as a u32; absent when missing or short.
    pub fn get_uint(&self, tlv_type: u16) -> Option<u32> {
        self.first(tlv_type).and_then(Tlv::as_u32)
    }

    /// First element of `tlv_type` as a u16; absent when missing or short.
    pub fn get_ushort(&self, tlv_type: u16) -> Option<u16> {
        self.first(tlv_type).and_then(Tlv::as_u16)
    }

    pub fn get_bytes(&self, tlv_type: u16) -> Option<&Bytes> {
        self.first(tlv_type).map(|t| &t.value)
    }

    pub fn encoded_len(&self) -> usize {
        self.tlvs.iter().map(Tlv::encoded_len).sum()
    }

    /// Appends every element in insertion order.
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.reserve(self.encoded_len());
        for tlv in &self.tlvs {
            tlv.write(buf)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl FromIterator<Tlv> for TlvChain {
    fn from_iter<I: IntoIterator<Item = Tlv>>(iter: I) -> Self {
        Self {
            tlvs: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TlvChain {
    type Item = Tlv;
    type IntoIter = std::vec::IntoIter<Tlv>;

    fn into_iter(self) -> Self::IntoIter {
        self.tlvs.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn chain_round_trip(elements in proptest::collection::vec(
            (0u16..8, proptest::collection::vec(any::<u8>(), 0..64)),
            0..24,
        )) {
            let chain: TlvChain = elements
                .iter()
                .map(|(t, v)| Tlv::new(*t, v.clone()))
                .collect();
            let encoded = chain.to_bytes().unwrap();

            let (decoded, consumed) = TlvChain::read(&encoded, None);
            prop_assert_eq!(consumed, encoded.len());
            prop_assert_eq!(&decoded, &chain);

            let pairs: Vec<(u16, Vec<u8>)> = decoded
                .iter()
                .map(|t| (t.tlv_type, t.value.to_vec()))
                .collect();
            prop_assert_eq!(pairs, elements);
        }
    }

    #[test]
    fn test_read_stops_on_truncated_value() {
        let mut buf = BytesMut::new();
        Tlv::from_u16(1, 0x1234).write(&mut buf).unwrap();
        Tlv::from_string(2, "hello").write(&mut buf).unwrap();
        let whole = buf.len();
        // header claims 10 bytes but only 3 follow
        buf.extend_from_slice(&[0x00, 0x03, 0x00, 0x0a, b'a', b'b', b'c']);

        let (chain, consumed) = TlvChain::read(&buf, None);
        assert_eq!(chain.len(), 2);
        assert_eq!(consumed, whole);
        assert_eq!(chain.get_string(2, None).as_deref(), Some("hello"));
    }

    #[test]
    fn test_read_stops_on_short_header() {
        let mut buf = BytesMut::new();
        Tlv::from_u32(7, 42).write(&mut buf).unwrap();
        buf.extend_from_slice(&[0x00, 0x01]);

        let (chain, consumed) = TlvChain::read(&buf, None);
        assert_eq!(chain.len(), 1);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_read_respects_max_elements() {
        let chain = TlvChain::new()
            .with(Tlv::from_u16(1, 1))
            .with(Tlv::from_u16(2, 2))
            .with(Tlv::from_u16(3, 3));
        let encoded = chain.to_bytes().unwrap();

        let (partial, consumed) = TlvChain::read(&encoded, Some(2));
        assert_eq!(partial.len(), 2);
        assert_eq!(consumed, 12);
        assert!(!partial.has(3));
    }

    #[test]
    fn test_lookup_first_last_all() {
        let chain = TlvChain::new()
            .with(Tlv::from_u16(5, 1))
            .with(Tlv::from_u16(6, 9))
            .with(Tlv::from_u16(5, 2))
            .with(Tlv::from_u16(5, 3));

        assert_eq!(chain.first(5).and_then(Tlv::as_u16), Some(1));
        assert_eq!(chain.last(5).and_then(Tlv::as_u16), Some(3));
        let all: Vec<u16> = chain.all(5).filter_map(Tlv::as_u16).collect();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_is_absent_not_zero() {
        let chain = TlvChain::new().with(Tlv::new(1, vec![0x01]));
        assert_eq!(chain.get_uint(9), None);
        assert_eq!(chain.get_ushort(9), None);
        assert_eq!(chain.get_string(9, None), None);
        // present but too short for the requested width
        assert_eq!(chain.get_ushort(1), None);
    }

    #[test]
    fn test_value_too_large() {
        let tlv = Tlv::new(1, vec![0u8; MAX_TLV_VALUE + 1]);
        let mut buf = BytesMut::new();
        assert!(matches!(
            tlv.write(&mut buf),
            Err(ProtocolError::TlvTooLarge { tlv_type: 1, .. })
        ));
    }

    #[test]
    fn test_charsets() {
        assert_eq!(Charset::from_name("unicode-2-0"), Some(Charset::Ucs2Be));
        assert_eq!(Charset::from_name("US-ASCII"), Some(Charset::Ascii));
        assert_eq!(Charset::from_name("klingon"), None);

        let ucs = Charset::Ucs2Be.encode("hé");
        assert_eq!(ucs, vec![0x00, b'h', 0x00, 0xe9]);
        assert_eq!(Charset::Ucs2Be.decode(&ucs), "hé");

        assert_eq!(Charset::Latin1.decode(&[0x68, 0xe9]), "hé");
        assert_eq!(Charset::Ascii.decode(&[0x68, 0xe9]), "h\u{FFFD}");
        assert_eq!(Charset::Ascii.encode("hé"), b"h?".to_vec());
    }

    #[test]
    fn test_remove_all() {
        let mut chain = TlvChain::new()
            .with(Tlv::empty(1))
            .with(Tlv::empty(2))
            .with(Tlv::empty(1));
        assert_eq!(chain.remove_all(1), 2);
        assert_eq!(chain.len(), 1);
    }
}
