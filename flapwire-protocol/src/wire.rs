//! Cursor helpers for fixed-layout structures.

use crate::error::ProtocolError;
use crate::tlv::TlvChain;
use bytes::{BufMut, Bytes, BytesMut};

/// Big-endian reader over a byte slice that reports which structure ran short.
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::truncated(
                self.what,
                self.pos + n,
                self.data.len(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(n)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a u8-length-prefixed string.
    pub fn short_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Reads a u16-count-prefixed TLV block, leniently.
    pub fn counted_tlvs(&mut self) -> Result<TlvChain, ProtocolError> {
        let count = self.u16()? as usize;
        let (chain, used) = TlvChain::read(&self.data[self.pos..], Some(count));
        self.pos += used;
        Ok(chain)
    }

    /// Reads every remaining byte as a TLV chain, leniently.
    pub fn rest_tlvs(&mut self) -> TlvChain {
        let (chain, used) = TlvChain::read(&self.data[self.pos..], None);
        self.pos += used;
        chain
    }

    pub fn rest(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(&self.data[self.pos..]);
        self.pos = self.data.len();
        rest
    }
}

/// Writes a u8-length-prefixed string.
pub(crate) fn put_short_string(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
) -> Result<(), ProtocolError> {
    let bytes = value.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: bytes.len(),
            max: u8::MAX as usize,
        });
    }
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_structure() {
        let mut reader = WireReader::new(&[0x00, 0x01, 0x02], "rate class");
        assert_eq!(reader.u16().unwrap(), 1);
        let err = reader.u32().unwrap_err();
        assert!(err.to_string().contains("rate class"));
    }

    #[test]
    fn test_short_string() {
        let mut buf = BytesMut::new();
        put_short_string(&mut buf, "screen name", "alice").unwrap();
        let mut reader = WireReader::new(&buf, "test");
        assert_eq!(reader.short_string().unwrap(), "alice");
        assert!(reader.is_empty());

        let long = "x".repeat(300);
        assert!(matches!(
            put_short_string(&mut buf, "screen name", &long),
            Err(ProtocolError::FieldTooLong { .. })
        ));
    }
}
