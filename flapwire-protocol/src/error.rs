//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding wire structures.
///
/// Truncated TLV chains and directory listings are not errors; those readers
/// return whatever prefix parsed cleanly.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame marker: expected 0x2a, got {0:#04x}")]
    InvalidMarker(u8),

    #[error("frame payload too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("TLV value too large: type {tlv_type:#06x} has {size} bytes")]
    TlvTooLarge { tlv_type: u16, size: usize },

    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("invalid magic for {what}: {found:?}")]
    InvalidMagic { what: &'static str, found: Vec<u8> },

    #[error("unsupported {what} version: {version:#06x}")]
    UnsupportedVersion { what: &'static str, version: u32 },

    #[error("unknown {what} code: {code:#06x}")]
    UnknownCode { what: &'static str, code: u16 },

    #[error("field too long: {field} is {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        ProtocolError::Truncated {
            what,
            needed,
            available,
        }
    }
}
