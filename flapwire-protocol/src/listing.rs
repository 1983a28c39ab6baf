//! Directory listings exchanged before a multi-file transfer.
//!
//! ```text
//! "LST1" | entry* ;  entry = TLV(name) TLV(size) TLV(mtime) TLV(flags) TLV(0xffff)
//! ```
//!
//! Parsing is lenient: an entry cut short by the end of the buffer is dropped
//! and the entries before it are returned.

use crate::error::ProtocolError;
use crate::tlv::{Charset, Tlv, TlvChain};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Version tag opening every listing.
pub const LISTING_TAG: &[u8; 4] = b"LST1";

/// Entry TLV types.
pub mod entry_tlv {
    pub const NAME: u16 = 0x0001;
    pub const SIZE: u16 = 0x0002;
    pub const MODIFIED: u16 = 0x0003;
    pub const FLAGS: u16 = 0x0004;
    /// Closes an entry.
    pub const END: u16 = 0xffff;
}

/// Entry flag marking a directory.
pub const FLAG_DIRECTORY: u16 = 0x0001;

/// One file or folder in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingEntry {
    /// Path relative to the listing root, `/` separated.
    pub name: String,
    pub size: u32,
    /// Seconds since the Unix epoch.
    pub modified: u32,
    pub flags: u16,
}

impl ListingEntry {
    pub fn file(name: impl Into<String>, size: u32, modified: u32) -> Self {
        Self {
            name: name.into(),
            size,
            modified,
            flags: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.modified as i64, 0).single()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    pub entries: Vec<ListingEntry>,
}

impl DirectoryListing {
    pub fn new(entries: Vec<ListingEntry>) -> Self {
        Self { entries }
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size as u64).sum()
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_slice(LISTING_TAG);
        for entry in &self.entries {
            TlvChain::new()
                .with(Tlv::from_string_in(entry_tlv::NAME, &entry.name, Charset::Utf8))
                .with(Tlv::from_u32(entry_tlv::SIZE, entry.size))
                .with(Tlv::from_u32(entry_tlv::MODIFIED, entry.modified))
                .with(Tlv::from_u16(entry_tlv::FLAGS, entry.flags))
                .with(Tlv::empty(entry_tlv::END))
                .write(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Parses a listing. Only a wrong version tag is an error.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < LISTING_TAG.len() {
            return Ok(Self::default());
        }
        if &data[..4] != LISTING_TAG {
            return Err(ProtocolError::InvalidMagic {
                what: "directory listing",
                found: data[..4].to_vec(),
            });
        }

        let mut entries = Vec::new();
        let mut pending = TlvChain::new();
        let mut offset = LISTING_TAG.len();

        while let Some((tlv, used)) = Tlv::read(&data[offset..]) {
            offset += used;
            if tlv.tlv_type != entry_tlv::END {
                pending.push(tlv);
                continue;
            }
            let fields = std::mem::take(&mut pending);
            // Entries without a name carry nothing useful
            if let Some(name) = fields.get_string(entry_tlv::NAME, Some(Charset::Utf8)) {
                entries.push(ListingEntry {
                    name,
                    size: fields.get_uint(entry_tlv::SIZE).unwrap_or(0),
                    modified: fields.get_uint(entry_tlv::MODIFIED).unwrap_or(0),
                    flags: fields.get_ushort(entry_tlv::FLAGS).unwrap_or(0),
                });
            }
        }

        Ok(Self { entries })
    }
}
