//! # flapwire-protocol
//!
//! Wire codecs for the FLAP/SNAC instant messaging protocol.
//!
//! This crate provides:
//! - TLV elements and lenient TLV chains
//! - The outer frame envelope and the inner command envelope
//! - A closed `(family, subtype)` table of typed command bodies
//! - Sign-on TLVs, rendezvous blocks, peer transfer headers, relay packets
//!   and directory listings
//!
//! Nothing here performs I/O.

pub mod auth;
pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod listing;
pub mod message;
pub mod oft;
pub mod proxy;
pub mod rendezvous;
pub mod tlv;
mod wire;

pub use codec::{Decoder, Encoder};
pub use command::{family, Command, CommandFlags, COMMAND_HEADER_SIZE};
pub use error::ProtocolError;
pub use frame::{Channel, Frame, FRAME_HEADER_SIZE, FRAME_MARKER, MAX_FRAME_PAYLOAD};
pub use listing::{DirectoryListing, ListingEntry};
pub use message::{CommandBody, FamilyVersion, RateClassInfo, RateInfo};
pub use oft::{OftHeader, OftType};
pub use proxy::ProxyMessage;
pub use rendezvous::{Cookie, RendezvousBlock, RendezvousKind};
pub use tlv::{Charset, Tlv, TlvChain};

/// Default login host port.
pub const DEFAULT_PORT: u16 = 5190;

/// Default login host.
pub const DEFAULT_LOGIN_HOST: &str = "login.oscar.aol.com";
