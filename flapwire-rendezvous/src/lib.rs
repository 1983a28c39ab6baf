//! # flapwire-rendezvous
//!
//! Peer-to-peer rendezvous for flapwire clients.
//!
//! A session negotiates a peer stream through rendezvous blocks carried in
//! ICBMs, trying a direct connection before falling back to a relay, and
//! then moves files over it with resume support.
//!
//! - [`state`]: the pure state machine
//! - [`session`]: the async driver running one session
//! - [`bridge`]: routing between a signed-on client and its sessions
//! - [`transfer`]: the file transfer exchange
//! - [`connect`]: direct and relayed connection setup

pub mod bridge;
pub mod connect;
pub mod error;
pub mod path;
pub mod session;
pub mod state;
pub mod timeout;
pub mod transfer;

pub use bridge::{IcbmSignaling, IncomingProposal, RendezvousBridge};
pub use error::{AttemptFailure, FailureReason, RendezvousError};
pub use path::{build_listing, collect_files, receive_path, transfer_path, SourceFile};
pub use session::{start, Direction, SessionEvent, SessionHandle, SessionParams, Signal, Signaling};
pub use state::{initial, transition, Controller, Input, Plan, RendezvousEvent, State, Transition};
pub use timeout::{ConnectionType, Initiator, TimeoutPolicy};
pub use transfer::{receive_files, send_files, PeerChannel, Progress, TransferControl, TransferOptions};
