//! Rendezvous error types.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Why a single connection attempt did not produce a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AttemptFailure {
    TimedOut,
    Refused,
    /// The relay answered with an error packet.
    Relay(u16),
    Io(String),
}

impl AttemptFailure {
    pub fn from_io(error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::ConnectionRefused => AttemptFailure::Refused,
            std::io::ErrorKind::TimedOut => AttemptFailure::TimedOut,
            _ => AttemptFailure::Io(error.to_string()),
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::TimedOut => write!(f, "timed out"),
            AttemptFailure::Refused => write!(f, "connection refused"),
            AttemptFailure::Relay(code) => write!(f, "relay error {:#06x}", code),
            AttemptFailure::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Terminal failure of a session, delivered once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The peer never answered the proposal.
    NoResponse,
    /// Every direct and relayed route failed; carries the last failure.
    Unreachable(AttemptFailure),
    /// No bytes moved for longer than the stall timeout.
    Stalled,
    /// The data phase failed.
    Transfer(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::NoResponse => write!(f, "peer did not respond"),
            FailureReason::Unreachable(last) => write!(f, "peer unreachable ({})", last),
            FailureReason::Stalled => write!(f, "transfer stalled"),
            FailureReason::Transfer(e) => write!(f, "transfer failed: {}", e),
        }
    }
}

/// Errors raised by rendezvous operations.
#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] flapwire_protocol::ProtocolError),

    #[error("client error: {0}")]
    Client(#[from] flapwire_client::ClientError),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("file too large for a transfer header: {0} bytes")]
    FileTooLarge(u64),

    #[error("unexpected {found} while waiting for {expected}")]
    UnexpectedHeader {
        expected: &'static str,
        found: String,
    },

    #[error("relay error {0:#06x}")]
    Relay(u16),

    #[error("no progress for {0:?}")]
    Stalled(std::time::Duration),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("session closed")]
    SessionClosed,
}

impl RendezvousError {
    pub(crate) fn invalid_path(path: impl Into<PathBuf>, reason: &'static str) -> Self {
        RendezvousError::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// Maps a failed connection step onto an attempt failure.
    pub fn attempt_failure(&self) -> AttemptFailure {
        match self {
            RendezvousError::Io(e) => AttemptFailure::from_io(e),
            RendezvousError::Relay(code) => AttemptFailure::Relay(*code),
            RendezvousError::Stalled(_) => AttemptFailure::TimedOut,
            RendezvousError::Client(flapwire_client::ClientError::Timeout) => AttemptFailure::TimedOut,
            RendezvousError::Client(flapwire_client::ClientError::Io(e)) => AttemptFailure::from_io(e),
            other => AttemptFailure::Io(other.to_string()),
        }
    }

    /// Maps a failed data phase onto a terminal reason.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            RendezvousError::Stalled(_) => FailureReason::Stalled,
            other => FailureReason::Transfer(other.to_string()),
        }
    }
}
