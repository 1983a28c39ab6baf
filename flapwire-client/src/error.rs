//! Client error types.

use std::fmt;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] flapwire_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server error in family {family:#06x}: code {code:#06x}")]
    ServerError { family: u16, code: u16 },

    #[error("unexpected command {family:#06x}/{subtype:#06x} while {context}")]
    UnexpectedCommand {
        family: u16,
        subtype: u16,
        context: &'static str,
    },

    #[error("login failed: {0}")]
    Login(#[from] LoginFailure),

    #[error("listener failed: {0}")]
    Listener(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("no service available for family {0:#06x}")]
    NoService(u16),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Login(failure) => failure.is_retryable(),
            _ => false,
        }
    }
}

/// Why a sign-on attempt ended without a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginFailure {
    /// The server rejected the credentials or reported an error code.
    #[error("authentication error {code:#06x}{}", url_suffix(.url))]
    AuthError { code: u16, url: Option<String> },

    /// The server sent a frame-level error.
    #[error("frame error: {0}")]
    FrameError(String),

    /// The connection closed before the server answered.
    #[error("connection closed before login completed")]
    ClosedEarly,

    /// The connection dropped after it had been established.
    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("login timed out")]
    TimedOut,

    /// The server answered with something that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

fn url_suffix(url: &Option<String>) -> String {
    url.as_deref()
        .map(|u| format!(" ({})", u))
        .unwrap_or_default()
}

impl LoginFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoginFailure::ClosedEarly | LoginFailure::Disconnected(_) | LoginFailure::TimedOut
        )
    }
}

/// Class of a connection-level fault reported to error handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Reading or connecting failed.
    Connection,
    /// A command could not be encoded.
    CommandGeneration,
    /// A listener failed while handling a frame or command.
    Listener,
    /// Writing to the socket failed.
    Write,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Connection => "connection",
            FaultKind::CommandGeneration => "command generation",
            FaultKind::Listener => "listener",
            FaultKind::Write => "write",
        };
        f.write_str(name)
    }
}

/// Error returned by listener callbacks.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
        assert!(ClientError::Login(LoginFailure::TimedOut).is_retryable());
        assert!(!ClientError::Login(LoginFailure::AuthError { code: 5, url: None }).is_retryable());
    }

    #[test]
    fn test_login_failure_display() {
        let err = LoginFailure::AuthError {
            code: 0x18,
            url: Some("http://x.invalid".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x0018"));
        assert!(msg.contains("http://x.invalid"));

        let err = LoginFailure::AuthError { code: 5, url: None };
        assert!(!err.to_string().contains('('));
    }

    #[test]
    fn test_fault_kind_display() {
        assert_eq!(FaultKind::CommandGeneration.to_string(), "command generation");
    }
}
