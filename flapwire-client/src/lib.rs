//! # flapwire-client
//!
//! Client engine for the flapwire messaging protocol.
//!
//! This crate provides:
//! - A frame transport with ordered listener dispatch and vetoable listeners
//! - Command multiplexing with request ids and multi-part responses
//! - Per-class rate limiting of outbound commands
//! - Sign-on, negotiation and service redirects
//! - Optional TLS and SOCKS/HTTP proxy support

pub mod arbiter;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod listeners;
pub mod login;
pub mod mux;
pub mod proxy;
pub mod rate;
pub mod stream;
pub mod tls;
pub mod transport;

pub use arbiter::{RequestHandler, Service, ServiceArbiter, ServiceOpener};
pub use client::Client;
pub use config::{Config, ConfigError};
pub use connection::{Connection, Negotiated};
pub use error::{ClientError, ListenerError, LoginFailure};
pub use login::LoginSuccess;
pub use mux::{CommandListener, CommandMultiplexer, ReceivedCommand, ResponseListener};
pub use rate::{OutboundRequest, OutboundScheduler, RateClassMonitor, RateMonitor, RateQueue};
pub use stream::ClientStream;
pub use tls::TrustProvider;
pub use transport::{FrameListener, FrameTransport, TransportOptions, TransportState};
