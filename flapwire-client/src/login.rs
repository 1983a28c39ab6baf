//! Sign-on against the login host.
//!
//! The server greets with a channel-1 hello; the client answers with its
//! credentials on channel 1 and the server replies on channel 4 with either
//! the BOS address and cookie or an error code. Exactly one outcome is
//! delivered per attempt, whichever of reply, disconnect or timeout comes
//! first.

use crate::config::Config;
use crate::error::{ClientError, FaultKind, ListenerError, LoginFailure};
use crate::stream::ClientStream;
use crate::tls::TrustProvider;
use crate::transport::{
    ConnectionEvent, ConnectionListener, FrameListener, FrameTransport, TransportOptions,
};
use bytes::Bytes;
use flapwire_protocol::auth::{parse_sign_on, LoginReply, LoginRequest};
use flapwire_protocol::{Channel, Frame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

/// Where to go after a successful sign-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    /// Screen name as normalised by the server.
    pub screen_name: String,
    pub bos_host: String,
    pub bos_port: u16,
    pub cookie: Bytes,
}

/// Splits `host[:port]`, falling back to `default_port`.
pub fn parse_address(address: &str, default_port: u16) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), default_port),
        },
        _ => (address.to_string(), default_port),
    }
}

type Outcome = Result<LoginSuccess, LoginFailure>;

/// Delivers at most one outcome.
struct Attempt {
    notified: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Attempt {
    fn notify(&self, outcome: Outcome) -> bool {
        if self.notified.swap(true, Ordering::SeqCst) {
            return false;
        }
        match &outcome {
            Ok(success) => tracing::info!("Signed on as {}", success.screen_name),
            Err(failure) => tracing::warn!("Sign-on failed: {}", failure),
        }
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
        true
    }

    fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }
}

struct LoginFlow {
    request: LoginRequest,
    default_port: u16,
    sent: AtomicBool,
    attempt: Arc<Attempt>,
}

impl LoginFlow {
    fn send_credentials(&self, transport: &FrameTransport) -> Result<(), ClientError> {
        if self.sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let payload = self.request.encode()?;
        transport.send_frame(Channel::SIGN_ON, &payload)?;
        tracing::debug!("Sent credentials for {}", self.request.screen_name);
        Ok(())
    }

    fn outcome(&self, frame: &Frame) -> Option<Outcome> {
        match frame.channel {
            Channel::SIGN_OFF => Some(match LoginReply::parse(&frame.payload) {
                Ok(LoginReply::Success {
                    screen_name,
                    bos_address,
                    cookie,
                }) => {
                    let (bos_host, bos_port) = parse_address(&bos_address, self.default_port);
                    Ok(LoginSuccess {
                        screen_name: screen_name.unwrap_or_else(|| self.request.screen_name.clone()),
                        bos_host,
                        bos_port,
                        cookie,
                    })
                }
                Ok(LoginReply::Failure { code, url }) => Err(LoginFailure::AuthError { code, url }),
                Err(e) => Err(LoginFailure::Protocol(e.to_string())),
            }),
            Channel::ERROR => Some(Err(LoginFailure::FrameError(hex::encode(&frame.payload)))),
            _ => None,
        }
    }
}

impl FrameListener for LoginFlow {
    fn handle_frame(&self, transport: &FrameTransport, frame: &Frame) -> Result<(), ListenerError> {
        if frame.channel == Channel::SIGN_ON {
            return match parse_sign_on(&frame.payload) {
                Ok((version, _)) => {
                    tracing::debug!("Login host hello, version {}", version);
                    if let Err(e) = self.send_credentials(transport) {
                        self.attempt.notify(Err(LoginFailure::Protocol(e.to_string())));
                        transport.close();
                    }
                    Ok(())
                }
                Err(e) => {
                    self.attempt.notify(Err(LoginFailure::Protocol(e.to_string())));
                    transport.close();
                    Ok(())
                }
            };
        }

        if let Some(outcome) = self.outcome(frame) {
            self.attempt.notify(outcome);
            transport.close();
        }
        Ok(())
    }
}

impl ConnectionListener for LoginFlow {
    fn connection_event(&self, _: &FrameTransport, event: &ConnectionEvent) {
        if let ConnectionEvent::Disconnected { error } = event {
            if self.attempt.is_notified() {
                return;
            }
            let failure = match error {
                Some(e) => LoginFailure::Disconnected(e.clone()),
                None => LoginFailure::ClosedEarly,
            };
            self.attempt.notify(Err(failure));
        }
    }
}

/// Signs on over an already connected stream.
pub async fn sign_on_with_stream<S>(
    stream: S,
    request: LoginRequest,
    default_port: u16,
    options: TransportOptions,
    timeout: Duration,
) -> Result<LoginSuccess, LoginFailure>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let attempt = Arc::new(Attempt {
        notified: AtomicBool::new(false),
        tx: Mutex::new(Some(tx)),
    });
    let flow = Arc::new(LoginFlow {
        request,
        default_port,
        sent: AtomicBool::new(false),
        attempt: attempt.clone(),
    });

    let transport = FrameTransport::new("login", options);
    transport.add_listener(flow.clone());
    transport.add_connection_listener(flow);
    transport
        .attach(stream)
        .map_err(|e| LoginFailure::Protocol(e.to_string()))?;

    let timer = {
        let attempt = attempt.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if attempt.notify(Err(LoginFailure::TimedOut)) {
                transport.report_error(FaultKind::Connection, &ClientError::Timeout);
            }
            transport.close();
        })
    };

    let outcome = rx.await.unwrap_or(Err(LoginFailure::ClosedEarly));
    timer.abort();
    transport.close();
    outcome
}

/// Connects to the configured login host and signs on.
pub async fn sign_on(
    config: &Config,
    screen_name: &str,
    password: &str,
    trust: Option<Arc<dyn TrustProvider>>,
) -> Result<LoginSuccess, ClientError> {
    let login = &config.login;
    tracing::info!("Signing on to {}:{} as {}", login.host, login.port, screen_name);
    let stream = ClientStream::connect(config, &login.host, login.port, trust).await?;

    let request = LoginRequest {
        screen_name: screen_name.to_string(),
        password: password.to_string(),
        version: login.client_version.clone(),
        language: login.language.clone(),
        country: login.country.clone(),
    };
    let mut options = TransportOptions::from(&config.transport);
    options.keep_alive = None;

    Ok(sign_on_with_stream(stream, request, login.port, options, login.timeout()).await?)
}
