//! Server connections.
//!
//! A [`Connection`] is one framed socket to a BOS or service host, with its
//! own multiplexer and outbound scheduler. Opening presents the login cookie
//! on channel 1, then negotiates before anything else is sent:
//!
//! ```text
//! server: ServerReady(families)
//! client: ClientVersions          server: ServerVersions
//! client: RateInfoRequest         server: RateInfo
//! client: RateAck, ClientReady
//! ```

use crate::config::Config;
use crate::error::{ClientError, ListenerError};
use crate::mux::{CommandListener, CommandMultiplexer, ReceivedCommand};
use crate::rate::OutboundScheduler;
use crate::stream::ClientStream;
use crate::tls::TrustProvider;
use crate::transport::{
    ConnectionEvent, ConnectionListener, FrameListener, FrameTransport, TransportOptions,
};
use bytes::Bytes;
use flapwire_protocol::auth::cookie_sign_on;
use flapwire_protocol::message::FamilyToolInfo;
use flapwire_protocol::{family, Channel, CommandBody, FamilyVersion, Frame, RateInfo};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

/// Tool id and version announced in ClientReady.
pub const TOOL_ID: u16 = 0x0110;
pub const TOOL_VERSION: u16 = 0x047b;

/// Family versions this client speaks.
pub fn default_family_versions() -> Vec<FamilyVersion> {
    [
        (family::SERVICE, 4),
        (family::LOCATION, 1),
        (family::BUDDY, 1),
        (family::ICBM, 1),
        (family::INVITE, 1),
        (family::ADMIN, 1),
        (family::BOS, 1),
        (family::USER_LOOKUP, 1),
        (family::STATS, 1),
        (family::CHAT_NAV, 1),
        (family::CHAT, 1),
        (family::ICON, 1),
        (family::SSI, 4),
    ]
    .into_iter()
    .map(|(family, version)| FamilyVersion { family, version })
    .collect()
}

/// What the server agreed to during negotiation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Negotiated {
    /// Families served by this connection.
    pub families: Vec<u16>,
    pub versions: Vec<FamilyVersion>,
    pub rate_info: RateInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AwaitServerReady,
    AwaitVersions,
    AwaitRateInfo,
    Done,
}

type NegotiationResult = Result<Negotiated, ClientError>;

struct Negotiator {
    known: Vec<FamilyVersion>,
    scheduler: OutboundScheduler,
    step: Mutex<Step>,
    negotiated: Mutex<Negotiated>,
    done: Mutex<Option<oneshot::Sender<NegotiationResult>>>,
}

impl Negotiator {
    fn finish(&self, result: NegotiationResult) {
        *self.step.lock() = Step::Done;
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(result);
        }
    }

    fn version_of(&self, family: u16) -> u16 {
        self.known
            .iter()
            .find(|v| v.family == family)
            .map_or(1, |v| v.version)
    }

    fn advance(&self, mux: &CommandMultiplexer, body: &CommandBody) -> Result<(), ClientError> {
        let step = *self.step.lock();
        match (step, body) {
            (Step::AwaitServerReady, CommandBody::ServerReady(families)) => {
                tracing::debug!("Server offers {} families", families.len());
                let versions = families
                    .iter()
                    .map(|&family| FamilyVersion {
                        family,
                        version: self.version_of(family),
                    })
                    .collect();
                self.negotiated.lock().families = families.clone();
                *self.step.lock() = Step::AwaitVersions;
                mux.send(CommandBody::ClientVersions(versions).into_command()?)?;
            }
            (Step::AwaitVersions, CommandBody::ServerVersions(versions)) => {
                self.negotiated.lock().versions = versions.clone();
                *self.step.lock() = Step::AwaitRateInfo;
                mux.send(CommandBody::RateInfoRequest.into_command()?)?;
            }
            (Step::AwaitRateInfo, CommandBody::RateInfo(info)) => {
                self.scheduler.install_rate_info(info);
                let classes = info.classes.iter().map(|c| c.class_id).collect();
                mux.send(CommandBody::RateAck(classes).into_command()?)?;

                let tools = {
                    let mut negotiated = self.negotiated.lock();
                    negotiated.rate_info = info.clone();
                    negotiated
                        .families
                        .iter()
                        .map(|&family| FamilyToolInfo {
                            family,
                            version: self.version_of(family),
                            tool_id: TOOL_ID,
                            tool_version: TOOL_VERSION,
                        })
                        .collect()
                };
                mux.send(CommandBody::ClientReady(tools).into_command()?)?;
                let negotiated = self.negotiated.lock().clone();
                self.finish(Ok(negotiated));
            }
            (Step::Done, _) => {}
            (_, CommandBody::Error(reply)) => {
                return Err(ClientError::ServerError {
                    family: reply.family,
                    code: reply.code,
                });
            }
            (_, other) => {
                let (family, subtype) = other.code();
                tracing::debug!("Ignoring {:#06x}/{:#06x} during negotiation", family, subtype);
            }
        }
        Ok(())
    }
}

impl CommandListener for Negotiator {
    fn handle_command(
        &self,
        mux: &CommandMultiplexer,
        command: &ReceivedCommand,
    ) -> Result<(), ListenerError> {
        if let Err(e) = self.advance(mux, &command.body) {
            self.finish(Err(e));
        }
        Ok(())
    }
}

impl ConnectionListener for Negotiator {
    fn connection_event(&self, _: &FrameTransport, event: &ConnectionEvent) {
        if let ConnectionEvent::Disconnected { .. } = event {
            self.finish(Err(ClientError::ConnectionClosed));
        }
    }
}

/// Answers the server hello with the login cookie.
struct CookieSignOn {
    cookie: Bytes,
    sent: AtomicBool,
}

impl FrameListener for CookieSignOn {
    fn handle_frame(&self, transport: &FrameTransport, frame: &Frame) -> Result<(), ListenerError> {
        if frame.channel != Channel::SIGN_ON || self.sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let payload = cookie_sign_on(&self.cookie)?;
        transport.send_frame(Channel::SIGN_ON, &payload)?;
        tracing::debug!(transport = transport.name(), "Presented login cookie");
        Ok(())
    }
}

/// One negotiated server connection.
#[derive(Clone)]
pub struct Connection {
    mux: CommandMultiplexer,
    scheduler: OutboundScheduler,
    negotiated: Arc<Negotiated>,
}

impl Connection {
    /// Dials `host:port`, presents `cookie` and negotiates.
    pub async fn open(
        config: &Config,
        host: &str,
        port: u16,
        cookie: &[u8],
        trust: Option<Arc<dyn TrustProvider>>,
    ) -> Result<Self, ClientError> {
        tracing::info!("Connecting to {}:{}", host, port);
        let stream = ClientStream::connect(config, host, port, trust).await?;
        Self::open_with_stream(format!("{}:{}", host, port), stream, cookie, config).await
    }

    /// Presents `cookie` and negotiates over a connected stream.
    pub async fn open_with_stream<S>(
        name: impl Into<String>,
        stream: S,
        cookie: &[u8],
        config: &Config,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let transport = FrameTransport::new(name, TransportOptions::from(&config.transport));
        let mux = CommandMultiplexer::new(transport.clone());
        let scheduler = OutboundScheduler::new(mux.clone(), config.rate.clone());

        let (tx, rx) = oneshot::channel();
        let negotiator = Arc::new(Negotiator {
            known: default_family_versions(),
            scheduler: scheduler.clone(),
            step: Mutex::new(Step::AwaitServerReady),
            negotiated: Mutex::new(Negotiated::default()),
            done: Mutex::new(Some(tx)),
        });
        let as_listener: Arc<dyn CommandListener> = negotiator.clone();
        mux.add_family_listener(family::SERVICE, as_listener.clone());
        transport.add_connection_listener(negotiator.clone());
        transport.add_listener(Arc::new(CookieSignOn {
            cookie: Bytes::copy_from_slice(cookie),
            sent: AtomicBool::new(false),
        }));
        transport.attach(stream)?;

        let result = match tokio::time::timeout(config.login.timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        };
        mux.remove_family_listener(family::SERVICE, &as_listener);
        let connection_listener: Arc<dyn ConnectionListener> = negotiator;
        transport.remove_connection_listener(&connection_listener);

        let negotiated = match result {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!(transport = transport.name(), "Negotiation failed: {}", e);
                transport.close();
                return Err(e);
            }
        };

        tracing::info!(
            transport = transport.name(),
            families = negotiated.families.len(),
            rate_classes = negotiated.rate_info.classes.len(),
            "Connection ready"
        );
        scheduler.start_pump();
        Ok(Self {
            mux,
            scheduler,
            negotiated: Arc::new(negotiated),
        })
    }

    pub fn name(&self) -> &str {
        self.mux.transport().name()
    }

    pub fn mux(&self) -> &CommandMultiplexer {
        &self.mux
    }

    pub fn scheduler(&self) -> &OutboundScheduler {
        &self.scheduler
    }

    pub fn transport(&self) -> &FrameTransport {
        self.mux.transport()
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Whether this connection serves `family`.
    pub fn serves(&self, family: u16) -> bool {
        self.negotiated.families.contains(&family)
    }

    pub fn is_connected(&self) -> bool {
        self.transport().is_connected()
    }

    pub fn close(&self) {
        self.scheduler.stop_pump();
        self.transport().close();
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.transport().closed().await
    }
}

/// Server side of negotiation, for tests elsewhere in the crate.
#[cfg(test)]
pub(crate) mod fake_server {
    use super::*;
    use flapwire_protocol::auth::parse_sign_on;
    use flapwire_protocol::auth::sign_on_payload;
    use flapwire_protocol::message::{service, RateClassMembers};
    use flapwire_protocol::{Command, Decoder, Encoder, RateClassInfo, TlvChain};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    pub struct FakeServer<S = DuplexStream> {
        pub stream: S,
        pub decoder: Decoder,
        sequence: u16,
    }

    impl<S: AsyncRead + AsyncWrite + Unpin> FakeServer<S> {
        pub fn new(stream: S) -> Self {
            Self {
                stream,
                decoder: Decoder::new(),
                sequence: 0,
            }
        }

        pub async fn next_frame(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.decoder.decode_frame().unwrap() {
                    return frame;
                }
                let n = self.stream.read_buf(self.decoder.buffer_mut()).await.unwrap();
                assert!(n > 0, "client closed");
            }
        }

        pub async fn next_command(&mut self) -> Command {
            loop {
                let frame = self.next_frame().await;
                if frame.channel == Channel::DATA {
                    return Command::decode(&frame.payload).unwrap();
                }
            }
        }

        pub async fn send_frame(&mut self, channel: Channel, payload: &[u8]) {
            let bytes = Encoder::encode_frame(channel, self.sequence, payload).unwrap();
            self.sequence = self.sequence.wrapping_add(1);
            self.stream.write_all(&bytes).await.unwrap();
        }

        pub async fn send_command(&mut self, command: Command) {
            let payload = command.encode().unwrap();
            self.send_frame(Channel::DATA, &payload).await;
        }

        pub async fn send_body(&mut self, body: CommandBody, request_id: u32) {
            self.send_command(body.into_command().unwrap().with_request_id(request_id))
                .await;
        }

        pub fn rate_info() -> RateInfo {
            RateInfo {
                classes: vec![RateClassInfo {
                    class_id: 1,
                    window_size: 10,
                    clear_avg: 500,
                    alert_avg: 400,
                    limited_avg: 300,
                    disconnect_avg: 100,
                    current_avg: 1000,
                    max_avg: 1000,
                    last_time: 0,
                    state: 0,
                }],
                members: vec![RateClassMembers {
                    class_id: 1,
                    commands: vec![(family::ICBM, 0x0006)],
                }],
            }
        }

        /// Runs the server half of sign-on and negotiation. Returns the
        /// cookie the client presented.
        pub async fn accept(&mut self, families: &[u16]) -> Bytes {
            self.send_frame(Channel::SIGN_ON, &sign_on_payload(&TlvChain::new()).unwrap())
                .await;
            let hello = self.next_frame().await;
            assert_eq!(hello.channel, Channel::SIGN_ON);
            let (_, tlvs) = parse_sign_on(&hello.payload).unwrap();
            let cookie = tlvs
                .get_bytes(flapwire_protocol::auth::login_tlv::COOKIE)
                .cloned()
                .unwrap_or_default();

            self.send_body(CommandBody::ServerReady(families.to_vec()), 0).await;
            let versions = self.next_command().await;
            assert_eq!(versions.code(), (family::SERVICE, service::CLIENT_VERSIONS));
            self.send_body(
                CommandBody::ServerVersions(
                    families
                        .iter()
                        .map(|&family| FamilyVersion { family, version: 1 })
                        .collect(),
                ),
                versions.request_id,
            )
            .await;
            let request = self.next_command().await;
            assert_eq!(request.code(), (family::SERVICE, service::RATE_INFO_REQUEST));
            self.send_body(CommandBody::RateInfo(Self::rate_info()), request.request_id)
                .await;
            let ack = self.next_command().await;
            assert_eq!(ack.code(), (family::SERVICE, service::RATE_ACK));
            let ready = self.next_command().await;
            assert_eq!(ready.code(), (family::SERVICE, service::CLIENT_READY));
            cookie
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake_server::FakeServer;
    use super::*;
    use flapwire_protocol::message::ErrorReply;
    use flapwire_protocol::TlvChain;

    fn config() -> Config {
        let mut config = Config::default();
        config.transport.keep_alive_secs = 0;
        config.login.timeout_secs = 5;
        config
    }

    #[tokio::test]
    async fn test_negotiation() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = FakeServer::new(server);
        let server_task = tokio::spawn(async move {
            let cookie = server.accept(&[family::SERVICE, family::BUDDY, family::ICBM]).await;
            (cookie, server)
        });

        let config = config();
        let connection = Connection::open_with_stream("bos", client, b"cookie", &config)
            .await
            .unwrap();
        let (cookie, _server) = server_task.await.unwrap();

        assert_eq!(cookie, Bytes::from_static(b"cookie"));
        assert!(connection.serves(family::ICBM));
        assert!(!connection.serves(family::ICON));
        assert_eq!(connection.negotiated().rate_info.classes.len(), 1);
        assert_eq!(connection.scheduler().class_of(family::ICBM), Some(1));
        assert!(connection.is_connected());
        connection.close();
    }

    #[tokio::test]
    async fn test_negotiation_error_reply() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = FakeServer::new(server);
        let server_task = tokio::spawn(async move {
            server
                .send_frame(Channel::SIGN_ON, &flapwire_protocol::auth::sign_on_payload(&TlvChain::new()).unwrap())
                .await;
            server.next_frame().await;
            server
                .send_body(
                    CommandBody::Error(ErrorReply {
                        family: family::SERVICE,
                        code: 0x0004,
                        tlvs: TlvChain::new(),
                    }),
                    0,
                )
                .await;
            server
        });

        let result = Connection::open_with_stream("bos", client, b"cookie", &config()).await;
        let _server = server_task.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::ServerError { family: 1, code: 4 })
        ));
    }

    #[tokio::test]
    async fn test_negotiation_closed() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        drop(server);
        let result = Connection::open_with_stream("bos", client, b"cookie", &config()).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    }
}
