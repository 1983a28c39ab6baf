//! Opening the peer stream: direct, listening or through a relay.

use crate::error::RendezvousError;
use bytes::{BufMut, BytesMut};
use flapwire_client::config::ProxyConfig;
use flapwire_client::proxy::dial;
use flapwire_protocol::rendezvous::ConnectionInfo;
use flapwire_protocol::{Cookie, ProtocolError, ProxyMessage};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Connects to the addresses a peer advertised, internal address first.
pub async fn connect_direct(
    proxy: &ProxyConfig,
    info: &ConnectionInfo,
    timeout: Duration,
) -> Result<TcpStream, RendezvousError> {
    let port = info.port.ok_or(ProtocolError::MissingField("rendezvous port"))?;
    let mut candidates: Vec<Ipv4Addr> = Vec::with_capacity(2);
    for ip in [info.client_ip, info.verified_ip].into_iter().flatten() {
        if !candidates.contains(&ip) {
            candidates.push(ip);
        }
    }
    if candidates.is_empty() {
        return Err(ProtocolError::MissingField("rendezvous address").into());
    }

    let mut last = None;
    for ip in candidates {
        tracing::debug!("Trying peer at {}:{}", ip, port);
        match dial(proxy, &ip.to_string(), port, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Peer address {}:{} failed: {}", ip, port, e);
                last = Some(e);
            }
        }
    }
    Err(last.map_or(RendezvousError::SessionClosed, RendezvousError::from))
}

/// Waits for the peer to connect to our advertised port.
pub async fn accept_peer(listener: &TcpListener) -> Result<TcpStream, RendezvousError> {
    let (stream, addr) = listener.accept().await?;
    tracing::debug!("Peer connected from {}", addr);
    stream.set_nodelay(true).ok();
    Ok(stream)
}

async fn write_relay(stream: &mut TcpStream, message: &ProxyMessage) -> Result<(), RendezvousError> {
    let bytes = message.encode()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads exactly one relay message so nothing behind it is consumed.
async fn read_relay(stream: &mut TcpStream) -> Result<ProxyMessage, RendezvousError> {
    let length = stream.read_u16().await?;
    let mut buf = BytesMut::with_capacity(2 + length as usize);
    buf.put_u16(length);
    buf.resize(2 + length as usize, 0);
    stream.read_exact(&mut buf[2..]).await?;
    match ProxyMessage::decode(&mut buf)? {
        Some(ProxyMessage::Error { code }) => Err(RendezvousError::Relay(code)),
        Some(message) => Ok(message),
        None => Err(ProtocolError::MissingField("relay packet").into()),
    }
}

fn unexpected(expected: &'static str, found: &ProxyMessage) -> RendezvousError {
    RendezvousError::UnexpectedHeader {
        expected,
        found: format!("relay command {:#06x}", found.command()),
    }
}

/// A relay session we opened, waiting for the peer to join.
#[derive(Debug)]
pub struct RelaySession {
    stream: TcpStream,
    /// Relay address to advertise to the peer.
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl RelaySession {
    /// Waits for the relay to report the peer attached.
    pub async fn ready(mut self) -> Result<TcpStream, RendezvousError> {
        match read_relay(&mut self.stream).await? {
            ProxyMessage::Ready => Ok(self.stream),
            other => Err(unexpected("relay ready", &other)),
        }
    }
}

/// Opens a relay session as the side that invites the peer.
pub async fn relay_initiate(
    proxy: &ProxyConfig,
    relay_host: &str,
    relay_port: u16,
    screen_name: &str,
    cookie: Cookie,
    capability: Uuid,
    timeout: Duration,
) -> Result<RelaySession, RendezvousError> {
    let mut stream = dial(proxy, relay_host, relay_port, timeout).await?;
    write_relay(
        &mut stream,
        &ProxyMessage::InitSend {
            screen_name: screen_name.to_string(),
            cookie,
            capability,
        },
    )
    .await?;
    match read_relay(&mut stream).await? {
        ProxyMessage::Ack { port, ip } => {
            tracing::debug!("Relay session open at {}:{}", ip, port);
            Ok(RelaySession { stream, ip, port })
        }
        other => Err(unexpected("relay ack", &other)),
    }
}

/// Joins the relay session a peer advertised.
#[allow(clippy::too_many_arguments)]
pub async fn relay_join(
    proxy: &ProxyConfig,
    relay_ip: Ipv4Addr,
    relay_port: u16,
    session_port: u16,
    screen_name: &str,
    cookie: Cookie,
    capability: Uuid,
    timeout: Duration,
) -> Result<TcpStream, RendezvousError> {
    let mut stream = dial(proxy, &relay_ip.to_string(), relay_port, timeout).await?;
    write_relay(
        &mut stream,
        &ProxyMessage::InitRecv {
            screen_name: screen_name.to_string(),
            port: session_port,
            cookie,
            capability,
        },
    )
    .await?;
    match read_relay(&mut stream).await? {
        ProxyMessage::Ready => Ok(stream),
        other => Err(unexpected("relay ready", &other)),
    }
}


#[cfg(test)]
mod tests {
    use super::fake_relay::serve_once;
    use super::*;
    use crate::error::AttemptFailure;
    use flapwire_protocol::rendezvous::CAP_SEND_FILE;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_direct_connect() {
        let (listener, port) = local_listener().await;
        let info = ConnectionInfo {
            request_index: 1,
            client_ip: Some(Ipv4Addr::LOCALHOST),
            verified_ip: Some(Ipv4Addr::LOCALHOST),
            port: Some(port),
            ..Default::default()
        };
        let proxy = ProxyConfig::default();
        let (connected, accepted) = tokio::join!(
            connect_direct(&proxy, &info, TIMEOUT),
            accept_peer(&listener),
        );
        let mut client = connected.unwrap();
        let mut server = accepted.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_direct_refused() {
        let (listener, port) = local_listener().await;
        drop(listener);
        let info = ConnectionInfo {
            client_ip: Some(Ipv4Addr::LOCALHOST),
            port: Some(port),
            ..Default::default()
        };
        let err = connect_direct(&ProxyConfig::default(), &info, TIMEOUT).await.unwrap_err();
        assert_eq!(err.attempt_failure(), AttemptFailure::Refused);
    }

    #[tokio::test]
    async fn test_direct_needs_port() {
        let info = ConnectionInfo {
            client_ip: Some(Ipv4Addr::LOCALHOST),
            ..Default::default()
        };
        let err = connect_direct(&ProxyConfig::default(), &info, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, RendezvousError::Protocol(ProtocolError::MissingField(_))));
    }

    #[tokio::test]
    async fn test_relay_initiate_then_ready() {
        let (listener, port) = local_listener().await;
        let relay = tokio::spawn(serve_once(
            listener,
            Some(ProxyMessage::Ack {
                port: 4443,
                ip: Ipv4Addr::new(10, 0, 0, 9),
            }),
            ProxyMessage::Ready,
        ));

        let session = relay_initiate(
            &ProxyConfig::default(),
            "127.0.0.1",
            port,
            "alice",
            Cookie([9; 8]),
            CAP_SEND_FILE,
            TIMEOUT,
        )
        .await
        .unwrap();
        assert_eq!((session.ip, session.port), (Ipv4Addr::new(10, 0, 0, 9), 4443));
        let mut stream = session.ready().await.unwrap();

        let (init, mut relay_side) = relay.await.unwrap();
        assert_eq!(
            init,
            ProxyMessage::InitSend {
                screen_name: "alice".to_string(),
                cookie: Cookie([9; 8]),
                capability: CAP_SEND_FILE,
            }
        );
        // The stream is a plain pipe once ready
        relay_side.write_all(b"OFT2").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OFT2");
    }

    #[tokio::test]
    async fn test_relay_error() {
        let (listener, port) = local_listener().await;
        let relay = tokio::spawn(serve_once(listener, None, ProxyMessage::Error { code: 0x1a }));
        let err = relay_initiate(
            &ProxyConfig::default(),
            "127.0.0.1",
            port,
            "alice",
            Cookie([1; 8]),
            CAP_SEND_FILE,
            TIMEOUT,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RendezvousError::Relay(0x1a)));
        assert_eq!(err.attempt_failure(), AttemptFailure::Relay(0x1a));
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_join() {
        let (listener, port) = local_listener().await;
        let relay = tokio::spawn(serve_once(listener, None, ProxyMessage::Ready));
        relay_join(
            &ProxyConfig::default(),
            Ipv4Addr::LOCALHOST,
            port,
            4443,
            "bob",
            Cookie([2; 8]),
            CAP_SEND_FILE,
            TIMEOUT,
        )
        .await
        .unwrap();
        let (init, _) = relay.await.unwrap();
        assert_eq!(
            init,
            ProxyMessage::InitRecv {
                screen_name: "bob".to_string(),
                port: 4443,
                cookie: Cookie([2; 8]),
                capability: CAP_SEND_FILE,
            }
        );
    }
}
