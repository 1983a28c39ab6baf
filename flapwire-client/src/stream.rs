//! Server stream: plain TCP (possibly proxied) or TLS.

use crate::config::Config;
use crate::error::ClientError;
use crate::proxy::dial;
use crate::tls::{create_tls_connector, TrustProvider};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;

pin_project! {
    /// A client stream that can be either plain TCP or TLS.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl ClientStream {
    /// Dials `host:port` through the configured proxy and wraps it in TLS
    /// when enabled.
    pub async fn connect(
        config: &Config,
        host: &str,
        port: u16,
        trust: Option<Arc<dyn TrustProvider>>,
    ) -> Result<Self, ClientError> {
        let tcp = dial(&config.proxy, host, port, config.transport.connect_timeout()).await?;
        if !config.tls.enabled {
            return Ok(ClientStream::Plain { stream: tcp });
        }

        let (connector, server_name) = create_tls_connector(&config.tls, host, trust)?;
        tracing::debug!("Performing TLS handshake with {}", host);
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
        Ok(ClientStream::Tls { stream: tls })
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            ClientStream::Plain { stream } => stream.local_addr(),
            ClientStream::Tls { stream } => stream.get_ref().0.local_addr(),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
