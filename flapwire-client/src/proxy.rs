//! Tunnelling a TCP connection through SOCKS4, SOCKS5 or HTTP CONNECT proxies.

use crate::config::{ProxyConfig, ProxyKind};
use crate::error::ClientError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest HTTP response head accepted from a proxy.
const MAX_HTTP_HEAD: usize = 8 * 1024;

/// Opens a TCP connection to `host:port`, through the configured proxy if any.
pub async fn dial(
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ClientError> {
    let connect = async {
        match (proxy.kind, proxy.host.as_deref()) {
            (ProxyKind::None, _) | (_, None) => {
                tracing::debug!("Connecting to {}:{}", host, port);
                Ok::<_, ClientError>(TcpStream::connect((host, port)).await?)
            }
            (kind, Some(proxy_host)) => {
                tracing::debug!(
                    "Connecting to {}:{} via {:?} proxy {}:{}",
                    host,
                    port,
                    kind,
                    proxy_host,
                    proxy.port
                );
                let mut stream = TcpStream::connect((proxy_host, proxy.port)).await?;
                let user = proxy.username.as_deref();
                let pass = proxy.password.as_deref();
                match kind {
                    ProxyKind::Socks4 => socks4_connect(&mut stream, host, port, user).await?,
                    ProxyKind::Socks5 => socks5_connect(&mut stream, host, port, user, pass).await?,
                    ProxyKind::Http => http_connect(&mut stream, host, port, user, pass).await?,
                    ProxyKind::None => {}
                }
                Ok::<_, ClientError>(stream)
            }
        }
    };

    let stream: TcpStream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| ClientError::Timeout)??;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// SOCKS4 (or 4a for host names) CONNECT.
pub async fn socks4_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    user: Option<&str>,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    let ip = host.parse::<Ipv4Addr>().ok();
    // 4a: an invalid address 0.0.0.x means the host name follows the user id
    request.extend_from_slice(&ip.unwrap_or(Ipv4Addr::new(0, 0, 0, 1)).octets());
    request.extend_from_slice(user.unwrap_or("").as_bytes());
    request.push(0);
    if ip.is_none() {
        request.extend_from_slice(host.as_bytes());
        request.push(0);
    }
    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x5a {
        return Err(ClientError::Proxy(format!(
            "SOCKS4 request rejected with code {:#04x}",
            reply[1]
        )));
    }
    Ok(())
}

/// SOCKS5 CONNECT, with username/password authentication when credentials are given.
pub async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    user: Option<&str>,
    pass: Option<&str>,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let with_auth = user.is_some();
    if with_auth {
        stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
    } else {
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
    }

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(ClientError::Proxy(format!(
            "SOCKS5 proxy answered with version {}",
            choice[0]
        )));
    }
    match choice[1] {
        0x00 => {}
        0x02 if with_auth => {
            let user = user.unwrap_or("").as_bytes();
            let pass = pass.unwrap_or("").as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(ClientError::Proxy("SOCKS5 credentials too long".to_string()));
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user);
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass);
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(ClientError::Proxy("SOCKS5 authentication failed".to_string()));
            }
        }
        other => {
            return Err(ClientError::Proxy(format!(
                "SOCKS5 proxy refused authentication methods ({:#04x})",
                other
            )))
        }
    }

    let mut request = vec![0x05, 0x01, 0x00];
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        request.push(0x01);
        request.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
        request.push(0x04);
        request.extend_from_slice(&ip.octets());
    } else {
        if host.len() > 255 {
            return Err(ClientError::Proxy(format!("host name too long: {}", host)));
        }
        request.push(0x03);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(ClientError::Proxy(format!(
            "SOCKS5 connect failed with code {:#04x}",
            head[1]
        )));
    }
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(ClientError::Proxy(format!(
                "SOCKS5 reply with unknown address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// HTTP CONNECT tunnel.
pub async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    user: Option<&str>,
    pass: Option<&str>,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {} HTTP/1.0\r\nHost: {}\r\n", target, target);
    if let Some(user) = user {
        let credentials = format!("{}:{}", user, pass.unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Byte at a time so nothing past the head is consumed
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            return Err(ClientError::Proxy("HTTP proxy response head too large".to_string()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(ClientError::Proxy(format!(
            "HTTP proxy refused CONNECT: {}",
            status_line
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_socks4_ip() {
        let mut mock = Builder::new()
            .write(&[0x04, 0x01, 0x14, 0x46, 10, 0, 0, 1, b'b', b'o', b'b', 0])
            .read(&[0x00, 0x5a, 0, 0, 0, 0, 0, 0])
            .build();
        socks4_connect(&mut mock, "10.0.0.1", 5190, Some("bob"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_socks4a_hostname_rejected() {
        let mut expected = vec![0x04, 0x01, 0x14, 0x46, 0, 0, 0, 1, 0];
        expected.extend_from_slice(b"login.example\0");
        let mut mock = Builder::new()
            .write(&expected)
            .read(&[0x00, 0x5b, 0, 0, 0, 0, 0, 0])
            .build();
        let err = socks4_connect(&mut mock, "login.example", 5190, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Proxy(_)));
    }

    #[tokio::test]
    async fn test_socks5_no_auth_domain() {
        let mut connect = vec![0x05, 0x01, 0x00, 0x03, 4];
        connect.extend_from_slice(b"host");
        connect.extend_from_slice(&[0x14, 0x46]);
        let mut mock = Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&connect)
            .read(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
            .build();
        socks5_connect(&mut mock, "host", 5190, None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_socks5_user_pass() {
        let mut mock = Builder::new()
            .write(&[0x05, 0x02, 0x00, 0x02])
            .read(&[0x05, 0x02])
            .write(&[0x01, 1, b'u', 2, b'p', b'w'])
            .read(&[0x01, 0x00])
            .write(&[0x05, 0x01, 0x00, 0x01, 192, 168, 0, 9, 0x00, 0x50])
            .read(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();
        socks5_connect(&mut mock, "192.168.0.9", 80, Some("u"), Some("pw"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_socks5_auth_failure() {
        let mut mock = Builder::new()
            .write(&[0x05, 0x02, 0x00, 0x02])
            .read(&[0x05, 0x02])
            .write(&[0x01, 1, b'u', 1, b'x'])
            .read(&[0x01, 0x01])
            .build();
        let err = socks5_connect(&mut mock, "h", 1, Some("u"), Some("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_http_connect() {
        let mut mock = Builder::new()
            .write(b"CONNECT host:443 HTTP/1.0\r\nHost: host:443\r\nProxy-Authorization: Basic dTpw\r\n\r\n")
            .read(b"HTTP/1.1 200 Connection established\r\nVia: x\r\n\r\n")
            .build();
        http_connect(&mut mock, "host", 443, Some("u"), Some("p"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_refused() {
        let mut mock = Builder::new()
            .write(b"CONNECT host:443 HTTP/1.0\r\nHost: host:443\r\n\r\n")
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .build();
        let err = http_connect(&mut mock, "host", 443, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("407"));
    }

    #[tokio::test]
    async fn test_http_connect_pads_credentials() {
        // "user:pass!" needs padding
        let mut mock = Builder::new()
            .write(b"CONNECT host:80 HTTP/1.0\r\nHost: host:80\r\nProxy-Authorization: Basic dXNlcjpwYXNzIQ==\r\n\r\n")
            .read(b"HTTP/1.0 200 OK\r\n\r\n")
            .build();
        http_connect(&mut mock, "host", 80, Some("user"), Some("pass!"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_user_without_password() {
        let mut mock = Builder::new()
            .write(b"CONNECT host:80 HTTP/1.0\r\nHost: host:80\r\nProxy-Authorization: Basic dTo=\r\n\r\n")
            .read(b"HTTP/1.0 200 OK\r\n\r\n")
            .build();
        http_connect(&mut mock, "host", 80, Some("u"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dial_direct() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = dial(&ProxyConfig::default(), "127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        accept.await.unwrap();
    }
}
