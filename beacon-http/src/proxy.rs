//! Proxy configuration and the shared dial operation.
//!
//! The REST client delegates proxying to reqwest; the gateway's WebSocket
//! needs a pre-connected TCP stream, so [`dial`] performs the HTTP-CONNECT or
//! SOCKS5 handshake itself and hands back a tunneled socket ready for TLS.

use crate::HttpError;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

/// Proxy handshake timeout.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Supported proxy protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    /// HTTP proxy, tunneled with CONNECT.
    Http,
    /// SOCKS5 proxy.
    Socks5,
}

/// A parsed proxy endpoint.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    /// Parse a proxy URL such as `http://127.0.0.1:8080` or
    /// `socks5://127.0.0.1:1080`.
    pub fn parse(raw: &str) -> Result<Self, HttpError> {
        let url = Url::parse(raw).map_err(|e| HttpError::InvalidProxy(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" => ProxyScheme::Http,
            scheme if scheme.starts_with("socks") => ProxyScheme::Socks5,
            other => {
                return Err(HttpError::InvalidProxy(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::InvalidProxy("missing host".to_string()))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| HttpError::InvalidProxy("missing port".to_string()))?;
        Ok(Self { scheme, host, port })
    }

    /// The equivalent reqwest proxy, for the REST client.
    pub fn reqwest_proxy(&self) -> Result<reqwest::Proxy, HttpError> {
        let scheme = match self.scheme {
            ProxyScheme::Http => "http",
            ProxyScheme::Socks5 => "socks5",
        };
        reqwest::Proxy::all(format!("{scheme}://{}:{}", self.host, self.port))
            .map_err(HttpError::Transport)
    }
}

/// Open a TCP stream to `host:port`, tunneling through the proxy when one is
/// configured. TLS is layered on by the caller.
pub async fn dial(proxy: Option<&ProxyConfig>, host: &str, port: u16) -> io::Result<TcpStream> {
    match proxy {
        None => TcpStream::connect((host, port)).await,
        Some(proxy_config) => {
            let stream =
                TcpStream::connect((proxy_config.host.as_str(), proxy_config.port)).await?;
            let handshake = async {
                match proxy_config.scheme {
                    ProxyScheme::Http => connect_tunnel(stream, host, port).await,
                    ProxyScheme::Socks5 => socks5_tunnel(stream, host, port).await,
                }
            };
            timeout(HANDSHAKE_TIMEOUT, handshake)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "proxy handshake timed out"))?
        }
    }
}

/// Establish an HTTP CONNECT tunnel.
async fn connect_tunnel(mut stream: TcpStream, host: &str, port: u16) -> io::Result<TcpStream> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response head byte by byte until the blank line; the tunnel
    // payload must not be consumed.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized CONNECT response",
            ));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    let status_line = String::from_utf8_lossy(&head);
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'));
    if !ok {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused CONNECT: {}", status_line.lines().next().unwrap_or("")),
        ));
    }
    Ok(stream)
}

/// Perform the SOCKS5 no-auth handshake and a domain-name CONNECT.
async fn socks5_tunnel(mut stream: TcpStream, host: &str, port: u16) -> io::Result<TcpStream> {
    // Greeting: version 5, one method, no authentication.
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "SOCKS5 proxy rejected authentication method",
        ));
    }

    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "hostname too long"));
    }
    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host_bytes.len() as u8]);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("SOCKS5 connect failed with code {}", header[1]),
        ));
    }
    // Drain the bound address: 4 (IPv4), 16 (IPv6) or length-prefixed domain.
    let addr_len = match header[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("SOCKS5 reply with unknown address type {other}"),
            ))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_http_proxy() {
        let proxy = ProxyConfig::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(proxy.scheme, ProxyScheme::Http);
        assert_eq!(proxy.port, 8080);
    }

    #[test]
    fn test_parse_socks_variants() {
        for raw in ["socks5://10.0.0.1:1080", "socks5h://10.0.0.1:1080"] {
            assert_eq!(ProxyConfig::parse(raw).unwrap().scheme, ProxyScheme::Socks5);
        }
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!(ProxyConfig::parse("http://127.0.0.1").is_err());
        assert!(ProxyConfig::parse("ftp://127.0.0.1:21").is_err());
    }

    #[tokio::test]
    async fn test_connect_tunnel_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let proxy = ProxyConfig {
            scheme: ProxyScheme::Http,
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        };
        let stream = dial(Some(&proxy), "example.com", 443).await.unwrap();
        drop(stream);
        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_socks5_tunnel_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut header = [0u8; 5];
            stream.read_exact(&mut header).await.unwrap();
            let mut rest = vec![0u8; header[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
            // Reply: success, IPv4 bound address.
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            (header, rest)
        });

        let proxy = ProxyConfig {
            scheme: ProxyScheme::Socks5,
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        };
        dial(Some(&proxy), "example.com", 443).await.unwrap();
        let (header, rest) = server.await.unwrap();
        assert_eq!(&header[..4], &[0x05, 0x01, 0x00, 0x03]);
        assert_eq!(&rest[..header[4] as usize], b"example.com");
        assert_eq!(&rest[header[4] as usize..], &443u16.to_be_bytes());
    }
}
