// Connexions sortantes, directes ou via un proxy SOCKS/HTTP

use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy {0} is not reachable: {1}")]
    Unreachable(String, String),

    #[error("SOCKS4 request rejected (code 0x{0:02X})")]
    Socks4Rejected(u8),

    #[error("SOCKS4 needs an IPv4 address, {0} does not resolve to one")]
    Socks4NeedsIpv4(String),

    #[error("SOCKS5 request failed: {0}")]
    Socks5Failed(&'static str),

    #[error("SOCKS5 authentication failed")]
    Socks5AuthFailed,

    #[error("SOCKS5 proxy wants unsupported auth method {0}")]
    Socks5UnsupportedAuth(u8),

    #[error("HTTP proxy refused CONNECT: {0}")]
    HttpRefused(String),

    #[error("Proxy kind {0:?} cannot listen for active data connections")]
    BindUnsupported(ProxyKind),

    #[error("Invalid proxy reply: {0}")]
    InvalidReply(String),

    #[error("Proxy I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy did not answer in time")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    None,
    Socks4,
    Socks4a,
    Socks5,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            kind: ProxyKind::None,
            host: String::new(),
            port: 1080,
            user: None,
            password: None,
        }
    }
}

impl ProxyConfig {
    pub fn is_enabled(&self) -> bool {
        self.kind != ProxyKind::None
    }
}

/// Opens a TCP connection to `host:port`, through the proxy when one is configured.
pub async fn connect(
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<TcpStream, ProxyError> {
    let work = async {
        if !proxy.is_enabled() {
            return Ok(TcpStream::connect((host, port)).await?);
        }
        let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
            .await
            .map_err(|e| ProxyError::Unreachable(format!("{}:{}", proxy.host, proxy.port), e.to_string()))?;
        debug!("Connected to {:?} proxy {}:{}", proxy.kind, proxy.host, proxy.port);
        match proxy.kind {
            ProxyKind::Socks4 => {
                let ip = resolve_ipv4(host, port).await?;
                socks4_request(&mut stream, proxy, 0x01, port, Some(ip), host).await?;
            }
            ProxyKind::Socks4a => {
                socks4_request(&mut stream, proxy, 0x01, port, None, host).await?;
            }
            ProxyKind::Socks5 => {
                socks5_handshake(&mut stream, proxy).await?;
                socks5_request(&mut stream, 0x01, host, port).await?;
            }
            ProxyKind::Http => http_connect(&mut stream, proxy, host, port).await?,
            ProxyKind::None => {}
        }
        Ok(stream)
    };
    timeout(limit, work).await.map_err(|_| ProxyError::Timeout)?
}

/// A SOCKS BIND in progress: the proxy listens on `addr` for the server to dial in.
pub struct ProxyListener {
    stream: TcpStream,
    kind: ProxyKind,
    pub addr: SocketAddr,
}

impl ProxyListener {
    /// Waits for the proxy's second reply, sent once the server has connected.
    pub async fn accept(mut self) -> Result<TcpStream, ProxyError> {
        match self.kind {
            ProxyKind::Socks4 | ProxyKind::Socks4a => {
                socks4_reply(&mut self.stream).await?;
            }
            _ => {
                socks5_reply(&mut self.stream).await?;
            }
        }
        Ok(self.stream)
    }
}

/// Asks the proxy to listen for a connection coming from `server` (the control peer).
pub async fn bind(
    proxy: &ProxyConfig,
    server: SocketAddr,
    limit: Duration,
) -> Result<ProxyListener, ProxyError> {
    let work = async {
        let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
            .await
            .map_err(|e| ProxyError::Unreachable(format!("{}:{}", proxy.host, proxy.port), e.to_string()))?;
        let announced = match (proxy.kind, server.ip()) {
            (ProxyKind::Socks4 | ProxyKind::Socks4a, IpAddr::V4(ip)) => {
                socks4_request(&mut stream, proxy, 0x02, server.port(), Some(ip), "").await?
            }
            (ProxyKind::Socks4 | ProxyKind::Socks4a, IpAddr::V6(_)) => {
                return Err(ProxyError::Socks4NeedsIpv4(server.to_string()))
            }
            (ProxyKind::Socks5, ip) => {
                socks5_handshake(&mut stream, proxy).await?;
                socks5_request(&mut stream, 0x02, &ip.to_string(), server.port()).await?
            }
            (kind, _) => return Err(ProxyError::BindUnsupported(kind)),
        };
        // A proxy answering 0.0.0.0 listens on its own address.
        let addr = if announced.ip().is_unspecified() {
            SocketAddr::new(stream.peer_addr()?.ip(), announced.port())
        } else {
            announced
        };
        Ok(ProxyListener {
            stream,
            kind: proxy.kind,
            addr,
        })
    };
    timeout(limit, work).await.map_err(|_| ProxyError::Timeout)?
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr, ProxyError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    lookup_host((host, port))
        .await?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| ProxyError::Socks4NeedsIpv4(host.to_string()))
}

/// Builds a SOCKS4 (or SOCKS4A when `ip` is `None`) request.
fn socks4_message(proxy: &ProxyConfig, command: u8, port: u16, ip: Option<Ipv4Addr>, host: &str) -> Vec<u8> {
    let mut request = vec![0x04, command];
    request.extend_from_slice(&port.to_be_bytes());
    match ip {
        Some(ip) => request.extend_from_slice(&ip.octets()),
        None => request.extend_from_slice(&[0, 0, 0, 1]),
    }
    if let Some(user) = &proxy.user {
        request.extend_from_slice(user.as_bytes());
    }
    request.push(0x00);
    if ip.is_none() {
        request.extend_from_slice(host.as_bytes());
        request.push(0x00);
    }
    request
}

async fn socks4_request(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    command: u8,
    port: u16,
    ip: Option<Ipv4Addr>,
    host: &str,
) -> Result<SocketAddr, ProxyError> {
    stream
        .write_all(&socks4_message(proxy, command, port, ip, host))
        .await?;
    socks4_reply(stream).await
}

async fn socks4_reply(stream: &mut TcpStream) -> Result<SocketAddr, ProxyError> {
    let mut response = [0u8; 8];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x5A {
        return Err(ProxyError::Socks4Rejected(response[1]));
    }
    let port = u16::from_be_bytes([response[2], response[3]]);
    let ip = Ipv4Addr::new(response[4], response[5], response[6], response[7]);
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

async fn socks5_handshake(stream: &mut TcpStream, proxy: &ProxyConfig) -> Result<(), ProxyError> {
    let greeting: &[u8] = if proxy.user.is_some() {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream.write_all(greeting).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != 0x05 {
        return Err(ProxyError::InvalidReply("SOCKS5 version mismatch".into()));
    }
    match response[1] {
        0x00 => Ok(()),
        0x02 => {
            let user = proxy.user.as_deref().unwrap_or("");
            let password = proxy.password.as_deref().unwrap_or("");
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream.write_all(&auth).await?;

            let mut auth_response = [0u8; 2];
            stream.read_exact(&mut auth_response).await?;
            if auth_response[1] != 0x00 {
                return Err(ProxyError::Socks5AuthFailed);
            }
            Ok(())
        }
        other => Err(ProxyError::Socks5UnsupportedAuth(other)),
    }
}

fn socks5_message(command: u8, host: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, command, 0x00];
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        request.push(0x01);
        request.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
        request.push(0x04);
        request.extend_from_slice(&ip.octets());
    } else {
        request.push(0x03);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());
    request
}

async fn socks5_request(
    stream: &mut TcpStream,
    command: u8,
    host: &str,
    port: u16,
) -> Result<SocketAddr, ProxyError> {
    stream.write_all(&socks5_message(command, host, port)).await?;
    socks5_reply(stream).await
}

async fn socks5_reply(stream: &mut TcpStream) -> Result<SocketAddr, ProxyError> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        let reason = match head[1] {
            0x01 => "General SOCKS server failure",
            0x02 => "Connection not allowed by ruleset",
            0x03 => "Network unreachable",
            0x04 => "Host unreachable",
            0x05 => "Connection refused",
            0x06 => "TTL expired",
            0x07 => "Command not supported",
            0x08 => "Address type not supported",
            _ => "Unknown SOCKS5 error",
        };
        return Err(ProxyError::Socks5Failed(reason));
    }
    let ip = match head[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        other => return Err(ProxyError::InvalidReply(format!("address type {}", other))),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}

async fn http_connect(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<(), ProxyError> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let Some(user) = &proxy.user {
        let credentials = format!("{}:{}", user, proxy.password.as_deref().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Byte-wise reads so nothing past the header block is consumed.
    let mut reader = BufReader::with_capacity(1, &mut *stream);
    let mut status = String::new();
    reader.read_line(&mut status).await?;
    let accepted = status
        .split_whitespace()
        .nth(1)
        .map_or(false, |code| code.starts_with('2'));
    loop {
        let mut header = String::new();
        let n = reader.read_line(&mut header).await?;
        if n == 0 || header.trim().is_empty() {
            break;
        }
    }
    if accepted {
        Ok(())
    } else {
        Err(ProxyError::HttpRefused(status.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_socks4a_message() {
        let proxy = ProxyConfig {
            kind: ProxyKind::Socks4a,
            user: Some("bob".into()),
            ..ProxyConfig::default()
        };
        let msg = socks4_message(&proxy, 0x01, 21, None, "ftp.example.com");
        assert_eq!(&msg[..8], &[0x04, 0x01, 0x00, 21, 0, 0, 0, 1]);
        assert_eq!(&msg[8..12], b"bob\0");
        assert_eq!(&msg[12..], b"ftp.example.com\0");
    }

    #[test]
    fn test_socks5_message_domain() {
        let msg = socks5_message(0x01, "ftp.example.com", 21);
        assert_eq!(&msg[..5], &[0x05, 0x01, 0x00, 0x03, 15]);
        assert_eq!(&msg[msg.len() - 2..], &[0, 21]);
        let msg = socks5_message(0x02, "10.0.0.1", 2121);
        assert_eq!(msg, vec![0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x08, 0x49]);
    }

    #[tokio::test]
    async fn test_http_connect_through_fake_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\nX: y\r\n\r\n220 hello\r\n")
                .await
                .unwrap();
            request
        });

        let proxy = ProxyConfig {
            kind: ProxyKind::Http,
            host: addr.ip().to_string(),
            port: addr.port(),
            user: Some("u".into()),
            password: Some("p".into()),
        };
        let mut stream = connect(&proxy, "ftp.example.com", 21, Duration::from_secs(5))
            .await
            .unwrap();
        let mut greeting = [0u8; 11];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"220 hello\r\n");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT ftp.example.com:21 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[tokio::test]
    async fn test_socks5_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = vec![0u8; 64];
            let _ = socket.read(&mut request).await.unwrap();
            socket.write_all(&[0x05, 0x05, 0x00, 0x01]).await.unwrap();
        });

        let proxy = ProxyConfig {
            kind: ProxyKind::Socks5,
            host: addr.ip().to_string(),
            port: addr.port(),
            ..ProxyConfig::default()
        };
        let result = connect(&proxy, "ftp.example.com", 21, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ProxyError::Socks5Failed("Connection refused"))));
    }
}
