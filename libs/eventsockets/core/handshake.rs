//! HTTP/1.1 upgrade handshake (RFC 6455 section 4)
//!
//! The client sends a `GET` with a random `Sec-WebSocket-Key`; the server
//! must answer `101 Switching Protocols` with
//! `Sec-WebSocket-Accept = base64(SHA-1(key + GUID))` and, optionally,
//! one of the requested subprotocols.

use crate::error::{Result, WsError};
use crate::headers::{is_reserved_header, Headers};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Fixed GUID appended to the key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Response heads larger than this are rejected
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Expected `Sec-WebSocket-Accept` value for a client key
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Fresh base64-encoded 16-byte nonce
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Parsed `ws://` or `wss://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`
    pub path: String,
    pub tls: bool,
}

impl WsUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| WsError::Configuration(format!("invalid URL '{}': {}", url, reason));

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let tls = match scheme.to_ascii_lowercase().as_str() {
            "ws" => false,
            "wss" => true,
            _ => return Err(invalid("scheme must be ws or wss")),
        };
        let default_port = if tls { 443 } else { 80 };

        let split_at = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, path) = rest.split_at(split_at);
        let path = match path {
            "" => "/".to_string(),
            p if p.starts_with('?') => format!("/{}", p),
            p => p.to_string(),
        };
        let path = match path.find('#') {
            Some(idx) => path[..idx].to_string(),
            None => path,
        };

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, after) = stripped
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid("invalid port"))?,
                None if after.is_empty() => default_port,
                None => return Err(invalid("unexpected text after IPv6 address")),
            };
            (format!("[{}]", host), port)
        } else if let Some((host, port)) = authority.rsplit_once(':') {
            (host.to_string(), port.parse().map_err(|_| invalid("invalid port"))?)
        } else {
            (authority.to_string(), default_port)
        };

        if host.is_empty() || host == "[]" {
            return Err(invalid("empty host"));
        }

        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }

    /// Value for the `Host` header; the port is omitted when it is the default
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Host without IPv6 brackets, suitable for socket address resolution
    pub fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl std::fmt::Display for WsUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "wss" } else { "ws" };
        write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Subprotocol selected by the server, if any
    pub protocol: Option<String>,
    /// Bytes received after the response head; they belong to the frame stream
    pub leftover: BytesMut,
}

/// Builds the upgrade request and validates the server's answer
#[derive(Debug, Clone)]
pub struct HandshakeNegotiator {
    url: WsUrl,
    protocols: Vec<String>,
    headers: Headers,
    key: String,
}

impl HandshakeNegotiator {
    pub fn new(url: WsUrl, protocols: Vec<String>, headers: Headers) -> Self {
        Self {
            url,
            protocols,
            headers,
            key: generate_key(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The raw HTTP upgrade request
    pub fn request_bytes(&self) -> Vec<u8> {
        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n",
            self.url.path,
            self.url.host_header(),
            self.key
        );

        if !self.protocols.is_empty() {
            request.push_str("Sec-WebSocket-Protocol: ");
            request.push_str(&self.protocols.join(", "));
            request.push_str("\r\n");
        }

        for (name, value) in &self.headers {
            if is_reserved_header(name) {
                warn!("Ignoring reserved handshake header '{}'", name);
                continue;
            }
            if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
                warn!("Ignoring malformed handshake header '{}'", name);
                continue;
            }
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }

        request.push_str("\r\n");
        request.into_bytes()
    }

    /// Check the server's response; returns the selected subprotocol
    pub fn validate(&self, response: &HttpResponse) -> Result<Option<String>> {
        if response.status != 101 {
            return Err(WsError::HandshakeFailed(format!(
                "expected status 101, got {} {}",
                response.status, response.reason
            )));
        }

        let upgrade = response
            .header("upgrade")
            .ok_or_else(|| missing("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(WsError::HandshakeFailed(format!(
                "Upgrade header must be 'websocket', got '{}'",
                upgrade
            )));
        }

        let connection = response
            .header("connection")
            .ok_or_else(|| missing("Connection"))?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(WsError::HandshakeFailed(format!(
                "Connection header must contain 'Upgrade', got '{}'",
                connection
            )));
        }

        let accept = response
            .header("sec-websocket-accept")
            .ok_or_else(|| missing("Sec-WebSocket-Accept"))?;
        let expected = compute_accept_key(&self.key);
        if accept != expected {
            return Err(WsError::HandshakeFailed(format!(
                "Sec-WebSocket-Accept mismatch: expected '{}', got '{}'",
                expected, accept
            )));
        }

        match response.header("sec-websocket-protocol").map(str::trim) {
            None | Some("") => Ok(None),
            Some(selected) => {
                if self.protocols.iter().any(|p| p == selected) {
                    Ok(Some(selected.to_string()))
                } else {
                    Err(WsError::HandshakeFailed(format!(
                        "server selected unsupported subprotocol '{}'",
                        selected
                    )))
                }
            }
        }
    }

    /// Run the handshake over an already connected stream
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<Negotiated>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        stream
            .write_all(&self.request_bytes())
            .await
            .map_err(|e| WsError::HandshakeFailed(format!("failed to send request: {}", e)))?;
        stream.flush().await?;
        debug!("Sent upgrade request for {}", self.url);

        let mut buf = BytesMut::with_capacity(1024);
        let head_len = loop {
            if let Some(pos) = find_head_end(&buf) {
                break pos;
            }
            if buf.len() > MAX_RESPONSE_HEAD {
                return Err(WsError::HandshakeFailed(
                    "response head exceeds 16 KiB".to_string(),
                ));
            }
            let read = stream
                .read_buf(&mut buf)
                .await
                .map_err(|e| WsError::HandshakeFailed(format!("failed to read response: {}", e)))?;
            if read == 0 {
                return Err(WsError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ));
            }
        };

        let head = buf.split_to(head_len);
        let response = HttpResponse::parse(&head)?;
        let protocol = self.validate(&response)?;
        debug!(
            "Handshake complete (protocol: {:?}, {} buffered bytes)",
            protocol,
            buf.len()
        );

        Ok(Negotiated {
            protocol,
            leftover: buf,
        })
    }
}

fn missing(header: &str) -> WsError {
    WsError::HandshakeFailed(format!("missing {} header", header))
}

/// Length of the response head including the blank line, if complete
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Minimal HTTP response head
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    /// Lowercased names; repeated headers are joined with ", "
    headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let bad = |reason: &str| WsError::HandshakeFailed(format!("malformed response: {}", reason));
        let text = std::str::from_utf8(data).map_err(|_| bad("not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().ok_or_else(|| bad("empty response"))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(bad("not an HTTP/1.x status line"));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad("invalid status code"))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| bad("header without ':'"))?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(protocols: &[&str]) -> HandshakeNegotiator {
        HandshakeNegotiator::new(
            WsUrl::parse("ws://localhost:8080/").unwrap(),
            protocols.iter().map(|p| p.to_string()).collect(),
            Vec::new(),
        )
    }

    fn response_for(n: &HandshakeNegotiator, extra: &str) -> HttpResponse {
        let raw = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n{}\r\n",
            compute_accept_key(n.key()),
            extra
        );
        HttpResponse::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_compute_accept_key() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_fresh_16_bytes() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 16);
    }

    #[test]
    fn test_url_parse() {
        let url = WsUrl::parse("ws://localhost:8080/").unwrap();
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/");
        assert!(!url.tls);

        let url = WsUrl::parse("wss://example.com").unwrap();
        assert_eq!(url.port, 443);
        assert_eq!(url.path, "/");
        assert_eq!(url.host_header(), "example.com");

        let url = WsUrl::parse("ws://example.com?room=1#frag").unwrap();
        assert_eq!(url.path, "/?room=1");

        let url = WsUrl::parse("ws://[::1]:9001/chat").unwrap();
        assert_eq!(url.host, "[::1]");
        assert_eq!(url.connect_host(), "::1");
        assert_eq!(url.host_header(), "[::1]:9001");
    }

    #[test]
    fn test_url_parse_errors() {
        assert!(WsUrl::parse("localhost:8080").is_err());
        assert!(WsUrl::parse("http://localhost").is_err());
        assert!(WsUrl::parse("ws://:80/").is_err());
        assert!(WsUrl::parse("ws://host:notaport/").is_err());
    }

    #[test]
    fn test_request_bytes() {
        let n = HandshakeNegotiator::new(
            WsUrl::parse("ws://localhost:8080/chat").unwrap(),
            vec!["chat".into(), "superchat".into()],
            vec![
                ("Origin".into(), "http://localhost".into()),
                ("Sec-WebSocket-Key".into(), "spoofed".into()),
            ],
        );
        let request = String::from_utf8(n.request_bytes()).unwrap();
        assert!(request.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(request.contains("Host: localhost:8080\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains("Connection: Upgrade\r\n"));
        assert!(request.contains(&format!("Sec-WebSocket-Key: {}\r\n", n.key())));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(request.contains("Origin: http://localhost\r\n"));
        assert!(!request.contains("spoofed"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_no_protocol_header_without_protocols() {
        let request = String::from_utf8(negotiator(&[]).request_bytes()).unwrap();
        assert!(!request.contains("Sec-WebSocket-Protocol"));
    }

    #[test]
    fn test_validate_selects_protocol() {
        let n = negotiator(&["chat", "superchat"]);
        let response = response_for(&n, "Sec-WebSocket-Protocol: chat\r\n");
        assert_eq!(n.validate(&response).unwrap(), Some("chat".to_string()));
    }

    #[test]
    fn test_validate_without_protocol() {
        let n = negotiator(&["chat"]);
        assert_eq!(n.validate(&response_for(&n, "")).unwrap(), None);
    }

    #[test]
    fn test_validate_rejects_unrequested_protocol() {
        let n = negotiator(&["chat"]);
        let response = response_for(&n, "Sec-WebSocket-Protocol: mqtt\r\n");
        assert!(matches!(n.validate(&response), Err(WsError::HandshakeFailed(_))));

        let n = negotiator(&[]);
        let response = response_for(&n, "Sec-WebSocket-Protocol: chat\r\n");
        assert!(n.validate(&response).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_status() {
        let n = negotiator(&[]);
        let response = HttpResponse::parse(b"HTTP/1.1 403 Forbidden\r\n\r\n").unwrap();
        let err = n.validate(&response).unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn test_validate_rejects_missing_accept() {
        let n = negotiator(&[]);
        let response = HttpResponse::parse(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .unwrap();
        let err = n.validate(&response).unwrap_err();
        assert!(err.to_string().contains("Sec-WebSocket-Accept"));
    }

    #[test]
    fn test_validate_rejects_wrong_accept() {
        let n = negotiator(&[]);
        let raw = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                   Connection: keep-alive, Upgrade\r\n\
                   Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        let response = HttpResponse::parse(raw.as_bytes()).unwrap();
        assert!(n.validate(&response).unwrap_err().to_string().contains("mismatch"));
    }

    #[test]
    fn test_response_headers_case_insensitive() {
        let response =
            HttpResponse::parse(b"HTTP/1.1 101 OK\r\nUPGRADE: WebSocket\r\nX-A: 1\r\nx-a: 2\r\n\r\n")
                .unwrap();
        assert_eq!(response.header("Upgrade"), Some("WebSocket"));
        assert_eq!(response.header("x-a"), Some("1, 2"));
    }

    #[tokio::test]
    async fn test_negotiate_keeps_leftover_bytes() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let n = negotiator(&["chat"]);
        let accept = compute_accept_key(n.key());

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                 Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\
                 Sec-WebSocket-Protocol: chat\r\n\r\n",
                accept
            );
            server.write_all(response.as_bytes()).await.unwrap();
            server.write_all(&[0x81, 0x01, b'!']).await.unwrap();
            server
        });

        let negotiated = n.negotiate(&mut client).await.unwrap();
        let _server = server_task.await.unwrap();
        assert_eq!(negotiated.protocol.as_deref(), Some("chat"));
        // The frame may or may not have arrived in the same read
        assert!(negotiated.leftover.is_empty() || &negotiated.leftover[..] == &[0x81, 0x01, b'!']);
    }

    #[tokio::test]
    async fn test_negotiate_eof_fails() {
        let (mut client, server) = tokio::io::duplex(4096);
        drop(server);
        let err = negotiator(&[]).negotiate(&mut client).await.unwrap_err();
        assert!(matches!(err, WsError::HandshakeFailed(_)));
    }
}
