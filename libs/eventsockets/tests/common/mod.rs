//! Common test utilities for EventSockets integration tests
//!
//! Two kinds of peer are provided:
//!
//! - [`MockWsServer`]: a well-behaved echo server built on tokio-tungstenite
//! - [`scripted_server`]: a raw TCP peer that answers the handshake as told
//!   and then runs a test-supplied script over the crate's server-role codec

#![allow(dead_code)]

use bytes::BytesMut;
use eventsockets::{compute_accept_key, Frame, FrameCodec, Subscription};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// Install a test-writer tracing subscriber honoring RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait for the next event without blocking the runtime
pub async fn next_event<T>(sub: &Subscription<T>, timeout: Duration) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(event) = sub.try_recv() {
            return Some(event);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

/// A simple mock WebSocket echo server for testing
///
/// Text commands change its behavior:
/// - `__close__` makes it send a close frame (1000) and stop
/// - `__drop__` makes it drop the TCP connection without a close frame
pub struct MockWsServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl MockWsServer {
    /// Create and start a new mock WebSocket server
    pub async fn start() -> Self {
        Self::start_with_protocols(&[]).await
    }

    /// Start a server that selects the first offered protocol it supports
    pub async fn start_with_protocols(supported: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();
        let supported: Arc<Vec<String>> =
            Arc::new(supported.iter().map(|p| p.to_string()).collect());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let shutdown = shutdown_clone.clone();
                                let supported = Arc::clone(&supported);
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, supported, shutdown).await;
                                });
                            }
                            Err(e) => {
                                eprintln!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        break;
                    }
                }
            }
        });

        Self { addr, shutdown }
    }

    async fn handle_connection(stream: TcpStream, supported: Arc<Vec<String>>, shutdown: Arc<Notify>) {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
        use tokio_tungstenite::tungstenite::http::HeaderValue;
        use tokio_tungstenite::tungstenite::Message;

        let select_protocol = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            let offered = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let chosen = offered
                .split(',')
                .map(str::trim)
                .find(|p| supported.iter().any(|s| s == p));
            if let Some(protocol) = chosen {
                resp.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_str(protocol).unwrap(),
                );
            }
            Ok(resp)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, select_protocol).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) if text == "__drop__" => break,
                        Some(Ok(Message::Text(text))) if text == "__close__" => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                        Some(Ok(msg)) => {
                            if msg.is_text() || msg.is_binary() {
                                // Echo the message back
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            } else if msg.is_close() {
                                let _ = write.close().await;
                                break;
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
    }

    /// Get the WebSocket URL for this server
    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// How the scripted server answers the upgrade request
#[derive(Debug, Clone)]
pub enum HandshakeReply {
    /// Valid 101 response, optionally selecting a protocol
    Accept { protocol: Option<String> },
    /// Valid 101 response immediately followed by raw bytes in the same write
    AcceptWith { trailing: Vec<u8> },
    /// 101 response without `Sec-WebSocket-Accept`
    MissingAccept,
    /// Read the request and never answer
    Silent,
}

impl HandshakeReply {
    pub fn accept() -> Self {
        HandshakeReply::Accept { protocol: None }
    }
}

/// Raw server side of one connection
pub struct RawPeer {
    stream: TcpStream,
    buf: BytesMut,
    codec: FrameCodec,
}

impl RawPeer {
    pub async fn send_frame(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        self.codec.encode_frame(&frame, &mut out);
        self.send_raw(&out).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes).await;
        let _ = self.stream.flush().await;
    }

    /// Next frame from the client; `None` on EOF, decode error or 5 s of silence
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(e) => {
                    eprintln!("Client sent an invalid frame: {}", e);
                    return None;
                }
            }
            let read = tokio::time::timeout(
                Duration::from_secs(5),
                self.stream.read_buf(&mut self.buf),
            )
            .await;
            match read {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                Ok(Ok(_)) => {}
            }
        }
    }

    /// Close the TCP connection without a close frame
    pub async fn drop_connection(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(buf).ok()
}

fn request_header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Start a one-connection raw server
///
/// Returns the URL to connect to and the handle of the task running the
/// handshake and then `script`.
pub async fn scripted_server<F, Fut>(reply: HandshakeReply, script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(RawPeer) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if let Some(peer) = answer_handshake(stream, reply).await {
            script(peer).await;
        }
    });

    (format!("ws://{}/", addr), handle)
}

/// Start a raw server that accepts `connections` clients in turn
///
/// `script` gets the zero-based index of the connection, so a test can
/// behave differently on each reconnect. Every connection runs on its own
/// task, a peer that never hangs up does not hold back the next one.
pub async fn scripted_server_sequence<F, Fut>(
    reply: HandshakeReply,
    connections: usize,
    script: F,
) -> (String, JoinHandle<()>)
where
    F: Fn(usize, RawPeer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let script = Arc::new(script);

    let handle = tokio::spawn(async move {
        for index in 0..connections {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let script = Arc::clone(&script);
            let reply = reply.clone();
            tokio::spawn(async move {
                if let Some(peer) = answer_handshake(stream, reply).await {
                    script(index, peer).await;
                }
            });
        }
    });

    (format!("ws://{}/", addr), handle)
}

async fn answer_handshake(mut stream: TcpStream, reply: HandshakeReply) -> Option<RawPeer> {
    let head = read_request_head(&mut stream).await?;
    let key = request_header(&head, "Sec-WebSocket-Key").unwrap_or("").to_string();
    let accept = compute_accept_key(&key);

    let mut response = String::from(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n",
    );
    let mut trailing = Vec::new();
    match reply {
        HandshakeReply::Accept { protocol } => {
            response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));
            if let Some(protocol) = protocol {
                response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
            }
        }
        HandshakeReply::AcceptWith { trailing: bytes } => {
            response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));
            trailing = bytes;
        }
        HandshakeReply::MissingAccept => {}
        HandshakeReply::Silent => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return None;
        }
    }
    response.push_str("\r\n");

    let mut out = response.into_bytes();
    out.extend_from_slice(&trailing);
    stream.write_all(&out).await.ok()?;

    Some(RawPeer {
        stream,
        buf: BytesMut::new(),
        codec: FrameCodec::server(),
    })
}
