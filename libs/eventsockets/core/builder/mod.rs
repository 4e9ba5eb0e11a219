pub mod states;

use crate::client::WebSocketClient;
use crate::config::{ClientConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
use crate::codec::FrameCodec;
use crate::handshake::WsUrl;
use crate::traits::*;
use states::*;
use std::sync::Arc;
use std::time::Duration;

/// Type-state builder for WebSocketClient
///
/// The URL is the only required field; the type system enforces that it
/// is set before `build()` becomes available. Everything else falls back
/// to the defaults of [`ClientConfig::new`].
pub struct WebSocketClientBuilder<U>
where
    U: UrlState,
{
    _state: TypeState<U>,
    url: Option<String>,
    protocols: Vec<String>,
    headers: Option<Arc<dyn HeaderProvider>>,
    connector: Option<Arc<dyn Connector>>,
    max_frame_size: usize,
    max_message_size: usize,
    connect_timeout: Duration,
    close_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Option<Duration>,
    heartbeat: Option<Duration>,
    pong_timeout: Option<Duration>,
}

impl WebSocketClientBuilder<NoUrl> {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            _state: TypeState::new(),
            url: None,
            protocols: Vec::new(),
            headers: None,
            connector: None,
            max_frame_size: FrameCodec::DEFAULT_MAX_FRAME_SIZE,
            max_message_size: FrameCodec::DEFAULT_MAX_PAYLOAD_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: None,
            heartbeat: None,
            pong_timeout: None,
        }
    }
}

impl Default for WebSocketClientBuilder<NoUrl> {
    fn default() -> Self {
        Self::new()
    }
}

// URL setting
impl WebSocketClientBuilder<NoUrl> {
    pub fn url(self, url: impl Into<String>) -> WebSocketClientBuilder<HasUrl> {
        WebSocketClientBuilder {
            _state: TypeState::new(),
            url: Some(url.into()),
            protocols: self.protocols,
            headers: self.headers,
            connector: self.connector,
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
            connect_timeout: self.connect_timeout,
            close_timeout: self.close_timeout,
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
            heartbeat: self.heartbeat,
            pong_timeout: self.pong_timeout,
        }
    }
}

// Optional configuration methods
impl<U> WebSocketClientBuilder<U>
where
    U: UrlState,
{
    /// Add a subprotocol to offer in the upgrade request
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols.extend(protocols.into_iter().map(Into::into));
        self
    }

    pub fn headers(mut self, provider: impl HeaderProvider + 'static) -> Self {
        self.headers = Some(Arc::new(provider));
        self
    }

    /// Replace the plain TCP connector, e.g. with one that layers TLS
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Outgoing messages above this size are split into fragments
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Largest incoming message accepted before the session fails with 1009
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long `disconnect` waits for the peer's close acknowledgment
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Fail the session with `Timeout` when nothing is received for this long
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Send a ping every `interval` while connected
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    /// Set the PONG timeout for connection health tracking
    ///
    /// If the latest heartbeat ping is not answered within this duration
    /// the session is torn down with a `Timeout` error. Requires
    /// `heartbeat()`.
    ///
    /// Recommended value: 3x the heartbeat interval (e.g., 15s for 5s heartbeat)
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = Some(timeout);
        self
    }
}

// Build method - only available when the URL is set
impl WebSocketClientBuilder<HasUrl> {
    pub fn build(self) -> Result<WebSocketClient> {
        let url = self
            .url
            .ok_or_else(|| WsError::Configuration("URL must be set".into()))?;

        let mut config = ClientConfig::new(WsUrl::parse(&url)?, self.protocols);
        if let Some(headers) = self.headers {
            config.headers = headers;
        }
        if let Some(connector) = self.connector {
            config.connector = connector;
        }
        config.max_frame_size = self.max_frame_size;
        config.max_message_size = self.max_message_size;
        config.connect_timeout = self.connect_timeout;
        config.close_timeout = self.close_timeout;
        config.write_timeout = self.write_timeout;
        config.read_timeout = self.read_timeout;
        config.heartbeat = self.heartbeat;
        config.pong_timeout = self.pong_timeout;

        WebSocketClient::from_config(config)
    }
}
