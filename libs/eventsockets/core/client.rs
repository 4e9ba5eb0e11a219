use crate::config::ClientConfig;
use crate::connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState};
use crate::events::EventStream;
use crate::handshake::{HandshakeNegotiator, Negotiated, WsUrl};
use crate::codec::MAX_CONTROL_PAYLOAD;
use crate::session::{ConnectionSession, Streams};
use crate::traits::*;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake completed; carries the negotiated subprotocol
    Connected { protocol: Option<String> },
    /// Session torn down, by either side
    Disconnected,
}

/// Client metrics snapshot
#[derive(Debug, Clone)]
pub struct Metrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub connect_count: u64,
    pub connection_state: ConnectionState,
}

/// Event-stream WebSocket client
///
/// - Lock-free state management using atomics
/// - Incoming text, binary, error and lifecycle events fan out to any
///   number of subscribers through [`EventStream`]s
/// - Writes are queued to a single writer task and never block
/// - `connect` may be called again after `disconnect`; every connect
///   starts a fresh session, the event streams stay the same
pub struct WebSocketClient {
    config: Arc<ClientConfig>,
    state: Arc<AtomicConnectionState>,
    metrics: Arc<AtomicMetrics>,
    streams: Streams,
    /// Live session, if any; lock order is `session` then `pending_connect`
    session: Mutex<Option<ConnectionSession>>,
    /// Cancellation token of the connect attempt that owns `Connecting`
    pending_connect: Mutex<Option<Arc<Notify>>>,
    /// Serializes `disconnect` calls
    teardown: tokio::sync::Mutex<()>,
}

impl WebSocketClient {
    /// Client for `url` with default settings
    ///
    /// Use `eventsockets::builder()` for anything beyond the subprotocol list.
    pub fn new<I, S>(url: &str, protocols: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let protocols = protocols.into_iter().map(Into::into).collect();
        Self::from_config(ClientConfig::new(WsUrl::parse(url)?, protocols))
    }

    /// Create a client from a validated configuration
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(AtomicConnectionState::new(ConnectionState::Idle)),
            metrics: Arc::new(AtomicMetrics::new()),
            streams: Streams::new(),
            session: Mutex::new(None),
            pending_connect: Mutex::new(None),
            teardown: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the connection and run the upgrade handshake
    ///
    /// Bounded by `connect_timeout`. Fails with `AlreadyConnected` unless
    /// the client is idle or closed, and with `Aborted` when `disconnect`
    /// is called before the handshake completes. Every other failure is
    /// also published on the error stream and leaves the client `Closed`.
    pub async fn connect(&self) -> Result<()> {
        let token = {
            let mut pending = self.pending_connect.lock();
            let from = self.state.get();
            if !from.can_connect() || !self.state.transition(from, ConnectionState::Connecting) {
                return Err(WsError::AlreadyConnected);
            }
            let token = Arc::new(Notify::new());
            *pending = Some(Arc::clone(&token));
            token
        };

        info!("Connecting to {}", self.config.url);
        let connect_timeout = self.config.connect_timeout;
        let outcome = tokio::select! {
            _ = token.notified() => {
                info!("Connect to {} aborted", self.config.url);
                return Err(WsError::Aborted);
            }
            outcome = tokio::time::timeout(connect_timeout, establish(&self.config)) => {
                outcome.unwrap_or_else(|_| {
                    Err(WsError::Timeout(format!(
                        "handshake not completed within {:?}",
                        connect_timeout
                    )))
                })
            }
        };

        match outcome {
            Ok((transport, negotiated)) => {
                let mut slot = self.session.lock();
                // Session left over from an error teardown must go before the state is Open
                drop(slot.take());

                if !self.release_attempt(&token)
                    || !self
                        .state
                        .transition(ConnectionState::Connecting, ConnectionState::Open)
                {
                    debug!("Connect attempt lost to disconnect, dropping transport");
                    return Err(WsError::Aborted);
                }

                info!(
                    "Connected to {} (protocol: {})",
                    self.config.url,
                    negotiated.protocol.as_deref().unwrap_or("none")
                );
                self.metrics.increment_connects();
                self.streams.lifecycle.publish(ClientEvent::Connected {
                    protocol: negotiated.protocol.clone(),
                });

                *slot = Some(ConnectionSession::start(
                    transport,
                    negotiated.leftover,
                    negotiated.protocol,
                    self.config.session_settings(),
                    Arc::clone(&self.state),
                    Arc::clone(&self.metrics),
                    self.streams.clone(),
                ));
                Ok(())
            }
            Err(err) => {
                if !self.release_attempt(&token) {
                    return Err(WsError::Aborted);
                }
                warn!("Failed to connect to {}: {}", self.config.url, err);
                self.state
                    .transition(ConnectionState::Connecting, ConnectionState::Closed);
                self.streams.error.publish(ErrorEvent::from(&err));
                Err(err)
            }
        }
    }

    /// Clear the pending connect slot if it still holds `token`
    fn release_attempt(&self, token: &Arc<Notify>) -> bool {
        let mut pending = self.pending_connect.lock();
        match pending.as_ref() {
            Some(current) if Arc::ptr_eq(current, token) => {
                *pending = None;
                true
            }
            _ => false,
        }
    }

    /// Close the connection
    ///
    /// Sends a normal close frame and waits up to `close_timeout` for the
    /// peer to acknowledge it. A connect in flight is aborted instead.
    /// Calling this when already closed is a no-op. When it returns the
    /// client is not connected and the session publishes nothing more.
    pub async fn disconnect(&self) {
        let _serialized = self.teardown.lock().await;

        let session = {
            let mut slot = self.session.lock();
            let mut pending = self.pending_connect.lock();
            if let Some(token) = pending.take() {
                token.notify_one();
                if self
                    .state
                    .transition(ConnectionState::Connecting, ConnectionState::Closed)
                {
                    info!("Pending connect to {} cancelled", self.config.url);
                }
                return;
            }
            slot.take()
        };

        match session {
            Some(session) => session.shutdown(self.config.close_timeout).await,
            None => debug!("Disconnect called with no active session"),
        }
    }

    /// Queue a text message
    pub fn write_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(WsMessage::Text(text.into()))
    }

    /// Queue a binary message
    pub fn write_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(WsMessage::Binary(data.into()))
    }

    /// Serialize `value` and queue it as a text message
    pub fn write_json(&self, value: &serde_json::Value) -> Result<()> {
        self.send(WsMessage::Text(value.to_string()))
    }

    /// Queue a message of either kind
    ///
    /// Never waits for delivery. When not connected, returns `NotConnected`
    /// and publishes a matching non-fatal event on the error stream.
    pub fn send(&self, message: WsMessage) -> Result<()> {
        let result = match self.session.lock().as_ref() {
            Some(session) => session.write(message),
            None => Err(WsError::NotConnected),
        };
        self.report_misuse(result)
    }

    /// Send a ping control frame; the pong is consumed internally
    pub fn write_ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::ProtocolViolation(format!(
                "ping payload of {} bytes exceeds {}",
                payload.len(),
                MAX_CONTROL_PAYLOAD
            )));
        }
        let result = match self.session.lock().as_ref() {
            Some(session) => session.ping(payload),
            None => Err(WsError::NotConnected),
        };
        self.report_misuse(result)
    }

    fn report_misuse(&self, result: Result<()>) -> Result<()> {
        if let Err(WsError::NotConnected) = &result {
            debug!("Write rejected, not connected");
            self.streams
                .error
                .publish(ErrorEvent::from(&WsError::NotConnected));
        }
        result
    }

    /// Get current connection state
    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Check if connected
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state.is_open()
    }

    /// Subprotocol selected by the server for the open session
    pub fn protocol(&self) -> Option<String> {
        if !self.is_connected() {
            return None;
        }
        self.session
            .lock()
            .as_ref()
            .and_then(|session| session.protocol().map(str::to_string))
    }

    /// Get current metrics
    pub fn metrics(&self) -> Metrics {
        Metrics {
            messages_sent: self.metrics.messages_sent(),
            messages_received: self.metrics.messages_received(),
            frames_sent: self.metrics.frames_sent(),
            frames_received: self.metrics.frames_received(),
            connect_count: self.metrics.connect_count(),
            connection_state: self.state.get(),
        }
    }

    /// Complete incoming text messages
    pub fn text_events(&self) -> &EventStream<String> {
        &self.streams.text
    }

    /// Complete incoming binary messages
    pub fn data_events(&self) -> &EventStream<Bytes> {
        &self.streams.data
    }

    /// Connection-level errors, fatal and non-fatal
    pub fn error_events(&self) -> &EventStream<ErrorEvent> {
        &self.streams.error
    }

    /// Connected / Disconnected notifications
    pub fn lifecycle_events(&self) -> &EventStream<ClientEvent> {
        &self.streams.lifecycle
    }
}

impl std::fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("url", &self.config.url)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

/// TCP connect plus upgrade handshake
async fn establish(config: &ClientConfig) -> Result<(BoxedTransport, Negotiated)> {
    let headers = config.headers.get_headers().await;
    let mut transport = config.connector.connect(&config.url).await?;

    let negotiator = HandshakeNegotiator::new(config.url.clone(), config.protocols.clone(), headers);
    let negotiated = negotiator.negotiate(&mut transport).await?;
    Ok((transport, negotiated))
}
