use crate::codec::FrameCodec;
use crate::handshake::WsUrl;
use crate::session::SessionSettings;
use crate::traits::*;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on TCP connect plus upgrade handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on waiting for the peer's close acknowledgment
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on a single message write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for WebSocketClient
///
/// Built with the type-state builder (`eventsockets::builder()`) or with
/// [`ClientConfig::new`] for the defaults.
pub struct ClientConfig {
    /// Target endpoint
    pub(crate) url: WsUrl,

    /// Subprotocols offered in the upgrade request, in preference order
    pub(crate) protocols: Vec<String>,

    /// Extra headers for the upgrade request
    pub(crate) headers: Arc<dyn HeaderProvider>,

    /// Opens the byte stream the session runs over
    pub(crate) connector: Arc<dyn Connector>,

    /// Outgoing payloads above this size are fragmented
    pub(crate) max_frame_size: usize,

    /// Largest accepted incoming message (and single frame payload)
    pub(crate) max_message_size: usize,

    pub(crate) connect_timeout: Duration,
    pub(crate) close_timeout: Duration,
    pub(crate) write_timeout: Duration,

    /// Tear the session down when nothing arrives for this long
    pub(crate) read_timeout: Option<Duration>,

    /// Interval between heartbeat pings
    pub(crate) heartbeat: Option<Duration>,

    /// Tear the session down when a heartbeat ping stays unanswered this long
    pub(crate) pong_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the endpoint
    pub fn new(url: WsUrl, protocols: Vec<String>) -> Self {
        Self {
            url,
            protocols,
            headers: Arc::new(NoHeaders),
            connector: Arc::new(TcpConnector::new()),
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

    /// Reject settings the session cannot run with
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(WsError::Configuration("max_frame_size must be positive".into()));
        }
        if self.max_message_size == 0 {
            return Err(WsError::Configuration("max_message_size must be positive".into()));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("close_timeout", self.close_timeout),
            ("write_timeout", self.write_timeout),
        ] {
            if value.is_zero() {
                return Err(WsError::Configuration(format!("{} must be positive", name)));
            }
        }
        if matches!(self.heartbeat, Some(interval) if interval.is_zero()) {
            return Err(WsError::Configuration("heartbeat interval must be positive".into()));
        }
        if self.pong_timeout.is_some() && self.heartbeat.is_none() {
            return Err(WsError::Configuration(
                "pong_timeout requires a heartbeat interval".into(),
            ));
        }
        for protocol in &self.protocols {
            let valid = !protocol.is_empty()
                && protocol
                    .bytes()
                    .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b));
            if !valid {
                return Err(WsError::Configuration(format!(
                    "invalid subprotocol name {:?}",
                    protocol
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
            heartbeat: self.heartbeat,
            pong_timeout: self.pong_timeout,
        }
    }

    /// Get a reference to the URL
    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Check if heartbeat is configured
    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("protocols", &self.protocols)
            .field("max_frame_size", &self.max_frame_size)
            .field("max_message_size", &self.max_message_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("close_timeout", &self.close_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("heartbeat", &self.heartbeat)
            .field("pong_timeout", &self.pong_timeout)
            .finish_non_exhaustive()
    }
}
