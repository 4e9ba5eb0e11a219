use crate::message::close_code;
use thiserror::Error;

/// Main error type for eventsockets
#[derive(Error, Debug)]
pub enum WsError {
    /// Upgrade handshake rejected or malformed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer violated the framing protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Text payload that is not valid UTF-8
    #[error("Protocol violation: invalid payload: {0}")]
    InvalidPayload(String),

    /// Frame or message larger than the configured limit
    #[error("Protocol violation: message too big: {0}")]
    MessageTooBig(String),

    /// Peer closed the connection or the socket failed
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Write attempted while the session is not open
    #[error("Not connected")]
    NotConnected,

    /// Connect attempted while a session is already active
    #[error("Already connected")]
    AlreadyConnected,

    /// Pending connect was cancelled by a disconnect
    #[error("Connect aborted by disconnect")]
    Aborted,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// Shorthand for a protocol violation with a static reason
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        WsError::ProtocolViolation(reason.into())
    }

    /// Map the error onto the event taxonomy published on the error stream
    pub fn kind(&self) -> ErrorKind {
        match self {
            WsError::HandshakeFailed(_) | WsError::Configuration(_) => ErrorKind::HandshakeFailed,
            WsError::ProtocolViolation(_)
            | WsError::InvalidPayload(_)
            | WsError::MessageTooBig(_) => ErrorKind::ProtocolViolation,
            WsError::TransportClosed(_) | WsError::Io(_) | WsError::Aborted => {
                ErrorKind::TransportClosed
            }
            WsError::Timeout(_) => ErrorKind::Timeout,
            WsError::NotConnected => ErrorKind::NotConnected,
            WsError::AlreadyConnected => ErrorKind::AlreadyConnected,
        }
    }

    /// Close code sent to the peer when this error fails a session
    pub fn close_code(&self) -> u16 {
        match self {
            WsError::InvalidPayload(_) => close_code::INVALID_PAYLOAD,
            WsError::MessageTooBig(_) => close_code::MESSAGE_TOO_BIG,
            _ => close_code::PROTOCOL_ERROR,
        }
    }

    /// Whether this error ends the session it occurred on
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

/// Category of an error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    HandshakeFailed,
    ProtocolViolation,
    TransportClosed,
    Timeout,
    NotConnected,
    AlreadyConnected,
}

impl ErrorKind {
    /// Caller-misuse kinds leave the session untouched
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::NotConnected | ErrorKind::AlreadyConnected)
    }
}

/// An error published on the error stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub description: String,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

impl From<&WsError> for ErrorEvent {
    fn from(err: &WsError) -> Self {
        ErrorEvent::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}

/// Result type for eventsockets operations
pub type Result<T> = std::result::Result<T, WsError>;
