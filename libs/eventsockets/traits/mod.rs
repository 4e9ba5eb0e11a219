//! # EventSockets Traits
//!
//! Shared types and the pluggable seams of the client:
//!
//! - **WsMessage / CloseFrame**: logical messages and close payloads
//! - **WsError / ErrorEvent**: the error taxonomy and its stream form
//! - **HeaderProvider**: extra headers for the upgrade request
//! - **Connector**: opens the byte stream a session runs over

pub mod connector;
pub mod error;
pub mod headers;
pub mod message;

// Re-export commonly used types
pub use connector::{BoxedTransport, Connector, TcpConnector, Transport};
pub use error::{ErrorEvent, ErrorKind, Result, WsError};
pub use headers::{HeaderProvider, Headers, NoHeaders, StaticHeaders};
pub use message::{close_code, CloseFrame, WsMessage};
