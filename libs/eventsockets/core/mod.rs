//! # EventSockets core
//!
//! Protocol engine and client facade:
//!
//! - **codec / assembler**: RFC 6455 framing and fragment reassembly
//! - **handshake**: HTTP upgrade request and response validation
//! - **session**: read loop, writer task and teardown for one connection
//! - **events**: ordered multi-subscriber event streams
//! - **client / builder / config**: the public facade and its configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use eventsockets::WsError;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WsError> {
//!     let client = eventsockets::builder()
//!         .url("ws://localhost:9001/chat")
//!         .protocols(["chat", "superchat"])
//!         .heartbeat(Duration::from_secs(30))
//!         .build()?;
//!
//!     let text = client.text_events().subscribe();
//!     client.connect().await?;
//!     client.write_text("hello")?;
//!
//!     if let Ok(message) = text.recv_timeout(Duration::from_secs(5)) {
//!         println!("Received: {}", message);
//!     }
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod builder;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection_state;
pub mod events;
pub mod handshake;
pub mod heartbeat;
pub mod pong_tracker;
pub(crate) mod session;

// Re-export main types
pub use assembler::MessageAssembler;
pub use builder::{states, WebSocketClientBuilder};
pub use client::{ClientEvent, Metrics, WebSocketClient};
pub use codec::{Frame, FrameCodec, Opcode, Role};
pub use config::ClientConfig;
pub use connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState};
pub use events::{EventStream, Observer, Subscription};
pub use handshake::{compute_accept_key, HandshakeNegotiator, Negotiated, WsUrl};
pub use pong_tracker::PongTracker;

/// Create a new WebSocket client builder
///
/// # Example
/// ```ignore
/// let client = eventsockets::builder()
///     .url("ws://localhost:9001/")
///     .protocol("chat")
///     .close_timeout(Duration::from_secs(2))
///     .build()?;
/// ```
pub fn builder() -> WebSocketClientBuilder<builder::states::NoUrl> {
    WebSocketClientBuilder::new()
}
