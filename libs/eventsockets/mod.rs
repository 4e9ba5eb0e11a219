//! # EventSockets
//!
//! An embeddable WebSocket client that delivers incoming messages and
//! errors as ordered, multi-subscriber event streams.
//!
//! ## Features
//!
//! - **Event streams**: text, binary, error and lifecycle streams, each with
//!   any number of independent subscribers
//! - **Lock-free state**: atomic connection state with compare-and-exchange transitions
//! - **Concurrent writes**: a single writer task keeps fragmented messages contiguous
//! - **Type-state builder**: compile-time guarantee that a URL is configured
//! - **Pluggable transport**: plain TCP by default, any `Connector` for TLS

pub mod traits;
pub mod core;

// Re-export all traits
pub use traits::*;

// Re-export core client functionality
pub use self::core::{
    assembler, builder, client, codec, config, connection_state, events, handshake, heartbeat,
    pong_tracker,
    assembler::MessageAssembler,
    builder::{states, WebSocketClientBuilder},
    client::{ClientEvent, Metrics, WebSocketClient},
    codec::{Frame, FrameCodec, Opcode, Role},
    config::ClientConfig,
    connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState},
    events::{EventStream, Observer, Subscription},
    handshake::{compute_accept_key, HandshakeNegotiator, Negotiated, WsUrl},
    pong_tracker::PongTracker,
};
pub(crate) use self::core::session;

// Convenience function
pub use self::core::builder as client_builder;
