//! One live WebSocket connection
//!
//! # Architecture
//!
//! ```text
//!                    ┌─────────────────────┐
//!   socket read ───> │  Read Loop (task)   │ ──publish──> text / data / error streams
//!                    │  decode, reassemble │
//!                    └─────────┬───────────┘
//!                              │ Pong / Close / Shutdown
//!                              v
//!  write_text ──┐    ┌─────────────────────┐
//!  write_data ──┼──> │  Writer (task)      │ ───> socket write
//!  heartbeat  ──┘    │  one message at a   │
//!                    │  time, fully written│
//!                    └─────────────────────┘
//! ```
//!
//! The read loop is the only owner of reassembly state and the only
//! publisher of message events. Every outgoing frame goes through the
//! writer task's queue, so the frames of one message are written with a
//! single `write_all` before the next queued item is looked at.
//!
//! The heartbeat runs inside the same driver task as the two loops, so a
//! session's tasks all stop together when the driver finishes or is aborted.
//!
//! Whoever wins the `Open -> Closing` compare-and-exchange (read loop,
//! writer, heartbeat or `disconnect`) owns the teardown and is the only
//! one allowed to publish a fatal error. The driver task moves the state
//! to `Closed` once both halves have finished.

use crate::assembler::MessageAssembler;
use crate::client::ClientEvent;
use crate::codec::{Frame, FrameCodec, Opcode};
use crate::connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState};
use crate::error::{ErrorEvent, Result, WsError};
use crate::events::EventStream;
use crate::heartbeat;
use crate::message::{close_code, CloseFrame, WsMessage};
use crate::pong_tracker::PongTracker;
use crate::traits::BoxedTransport;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Work items for the writer task
#[derive(Debug)]
pub(crate) enum Outgoing {
    Message(WsMessage),
    Ping(Bytes),
    Pong(Bytes),
    Close(CloseFrame),
    Shutdown,
}

/// The event streams a session publishes to
#[derive(Clone)]
pub struct Streams {
    pub text: EventStream<String>,
    pub data: EventStream<Bytes>,
    pub error: EventStream<ErrorEvent>,
    pub lifecycle: EventStream<ClientEvent>,
}

impl Streams {
    pub fn new() -> Self {
        Self {
            text: EventStream::new("text"),
            data: EventStream::new("data"),
            error: EventStream::new("error"),
            lifecycle: EventStream::new("lifecycle"),
        }
    }
}

impl Default for Streams {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session tuning taken from the client configuration
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    pub write_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub heartbeat: Option<Duration>,
    pub pong_timeout: Option<Duration>,
}

/// State shared by the session's tasks
pub(crate) struct SessionShared {
    pub(crate) state: Arc<AtomicConnectionState>,
    pub(crate) metrics: Arc<AtomicMetrics>,
    pub(crate) streams: Streams,
    pub(crate) writer_tx: mpsc::UnboundedSender<Outgoing>,
    pub(crate) pong_tracker: PongTracker,
    /// Wakes the read loop when another task starts teardown
    teardown: Notify,
    fatal_published: AtomicBool,
}

impl SessionShared {
    pub(crate) fn enqueue(&self, item: Outgoing) -> Result<()> {
        self.writer_tx.send(item).map_err(|_| WsError::NotConnected)
    }

    /// Tear the session down because of `err`
    ///
    /// Returns false when a teardown was already in progress, in which
    /// case nothing is published.
    pub(crate) fn fail(&self, err: WsError, close: Option<CloseFrame>) -> bool {
        let won = self
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing);

        if won {
            error!("Session failed: {}", err);
            if let Some(close) = close {
                let _ = self.writer_tx.send(Outgoing::Close(close));
            }
            self.publish_fatal(&err);
        } else {
            debug!("Ignoring error during teardown: {}", err);
        }

        let _ = self.writer_tx.send(Outgoing::Shutdown);
        self.teardown.notify_one();
        won
    }

    /// Publish the session's single terminal error event
    pub(crate) fn publish_fatal(&self, err: &WsError) {
        if !self.fatal_published.swap(true, Ordering::AcqRel) {
            self.streams.error.publish(ErrorEvent::from(err));
        }
    }
}

/// Handle to a running session, owned by the client facade
pub(crate) struct ConnectionSession {
    shared: Arc<SessionShared>,
    driver: JoinHandle<()>,
    protocol: Option<String>,
}

impl ConnectionSession {
    /// Spawn the read loop, writer and optional heartbeat over an upgraded transport
    ///
    /// `leftover` holds bytes read past the handshake response. The
    /// caller must already have moved the state to `Open`.
    pub(crate) fn start(
        transport: BoxedTransport,
        leftover: BytesMut,
        protocol: Option<String>,
        settings: SessionSettings,
        state: Arc<AtomicConnectionState>,
        metrics: Arc<AtomicMetrics>,
        streams: Streams,
    ) -> Self {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            state,
            metrics,
            streams,
            writer_tx,
            pong_tracker: PongTracker::new(),
            teardown: Notify::new(),
            fatal_published: AtomicBool::new(false),
        });

        let (read_half, write_half) = tokio::io::split(transport);
        let driver = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                // Never outlives the driver
                let heartbeat = {
                    let shared = Arc::clone(&shared);
                    let (interval, pong_timeout) = (settings.heartbeat, settings.pong_timeout);
                    async move {
                        if let Some(interval) = interval {
                            heartbeat::heartbeat_task(interval, pong_timeout, shared).await;
                        }
                        futures::future::pending::<()>().await
                    }
                };

                let reader = read_loop(read_half, leftover, Arc::clone(&shared), settings.clone());
                let writer = write_loop(write_half, writer_rx, Arc::clone(&shared), settings);
                tokio::select! {
                    _ = futures::future::join(reader, writer) => {}
                    _ = heartbeat => {}
                }

                shared.streams.lifecycle.publish(ClientEvent::Disconnected);
                shared
                    .state
                    .transition(ConnectionState::Closing, ConnectionState::Closed);
                info!("Connection closed");
            })
        };

        Self {
            shared,
            driver,
            protocol,
        }
    }

    pub(crate) fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Queue a message; fails unless the session is open
    pub(crate) fn write(&self, message: WsMessage) -> Result<()> {
        if !self.shared.state.is_open() {
            return Err(WsError::NotConnected);
        }
        self.shared.enqueue(Outgoing::Message(message))
    }

    pub(crate) fn ping(&self, payload: Bytes) -> Result<()> {
        if !self.shared.state.is_open() {
            return Err(WsError::NotConnected);
        }
        self.shared.enqueue(Outgoing::Ping(payload))
    }

    /// Close handshake, bounded by `close_timeout`
    ///
    /// Sends a normal close when the session is still open, then waits for
    /// the read loop to see the peer's close (or EOF) and the writer to shut
    /// the socket down. On timeout the tasks are aborted. In every case the
    /// session is `Closed` and silent when this returns.
    pub(crate) async fn shutdown(mut self, close_timeout: Duration) {
        if self
            .shared
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            info!("Closing connection");
            let _ = self.shared.enqueue(Outgoing::Close(CloseFrame::normal()));
        }

        if tokio::time::timeout(close_timeout, &mut self.driver).await.is_err() {
            warn!("Close handshake not completed within {:?}", close_timeout);
            self.driver.abort();
            let _ = (&mut self.driver).await;

            self.shared.publish_fatal(&WsError::Timeout(format!(
                "close acknowledgment not received within {:?}",
                close_timeout
            )));
            self.shared.streams.lifecycle.publish(ClientEvent::Disconnected);
            self.shared
                .state
                .transition(ConnectionState::Closing, ConnectionState::Closed);
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if self.driver.is_finished() {
            return;
        }
        // Client dropped without disconnect: close best-effort in the background
        if self
            .shared
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            let _ = self
                .shared
                .enqueue(Outgoing::Close(CloseFrame::new(close_code::GOING_AWAY, "")));
        }
        let _ = self.shared.enqueue(Outgoing::Shutdown);
        self.shared.teardown.notify_one();
    }
}

enum Flow {
    Continue,
    Stop,
}

async fn read_loop(
    mut reader: ReadHalf<BoxedTransport>,
    mut buf: BytesMut,
    shared: Arc<SessionShared>,
    settings: SessionSettings,
) {
    let codec = FrameCodec::client().with_max_payload_size(settings.max_message_size);
    let mut assembler = MessageAssembler::new(settings.max_message_size);
    debug!("Read loop started");

    'outer: loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    shared.metrics.increment_frames_received();
                    if let Flow::Stop = handle_frame(frame, &mut assembler, &shared) {
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let close = CloseFrame::new(err.close_code(), "");
                    shared.fail(err, Some(close));
                    break 'outer;
                }
            }
        }

        buf.reserve(8 * 1024);
        let read = tokio::select! {
            _ = shared.teardown.notified() => {
                debug!("Read loop stopping for teardown");
                break 'outer;
            }
            read = read_some(&mut reader, &mut buf, settings.read_timeout) => read,
        };

        match read {
            Ok(0) => {
                if shared.state.is_open() {
                    shared.fail(
                        WsError::TransportClosed("peer closed the socket without a close frame".into()),
                        None,
                    );
                } else {
                    let _ = shared.enqueue(Outgoing::Shutdown);
                }
                break;
            }
            Ok(_) => {}
            Err(err) => {
                let close = matches!(err, WsError::Timeout(_))
                    .then(|| CloseFrame::new(close_code::GOING_AWAY, "idle timeout"));
                shared.fail(err, close);
                break;
            }
        }
    }

    debug!("Read loop exiting");
}

async fn read_some(
    reader: &mut ReadHalf<BoxedTransport>,
    buf: &mut BytesMut,
    timeout: Option<Duration>,
) -> Result<usize> {
    let read = match timeout {
        Some(limit) => tokio::time::timeout(limit, reader.read_buf(buf))
            .await
            .map_err(|_| WsError::Timeout(format!("no data received within {:?}", limit)))?,
        None => reader.read_buf(buf).await,
    };
    read.map_err(|e| WsError::TransportClosed(e.to_string()))
}

fn handle_frame(frame: Frame, assembler: &mut MessageAssembler, shared: &SessionShared) -> Flow {
    match frame.opcode {
        Opcode::Ping => {
            debug!("Ping received ({} bytes), queueing pong", frame.payload.len());
            if shared.state.is_open() {
                let _ = shared.enqueue(Outgoing::Pong(frame.payload));
            }
            Flow::Continue
        }
        Opcode::Pong => {
            if !shared.pong_tracker.record_pong(&frame.payload) {
                debug!("Unsolicited pong ({} bytes)", frame.payload.len());
            }
            Flow::Continue
        }
        Opcode::Close => {
            let close = match CloseFrame::parse(&frame.payload) {
                Ok(close) => close,
                Err(err) => {
                    shared.fail(err, Some(CloseFrame::new(close_code::PROTOCOL_ERROR, "")));
                    return Flow::Stop;
                }
            };

            if shared
                .state
                .transition(ConnectionState::Open, ConnectionState::Closing)
            {
                let description = match &close {
                    Some(close) => format!("peer closed the connection with {}", close),
                    None => "peer closed the connection".to_string(),
                };
                info!("{}", description);
                let echo = close
                    .map(|c| CloseFrame::new(c.code, ""))
                    .unwrap_or_else(CloseFrame::normal);
                let _ = shared.enqueue(Outgoing::Close(echo));
                shared.publish_fatal(&WsError::TransportClosed(description));
            } else {
                debug!("Close acknowledged by peer");
            }
            let _ = shared.enqueue(Outgoing::Shutdown);
            Flow::Stop
        }
        Opcode::Text | Opcode::Binary | Opcode::Continuation => match assembler.push(frame) {
            Ok(Some(message)) => {
                if shared.state.is_open() {
                    shared.metrics.increment_received();
                    match message {
                        WsMessage::Text(text) => {
                            shared.streams.text.publish(text);
                        }
                        WsMessage::Binary(data) => {
                            shared.streams.data.publish(data);
                        }
                    }
                } else {
                    debug!("Discarding message received while closing");
                }
                Flow::Continue
            }
            Ok(None) => Flow::Continue,
            Err(err) => {
                let close = CloseFrame::new(err.close_code(), "");
                shared.fail(err, Some(close));
                Flow::Stop
            }
        },
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedTransport>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<SessionShared>,
    settings: SessionSettings,
) {
    let codec = FrameCodec::client().with_max_frame_size(settings.max_frame_size);
    let mut close_sent = false;
    debug!("Writer started");

    while let Some(item) = rx.recv().await {
        let mut bytes = BytesMut::new();
        let mut is_message = false;
        let mut frames = 1u64;
        match item {
            Outgoing::Shutdown => break,
            _ if close_sent => {
                debug!("Dropping outgoing item queued after close");
                continue;
            }
            Outgoing::Message(message) => {
                bytes = codec.encode(&message);
                frames = message.len().div_ceil(codec.max_frame_size()).max(1) as u64;
                is_message = true;
            }
            Outgoing::Ping(payload) => codec.encode_frame(&Frame::ping(payload), &mut bytes),
            Outgoing::Pong(payload) => codec.encode_frame(&Frame::pong(payload), &mut bytes),
            Outgoing::Close(close) => {
                close_sent = true;
                codec.encode_frame(&Frame::close(Some(&close)), &mut bytes);
            }
        }

        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        match tokio::time::timeout(settings.write_timeout, write).await {
            Ok(Ok(())) => {
                shared.metrics.add_frames_sent(frames);
                if is_message {
                    shared.metrics.increment_sent();
                }
            }
            Ok(Err(e)) => {
                shared.fail(WsError::TransportClosed(format!("write failed: {}", e)), None);
                break;
            }
            Err(_) => {
                shared.fail(
                    WsError::Timeout(format!("write not completed within {:?}", settings.write_timeout)),
                    None,
                );
                break;
            }
        }
    }

    let _ = tokio::time::timeout(settings.write_timeout, writer.shutdown()).await;
    debug!("Writer exiting");
}
