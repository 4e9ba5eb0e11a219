//! Heartbeat for WebSocket sessions
//!
//! # Architecture
//!
//! The heartbeat runs inside the session driver, raced against the read
//! loop and the writer, and is dropped together with them:
//!
//! ```text
//! ┌─────────────────────┐
//! │  Heartbeat          │
//! │  (session driver)   │
//! │                     │
//! │  Every X interval:  │
//! │  1. Wait for tick   │
//! │  2. Check pong age  │
//! │  3. Queue PING ─────┼──> Writer Queue ──> WebSocket
//! └─────────────────────┘
//! ```
//!
//! Each ping carries a sequence number from the session's
//! [`PongTracker`](crate::pong_tracker::PongTracker); the read loop records
//! matching pongs. When a pong timeout is configured and the latest ping
//! stays unanswered past it, the session is torn down with a `Timeout`
//! error.
//!
//! # Usage
//!
//! ```ignore
//! let client = eventsockets::builder()
//!     .url("ws://localhost:9001/")
//!     .heartbeat(Duration::from_secs(30))
//!     .pong_timeout(Duration::from_secs(90))
//!     .build()?;
//! ```

use crate::connection_state::ConnectionState;
use crate::error::WsError;
use crate::message::{close_code, CloseFrame};
use crate::session::{Outgoing, SessionShared};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Heartbeat loop for one session
///
/// Exits once the session leaves `Open`, the writer queue closes, or a
/// pong timeout fires.
pub(crate) async fn heartbeat_task(
    interval: Duration,
    pong_timeout: Option<Duration>,
    shared: Arc<SessionShared>,
) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the first immediate tick - wait for the first interval
    ticker.tick().await;
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!("Heartbeat task started with interval: {:?}", interval);

    loop {
        ticker.tick().await;

        if shared.state.get() != ConnectionState::Open {
            debug!("Heartbeat stopping, connection no longer open");
            break;
        }

        if let Some(timeout) = pong_timeout {
            if shared.pong_tracker.is_overdue(timeout) {
                warn!("No pong received within {:?}", timeout);
                shared.fail(
                    WsError::Timeout(format!("no pong received within {:?}", timeout)),
                    Some(CloseFrame::new(close_code::GOING_AWAY, "pong timeout")),
                );
                break;
            }
        }

        debug!("Heartbeat tick - sending ping");
        if shared
            .enqueue(Outgoing::Ping(shared.pong_tracker.next_ping()))
            .is_err()
        {
            debug!("Writer queue closed, shutting down heartbeat task");
            break;
        }
    }

    debug!("Heartbeat task exiting");
}
