//! Heartbeat PONG tracking
//!
//! Each heartbeat ping carries an 8-byte big-endian sequence number. A
//! pong only counts as an answer when it echoes the sequence number of a
//! heartbeat ping, so unsolicited pongs and replies to caller-issued pings
//! never mask a dead connection. The overdue clock runs from the oldest
//! unanswered ping, so a steady stream of new pings cannot reset it.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Tracks outstanding heartbeat pings for one session
///
/// Timestamps are stored as milliseconds since an internal epoch so the
/// heartbeat task and the read loop can share the tracker lock-free.
pub struct PongTracker {
    epoch: Instant,
    /// Sequence number of the last ping sent (0 = none yet)
    last_seq: AtomicU64,
    /// Highest sequence number answered by a pong
    answered_seq: AtomicU64,
    /// When the oldest unanswered ping was sent (ms since epoch, 0 = none)
    unanswered_since_ms: AtomicU64,
    /// When the last matching pong arrived (ms since epoch, 0 = never)
    last_pong_ms: AtomicU64,
}

impl PongTracker {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_seq: AtomicU64::new(0),
            answered_seq: AtomicU64::new(0),
            unanswered_since_ms: AtomicU64::new(0),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        // +1 keeps a ping sent in the first millisecond distinguishable from "never"
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Record a new heartbeat ping and return its payload
    pub fn next_ping(&self) -> Bytes {
        let seq = self.last_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.unanswered_since_ms.compare_exchange(
            0,
            self.now_ms(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Bytes::copy_from_slice(&seq.to_be_bytes())
    }

    /// Record a received pong; returns whether it answered a heartbeat ping
    pub fn record_pong(&self, payload: &[u8]) -> bool {
        let Ok(raw) = <[u8; 8]>::try_from(payload) else {
            return false;
        };
        let seq = u64::from_be_bytes(raw);
        if seq == 0 || seq > self.last_seq.load(Ordering::Acquire) {
            return false;
        }
        let now = self.now_ms();
        self.answered_seq.fetch_max(seq, Ordering::AcqRel);
        self.last_pong_ms.store(now, Ordering::Release);
        // Later pings are still outstanding; their clock starts no earlier than now
        let pending = if seq >= self.last_seq.load(Ordering::Acquire) { 0 } else { now };
        self.unanswered_since_ms.store(pending, Ordering::Release);
        true
    }

    /// Whether a ping has gone unanswered for longer than `timeout`
    pub fn is_overdue(&self, timeout: Duration) -> bool {
        let sent = self.last_seq.load(Ordering::Acquire);
        if sent == 0 || self.answered_seq.load(Ordering::Acquire) >= sent {
            return false;
        }
        match self.unanswered_since_ms.load(Ordering::Acquire) {
            0 => false,
            since => self.now_ms().saturating_sub(since) > timeout.as_millis() as u64,
        }
    }

    /// Time since the last matching pong, if any arrived
    pub fn time_since_last_pong(&self) -> Option<Duration> {
        match self.last_pong_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(Duration::from_millis(self.now_ms().saturating_sub(ms))),
        }
    }
}

impl Default for PongTracker {
    fn default() -> Self {
        Self::new()
    }
}
