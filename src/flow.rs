//! Flow-control state for both protocol versions.
//!
//! Version 1 bounds memory per session with a token bucket shared by every
//! stream ([`ReceiveBudget`]). Version 2 runs a sliding window per stream:
//! the receiver reports how many bytes it has consumed and how large its
//! buffer is ([`RecvWindow`]), and the sender never has more than that
//! window in flight ([`SendWindow`]).

use crate::error::{Result, SmuxError};
use crate::frame::INITIAL_PEER_WINDOW;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tokio::sync::Notify;

/// Which discipline a session runs, fixed by the protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowMode {
    BoundedBuffer,
    SlidingWindow,
}

impl FlowMode {
    pub(crate) fn for_version(version: u8) -> Self {
        if version >= 2 {
            FlowMode::SlidingWindow
        } else {
            FlowMode::BoundedBuffer
        }
    }
}

/// Connection-wide token bucket.
///
/// Tokens are taken when a data frame is delivered to a stream and given
/// back once the application reads the bytes or the stream is torn down.
/// The receive loop stops pulling frames while the bucket is empty.
#[derive(Debug)]
pub(crate) struct ReceiveBudget {
    tokens: AtomicI64,
    returned: Notify,
}

impl ReceiveBudget {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            tokens: AtomicI64::new(capacity as i64),
            returned: Notify::new(),
        }
    }

    pub(crate) fn available(&self) -> i64 {
        self.tokens.load(Ordering::Acquire)
    }

    pub(crate) fn consume(&self, n: usize) {
        self.tokens.fetch_sub(n as i64, Ordering::AcqRel);
    }

    pub(crate) fn give_back(&self, n: usize) {
        if n == 0 {
            return;
        }
        let previous = self.tokens.fetch_add(n as i64, Ordering::AcqRel);
        if previous + n as i64 > 0 {
            self.returned.notify_one();
        }
    }

    /// Resolves once tokens have been returned since the last wakeup.
    pub(crate) async fn returned(&self) {
        self.returned.notified().await;
    }
}

/// Receiver-side accounting of a v2 stream.
#[derive(Debug, Default)]
pub(crate) struct RecvWindow {
    bytes_read: u32,
    unacked: u32,
}

impl RecvWindow {
    /// Records `n` consumed bytes. Returns the cumulative consumed count to
    /// report in an UPD frame when one is due: after the very first read,
    /// and whenever the unreported amount reaches `threshold`.
    pub(crate) fn on_read(&mut self, n: usize, threshold: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }

        let n = n as u32;
        self.bytes_read = self.bytes_read.wrapping_add(n);
        self.unacked = self.unacked.saturating_add(n);

        if self.unacked >= threshold || self.bytes_read == n {
            self.unacked = 0;
            Some(self.bytes_read)
        } else {
            None
        }
    }
}

/// Sender-side window of a v2 stream.
///
/// Counters are 32-bit and wrap; in-flight is computed with wrapping
/// arithmetic and read as signed, matching the peer's counters.
#[derive(Debug)]
pub(crate) struct SendWindow {
    bytes_written: AtomicU32,
    peer_consumed: AtomicU32,
    peer_window: AtomicU32,
    updated: Notify,
}

impl SendWindow {
    pub(crate) fn new() -> Self {
        Self {
            bytes_written: AtomicU32::new(0),
            peer_consumed: AtomicU32::new(0),
            peer_window: AtomicU32::new(INITIAL_PEER_WINDOW),
            updated: Notify::new(),
        }
    }

    /// Bytes sent but not yet reported consumed by the peer.
    pub(crate) fn in_flight(&self) -> Result<u32> {
        let written = self.bytes_written.load(Ordering::Acquire);
        let consumed = self.peer_consumed.load(Ordering::Acquire);
        let in_flight = written.wrapping_sub(consumed) as i32;

        if in_flight < 0 {
            return Err(SmuxError::ProtocolViolation(format!(
                "peer reported {consumed} bytes consumed but only {written} were sent"
            )));
        }

        Ok(in_flight as u32)
    }

    /// Bytes that may be sent right now without overrunning the peer.
    pub(crate) fn available(&self) -> Result<usize> {
        let in_flight = self.in_flight()? as i64;
        let window = self.peer_window.load(Ordering::Acquire) as i64;
        Ok((window - in_flight).max(0) as usize)
    }

    pub(crate) fn record_sent(&self, n: usize) {
        self.bytes_written.fetch_add(n as u32, Ordering::AcqRel);
    }

    pub(crate) fn update(&self, consumed: u32, window: u32) {
        self.peer_consumed.store(consumed, Ordering::Release);
        self.peer_window.store(window, Ordering::Release);
        self.updated.notify_one();
    }

    /// Resolves on the next window update (or one that arrived while nobody
    /// was waiting).
    pub(crate) async fn updated(&self) {
        self.updated.notified().await;
    }
}
