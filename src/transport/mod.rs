//! Byte-level link to the divider.
//!
//! A [`Link`] owns the physical connection. It writes raw bytes and exposes the
//! messages assembled from inbound bytes through a non-blocking
//! [`Link::poll_message`]. It knows nothing about what the messages mean.
//!
//! [`serial::SerialTransport`] is the production implementation;
//! [`mock_serial`] provides an in-memory port for tests.

pub mod mock_serial;
pub mod serial;

pub use serial::SerialTransport;

use crate::error::AppResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Whether the link can currently carry traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Open and writable
    Up,
    /// Never opened, failed, or closed. Sends are refused.
    Down,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Up => write!(f, "up"),
            LinkStatus::Down => write!(f, "down"),
        }
    }
}

/// Transport used by the engine loops.
///
/// Implementations must tolerate concurrent calls from the dispatch loop
/// (writes), the receive loop (polls) and their own reader.
#[async_trait]
pub trait Link: Send + Sync {
    /// Current link status.
    fn status(&self) -> LinkStatus;

    /// Begin turning inbound bytes into messages. Calling it again is a no-op.
    fn start_reader(&self);

    /// Write raw bytes.
    ///
    /// Returns [`DividerError::LinkDown`](crate::error::DividerError::LinkDown)
    /// without touching the port while the link is down.
    async fn write(&self, data: &[u8]) -> AppResult<()>;

    /// Write one command byte.
    async fn send_byte(&self, byte: u8) -> AppResult<()> {
        self.write(&[byte]).await
    }

    /// Write the literal bytes of `text`.
    async fn send_text(&self, text: &str) -> AppResult<()> {
        self.write(text.as_bytes()).await
    }

    /// Remove and return the oldest assembled message, if any.
    fn poll_message(&self) -> Option<String>;

    /// Release the port and stop the reader.
    ///
    /// Returns `true` only for the call that actually closed the link.
    async fn close(&self) -> bool;
}

/// Bounded FIFO of assembled messages.
///
/// Filled by the reader, drained by the receive loop. When full, the oldest
/// message is dropped to make room.
#[derive(Debug)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl MessageQueue {
    /// Create a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Append a message. Returns the message evicted to make room, if any.
    pub fn push(&self, message: String) -> Option<String> {
        let mut queue = self.inner.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(message);
        evicted
    }

    /// Remove the oldest message.
    pub fn pop(&self) -> Option<String> {
        self.inner.lock().pop_front()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Inbound traffic counters.
#[derive(Debug, Default)]
pub struct LinkStats {
    frames: AtomicU64,
    overruns: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    /// Messages assembled from the byte stream
    pub frames: u64,
    /// Frames lost to buffer overrun
    pub overruns: u64,
    /// Messages evicted from a full message queue
    pub dropped: u64,
}

impl LinkStats {
    pub(crate) fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_overruns(&self, total: u64) {
        self.overruns.store(total, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
