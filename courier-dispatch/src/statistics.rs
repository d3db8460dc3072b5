//! Per-connection delivery counters and stall detection.
//!
//! Connectors report byte progress through [`ProgressListener`] while a send
//! or receive is in flight. A health ping compares the running byte total
//! against the value seen by the previous ping:
//!
//! ```text
//! in flight? ──no──> Idle
//!     │
//!    yes
//!     │
//! bytes moved since last check? ──yes──> Advancing
//!     │
//!     no
//!     v
//!  Stalled   (slow transfer or hung socket, the caller decides)
//! ```

use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;

/// Callbacks a connector uses to report transfer progress.
pub trait ProgressListener: Send + Sync {
    /// `bytes` more have been read from the endpoint.
    fn progress_read(&self, bytes: u64);

    /// `bytes` more have been written to the endpoint.
    fn progress_write(&self, bytes: u64);
}

/// Result of [`DeliveryStatistics::check_progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Progress {
    /// Nothing in flight.
    Idle,
    /// In flight and bytes moved since the previous check.
    Advancing,
    /// In flight with no bytes moved since the previous check.
    Stalled,
}

/// Counters for one physical connection.
#[derive(Debug)]
pub struct DeliveryStatistics {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    send_failures: AtomicU64,
    pings: AtomicU64,
    in_flight: AtomicUsize,
    /// Byte total observed by the previous progress check
    last_checked_bytes: AtomicU64,
    created_at: Instant,
    last_progress_at: Mutex<Option<Instant>>,
}

impl Default for DeliveryStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryStatistics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            pings: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            last_checked_bytes: AtomicU64::new(0),
            created_at: Instant::now(),
            last_progress_at: Mutex::new(None),
        }
    }

    /// Mark an operation as in flight until the returned guard is dropped.
    #[must_use = "the operation is only in flight while the guard lives"]
    pub fn begin(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight { statistics: self }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_read
            .load(Ordering::Acquire)
            .saturating_add(self.bytes_written.load(Ordering::Acquire))
    }

    /// Compare the byte total against the previous check and remember the
    /// current value for the next one.
    pub fn check_progress(&self) -> Progress {
        let total = self.total_bytes();
        let previous = self.last_checked_bytes.swap(total, Ordering::AcqRel);

        if !self.is_in_progress() {
            Progress::Idle
        } else if total != previous {
            Progress::Advancing
        } else {
            Progress::Stalled
        }
    }

    pub fn record_sent(&self, messages: usize) {
        self.messages_sent
            .fetch_add(u64::try_from(messages).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn record_received(&self, messages: usize) {
        self.messages_received
            .fetch_add(u64::try_from(messages).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping(&self) {
        self.pings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// Time since bytes last moved in either direction.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_progress_at.lock().map(|at| at.elapsed())
    }

    fn touch(&self) {
        *self.last_progress_at.lock() = Some(Instant::now());
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            pings: self.pings.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            uptime_ms: u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            idle_ms: self
                .idle_for()
                .map(|idle| u64::try_from(idle.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

impl ProgressListener for DeliveryStatistics {
    fn progress_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::AcqRel);
        self.touch();
    }

    fn progress_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::AcqRel);
        self.touch();
    }
}

/// Guard returned by [`DeliveryStatistics::begin`].
#[derive(Debug)]
pub struct InFlight<'a> {
    statistics: &'a DeliveryStatistics,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.statistics.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time copy of [`DeliveryStatistics`] for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
    pub pings: u64,
    pub in_flight: usize,
    pub uptime_ms: u64,
    pub idle_ms: Option<u64>,
}
