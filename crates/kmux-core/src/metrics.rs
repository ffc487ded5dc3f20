//! Counters exposed for observability.
//!
//! Each component owns a set of atomic counters and hands out a
//! serializable snapshot, so hosts can log or export them as JSON.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

// =============================================================================
// Connection
// =============================================================================

/// Stream and control-frame counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    streams_accepted: AtomicU64,
    streams_refused: AtomicU64,
    streams_completed: AtomicU64,
    streams_aborted: AtomicU64,
    control_frames_received: AtomicU64,
    timeouts: AtomicU64,
}

impl ConnectionMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self) {
        bump(&self.streams_accepted);
    }

    pub(crate) fn record_refused(&self) {
        bump(&self.streams_refused);
    }

    pub(crate) fn record_completed(&self) {
        bump(&self.streams_completed);
    }

    pub(crate) fn record_aborted(&self) {
        bump(&self.streams_aborted);
    }

    pub(crate) fn record_control_frame(&self) {
        bump(&self.control_frames_received);
    }

    pub(crate) fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            streams_accepted: read(&self.streams_accepted),
            streams_refused: read(&self.streams_refused),
            streams_completed: read(&self.streams_completed),
            streams_aborted: read(&self.streams_aborted),
            control_frames_received: read(&self.control_frames_received),
            timeouts: read(&self.timeouts),
        }
    }
}

/// Serializable view of [`ConnectionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Request streams registered.
    pub streams_accepted: u64,
    /// Request streams refused over the concurrency limit.
    pub streams_refused: u64,
    /// Streams that closed normally.
    pub streams_completed: u64,
    /// Streams that were aborted.
    pub streams_aborted: u64,
    /// Frames received on the inbound control stream.
    pub control_frames_received: u64,
    /// Timeouts observed by the heartbeat.
    pub timeouts: u64,
}

// =============================================================================
// Admission
// =============================================================================

/// Serializable view of an admission queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    /// Requests currently holding a slot.
    pub active: usize,
    /// Requests waiting for a slot.
    pub queued: usize,
    /// `active + queued`.
    pub total_requests: usize,
    /// Every admission attempt ever made.
    pub total_seen: u64,
    /// Attempts rejected because the queue was full.
    pub rejected: u64,
}

// =============================================================================
// Heartbeat
// =============================================================================

/// Tick counters for a heartbeat.
#[derive(Debug, Default)]
pub struct HeartbeatMetrics {
    ticks: AtomicU64,
    slow_ticks: AtomicU64,
    callback_failures: AtomicU64,
}

impl HeartbeatMetrics {
    pub(crate) fn record_tick(&self) {
        bump(&self.ticks);
    }

    pub(crate) fn record_slow_tick(&self) {
        bump(&self.slow_ticks);
    }

    pub(crate) fn record_callback_failure(&self) {
        bump(&self.callback_failures);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> HeartbeatSnapshot {
        HeartbeatSnapshot {
            ticks: read(&self.ticks),
            slow_ticks: read(&self.slow_ticks),
            callback_failures: read(&self.callback_failures),
        }
    }
}

/// Serializable view of [`HeartbeatMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    /// Completed ticks.
    pub ticks: u64,
    /// Ticks that took longer than the interval.
    pub slow_ticks: u64,
    /// Handler callbacks that failed or panicked.
    pub callback_failures: u64,
}
