//! Per-connection timeout bookkeeping.
//!
//! [`TimeoutControl`] keeps one deadline per [`TimeoutReason`] plus read and
//! write data-rate accounting. It never acts on its own: the heartbeat calls
//! [`TimeoutControl::tick`] and the connection decides what an expired
//! deadline means.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::constants::{DEFAULT_MIN_DATA_RATE, DEFAULT_MIN_DATA_RATE_GRACE, MAX_DATA_RATE_WAIT};
use crate::error::{Error, Result};

/// Why a connection timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    /// No active streams for the keep-alive period.
    KeepAlive,
    /// Peer did not finish its preamble in time.
    RequestHeaders,
    /// Peer sent data slower than the minimum rate.
    ReadDataRate,
    /// Peer consumed data slower than the minimum rate.
    WriteDataRate,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutReason::KeepAlive => "keep-alive",
            TimeoutReason::RequestHeaders => "request headers",
            TimeoutReason::ReadDataRate => "read data rate",
            TimeoutReason::WriteDataRate => "write data rate",
        };
        f.write_str(name)
    }
}

/// Minimum data rate enforced after a grace period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinDataRate {
    /// Bytes per second the peer must sustain.
    pub bytes_per_second: f64,
    /// Time before the rate is enforced.
    #[serde(with = "crate::config::duration_millis")]
    pub grace_period: Duration,
}

impl MinDataRate {
    /// Create a rate. Fails unless `bytes_per_second` is finite and positive.
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Result<Self> {
        let rate = Self {
            bytes_per_second,
            grace_period,
        };
        rate.validate()?;
        Ok(rate)
    }

    /// Check that the rate can be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.bytes_per_second.is_finite() && self.bytes_per_second > 0.0 {
            Ok(())
        } else {
            Err(Error::InvalidConfig {
                message: format!(
                    "minimum data rate must be a positive number of bytes per second, got {}",
                    self.bytes_per_second
                ),
            })
        }
    }

    /// Time `bytes` may take at this rate, capped at [`MAX_DATA_RATE_WAIT`].
    fn time_for(&self, bytes: u64) -> Duration {
        Duration::try_from_secs_f64(bytes as f64 / self.bytes_per_second)
            .map_or(MAX_DATA_RATE_WAIT, |needed| needed.min(MAX_DATA_RATE_WAIT))
    }
}

impl Default for MinDataRate {
    fn default() -> Self {
        Self {
            bytes_per_second: DEFAULT_MIN_DATA_RATE,
            grace_period: DEFAULT_MIN_DATA_RATE_GRACE,
        }
    }
}

/// An armed deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutDeadline {
    /// What expires.
    pub reason: TimeoutReason,
    /// When it expires.
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
struct ReadTiming {
    concurrent: usize,
    last_tick: Option<Instant>,
    elapsed: Duration,
    bytes: u64,
}

#[derive(Debug, Default)]
struct WriteTiming {
    concurrent: usize,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct TimeoutState {
    keep_alive: Option<Instant>,
    request_headers: Option<Instant>,
    read: ReadTiming,
    write: WriteTiming,
}

impl TimeoutState {
    fn slot(&mut self, reason: TimeoutReason) -> Option<&mut Option<Instant>> {
        match reason {
            TimeoutReason::KeepAlive => Some(&mut self.keep_alive),
            TimeoutReason::RequestHeaders => Some(&mut self.request_headers),
            TimeoutReason::WriteDataRate => Some(&mut self.write.deadline),
            TimeoutReason::ReadDataRate => None,
        }
    }
}

/// Deadline and data-rate tracking for one connection.
#[derive(Debug)]
pub struct TimeoutControl {
    clock: Arc<dyn Clock>,
    min_read_rate: Option<MinDataRate>,
    min_write_rate: Option<MinDataRate>,
    state: Mutex<TimeoutState>,
}

impl TimeoutControl {
    /// Create timeout control with optional minimum data rates.
    ///
    /// Fails if either rate is not positive.
    pub fn new(
        clock: Arc<dyn Clock>,
        min_read_rate: Option<MinDataRate>,
        min_write_rate: Option<MinDataRate>,
    ) -> Result<Self> {
        for rate in min_read_rate.iter().chain(min_write_rate.iter()) {
            rate.validate()?;
        }
        Ok(Self {
            clock,
            min_read_rate,
            min_write_rate,
            state: Mutex::new(TimeoutState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TimeoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm (or re-arm) the deadline for `reason`, `after` from now.
    ///
    /// Data-rate deadlines are derived from timed I/O and cannot be set directly.
    pub fn set_timeout(&self, reason: TimeoutReason, after: Duration) {
        let expires_at = self.clock.now() + after;
        if let Some(slot) = self.lock().slot(reason) {
            *slot = Some(expires_at);
        }
    }

    /// Re-arm after I/O activity. Same as [`set_timeout`](Self::set_timeout).
    pub fn reset_timeout(&self, reason: TimeoutReason, after: Duration) {
        self.set_timeout(reason, after);
    }

    /// Disarm the deadline for `reason`.
    pub fn cancel_timeout(&self, reason: TimeoutReason) {
        if let Some(slot) = self.lock().slot(reason) {
            *slot = None;
        }
    }

    /// Expiry for `reason`, if armed.
    pub fn deadline(&self, reason: TimeoutReason) -> Option<Instant> {
        self.lock().slot(reason).and_then(|slot| *slot)
    }

    /// Every armed deadline.
    pub fn deadlines(&self) -> Vec<TimeoutDeadline> {
        let mut state = self.lock();
        [
            TimeoutReason::KeepAlive,
            TimeoutReason::RequestHeaders,
            TimeoutReason::WriteDataRate,
        ]
        .into_iter()
        .filter_map(|reason| {
            state
                .slot(reason)
                .and_then(|slot| *slot)
                .map(|expires_at| TimeoutDeadline { reason, expires_at })
        })
        .collect()
    }

    /// Time a read until the returned guard is dropped.
    pub fn timed_read(&self) -> ReadTimer<'_> {
        self.start_timing_read();
        ReadTimer { control: self }
    }

    /// Time a write of `bytes` until the returned guard is dropped.
    pub fn timed_write(&self, bytes: u64) -> WriteTimer<'_> {
        self.start_timing_write(bytes);
        WriteTimer { control: self }
    }

    /// A read that counts toward the minimum read rate has started.
    ///
    /// Must be paired with [`stop_timing_read`](Self::stop_timing_read);
    /// prefer [`timed_read`](Self::timed_read).
    pub fn start_timing_read(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.read.concurrent == 0 {
            state.read.last_tick = Some(now);
        }
        state.read.concurrent += 1;
    }

    /// A timed read finished.
    pub fn stop_timing_read(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        let read = &mut state.read;
        if read.concurrent == 0 {
            return;
        }
        read.concurrent -= 1;
        if read.concurrent == 0
            && let Some(last) = read.last_tick.take()
        {
            read.elapsed += now.saturating_duration_since(last);
        }
    }

    /// Account bytes received during timed reads.
    pub fn bytes_read(&self, count: u64) {
        let mut state = self.lock();
        state.read.bytes = state.read.bytes.saturating_add(count);
    }

    /// Forget accumulated read timing (new request body).
    pub fn reset_read_timing(&self) {
        self.lock().read = ReadTiming::default();
    }

    /// A write of `bytes` is waiting on the peer.
    ///
    /// The first concurrent write gets `max(grace, bytes / rate)`; each
    /// additional write extends the deadline by `bytes / rate`.
    pub fn start_timing_write(&self, bytes: u64) {
        let Some(rate) = self.min_write_rate else {
            return;
        };
        let now = self.clock.now();
        let mut state = self.lock();
        let needed = rate.time_for(bytes);
        let write = &mut state.write;
        let deadline = match write.deadline {
            Some(deadline) if write.concurrent > 0 => deadline.checked_add(needed),
            _ => now.checked_add(needed.max(rate.grace_period)),
        };
        // An unrepresentable deadline keeps the previous one.
        if let Some(deadline) = deadline {
            write.deadline = Some(deadline);
        }
        write.concurrent += 1;
    }

    /// A timed write completed.
    pub fn stop_timing_write(&self) {
        let mut state = self.lock();
        let write = &mut state.write;
        write.concurrent = write.concurrent.saturating_sub(1);
        if write.concurrent == 0 {
            write.deadline = None;
        }
    }

    /// Check every deadline against `now`.
    ///
    /// Returns the first expired reason and disarms it, so one expiry is
    /// reported once.
    pub fn tick(&self, now: Instant) -> Option<TimeoutReason> {
        let mut state = self.lock();

        for reason in [TimeoutReason::RequestHeaders, TimeoutReason::KeepAlive] {
            if let Some(slot) = state.slot(reason)
                && slot.is_some_and(|expires_at| now > expires_at)
            {
                *slot = None;
                return Some(reason);
            }
        }

        if let Some(rate) = self.min_read_rate {
            let read = &mut state.read;
            if read.concurrent > 0
                && let Some(last) = read.last_tick
            {
                read.elapsed += now.saturating_duration_since(last);
                read.last_tick = Some(now);
            }
            if read.elapsed > rate.grace_period {
                let observed = read.bytes as f64 / read.elapsed.as_secs_f64();
                if observed < rate.bytes_per_second {
                    read.concurrent = 0;
                    read.last_tick = None;
                    return Some(TimeoutReason::ReadDataRate);
                }
            }
        }

        let write = &mut state.write;
        if write.concurrent > 0 && write.deadline.is_some_and(|deadline| now > deadline) {
            write.deadline = None;
            write.concurrent = 0;
            return Some(TimeoutReason::WriteDataRate);
        }

        None
    }
}

/// Stops read timing when dropped, including when the read is abandoned.
#[must_use = "read timing stops as soon as the timer is dropped"]
#[derive(Debug)]
pub struct ReadTimer<'a> {
    control: &'a TimeoutControl,
}

impl Drop for ReadTimer<'_> {
    fn drop(&mut self) {
        self.control.stop_timing_read();
    }
}

/// Stops write timing when dropped, including when the write is abandoned.
#[must_use = "write timing stops as soon as the timer is dropped"]
#[derive(Debug)]
pub struct WriteTimer<'a> {
    control: &'a TimeoutControl,
}

impl Drop for WriteTimer<'_> {
    fn drop(&mut self) {
        self.control.stop_timing_write();
    }
}
