//! Periodic tick driving timeout checks across connections.
//!
//! A [`Heartbeat`] holds weak references to registered handlers and calls
//! each one once per tick. A failing or panicking handler is logged and
//! counted; it never stops the rest of the tick.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::MuxConfig;
use crate::error::Result;
use crate::metrics::{HeartbeatMetrics, HeartbeatSnapshot};

/// Receives heartbeat ticks.
pub trait HeartbeatHandler: Send + Sync {
    /// Called once per tick with the heartbeat clock's time.
    fn on_heartbeat(&self, now: Instant) -> Result<()>;
}

/// Emitted when a tick took longer than the heartbeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowHeartbeat {
    /// How long the tick ran.
    pub duration: Duration,
    /// Configured interval.
    pub interval: Duration,
}

/// Result of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

struct HeartbeatInner {
    clock: Arc<dyn Clock>,
    interval: Duration,
    handlers: Mutex<BTreeMap<u64, Weak<dyn HeartbeatHandler>>>,
    next_id: AtomicU64,
    metrics: HeartbeatMetrics,
    slow_tx: broadcast::Sender<SlowHeartbeat>,
}

impl HeartbeatInner {
    fn handlers(&self) -> MutexGuard<'_, BTreeMap<u64, Weak<dyn HeartbeatHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick_at(&self, now: Instant) -> TickSummary {
        let started = Instant::now();

        // Snapshot live handlers and prune dropped ones.
        let live: Vec<(u64, Arc<dyn HeartbeatHandler>)> = {
            let mut handlers = self.handlers();
            handlers.retain(|_, weak| weak.strong_count() > 0);
            handlers
                .iter()
                .filter_map(|(id, weak)| weak.upgrade().map(|h| (*id, h)))
                .collect()
        };

        let mut summary = TickSummary::default();
        for (id, handler) in live {
            summary.invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| handler.on_heartbeat(now))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    summary.failed += 1;
                    self.metrics.record_callback_failure();
                    error!(handler_id = id, error = %e, "Heartbeat handler failed");
                }
                Err(_) => {
                    summary.failed += 1;
                    self.metrics.record_callback_failure();
                    error!(handler_id = id, "Heartbeat handler panicked");
                }
            }
        }

        self.metrics.record_tick();

        let duration = started.elapsed();
        if duration > self.interval {
            self.metrics.record_slow_tick();
            warn!(
                duration_ms = duration.as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "Heartbeat took longer than its interval; timeouts are being checked late"
            );
            let _ = self.slow_tx.send(SlowHeartbeat {
                duration,
                interval: self.interval,
            });
        }

        summary
    }
}

/// Periodic tick source shared by many connections.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

impl Heartbeat {
    /// Create a heartbeat with the given clock and interval.
    ///
    /// Zero intervals are raised to one millisecond.
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let (slow_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(HeartbeatInner {
                clock,
                interval: interval.max(Duration::from_millis(1)),
                handlers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
                metrics: HeartbeatMetrics::default(),
                slow_tx,
            }),
        }
    }

    /// Create a heartbeat ticking at `config.heartbeat_interval`.
    pub fn from_config(config: &MuxConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, config.heartbeat_interval)
    }

    /// Tick interval.
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Register a handler.
    ///
    /// The heartbeat keeps only a weak reference. Dropping the returned
    /// registration (or the handler itself) stops further ticks.
    pub fn register(&self, handler: Arc<dyn HeartbeatHandler>) -> HeartbeatRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers().insert(id, Arc::downgrade(&handler));
        HeartbeatRegistration {
            id,
            heartbeat: Arc::downgrade(&self.inner),
        }
    }

    /// Number of handlers still alive.
    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Run one tick now, using the heartbeat clock.
    pub fn tick(&self) -> TickSummary {
        self.inner.tick_at(self.inner.clock.now())
    }

    /// Run one tick with an explicit time.
    pub fn tick_at(&self, now: Instant) -> TickSummary {
        self.inner.tick_at(now)
    }

    /// Subscribe to slow-tick events.
    pub fn subscribe_slow(&self) -> broadcast::Receiver<SlowHeartbeat> {
        self.inner.slow_tx.subscribe()
    }

    /// Tick counters.
    pub fn metrics(&self) -> HeartbeatSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Spawn the timer loop on the current tokio runtime.
    pub fn start(&self) -> HeartbeatTask {
        let inner = Arc::clone(&self.inner);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.tick_at(inner.clock.now());
                    }
                }
            }
            debug!("Heartbeat loop stopped");
        });

        HeartbeatTask {
            cancel,
            handle: Some(handle),
        }
    }
}

/// Keeps a handler registered; deregisters on drop.
#[derive(Debug)]
pub struct HeartbeatRegistration {
    id: u64,
    heartbeat: Weak<HeartbeatInner>,
}

impl Drop for HeartbeatRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.heartbeat.upgrade() {
            inner.handlers().remove(&self.id);
        }
    }
}

impl std::fmt::Debug for HeartbeatInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatInner")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Handle to a running heartbeat loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct HeartbeatTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatTask {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Check if the loop task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
