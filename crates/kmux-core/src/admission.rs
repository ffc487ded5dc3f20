//! Bounded request admission.
//!
//! An [`AdmissionQueue`] lets at most `max_concurrent` requests run and at
//! most `queue_limit` wait. Everything beyond that is rejected immediately:
//! this is a load-shedding gate and never retries on the caller's behalf.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::AdmissionConfig;
use crate::connection::RequestStream;
use crate::error::{Error, ErrorCode, Result};
use crate::metrics::AdmissionSnapshot;
use crate::transport::{StreamHandler, TransportStream};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    active: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

/// Concurrency limiter with a bounded FIFO wait queue.
pub struct AdmissionQueue {
    max_concurrent: usize,
    queue_limit: usize,
    state: Mutex<QueueState>,
    total_seen: AtomicU64,
    rejected: AtomicU64,
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("max_concurrent", &self.max_concurrent)
            .field("queue_limit", &self.queue_limit)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl AdmissionQueue {
    /// Create a queue. `max_concurrent` must be at least 1.
    pub fn new(max_concurrent: usize, queue_limit: usize) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(Error::InvalidConfig {
                message: "max_concurrent_requests must be at least 1".into(),
            });
        }
        Ok(Self {
            max_concurrent,
            queue_limit,
            state: Mutex::new(QueueState::default()),
            total_seen: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Create a queue from configuration.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self> {
        Self::new(config.max_concurrent_requests, config.request_queue_limit)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to take a slot.
    ///
    /// The result is already complete when a slot is free (`true`) or the
    /// wait queue is full (`false`); check [`TryEnter::ready_value`] to skip
    /// the await on that path. Otherwise it completes with `true` once a
    /// slot is handed over. A `true` result obliges the caller to call
    /// [`release`](Self::release) exactly once.
    pub fn try_enter(&self) -> TryEnter<'_> {
        self.total_seen.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();

        if state.active < self.max_concurrent {
            state.active += 1;
            return TryEnter::Ready(true);
        }

        if state.waiters.len() < self.queue_limit {
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back(Waiter { id, tx });
            return TryEnter::Queued(Queued {
                queue: self,
                id,
                rx,
                done: false,
            });
        }

        drop(state);
        self.rejected.fetch_add(1, Ordering::Relaxed);
        TryEnter::Ready(false)
    }

    /// Give a slot back.
    ///
    /// If anyone is waiting, the slot passes straight to the oldest waiter;
    /// the waiter is woken after the lock is dropped.
    pub fn release(&self) {
        let next = {
            let mut state = self.lock();
            let next = state.waiters.pop_front();
            if next.is_none() {
                debug_assert!(state.active > 0, "release without a held slot");
                state.active = state.active.saturating_sub(1);
            }
            next
        };

        if let Some(waiter) = next {
            // A dropped waiter returns the slot from its own Drop.
            let _ = waiter.tx.send(());
        }
    }

    /// Take a slot, waiting if necessary, as an RAII permit.
    ///
    /// Returns `None` when the request is rejected.
    pub async fn enter(&self) -> Option<AdmissionPermit<'_>> {
        if self.try_enter().await {
            Some(AdmissionPermit {
                queue: self,
                acquired_at: Instant::now(),
            })
        } else {
            None
        }
    }

    /// Requests holding a slot.
    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// Requests waiting for a slot.
    pub fn queued_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Active plus queued requests.
    pub fn total_requests(&self) -> usize {
        let state = self.lock();
        state.active + state.waiters.len()
    }

    /// Counter snapshot.
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let (active, queued) = {
            let state = self.lock();
            (state.active, state.waiters.len())
        };
        AdmissionSnapshot {
            active,
            queued,
            total_requests: active + queued,
            total_seen: self.total_seen.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn withdraw(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Outcome of [`AdmissionQueue::try_enter`].
#[must_use = "a queued admission is withdrawn when dropped"]
pub enum TryEnter<'a> {
    /// Decided without waiting: admitted (`true`) or rejected (`false`).
    Ready(bool),
    /// Waiting in the queue.
    Queued(Queued<'a>),
}

/// A waiter's place in the queue.
pub struct Queued<'a> {
    queue: &'a AdmissionQueue,
    id: u64,
    rx: oneshot::Receiver<()>,
    done: bool,
}

impl TryEnter<'_> {
    /// Check if the outcome was decided synchronously.
    pub fn is_ready(&self) -> bool {
        matches!(self, TryEnter::Ready(_))
    }

    /// The synchronous outcome, if there is one.
    pub fn ready_value(&self) -> Option<bool> {
        match self {
            TryEnter::Ready(admitted) => Some(*admitted),
            TryEnter::Queued(_) => None,
        }
    }
}

impl Future for TryEnter<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match self.get_mut() {
            TryEnter::Ready(admitted) => Poll::Ready(*admitted),
            TryEnter::Queued(queued) => {
                if queued.done {
                    return Poll::Ready(true);
                }
                match Pin::new(&mut queued.rx).poll(cx) {
                    Poll::Ready(Ok(())) => {
                        queued.done = true;
                        Poll::Ready(true)
                    }
                    // The sender only disappears with the queue itself.
                    Poll::Ready(Err(_)) => {
                        queued.done = true;
                        Poll::Ready(false)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Still queued: leave the line. Otherwise release() already handed
        // us the slot and nobody will use it.
        if !self.queue.withdraw(self.id) {
            self.queue.release();
        }
    }
}

/// A held admission slot, released on drop.
pub struct AdmissionPermit<'a> {
    queue: &'a AdmissionQueue,
    acquired_at: Instant,
}

impl AdmissionPermit<'_> {
    /// When the slot was acquired.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// How long the slot has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// Stream handler gated by an admission queue.
///
/// A rejected request is reset with [`ErrorCode::RequestRejected`], which
/// peers treat as safe to retry, and is never passed to the inner handler.
pub struct Throttled<H> {
    queue: Arc<AdmissionQueue>,
    inner: H,
}

impl<H> Throttled<H> {
    /// Wrap `inner` behind `queue`.
    pub fn new(queue: Arc<AdmissionQueue>, inner: H) -> Self {
        Self { queue, inner }
    }

    /// The gating queue.
    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }
}

impl<S, H> StreamHandler<S> for Throttled<H>
where
    S: TransportStream,
    H: StreamHandler<S>,
{
    async fn handle(&self, mut stream: RequestStream<S>) -> Result<()> {
        let Some(_permit) = self.queue.enter().await else {
            debug!(stream_id = %stream.id(), "Request rejected: admission queue full");
            stream.abort(ErrorCode::RequestRejected);
            return Ok(());
        };
        self.inner.handle(stream).await
    }
}
