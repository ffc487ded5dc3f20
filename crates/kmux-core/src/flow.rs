//! Credit-based flow control.
//!
//! Tracks the connection-level send window and one window per stream.
//! Reservations succeed only when enough credit exists; otherwise they fail
//! without side effects, or (for the async variants) wait until the peer or
//! the local side releases credit.
//!
//! The peer adds credit with WINDOW_UPDATE frames. Connection credit a
//! stream consumed is also handed back locally once that stream is removed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::trace;

use crate::constants::MAX_WINDOW_SIZE;
use crate::error::{Error, Result};
use crate::stream::StreamId;

/// Flow-control window for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowWindow {
    /// Current available credit (negative after a SETTINGS shrink).
    window: i32,
    /// Initial window size this scope was created with.
    initial_window: i32,
}

impl FlowWindow {
    /// Create a window with the given initial credit.
    pub fn new(initial_window: i32) -> Self {
        Self {
            window: initial_window,
            initial_window,
        }
    }

    /// Current available credit.
    pub fn window(&self) -> i32 {
        self.window
    }

    /// Initial window size.
    pub fn initial_window(&self) -> i32 {
        self.initial_window
    }

    /// Check whether `n` bytes fit in the window.
    pub fn has_credit(&self, n: u32) -> bool {
        i64::from(self.window) >= i64::from(n)
    }

    /// Consume `n` bytes of credit, failing without side effects if short.
    pub fn consume(&mut self, n: u32) -> Result<()> {
        if !self.has_credit(n) {
            return Err(Error::FlowControl {
                message: format!("window {} cannot cover {n} bytes", self.window),
            });
        }
        // has_credit bounds n by window <= i32::MAX
        self.window -= n as i32;
        Ok(())
    }

    /// Return `n` bytes of credit. Errors instead of wrapping past 2^31 - 1.
    pub fn replenish(&mut self, n: u32) -> Result<()> {
        let new_window = i64::from(self.window) + i64::from(n);
        if new_window > i64::from(MAX_WINDOW_SIZE) {
            return Err(Error::FlowControl {
                message: format!("window update of {n} overflows window {}", self.window),
            });
        }
        self.window = new_window as i32;
        Ok(())
    }

    /// Return `n` bytes of credit, stopping at 2^31 - 1.
    pub fn replenish_saturating(&mut self, n: u64) {
        let new_window = i64::from(self.window).saturating_add_unsigned(n);
        self.window = new_window.min(i64::from(MAX_WINDOW_SIZE)) as i32;
    }

    /// Apply a new initial window size, shifting the current window by the delta.
    pub fn update_initial_window(&mut self, new_initial: i32) -> Result<()> {
        let delta = i64::from(new_initial) - i64::from(self.initial_window);
        let new_window = i64::from(self.window) + delta;
        if new_window > i64::from(MAX_WINDOW_SIZE) {
            return Err(Error::FlowControl {
                message: format!("initial window {new_initial} overflows window {}", self.window),
            });
        }
        self.window = new_window as i32;
        self.initial_window = new_initial;
        Ok(())
    }
}

/// Which window an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowScope {
    /// The shared connection window.
    Connection,
    /// One stream's window.
    Stream(StreamId),
}

#[derive(Debug)]
struct StreamCredit {
    window: FlowWindow,
    /// Connection credit taken by this stream's sends.
    connection_charged: u64,
}

#[derive(Debug)]
struct FlowState {
    connection: FlowWindow,
    streams: HashMap<StreamId, StreamCredit>,
    initial_stream_window: i32,
}

impl FlowState {
    fn window_mut(&mut self, scope: FlowScope) -> Result<&mut FlowWindow> {
        match scope {
            FlowScope::Connection => Ok(&mut self.connection),
            FlowScope::Stream(id) => self
                .streams
                .get_mut(&id)
                .map(|stream| &mut stream.window)
                .ok_or(Error::StreamNotFound(id)),
        }
    }
}

/// Send-side flow control for one connection.
#[derive(Debug)]
pub struct FlowController {
    state: Mutex<FlowState>,
    credit: Notify,
}

fn to_window(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::FlowControl {
        message: format!("window size {value} exceeds 2^31 - 1"),
    })
}

impl FlowController {
    /// Create a controller with the given connection and per-stream windows.
    pub fn new(connection_window: u32, initial_stream_window: u32) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(FlowState {
                connection: FlowWindow::new(to_window(connection_window)?),
                streams: HashMap::new(),
                initial_stream_window: to_window(initial_stream_window)?,
            }),
            credit: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a stream with the current initial window.
    pub fn add_stream(&self, id: StreamId) {
        let mut state = self.lock();
        let credit = StreamCredit {
            window: FlowWindow::new(state.initial_stream_window),
            connection_charged: 0,
        };
        state.streams.insert(id, credit);
    }

    /// Stop tracking a stream and give the connection credit it consumed
    /// back to the connection window. Waiters on the stream are woken and
    /// fail.
    pub fn remove_stream(&self, id: StreamId) {
        let returned = {
            let mut state = self.lock();
            let Some(stream) = state.streams.remove(&id) else {
                return;
            };
            state.connection.replenish_saturating(stream.connection_charged);
            stream.connection_charged
        };
        trace!(stream_id = %id, returned, "stream credit returned to connection");
        self.credit.notify_waiters();
    }

    /// Current credit for a scope, if it exists.
    pub fn window(&self, scope: FlowScope) -> Option<i32> {
        let mut state = self.lock();
        state.window_mut(scope).ok().map(|w| w.window())
    }

    /// Reserve `amount` bytes from one scope if enough credit exists.
    pub fn try_reserve(&self, scope: FlowScope, amount: u32) -> bool {
        let mut state = self.lock();
        match state.window_mut(scope) {
            Ok(window) => window.consume(amount).is_ok(),
            Err(_) => false,
        }
    }

    /// Reserve `amount` bytes from both a stream window and the connection
    /// window, atomically. Either both are charged or neither is.
    pub fn try_reserve_send(&self, id: StreamId, amount: u32) -> bool {
        matches!(self.try_reserve_send_inner(id, amount), Ok(true))
    }

    fn try_reserve_send_inner(&self, id: StreamId, amount: u32) -> Result<bool> {
        let mut state = self.lock();
        let FlowState {
            connection, streams, ..
        } = &mut *state;
        let stream = streams.get_mut(&id).ok_or(Error::StreamNotFound(id))?;
        if !stream.window.has_credit(amount) || !connection.has_credit(amount) {
            return Ok(false);
        }
        stream.window.consume(amount)?;
        connection.consume(amount)?;
        stream.connection_charged += u64::from(amount);
        Ok(true)
    }

    fn try_reserve_inner(&self, scope: FlowScope, amount: u32) -> Result<bool> {
        let mut state = self.lock();
        let window = state.window_mut(scope)?;
        Ok(window.consume(amount).is_ok())
    }

    /// Add credit to a scope (peer window update or local release) and wake
    /// any reservation waiting for it.
    pub fn release(&self, scope: FlowScope, amount: u32) -> Result<()> {
        {
            let mut state = self.lock();
            state.window_mut(scope)?.replenish(amount)?;
        }
        trace!(?scope, amount, "flow credit released");
        self.credit.notify_waiters();
        Ok(())
    }

    /// Apply a peer SETTINGS initial window to every stream window.
    pub fn update_initial_window(&self, new_initial: u32) -> Result<()> {
        let new_initial = to_window(new_initial)?;
        {
            let mut state = self.lock();
            // Validate first so a failure leaves every window untouched.
            let delta = i64::from(new_initial) - i64::from(state.initial_stream_window);
            if state
                .streams
                .values()
                .any(|s| i64::from(s.window.window()) + delta > i64::from(MAX_WINDOW_SIZE))
            {
                return Err(Error::FlowControl {
                    message: format!("initial window {new_initial} overflows a stream window"),
                });
            }
            for stream in state.streams.values_mut() {
                stream.window.update_initial_window(new_initial)?;
            }
            state.initial_stream_window = new_initial;
        }
        self.credit.notify_waiters();
        Ok(())
    }

    /// Reserve from one scope, waiting for credit if necessary.
    ///
    /// Fails if the scope disappears while waiting or if `amount` can never
    /// fit in a window.
    pub async fn reserve(&self, scope: FlowScope, amount: u32) -> Result<()> {
        to_window(amount)?;
        loop {
            let notified = self.credit.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_reserve_inner(scope, amount)? {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Reserve from a stream and the connection, waiting for credit.
    pub async fn reserve_send(&self, id: StreamId, amount: u32) -> Result<()> {
        to_window(amount)?;
        loop {
            let notified = self.credit.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_reserve_send_inner(id, amount)? {
                return Ok(());
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn sid(n: u64) -> StreamId {
        StreamId::new(n)
    }

    #[test]
    fn basic_window() {
        let mut fc = FlowWindow::new(65535);
        fc.consume(1000).unwrap();
        assert_eq!(fc.window(), 64535);
        fc.replenish(1000).unwrap();
        assert_eq!(fc.window(), 65535);
    }

    #[test]
    fn consume_more_than_window_fails_without_change() {
        let mut fc = FlowWindow::new(100);
        assert!(fc.consume(101).is_err());
        assert_eq!(fc.window(), 100);
    }

    #[test]
    fn replenish_overflow_fails() {
        let mut fc = FlowWindow::new(MAX_WINDOW_SIZE);
        assert!(fc.replenish(1).is_err());
        assert_eq!(fc.window(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn update_initial_window_shifts_by_delta() {
        let mut fc = FlowWindow::new(65535);
        fc.consume(10000).unwrap();
        fc.update_initial_window(75535).unwrap();
        assert_eq!(fc.window(), 65535);

        fc.update_initial_window(0).unwrap();
        assert_eq!(fc.window(), -10000);
        assert!(!fc.has_credit(1));
    }

    #[test]
    fn saturating_replenish_stops_at_max() {
        let mut fc = FlowWindow::new(MAX_WINDOW_SIZE - 10);
        fc.replenish_saturating(u64::MAX);
        assert_eq!(fc.window(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn removed_stream_returns_connection_credit() {
        let fc = FlowController::new(100, 100).unwrap();
        fc.add_stream(sid(0));
        fc.add_stream(sid(4));

        assert!(fc.try_reserve_send(sid(0), 60));
        assert!(fc.try_reserve_send(sid(4), 30));
        assert!(!fc.try_reserve_send(sid(4), 20));
        assert_eq!(fc.window(FlowScope::Connection), Some(10));

        fc.remove_stream(sid(0));
        assert_eq!(fc.window(FlowScope::Connection), Some(70));
        assert!(fc.try_reserve_send(sid(4), 20));

        fc.remove_stream(sid(4));
        assert_eq!(fc.window(FlowScope::Connection), Some(100));
    }

    #[tokio::test]
    async fn finished_stream_unblocks_other_writer() {
        let fc = Arc::new(FlowController::new(50, 100).unwrap());
        fc.add_stream(sid(0));
        fc.add_stream(sid(4));
        assert!(fc.try_reserve_send(sid(0), 50));

        let waiter = {
            let fc = fc.clone();
            tokio::spawn(async move { fc.reserve_send(sid(4), 40).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        fc.remove_stream(sid(0));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
        assert_eq!(fc.window(FlowScope::Connection), Some(10));
    }

    #[test]
    fn controller_scopes_are_independent() {
        let fc = FlowController::new(1000, 100).unwrap();
        fc.add_stream(sid(0));

        assert!(fc.try_reserve(FlowScope::Stream(sid(0)), 100));
        assert!(!fc.try_reserve(FlowScope::Stream(sid(0)), 1));
        assert_eq!(fc.window(FlowScope::Connection), Some(1000));

        assert!(fc.try_reserve(FlowScope::Connection, 1000));
        assert_eq!(fc.window(FlowScope::Connection), Some(0));
    }

    #[test]
    fn reserve_send_is_all_or_nothing() {
        let fc = FlowController::new(50, 100).unwrap();
        fc.add_stream(sid(4));

        assert!(!fc.try_reserve_send(sid(4), 60));
        assert_eq!(fc.window(FlowScope::Stream(sid(4))), Some(100));
        assert_eq!(fc.window(FlowScope::Connection), Some(50));

        assert!(fc.try_reserve_send(sid(4), 50));
        assert_eq!(fc.window(FlowScope::Stream(sid(4))), Some(50));
        assert_eq!(fc.window(FlowScope::Connection), Some(0));
    }

    #[test]
    fn unknown_stream_scope() {
        let fc = FlowController::new(100, 100).unwrap();
        assert!(!fc.try_reserve(FlowScope::Stream(sid(9)), 1));
        assert!(matches!(
            fc.release(FlowScope::Stream(sid(9)), 1),
            Err(Error::StreamNotFound(_))
        ));
    }

    #[test]
    fn release_overflow_is_an_error() {
        let fc = FlowController::new(MAX_WINDOW_SIZE as u32, 100).unwrap();
        assert!(matches!(
            fc.release(FlowScope::Connection, 1),
            Err(Error::FlowControl { .. })
        ));
        assert!(FlowController::new(u32::MAX, 100).is_err());
    }

    #[test]
    fn settings_update_applies_to_existing_streams() {
        let fc = FlowController::new(1000, 100).unwrap();
        fc.add_stream(sid(0));
        assert!(fc.try_reserve(FlowScope::Stream(sid(0)), 40));

        fc.update_initial_window(200).unwrap();
        assert_eq!(fc.window(FlowScope::Stream(sid(0))), Some(160));

        fc.add_stream(sid(4));
        assert_eq!(fc.window(FlowScope::Stream(sid(4))), Some(200));
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let fc = Arc::new(FlowController::new(10, 100).unwrap());
        assert!(fc.try_reserve(FlowScope::Connection, 10));

        let waiter = {
            let fc = fc.clone();
            tokio::spawn(async move { fc.reserve(FlowScope::Connection, 5).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        fc.release(FlowScope::Connection, 5).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
        assert_eq!(fc.window(FlowScope::Connection), Some(0));
    }

    #[tokio::test]
    async fn waiter_fails_when_stream_removed() {
        let fc = Arc::new(FlowController::new(100, 0).unwrap());
        fc.add_stream(sid(0));

        let waiter = {
            let fc = fc.clone();
            tokio::spawn(async move { fc.reserve_send(sid(0), 1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        fc.remove_stream(sid(0));

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::StreamNotFound(_))));
    }

    #[tokio::test]
    async fn impossible_amount_fails_fast() {
        let fc = FlowController::new(100, 100).unwrap();
        assert!(fc.reserve(FlowScope::Connection, u32::MAX).await.is_err());
    }
}
