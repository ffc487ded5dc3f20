//! Multiplexed connection orchestration.
//!
//! [`MultiplexedConnection::run`] opens the outbound control stream, then
//! accepts peer streams one at a time and dispatches them:
//! - Unidirectional streams go to a control-stream worker
//! - Bidirectional streams are registered and handed to the [`StreamHandler`]
//!
//! When the accept loop exits the connection decides, exactly once, whether
//! it is shutting down gracefully or aborting, and tears every live stream
//! down accordingly.

mod worker;

pub use worker::RequestStream;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::config::MuxConfig;
use crate::control::{ControlChannel, ControlEvent, Settings};
use crate::error::{Error, ErrorCode, Result};
use crate::flow::{FlowController, FlowScope};
use crate::heartbeat::{Heartbeat, HeartbeatHandler, HeartbeatRegistration};
use crate::metrics::{ConnectionMetrics, ConnectionSnapshot};
use crate::stream::{StreamDirection, StreamHandle, StreamId, StreamRegistry, StreamState, UniStreamType};
use crate::timeout::{TimeoutControl, TimeoutReason};
use crate::transport::{StreamHandler, Transport, TransportStream};

/// How a connection ended.
#[derive(Debug, Clone)]
pub enum ShutdownKind {
    /// Live streams were notified and allowed to finish.
    Graceful,
    /// Live streams were aborted because of this error.
    Aborted(Arc<Error>),
}

impl ShutdownKind {
    /// Check if the connection ended gracefully.
    pub fn is_graceful(&self) -> bool {
        matches!(self, ShutdownKind::Graceful)
    }

    fn close_code(&self) -> ErrorCode {
        match self {
            ShutdownKind::Graceful => ErrorCode::NoError,
            ShutdownKind::Aborted(error) => error.error_code(),
        }
    }
}

#[derive(Debug, Default)]
struct AbortState {
    error: Option<Arc<Error>>,
    shutdown: Option<ShutdownKind>,
    closed: bool,
}

/// State shared by the accept loop, stream workers and the heartbeat.
#[derive(Debug)]
pub struct ConnectionContext {
    id: u64,
    config: MuxConfig,
    streams: StreamRegistry<Arc<StreamHandle>>,
    flow: FlowController,
    timeouts: TimeoutControl,
    control: ControlChannel,
    abort_state: Mutex<AbortState>,
    /// Stops the accept loop; set by graceful stop and by abort.
    shutdown: CancellationToken,
    /// Set only by abort.
    aborted: CancellationToken,
    metrics: ConnectionMetrics,
}

impl ConnectionContext {
    fn new(id: u64, config: MuxConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let flow = FlowController::new(config.connection_window, config.initial_stream_window)?;
        let timeouts = TimeoutControl::new(
            clock,
            config.timeouts.min_request_body_data_rate,
            config.timeouts.min_response_data_rate,
        )?;
        Ok(Self {
            id,
            config,
            streams: StreamRegistry::new(),
            flow,
            timeouts,
            control: ControlChannel::new(),
            abort_state: Mutex::new(AbortState::default()),
            shutdown: CancellationToken::new(),
            aborted: CancellationToken::new(),
            metrics: ConnectionMetrics::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, AbortState> {
        self.abort_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connection id used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Connection configuration.
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Live request streams.
    pub fn streams(&self) -> &StreamRegistry<Arc<StreamHandle>> {
        &self.streams
    }

    /// Send-side flow control.
    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Timeout deadlines and data-rate tracking.
    pub fn timeouts(&self) -> &TimeoutControl {
        &self.timeouts
    }

    /// Control channel.
    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    /// Highest request stream id seen so far, including refused streams.
    pub fn highest_stream_id(&self) -> Option<StreamId> {
        self.streams.highest_id()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> ConnectionSnapshot {
        self.metrics.snapshot()
    }

    /// Abort the connection.
    ///
    /// Only the first call records its error and acts; later calls return
    /// false. Every caller can observe the result through [`is_aborted`].
    ///
    /// [`is_aborted`]: Self::is_aborted
    pub fn abort(&self, error: Error) -> bool {
        {
            let mut state = self.state();
            if state.error.is_some() {
                return false;
            }
            warn!(connection_id = self.id, error = %error, "Aborting connection");
            state.error = Some(Arc::new(error));
        }
        self.aborted.cancel();
        self.shutdown.cancel();
        true
    }

    /// Check if the connection has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.state().error.is_some()
    }

    /// The error recorded by the first abort.
    pub fn abort_error(&self) -> Option<Arc<Error>> {
        self.state().error.clone()
    }

    /// Stop accepting new streams. In-flight streams keep running.
    pub fn stop_processing_next_request(&self) {
        if !self.shutdown.is_cancelled() {
            info!(connection_id = self.id, "Stopping processing of new requests");
            self.shutdown.cancel();
        }
    }

    /// Error for a stream whose I/O was cancelled under it.
    ///
    /// Distinguishes a connection abort and a graceful close that ran out of
    /// time from a reset of that one stream.
    pub(crate) fn stream_cancelled_error(&self, id: StreamId) -> Error {
        let state = self.state();
        if let Some(error) = &state.error {
            Error::ConnectionAborted {
                message: error.to_string(),
            }
        } else if state.shutdown.is_some() {
            Error::ConnectionClosed
        } else {
            Error::StreamNotFound(id)
        }
    }

    /// Check if the connection has stopped accepting new streams.
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shutdown decision, once made.
    pub fn shutdown_kind(&self) -> Option<ShutdownKind> {
        self.state().shutdown.clone()
    }

    /// React to an expired deadline.
    ///
    /// Keep-alive stops accepting streams; every other reason aborts.
    pub fn on_timeout(&self, reason: TimeoutReason) {
        self.metrics.record_timeout();
        match reason {
            TimeoutReason::KeepAlive => {
                debug!(connection_id = self.id, %reason, "Connection idle");
                self.stop_processing_next_request();
            }
            TimeoutReason::RequestHeaders
            | TimeoutReason::ReadDataRate
            | TimeoutReason::WriteDataRate => {
                info!(connection_id = self.id, %reason, "Connection timed out");
                self.abort(Error::Timeout(reason));
            }
        }
    }

    /// Called by a stream when it reaches `Closed` or `Aborted`.
    pub(crate) fn on_stream_finished(&self, id: StreamId, state: StreamState) {
        if self.streams.remove(id).is_none() {
            return;
        }
        self.flow.remove_stream(id);
        match state {
            StreamState::Aborted(code) => {
                debug!(connection_id = self.id, stream_id = %id, %code, "Stream aborted");
                self.metrics.record_aborted();
            }
            _ => {
                debug!(connection_id = self.id, stream_id = %id, "Stream completed");
                self.metrics.record_completed();
            }
        }
        self.arm_keep_alive_if_idle();
    }

    fn arm_keep_alive_if_idle(&self) {
        if self.streams.is_empty()
            && !self.is_stopping()
            && self.control.peer_settings().is_some()
        {
            self.timeouts
                .set_timeout(TimeoutReason::KeepAlive, self.config.timeouts.keep_alive);
        }
    }

    /// Apply peer credit. Updates for streams that already finished are
    /// ignored; overflowing a window is fatal.
    fn on_window_update(&self, stream: Option<StreamId>, increment: u32) -> Result<()> {
        let scope = stream.map_or(FlowScope::Connection, FlowScope::Stream);
        match self.flow.release(scope, increment) {
            Err(Error::StreamNotFound(id)) => {
                trace!(connection_id = self.id, stream_id = %id, increment, "WINDOW_UPDATE for finished stream");
                Ok(())
            }
            result => result,
        }
    }

    fn on_peer_settings(&self, settings: Settings) -> Result<()> {
        debug!(connection_id = self.id, ?settings, "Peer SETTINGS received");
        self.flow.update_initial_window(settings.initial_window_size)?;
        self.timeouts.cancel_timeout(TimeoutReason::RequestHeaders);
        self.arm_keep_alive_if_idle();
        Ok(())
    }

    /// Decide graceful versus abort. The first call wins; later calls return
    /// the same decision.
    fn decide_shutdown(&self) -> ShutdownKind {
        let mut state = self.state();
        if let Some(kind) = &state.shutdown {
            return kind.clone();
        }
        let kind = match &state.error {
            Some(error) => ShutdownKind::Aborted(Arc::clone(error)),
            None => ShutdownKind::Graceful,
        };
        state.shutdown = Some(kind.clone());
        kind
    }

    fn mark_closed(&self) {
        self.state().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl HeartbeatHandler for ConnectionContext {
    fn on_heartbeat(&self, now: Instant) -> Result<()> {
        if self.is_closed() || self.is_aborted() {
            return Ok(());
        }
        if let Some(reason) = self.timeouts.tick(now) {
            self.on_timeout(reason);
        }
        Ok(())
    }
}

/// Accepts and dispatches streams for one transport connection.
pub struct MultiplexedConnection<T: Transport, H> {
    transport: Arc<T>,
    handler: Arc<H>,
    context: Arc<ConnectionContext>,
}

impl<T, H> MultiplexedConnection<T, H>
where
    T: Transport,
    H: StreamHandler<T::Stream>,
{
    /// Create a connection. Fails if `config` is invalid.
    pub fn new(
        id: u64,
        transport: T,
        handler: H,
        config: MuxConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(transport),
            handler: Arc::new(handler),
            context: Arc::new(ConnectionContext::new(id, config, clock)?),
        })
    }

    /// Shared connection state.
    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    /// Have `heartbeat` check this connection's timeouts on every tick.
    pub fn register_heartbeat(&self, heartbeat: &Heartbeat) -> HeartbeatRegistration {
        let handler: Arc<dyn HeartbeatHandler> = self.context.clone();
        heartbeat.register(handler)
    }

    /// Run the connection until the peer disconnects, it is stopped, or it
    /// is aborted.
    ///
    /// Failures never escape: they abort this connection and are reported in
    /// the returned [`ShutdownKind`].
    pub async fn run(self) -> ShutdownKind {
        let ctx = Arc::clone(&self.context);
        info!(connection_id = ctx.id, "Connection started");

        let mut workers = JoinSet::new();
        let mut control_workers = JoinSet::new();

        match self.start().await {
            Ok(()) => {
                if let Err(e) = self.accept_loop(&mut workers, &mut control_workers).await {
                    error!(
                        connection_id = ctx.id,
                        critical = true,
                        error = %e,
                        "Accept loop failed"
                    );
                    ctx.abort(e);
                }
            }
            Err(e) => {
                ctx.abort(e);
            }
        }

        let kind = ctx.decide_shutdown();
        match &kind {
            ShutdownKind::Graceful => self.drain(&mut workers).await,
            ShutdownKind::Aborted(error) => abort_all(&ctx, error.error_code(), &mut workers).await,
        }

        control_workers.shutdown().await;
        ctx.mark_closed();

        // An abort during the drain still decides the close code.
        let close_code = match ctx.abort_error() {
            Some(error) => error.error_code(),
            None => kind.close_code(),
        };
        self.transport.close(close_code);

        info!(
            connection_id = ctx.id,
            graceful = kind.is_graceful(),
            %close_code,
            wire_code = close_code.to_wire(),
            highest_stream_id = ?ctx.highest_stream_id(),
            "Connection closed"
        );
        kind
    }

    async fn start(&self) -> Result<()> {
        let ctx = &self.context;
        let sink = self.transport.open_control_stream().await?;
        ctx.control.attach(sink).await;
        ctx.control.send_settings(Settings::from_config(&ctx.config)).await?;
        ctx.timeouts.set_timeout(
            TimeoutReason::RequestHeaders,
            ctx.config.timeouts.request_headers,
        );
        Ok(())
    }

    async fn accept_loop(
        &self,
        workers: &mut JoinSet<()>,
        control_workers: &mut JoinSet<()>,
    ) -> Result<()> {
        let ctx = &self.context;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => {
                    debug!(connection_id = ctx.id, "Accept loop cancelled");
                    return Ok(());
                }
                accepted = self.transport.accept_stream() => accepted?,
            };

            let Some(mut stream) = accepted else {
                debug!(connection_id = ctx.id, "Transport closed by peer");
                return Ok(());
            };

            if ctx.control.goaway_sent() {
                stream.abort(ErrorCode::RequestRejected);
                return Ok(());
            }

            self.dispatch(stream, workers, control_workers)?;

            // Reap finished workers so the set does not grow unbounded.
            while workers.try_join_next().is_some() {}
        }
    }

    fn dispatch(
        &self,
        stream: T::Stream,
        workers: &mut JoinSet<()>,
        control_workers: &mut JoinSet<()>,
    ) -> Result<()> {
        let ctx = &self.context;
        match stream.direction() {
            StreamDirection::Unidirectional(kind) => {
                debug!(
                    connection_id = ctx.id,
                    stream_id = %stream.id(),
                    kind = kind.name(),
                    "Inbound unidirectional stream"
                );
                control_workers.spawn(run_control_stream(Arc::clone(ctx), kind, stream));
                Ok(())
            }
            StreamDirection::Bidirectional => self.dispatch_request(stream, workers),
        }
    }

    fn dispatch_request(&self, mut stream: T::Stream, workers: &mut JoinSet<()>) -> Result<()> {
        let ctx = &self.context;
        let id = stream.id();

        // Registering first moves the id watermark even for a stream that
        // is then refused.
        let handle = Arc::new(StreamHandle::new(
            id,
            StreamDirection::Bidirectional,
            Arc::downgrade(ctx),
        ));
        if !ctx.streams.add(id, Arc::clone(&handle)) {
            stream.abort(ErrorCode::StreamCreationError);
            return Err(Error::StreamCreation {
                message: format!(
                    "stream {id} is not above highest stream {}",
                    ctx.highest_stream_id().map_or(0, StreamId::value)
                ),
            });
        }

        if ctx.streams.len() > ctx.config.max_concurrent_streams as usize {
            ctx.streams.remove(id);
            debug!(connection_id = ctx.id, stream_id = %id, "Refusing stream over concurrency limit");
            stream.abort(ErrorCode::RequestRejected);
            ctx.metrics.record_refused();
            return Ok(());
        }

        ctx.flow.add_stream(id);
        ctx.timeouts.cancel_timeout(TimeoutReason::KeepAlive);
        ctx.metrics.record_accepted();
        debug!(connection_id = ctx.id, stream_id = %id, "Request stream accepted");

        let request = RequestStream::new(stream, handle, Arc::clone(ctx));
        workers.spawn(worker::run_request(Arc::clone(&self.handler), request));
        Ok(())
    }

    async fn drain(&self, workers: &mut JoinSet<()>) {
        let ctx = &self.context;
        let last_stream_id = ctx.highest_stream_id().unwrap_or(StreamId::new(0));
        if let Err(e) = ctx.control.send_goaway(last_stream_id).await {
            warn!(connection_id = ctx.id, error = %e, "Failed to send GOAWAY");
        }

        // No further input will arrive on any live stream.
        ctx.streams.for_each(|_, stream| stream.complete_input());

        let drained = tokio::select! {
            _ = join_all(workers) => true,
            _ = tokio::time::sleep(ctx.config.shutdown_timeout) => false,
            _ = ctx.aborted.cancelled() => false,
        };

        if !drained {
            let code = ctx
                .abort_error()
                .map_or(ErrorCode::RequestCancelled, |error| error.error_code());
            warn!(
                connection_id = ctx.id,
                remaining = ctx.streams.len(),
                %code,
                "Aborting streams still running after graceful shutdown"
            );
            abort_all(ctx, code, workers).await;
        }
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while workers.join_next().await.is_some() {}
}

async fn abort_all(ctx: &ConnectionContext, code: ErrorCode, workers: &mut JoinSet<()>) {
    ctx.streams.for_each(|_, stream| {
        stream.abort(code);
    });
    workers.shutdown().await;
}

/// Worker for one peer-initiated unidirectional stream.
async fn run_control_stream<S: TransportStream>(
    ctx: Arc<ConnectionContext>,
    kind: UniStreamType,
    mut stream: S,
) {
    let id = stream.id();

    if let UniStreamType::Unknown(stream_type) = kind {
        debug!(connection_id = ctx.id, stream_id = %id, stream_type, "Ignoring unknown stream type");
        stream.abort(ErrorCode::StreamCreationError);
        return;
    }

    if !ctx.control.register_inbound(kind, id) {
        ctx.abort(Error::StreamCreation {
            message: format!("duplicate inbound {} stream {id}", kind.name()),
        });
        return;
    }

    let result = match kind {
        UniStreamType::Control => process_control_frames(&ctx, &mut stream).await,
        _ => drain_stream(&mut stream).await,
    };

    // The peer may close its streams once we stopped accepting.
    if result.is_ok() && ctx.is_stopping() {
        return;
    }
    let error = match result {
        Ok(()) => Error::ClosedCriticalStream { kind: kind.name() },
        Err(e) => e,
    };
    ctx.abort(error);
}

async fn process_control_frames<S: TransportStream>(
    ctx: &ConnectionContext,
    stream: &mut S,
) -> Result<()> {
    while let Some(frame) = stream.read_control_frame().await? {
        ctx.metrics.record_control_frame();
        match ctx.control.on_control_frame_received(frame)? {
            ControlEvent::Settings(settings) => ctx.on_peer_settings(settings)?,
            ControlEvent::GoAway(last_stream_id) => {
                info!(connection_id = ctx.id, %last_stream_id, "Peer sent GOAWAY");
                ctx.stop_processing_next_request();
            }
            ControlEvent::WindowUpdate { stream, increment } => {
                ctx.on_window_update(stream, increment)?;
            }
        }
    }
    Ok(())
}

/// Consume encoder/decoder instructions; header compression is not
/// interpreted here.
async fn drain_stream<S: TransportStream>(stream: &mut S) -> Result<()> {
    let mut buf = [0u8; 1024];
    while stream.read(&mut buf).await? > 0 {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::clock::manual::ManualClock;

    fn context() -> (Arc<ManualClock>, Arc<ConnectionContext>) {
        let clock = Arc::new(ManualClock::new());
        let config = MuxConfig::default()
            .with_keep_alive(Duration::from_secs(10))
            .with_request_headers_timeout(Duration::from_secs(5));
        let ctx = ConnectionContext::new(7, config, clock.clone()).unwrap();
        (clock, Arc::new(ctx))
    }

    fn add_stream(ctx: &Arc<ConnectionContext>, id: u64) -> Arc<StreamHandle> {
        let id = StreamId::new(id);
        let handle = Arc::new(StreamHandle::new(
            id,
            StreamDirection::Bidirectional,
            Arc::downgrade(ctx),
        ));
        assert!(ctx.streams.add(id, handle.clone()));
        ctx.flow.add_stream(id);
        handle
    }

    #[test]
    fn first_abort_wins() {
        let (_, ctx) = context();
        assert!(ctx.abort(Error::protocol("first")));
        assert!(!ctx.abort(Error::protocol("second")));

        assert!(ctx.is_aborted());
        assert!(ctx.is_stopping());
        assert_eq!(
            ctx.abort_error().unwrap().to_string(),
            "protocol error: first"
        );
    }

    #[test]
    fn concurrent_aborts_record_one_error() {
        let (_, ctx) = context();

        let handles: Vec<_> = (0..2)
            .map(|n| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let won = ctx.abort(Error::protocol(format!("caller {n}")));
                    (won, ctx.is_aborted())
                })
            })
            .collect();
        let results: Vec<(bool, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(won, _)| *won).count(), 1);
        assert!(results.iter().all(|(_, aborted)| *aborted));

        let recorded = ctx.abort_error().unwrap().to_string();
        assert!(recorded == "protocol error: caller 0" || recorded == "protocol error: caller 1");
    }

    #[test]
    fn stop_processing_is_not_abort() {
        let (_, ctx) = context();
        ctx.stop_processing_next_request();
        assert!(ctx.is_stopping());
        assert!(!ctx.is_aborted());
        assert!(ctx.decide_shutdown().is_graceful());
    }

    #[test]
    fn shutdown_decision_is_made_once() {
        let (_, ctx) = context();
        assert!(ctx.decide_shutdown().is_graceful());
        ctx.abort(Error::transport("late"));
        assert!(ctx.decide_shutdown().is_graceful());
    }

    #[test]
    fn keep_alive_timeout_stops_gracefully() {
        let (clock, ctx) = context();
        ctx.on_peer_settings(Settings::default()).unwrap();
        assert!(ctx.timeouts.deadline(TimeoutReason::KeepAlive).is_some());

        clock.advance(Duration::from_secs(11));
        ctx.on_heartbeat(clock.now()).unwrap();

        assert!(ctx.is_stopping());
        assert!(!ctx.is_aborted());
        assert_eq!(ctx.metrics().timeouts, 1);
    }

    #[test]
    fn request_headers_timeout_aborts() {
        let (clock, ctx) = context();
        ctx.timeouts
            .set_timeout(TimeoutReason::RequestHeaders, Duration::from_secs(5));

        clock.advance(Duration::from_secs(6));
        ctx.on_heartbeat(clock.now()).unwrap();

        assert!(matches!(
            ctx.abort_error().as_deref(),
            Some(Error::Timeout(TimeoutReason::RequestHeaders))
        ));
    }

    #[test]
    fn peer_settings_cancel_request_headers_timeout() {
        let (clock, ctx) = context();
        ctx.timeouts
            .set_timeout(TimeoutReason::RequestHeaders, Duration::from_secs(5));
        ctx.on_peer_settings(Settings::default()).unwrap();

        clock.advance(Duration::from_secs(6));
        ctx.on_heartbeat(clock.now()).unwrap();
        assert!(!ctx.is_aborted());
    }

    #[test]
    fn cancelled_stream_error_reflects_connection_state() {
        let (_, ctx) = context();
        let id = StreamId::new(4);
        assert!(matches!(ctx.stream_cancelled_error(id), Error::StreamNotFound(_)));

        ctx.decide_shutdown();
        assert!(matches!(ctx.stream_cancelled_error(id), Error::ConnectionClosed));

        let (_, ctx) = context();
        ctx.abort(Error::protocol("bad frame"));
        match ctx.stream_cancelled_error(id) {
            Error::ConnectionAborted { message } => assert_eq!(message, "protocol error: bad frame"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn window_updates_add_credit() {
        let (_, ctx) = context();
        let id = StreamId::new(0);
        add_stream(&ctx, 0);
        assert!(ctx.flow.try_reserve_send(id, 65_535));

        ctx.on_window_update(Some(id), 100).unwrap();
        ctx.on_window_update(None, 40).unwrap();
        assert_eq!(ctx.flow.window(FlowScope::Stream(id)), Some(100));
        assert_eq!(ctx.flow.window(FlowScope::Connection), Some(40));

        // Late update for a finished stream
        ctx.on_window_update(Some(StreamId::new(8)), 10).unwrap();

        let overflow = ctx.on_window_update(None, u32::MAX).unwrap_err();
        assert!(matches!(overflow, Error::FlowControl { .. }));
    }

    #[test]
    fn finished_streams_leave_registry_and_rearm_keep_alive() {
        let (_, ctx) = context();
        ctx.on_peer_settings(Settings::default()).unwrap();
        let a = add_stream(&ctx, 0);
        let b = add_stream(&ctx, 4);
        ctx.timeouts.cancel_timeout(TimeoutReason::KeepAlive);

        a.complete();
        assert!(!ctx.streams.contains(StreamId::new(0)));
        assert_eq!(ctx.flow.window(FlowScope::Stream(StreamId::new(0))), None);
        assert!(ctx.timeouts.deadline(TimeoutReason::KeepAlive).is_none());

        b.abort(ErrorCode::RequestCancelled);
        assert!(ctx.streams.is_empty());
        assert!(ctx.timeouts.deadline(TimeoutReason::KeepAlive).is_some());

        let metrics = ctx.metrics();
        assert_eq!(metrics.streams_completed, 1);
        assert_eq!(metrics.streams_aborted, 1);
    }
}
