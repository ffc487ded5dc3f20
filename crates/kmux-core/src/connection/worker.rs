//! Per-request stream worker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

use super::ConnectionContext;
use crate::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{Error, ErrorCode, Result};
use crate::flow::FlowScope;
use crate::stream::{StreamHandle, StreamId};
use crate::transport::{StreamHandler, TransportStream};

/// A request stream handed to the application worker.
///
/// Wraps the transport stream together with its connection-side handle, so
/// reads and writes are charged to flow control and data-rate timing.
pub struct RequestStream<S> {
    io: S,
    handle: Arc<StreamHandle>,
    connection: Arc<ConnectionContext>,
}

impl<S: TransportStream> RequestStream<S> {
    pub(crate) fn new(io: S, handle: Arc<StreamHandle>, connection: Arc<ConnectionContext>) -> Self {
        Self {
            io,
            handle,
            connection,
        }
    }

    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.handle.id()
    }

    /// Connection-side handle (state, notifications, cancellation).
    pub fn handle(&self) -> &Arc<StreamHandle> {
        &self.handle
    }

    /// Owning connection.
    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.connection
    }

    /// Raw transport stream, bypassing flow control and timing.
    pub fn io(&mut self) -> &mut S {
        &mut self.io
    }

    /// Current send credit for this stream.
    pub fn send_window(&self) -> Option<i32> {
        self.connection.flow().window(FlowScope::Stream(self.id()))
    }

    /// Reserve send credit without waiting.
    pub fn try_reserve_send(&self, amount: u32) -> bool {
        self.connection.flow().try_reserve_send(self.id(), amount)
    }

    /// Reserve send credit, waiting until the stream and connection windows
    /// both have room.
    pub async fn reserve_send(&self, amount: u32) -> Result<()> {
        self.connection.flow().reserve_send(self.id(), amount).await
    }

    /// Read request data with the minimum read rate enforced.
    ///
    /// Returns 0 once the peer has finished sending; the stream then moves to
    /// half-closed (remote).
    pub async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeouts = self.connection.timeouts();
        let timer = timeouts.timed_read();
        let result = tokio::select! {
            read = self.io.read(buf) => read.map_err(Error::from),
            _ = self.handle.cancellation().cancelled() => {
                Err(self.connection.stream_cancelled_error(self.handle.id()))
            }
        };
        drop(timer);

        let n = result?;
        if n == 0 {
            self.handle.complete_input();
        } else {
            timeouts.bytes_read(n as u64);
        }
        Ok(n)
    }

    /// Write response data, charging flow control frame by frame and
    /// enforcing the minimum write rate.
    pub async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(DEFAULT_MAX_FRAME_SIZE as usize) {
            // Chunks are bounded by the frame size, so the length fits.
            let len = chunk.len() as u32;
            self.reserve_send(len).await?;

            let _timer = self.connection.timeouts().timed_write(u64::from(len));
            self.io.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Finish the response: flush, close the write side and mark output
    /// complete.
    pub async fn finish(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        self.handle.complete_output();
        Ok(())
    }

    /// Reset the stream with `code`.
    pub fn abort(&mut self, code: ErrorCode) {
        self.io.abort(code);
        self.handle.abort(code);
    }
}

/// Drive one request stream through the application handler.
///
/// Handler errors and panics stay inside this stream unless the error is
/// fatal to the connection.
pub(super) async fn run_request<S, H>(handler: Arc<H>, stream: RequestStream<S>)
where
    S: TransportStream,
    H: StreamHandler<S>,
{
    let handle = Arc::clone(&stream.handle);
    let connection = Arc::clone(&stream.connection);
    let stream_id = handle.id();

    match AssertUnwindSafe(handler.handle(stream)).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(connection_id = connection.id(), %stream_id, "Request completed");
            handle.complete();
        }
        Ok(Err(e)) => {
            let code = e.error_code();
            if e.is_connection_fatal() {
                handle.abort(code);
                connection.abort(e);
            } else {
                warn!(connection_id = connection.id(), %stream_id, error = %e, "Request failed");
                handle.abort(code);
            }
        }
        Err(_) => {
            error!(connection_id = connection.id(), %stream_id, "Request handler panicked");
            handle.abort(ErrorCode::InternalError);
        }
    }
}
