//! Transport abstractions.
//!
//! The connection core never touches the wire. A [`Transport`] hands it
//! accepted streams and an outbound control sink; a [`StreamHandler`] is the
//! application worker that processes each request stream.
//!
//! Stream kinds:
//! - Bidirectional: one request/response exchange
//! - Unidirectional control: SETTINGS and GOAWAY from the peer
//! - Unidirectional encoder/decoder: header compression instructions

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::RequestStream;
use crate::control::{ControlFrame, ControlSink};
use crate::error::{ErrorCode, Result};
use crate::stream::{StreamDirection, StreamId};

// =============================================================================
// Stream Trait
// =============================================================================

/// One stream accepted from the transport.
///
/// The byte channel is exposed through `AsyncRead`/`AsyncWrite`. Control
/// streams additionally decode frames with [`read_control_frame`].
///
/// [`read_control_frame`]: TransportStream::read_control_frame
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Stream id assigned by the initiator.
    fn id(&self) -> StreamId;

    /// Direction and, for unidirectional streams, purpose.
    fn direction(&self) -> StreamDirection;

    /// Read the next control frame. `Ok(None)` means the peer closed the stream.
    fn read_control_frame(&mut self) -> impl Future<Output = Result<Option<ControlFrame>>> + Send;

    /// Reset the stream with an error code.
    fn abort(&mut self, code: ErrorCode);
}

// =============================================================================
// Transport Trait
// =============================================================================

/// A multiplexed transport connection (QUIC-style).
pub trait Transport: Send + Sync + 'static {
    /// The stream type produced by this transport.
    type Stream: TransportStream;

    /// Open the local outbound control stream.
    fn open_control_stream(&self) -> impl Future<Output = Result<Box<dyn ControlSink>>> + Send;

    /// Accept the next peer-initiated stream.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    fn accept_stream(&self) -> impl Future<Output = Result<Option<Self::Stream>>> + Send;

    /// Close the connection with an application error code.
    fn close(&self, code: ErrorCode);
}

// =============================================================================
// Handler Trait
// =============================================================================

/// Application worker run once per accepted request stream.
///
/// Returning an error that is fatal to the connection (see
/// [`Error::is_connection_fatal`](crate::Error::is_connection_fatal)) aborts
/// the whole connection; any other error only aborts this stream.
pub trait StreamHandler<S: TransportStream>: Send + Sync + 'static {
    /// Process one request stream to completion.
    fn handle(&self, stream: RequestStream<S>) -> impl Future<Output = Result<()>> + Send;
}
