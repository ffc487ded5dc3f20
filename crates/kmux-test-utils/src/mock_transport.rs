//! Mock transport for testing without real network.
//!
//! [`mock_transport`] returns the connection side ([`MockTransport`]) and a
//! [`MockPeer`] that opens streams into it. Each stream is an in-memory
//! duplex pipe; control streams also carry a frame channel.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use kmux_core::control::{ControlFrame, ControlSink};
use kmux_core::error::{Error, ErrorCode, Result};
use kmux_core::stream::{StreamDirection, StreamId, UniStreamType};
use kmux_core::transport::{Transport, TransportStream};

use crate::control_sink::RecordingControlSink;

const PIPE_CAPACITY: usize = 64 * 1024;

type AbortSlot = Arc<Mutex<Option<ErrorCode>>>;

/// Connection-side half of a mock stream.
#[derive(Debug)]
pub struct MockStream {
    id: StreamId,
    direction: StreamDirection,
    io: DuplexStream,
    frames: Option<mpsc::UnboundedReceiver<ControlFrame>>,
    aborted: AbortSlot,
}

/// Peer-side half of a mock stream.
#[derive(Debug)]
pub struct PeerStream {
    id: StreamId,
    io: DuplexStream,
    frames: Option<mpsc::UnboundedSender<ControlFrame>>,
    aborted: AbortSlot,
}

/// Create a connected stream pair.
pub fn mock_stream(id: StreamId, direction: StreamDirection) -> (MockStream, PeerStream) {
    let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (frame_tx, frame_rx) = match direction {
        StreamDirection::Unidirectional(UniStreamType::Control) => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        }
        _ => (None, None),
    };
    let aborted = AbortSlot::default();

    let stream = MockStream {
        id,
        direction,
        io: local,
        frames: frame_rx,
        aborted: Arc::clone(&aborted),
    };
    let peer = PeerStream {
        id,
        io: remote,
        frames: frame_tx,
        aborted,
    };
    (stream, peer)
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl TransportStream for MockStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn direction(&self) -> StreamDirection {
        self.direction
    }

    async fn read_control_frame(&mut self) -> Result<Option<ControlFrame>> {
        match self.frames.as_mut() {
            Some(rx) => Ok(rx.recv().await),
            None => Err(Error::protocol(format!("stream {} is not a control stream", self.id))),
        }
    }

    fn abort(&mut self, code: ErrorCode) {
        *self.aborted.lock().unwrap() = Some(code);
    }
}

impl PeerStream {
    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Peer end of the byte pipe.
    pub fn io(&mut self) -> &mut DuplexStream {
        &mut self.io
    }

    /// Send a control frame. Returns false if this is not a control stream
    /// or the connection side is gone.
    pub fn send_frame(&self, frame: ControlFrame) -> bool {
        self.frames
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Close the frame channel, as if the peer finished the control stream.
    pub fn close_frames(&mut self) {
        self.frames = None;
    }

    /// Code the connection reset this stream with, if any.
    pub fn abort_code(&self) -> Option<ErrorCode> {
        *self.aborted.lock().unwrap()
    }
}

/// Connection side of the mock transport.
#[derive(Debug)]
pub struct MockTransport {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockStream>>,
    control: RecordingControlSink,
    closed: AbortSlot,
}

/// Peer side of the mock transport.
#[derive(Debug)]
pub struct MockPeer {
    incoming: Mutex<Option<mpsc::UnboundedSender<MockStream>>>,
    control: RecordingControlSink,
    closed: AbortSlot,
}

/// Create a mock transport and its peer.
pub fn mock_transport() -> (MockTransport, MockPeer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let control = RecordingControlSink::new();
    let closed = AbortSlot::default();

    let transport = MockTransport {
        incoming: tokio::sync::Mutex::new(rx),
        control: control.clone(),
        closed: Arc::clone(&closed),
    };
    let peer = MockPeer {
        incoming: Mutex::new(Some(tx)),
        control,
        closed,
    };
    (transport, peer)
}

impl Transport for MockTransport {
    type Stream = MockStream;

    async fn open_control_stream(&self) -> Result<Box<dyn ControlSink>> {
        Ok(Box::new(self.control.clone()))
    }

    async fn accept_stream(&self) -> Result<Option<MockStream>> {
        Ok(self.incoming.lock().await.recv().await)
    }

    fn close(&self, code: ErrorCode) {
        *self.closed.lock().unwrap() = Some(code);
    }
}

impl MockPeer {
    /// Open a stream toward the connection.
    ///
    /// Returns `None` after [`disconnect`](Self::disconnect) or if the
    /// connection side has been dropped.
    pub fn open_stream(&self, id: u64, direction: StreamDirection) -> Option<PeerStream> {
        let (stream, peer) = mock_stream(StreamId::new(id), direction);
        self.incoming.lock().unwrap().as_ref()?.send(stream).ok()?;
        Some(peer)
    }

    /// Open a bidirectional request stream.
    pub fn open_request(&self, id: u64) -> Option<PeerStream> {
        self.open_stream(id, StreamDirection::Bidirectional)
    }

    /// Open a unidirectional stream of the given type.
    pub fn open_uni(&self, id: u64, kind: UniStreamType) -> Option<PeerStream> {
        self.open_stream(id, StreamDirection::Unidirectional(kind))
    }

    /// Frames the connection wrote on its outbound control stream.
    pub fn sent_frames(&self) -> Vec<ControlFrame> {
        self.control.frames()
    }

    /// The recording sink behind the connection's outbound control stream.
    pub fn control(&self) -> &RecordingControlSink {
        &self.control
    }

    /// Code the connection closed the transport with, if closed.
    pub fn close_code(&self) -> Option<ErrorCode> {
        *self.closed.lock().unwrap()
    }

    /// Disconnect cleanly: the connection's next accept returns `None`.
    pub fn disconnect(&self) {
        self.incoming.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn stream_bytes_flow_both_ways() {
        let (mut stream, mut peer) = mock_stream(StreamId::new(0), StreamDirection::Bidirectional);

        peer.io().write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stream.write_all(b"pong").await.unwrap();
        peer.io().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn control_frames_delivered_until_closed() {
        let (mut stream, mut peer) =
            mock_stream(StreamId::new(2), StreamDirection::Unidirectional(UniStreamType::Control));

        let frame = ControlFrame::GoAway {
            last_stream_id: StreamId::new(0),
        };
        assert!(peer.send_frame(frame.clone()));
        assert_eq!(stream.read_control_frame().await.unwrap(), Some(frame));

        peer.close_frames();
        assert_eq!(stream.read_control_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn request_stream_has_no_frames() {
        let (mut stream, peer) = mock_stream(StreamId::new(0), StreamDirection::Bidirectional);
        assert!(!peer.send_frame(ControlFrame::GoAway {
            last_stream_id: StreamId::new(0)
        }));
        assert!(stream.read_control_frame().await.is_err());
    }

    #[tokio::test]
    async fn abort_visible_to_peer() {
        let (mut stream, peer) = mock_stream(StreamId::new(4), StreamDirection::Bidirectional);
        stream.abort(ErrorCode::RequestRejected);
        assert_eq!(peer.abort_code(), Some(ErrorCode::RequestRejected));
    }

    #[tokio::test]
    async fn accept_returns_none_after_disconnect() {
        let (transport, peer) = mock_transport();
        let _stream = peer.open_request(0).unwrap();
        peer.disconnect();
        assert!(peer.open_request(4).is_none());

        let first = transport.accept_stream().await.unwrap().unwrap();
        assert_eq!(first.id(), StreamId::new(0));
        assert!(transport.accept_stream().await.unwrap().is_none());
    }
}
