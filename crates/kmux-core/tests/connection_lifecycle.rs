use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use kmux_core::connection::{MultiplexedConnection, RequestStream, ShutdownKind};
use kmux_core::control::ControlFrame;
use kmux_core::error::{Error, ErrorCode, Result};
use kmux_core::flow::FlowScope;
use kmux_core::stream::{StreamId, StreamState};
use kmux_core::transport::StreamHandler;
use kmux_core::MuxConfig;
use kmux_test_utils::{FakeClock, MockPeer, MockStream, MockTransport, eventually, mock_transport};

const WAIT: Duration = Duration::from_secs(2);

fn connect<H>(handler: H, config: MuxConfig) -> (MultiplexedConnection<MockTransport, H>, MockPeer)
where
    H: StreamHandler<MockStream>,
{
    let (transport, peer) = mock_transport();
    let conn = MultiplexedConnection::new(1, transport, handler, config, Arc::new(FakeClock::new()))
        .expect("valid config");
    (conn, peer)
}

/// Records the first state change each request observes.
#[derive(Clone, Default)]
struct NotificationRecorder {
    seen: Arc<Mutex<Vec<(StreamId, StreamState)>>>,
}

impl NotificationRecorder {
    fn seen(&self) -> Vec<(StreamId, StreamState)> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort_by_key(|(id, _)| *id);
        seen
    }
}

impl StreamHandler<MockStream> for NotificationRecorder {
    async fn handle(&self, stream: RequestStream<MockStream>) -> Result<()> {
        let handle = Arc::clone(stream.handle());
        let state = handle.wait_for_notification().await;
        self.seen.lock().unwrap().push((stream.id(), state));
        Ok(())
    }
}

/// Never finishes on its own.
struct Stuck;

impl StreamHandler<MockStream> for Stuck {
    async fn handle(&self, _stream: RequestStream<MockStream>) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn peer_disconnect_completes_streams_gracefully() {
    kmux_core::init_test_logging();
    let recorder = NotificationRecorder::default();
    let (conn, peer) = connect(recorder.clone(), MuxConfig::default());
    let ctx = conn.context().clone();

    let _a = peer.open_request(0).unwrap();
    let _b = peer.open_request(4).unwrap();
    peer.disconnect();

    let kind = conn.run().await;

    assert!(kind.is_graceful());
    assert_eq!(
        recorder.seen(),
        vec![
            (StreamId::new(0), StreamState::HalfClosedRemote),
            (StreamId::new(4), StreamState::HalfClosedRemote),
        ]
    );

    let frames = peer.sent_frames();
    assert!(matches!(frames.first(), Some(ControlFrame::Settings(_))));
    assert_eq!(
        frames.last(),
        Some(&ControlFrame::GoAway {
            last_stream_id: StreamId::new(4)
        })
    );
    assert_eq!(peer.close_code(), Some(ErrorCode::NoError));

    assert!(ctx.streams().is_empty());
    let metrics = ctx.metrics();
    assert_eq!(metrics.streams_accepted, 2);
    assert_eq!(metrics.streams_completed, 2);
    assert_eq!(metrics.streams_aborted, 0);
}

#[tokio::test]
async fn abort_tears_down_live_streams() {
    let (conn, peer) = connect(NotificationRecorder::default(), MuxConfig::default());
    let ctx = conn.context().clone();

    let _a = peer.open_request(0).unwrap();
    let task = tokio::spawn(conn.run());

    assert!(eventually(WAIT, || ctx.streams().len() == 1).await);
    let handle = ctx.streams().try_get(StreamId::new(0)).unwrap();

    assert!(ctx.abort(Error::protocol("malformed frame")));
    assert!(!ctx.abort(Error::transport("reset")));

    let kind = task.await.unwrap();
    match kind {
        ShutdownKind::Aborted(error) => assert!(matches!(*error, Error::Protocol { .. })),
        ShutdownKind::Graceful => panic!("expected abort"),
    }

    assert_eq!(handle.state(), StreamState::Aborted(ErrorCode::ProtocolError));
    assert!(handle.cancellation().is_cancelled());
    assert_eq!(peer.close_code(), Some(ErrorCode::ProtocolError));
    assert_eq!(peer.control().goaway_count(), 0);
}

#[tokio::test]
async fn out_of_order_stream_id_aborts_connection() {
    let (conn, peer) = connect(NotificationRecorder::default(), MuxConfig::default());
    let ctx = conn.context().clone();

    let _high = peer.open_request(8).unwrap();
    let low = peer.open_request(4).unwrap();

    let kind = conn.run().await;

    match kind {
        ShutdownKind::Aborted(error) => {
            assert!(matches!(*error, Error::StreamCreation { .. }));
        }
        ShutdownKind::Graceful => panic!("expected abort"),
    }
    assert_eq!(low.abort_code(), Some(ErrorCode::StreamCreationError));
    assert_eq!(ctx.highest_stream_id(), Some(StreamId::new(8)));
    assert_eq!(peer.close_code(), Some(ErrorCode::StreamCreationError));
}

#[tokio::test]
async fn streams_over_limit_are_refused() {
    let config = MuxConfig::default().with_max_concurrent_streams(1);
    let recorder = NotificationRecorder::default();
    let (conn, peer) = connect(recorder.clone(), config);
    let ctx = conn.context().clone();

    let _first = peer.open_request(0).unwrap();
    let second = peer.open_request(4).unwrap();
    peer.disconnect();

    let kind = conn.run().await;

    assert!(kind.is_graceful());
    assert_eq!(second.abort_code(), Some(ErrorCode::RequestRejected));
    assert_eq!(
        recorder.seen(),
        vec![(StreamId::new(0), StreamState::HalfClosedRemote)]
    );

    let metrics = ctx.metrics();
    assert_eq!(metrics.streams_accepted, 1);
    assert_eq!(metrics.streams_refused, 1);
}

/// Fails, panics or succeeds depending on the stream id.
struct Mixed;

impl StreamHandler<MockStream> for Mixed {
    async fn handle(&self, stream: RequestStream<MockStream>) -> Result<()> {
        match stream.id().value() {
            0 => Err(Error::Handler {
                message: "bad request".into(),
            }),
            4 => panic!("handler bug"),
            _ => {
                let handle = Arc::clone(stream.handle());
                handle.wait_for_notification().await;
                Ok(())
            }
        }
    }
}

#[tokio::test]
async fn handler_failures_stay_in_their_stream() {
    let (conn, peer) = connect(Mixed, MuxConfig::default());
    let ctx = conn.context().clone();

    let _a = peer.open_request(0).unwrap();
    let _b = peer.open_request(4).unwrap();
    let _c = peer.open_request(8).unwrap();
    peer.disconnect();

    let kind = conn.run().await;

    assert!(kind.is_graceful());
    assert!(!ctx.is_aborted());
    let metrics = ctx.metrics();
    assert_eq!(metrics.streams_aborted, 2);
    assert_eq!(metrics.streams_completed, 1);
    assert_eq!(peer.close_code(), Some(ErrorCode::NoError));
}

#[tokio::test]
async fn stop_processing_next_request_drains() {
    let (conn, peer) = connect(NotificationRecorder::default(), MuxConfig::default());
    let ctx = conn.context().clone();

    let _a = peer.open_request(0).unwrap();
    let task = tokio::spawn(conn.run());
    assert!(eventually(WAIT, || ctx.streams().len() == 1).await);

    ctx.stop_processing_next_request();
    let kind = task.await.unwrap();

    assert!(kind.is_graceful());
    assert!(!ctx.is_aborted());
    assert_eq!(peer.control().goaway_count(), 1);
    assert_eq!(ctx.metrics().streams_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn stragglers_aborted_after_shutdown_timeout() {
    let config = MuxConfig::default().with_shutdown_timeout(Duration::from_millis(50));
    let (conn, peer) = connect(Stuck, config);
    let ctx = conn.context().clone();

    let _a = peer.open_request(0).unwrap();
    let task = tokio::spawn(conn.run());
    assert!(eventually(WAIT, || ctx.streams().len() == 1).await);
    let handle = ctx.streams().try_get(StreamId::new(0)).unwrap();

    peer.disconnect();
    let kind = task.await.unwrap();

    assert!(kind.is_graceful());
    assert_eq!(handle.state(), StreamState::Aborted(ErrorCode::RequestCancelled));
    assert!(ctx.streams().is_empty());
    assert_eq!(peer.close_code(), Some(ErrorCode::NoError));
}

/// Reads the whole request and echoes it back upper-cased.
struct Echo;

impl StreamHandler<MockStream> for Echo {
    async fn handle(&self, mut stream: RequestStream<MockStream>) -> Result<()> {
        let mut body = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = stream.read_data(&mut buf).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
        assert_eq!(stream.handle().state(), StreamState::HalfClosedRemote);

        stream.write_data(&body.to_ascii_uppercase()).await?;
        stream.finish().await
    }
}

#[tokio::test]
async fn request_data_is_flow_controlled() {
    let (conn, peer) = connect(Echo, MuxConfig::default());
    let ctx = conn.context().clone();

    let mut request = peer.open_request(0).unwrap();
    request.io().write_all(b"hello").await.unwrap();
    request.io().shutdown().await.unwrap();

    let task = tokio::spawn(conn.run());

    let mut response = Vec::new();
    request.io().read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"HELLO");

    assert!(eventually(WAIT, || ctx.metrics().streams_completed == 1).await);
    // The finished stream handed its connection credit back.
    assert_eq!(ctx.flow().window(FlowScope::Connection), Some(65_535));

    peer.disconnect();
    assert!(task.await.unwrap().is_graceful());
}

/// Reads the request to its end, then completes without a response.
struct Drain;

impl StreamHandler<MockStream> for Drain {
    async fn handle(&self, mut stream: RequestStream<MockStream>) -> Result<()> {
        let mut buf = [0u8; 64];
        while stream.read_data(&mut buf).await? > 0 {}
        Ok(())
    }
}

#[tokio::test]
async fn refused_stream_id_still_counts_as_seen() {
    let config = MuxConfig::default().with_max_concurrent_streams(1);
    let (conn, peer) = connect(Drain, config);
    let ctx = conn.context().clone();
    let task = tokio::spawn(conn.run());

    let mut first = peer.open_request(0).unwrap();
    assert!(eventually(WAIT, || ctx.streams().len() == 1).await);

    let refused = peer.open_request(8).unwrap();
    assert!(eventually(WAIT, || refused.abort_code().is_some()).await);
    assert_eq!(refused.abort_code(), Some(ErrorCode::RequestRejected));
    assert_eq!(ctx.highest_stream_id(), Some(StreamId::new(8)));

    first.io().shutdown().await.unwrap();
    assert!(eventually(WAIT, || ctx.metrics().streams_completed == 1).await);

    let lower = peer.open_request(4).unwrap();
    match task.await.unwrap() {
        ShutdownKind::Aborted(error) => {
            assert!(matches!(*error, Error::StreamCreation { .. }));
        }
        ShutdownKind::Graceful => panic!("expected abort"),
    }
    assert_eq!(lower.abort_code(), Some(ErrorCode::StreamCreationError));
    assert_eq!(ctx.highest_stream_id(), Some(StreamId::new(8)));

    let metrics = ctx.metrics();
    assert_eq!(metrics.streams_accepted, 1);
    assert_eq!(metrics.streams_refused, 1);
}

#[tokio::test]
async fn out_of_order_id_at_limit_aborts_instead_of_refusing() {
    let config = MuxConfig::default().with_max_concurrent_streams(1);
    let (conn, peer) = connect(NotificationRecorder::default(), config);
    let ctx = conn.context().clone();

    let _high = peer.open_request(8).unwrap();
    let low = peer.open_request(4).unwrap();

    let kind = conn.run().await;

    assert!(!kind.is_graceful());
    assert_eq!(low.abort_code(), Some(ErrorCode::StreamCreationError));
    assert_eq!(ctx.metrics().streams_refused, 0);
    assert_eq!(peer.close_code(), Some(ErrorCode::StreamCreationError));
}

/// Sends a fixed-size response without reading the request.
struct Respond(usize);

impl StreamHandler<MockStream> for Respond {
    async fn handle(&self, mut stream: RequestStream<MockStream>) -> Result<()> {
        stream.write_data(&vec![b'r'; self.0]).await?;
        stream.finish().await
    }
}

#[tokio::test]
async fn sequential_responses_larger_than_half_the_window() {
    let (conn, peer) = connect(Respond(40_000), MuxConfig::default());
    let ctx = conn.context().clone();
    let task = tokio::spawn(conn.run());

    for (n, id) in [0, 4].into_iter().enumerate() {
        let mut request = peer.open_request(id).unwrap();
        let mut body = Vec::new();
        tokio::time::timeout(WAIT, request.io().read_to_end(&mut body))
            .await
            .expect("response should not stall on flow control")
            .unwrap();
        assert_eq!(body.len(), 40_000);
        assert!(eventually(WAIT, || ctx.metrics().streams_completed == n as u64 + 1).await);
    }
    assert_eq!(ctx.flow().window(FlowScope::Connection), Some(65_535));

    peer.disconnect();
    assert!(task.await.unwrap().is_graceful());
}
