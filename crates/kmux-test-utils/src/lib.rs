//! kmux-test-utils: Test infrastructure for kmux.
//!
//! Provides:
//! - MockTransport / MockPeer: In-memory transport for driving connections
//! - RecordingControlSink: Captures outbound control frames
//! - FakeClock: Hand-driven clock for deterministic timeouts

mod control_sink;
mod fake_clock;
mod mock_transport;

use std::time::Duration;

pub use control_sink::RecordingControlSink;
pub use fake_clock::FakeClock;
pub use mock_transport::{MockPeer, MockStream, MockTransport, PeerStream, mock_stream, mock_transport};

/// Poll `condition` until it holds or `timeout` passes.
///
/// Returns whether the condition was met.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
