//! Protocol limits and configuration defaults for kmux.

use std::time::Duration;

// =============================================================================
// Flow Control Constants
// =============================================================================

/// Largest legal flow-control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: i32 = i32::MAX;

/// Default initial per-stream send window.
pub const DEFAULT_INITIAL_STREAM_WINDOW: u32 = 65_535;

/// Default connection-level send window.
pub const DEFAULT_CONNECTION_WINDOW: u32 = 65_535;

/// Largest frame payload advertised in SETTINGS.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Upper bound a peer may advertise for its frame size (2^24 - 1).
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16_777_215;

// =============================================================================
// Timing Constants
// =============================================================================

/// Interval between heartbeat ticks.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Keep-alive timeout applied while a connection has no active streams.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(130);

/// Time allowed for the peer to finish its connection preamble (SETTINGS).
pub const DEFAULT_REQUEST_HEADERS_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum acceptable data rate in bytes per second.
pub const DEFAULT_MIN_DATA_RATE: f64 = 240.0;

/// Grace period before a minimum data rate is enforced.
pub const DEFAULT_MIN_DATA_RATE_GRACE: Duration = Duration::from_secs(5);

/// Longest deadline a single timed write can be given.
pub const MAX_DATA_RATE_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Time a graceful shutdown waits for in-flight streams.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Concurrency Limits
// =============================================================================

/// Default maximum concurrent request streams per connection.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Default maximum concurrently admitted requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Default maximum requests waiting for admission.
pub const DEFAULT_REQUEST_QUEUE_LIMIT: usize = 5000;
