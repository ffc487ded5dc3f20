//! kmux-core: Multiplexed stream connection core.
//!
//! This crate provides:
//! - Stream registry with monotonic stream ids
//! - Credit-based flow control per connection and per stream
//! - Timeout control driven by a shared heartbeat
//! - Control channel (SETTINGS, GOAWAY, inbound control streams)
//! - Connection accept loop with graceful shutdown and abort
//! - Request admission queue
//! - Logging and metrics

pub mod admission;
pub mod clock;
pub mod config;
pub mod connection;
pub mod constants;
pub mod control;
pub mod error;
pub mod flow;
pub mod heartbeat;
pub mod logging;
pub mod metrics;
pub mod stream;
pub mod timeout;
pub mod transport;

pub use admission::{AdmissionPermit, AdmissionQueue, Throttled, TryEnter};
pub use clock::{Clock, SystemClock};
pub use config::MuxConfig;
pub use connection::{ConnectionContext, MultiplexedConnection, RequestStream, ShutdownKind};
pub use control::{ControlChannel, ControlFrame, ControlSink, Settings};
pub use error::{Error, ErrorCode, Result};
pub use flow::{FlowController, FlowScope};
pub use heartbeat::{Heartbeat, HeartbeatHandler, HeartbeatRegistration};
pub use logging::{LogFormat, init_logging, init_test_logging};
pub use metrics::ConnectionMetrics;
pub use stream::{StreamDirection, StreamHandle, StreamId, StreamRegistry, StreamState, UniStreamType};
pub use timeout::{MinDataRate, TimeoutControl, TimeoutReason};
pub use transport::{StreamHandler, Transport, TransportStream};
