//! Streams multiplexed over a connection.
//!
//! A [`StreamHandle`] is the connection-side record of one stream: its id,
//! direction, lifecycle state and cancellation token. Workers observe state
//! changes through a watch channel, so "input/output completed" and "aborted"
//! notifications are delivered even if the worker has not started yet.

mod registry;

pub use registry::StreamRegistry;

use std::fmt;
use std::sync::Weak;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionContext;
use crate::error::ErrorCode;

/// Numeric stream identifier, assigned by the stream initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(u64);

impl StreamId {
    /// Wrap a raw stream id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Purpose of a peer-initiated unidirectional stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniStreamType {
    /// Connection control frames (SETTINGS, GOAWAY).
    Control,
    /// Header compression encoder instructions.
    Encoder,
    /// Header compression decoder instructions.
    Decoder,
    /// Any stream type this core does not understand.
    Unknown(u64),
}

impl UniStreamType {
    /// Human-readable name, used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            UniStreamType::Control => "control",
            UniStreamType::Encoder => "encoder",
            UniStreamType::Decoder => "decoder",
            UniStreamType::Unknown(_) => "unknown",
        }
    }
}

/// Direction of a stream, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// Request/response stream readable and writable by both sides.
    Bidirectional,
    /// Peer-to-local stream carrying connection-level data.
    Unidirectional(UniStreamType),
}

impl StreamDirection {
    /// Check if this is a request/response stream.
    pub fn is_bidirectional(&self) -> bool {
        matches!(self, StreamDirection::Bidirectional)
    }
}

/// Lifecycle of a request stream.
///
/// ```text
/// Open --complete_output--> HalfClosedLocal --complete_input--> Closed
/// Open --complete_input---> HalfClosedRemote --complete_output-> Closed
/// any non-terminal --abort--> Aborted(code)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both directions open.
    Open,
    /// Local side finished writing.
    HalfClosedLocal,
    /// Peer finished writing.
    HalfClosedRemote,
    /// Both directions completed.
    Closed,
    /// Torn down with an error code.
    Aborted(ErrorCode),
}

impl StreamState {
    /// Closed or aborted; no further transitions happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Aborted(_))
    }
}

/// Connection-side record of one stream.
#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    direction: StreamDirection,
    state: watch::Sender<StreamState>,
    cancel: CancellationToken,
    connection: Weak<ConnectionContext>,
}

impl StreamHandle {
    /// Create a stream in the `Open` state.
    ///
    /// The connection reference is weak: a stream never keeps its
    /// connection alive.
    pub fn new(
        id: StreamId,
        direction: StreamDirection,
        connection: Weak<ConnectionContext>,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Open);
        Self {
            id,
            direction,
            state,
            cancel: CancellationToken::new(),
            connection,
        }
    }

    /// Create a stream that is not attached to any connection.
    pub fn detached(id: StreamId, direction: StreamDirection) -> Self {
        Self::new(id, direction, Weak::new())
    }

    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream direction.
    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Token cancelled when this stream is aborted.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until the stream leaves `Open` and return the new state.
    pub async fn wait_for_notification(&self) -> StreamState {
        let mut rx = self.subscribe();
        let notified = match rx.wait_for(|s| *s != StreamState::Open).await {
            Ok(state) => *state,
            // Sender lives in self, so this is unreachable while we hold &self.
            Err(_) => self.state(),
        };
        notified
    }

    /// Peer finished sending.
    pub fn complete_input(&self) {
        self.transition(|s| match s {
            StreamState::Open => Some(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => Some(StreamState::Closed),
            _ => None,
        });
    }

    /// Local side finished sending.
    pub fn complete_output(&self) {
        self.transition(|s| match s {
            StreamState::Open => Some(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => Some(StreamState::Closed),
            _ => None,
        });
    }

    /// Both directions completed.
    pub fn complete(&self) {
        self.transition(|s| if s.is_terminal() { None } else { Some(StreamState::Closed) });
    }

    /// Tear the stream down with an error code.
    ///
    /// Returns false if the stream had already reached a terminal state.
    pub fn abort(&self, code: ErrorCode) -> bool {
        let aborted =
            self.transition(|s| if s.is_terminal() { None } else { Some(StreamState::Aborted(code)) });
        if aborted {
            self.cancel.cancel();
        }
        aborted
    }

    fn transition<F>(&self, next: F) -> bool
    where
        F: FnOnce(StreamState) -> Option<StreamState>,
    {
        let mut reached = None;
        let changed = self.state.send_if_modified(|state| match next(*state) {
            Some(new_state) => {
                *state = new_state;
                reached = Some(new_state);
                true
            }
            None => false,
        });

        if let Some(state) = reached
            && state.is_terminal()
            && let Some(connection) = self.connection.upgrade()
        {
            connection.on_stream_finished(self.id, state);
        }
        changed
    }
}
