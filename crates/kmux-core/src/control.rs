//! Connection-level control frames.
//!
//! Each connection has exactly one outbound control stream, opened before any
//! request stream is accepted, and at most one inbound control, encoder and
//! decoder stream from the peer. The peer grants send credit on its control
//! stream with WINDOW_UPDATE frames.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MuxConfig;
use crate::constants::{DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT, MAX_WINDOW_SIZE};
use crate::error::{Error, Result};
use crate::stream::{StreamId, UniStreamType};

/// Connection settings exchanged at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Request streams the sender will process concurrently.
    pub max_concurrent_streams: u32,
    /// Initial per-stream flow-control window.
    pub initial_window_size: u32,
    /// Largest frame payload the sender accepts.
    pub max_frame_size: u32,
    /// Largest header block the sender accepts, if limited.
    pub max_field_section_size: Option<u64>,
}

impl Settings {
    /// Local settings advertised for `config`.
    pub fn from_config(config: &MuxConfig) -> Self {
        Self {
            max_concurrent_streams: config.max_concurrent_streams,
            initial_window_size: config.initial_stream_window,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_field_section_size: None,
        }
    }
}

impl Settings {
    /// Check values received from a peer.
    pub fn validate(&self) -> Result<()> {
        if self.initial_window_size > MAX_WINDOW_SIZE as u32 {
            return Err(Error::Settings {
                message: format!(
                    "initial window size {} exceeds {MAX_WINDOW_SIZE}",
                    self.initial_window_size
                ),
            });
        }
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&self.max_frame_size) {
            return Err(Error::Settings {
                message: format!("max frame size {} out of range", self.max_frame_size),
            });
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&MuxConfig::default())
    }
}

/// Frames carried on a control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlFrame {
    /// Connection settings; must be the first frame.
    Settings(Settings),
    /// No streams above `last_stream_id` will be processed.
    GoAway { last_stream_id: StreamId },
    /// Send credit for one stream, or for the whole connection when
    /// `stream` is `None`.
    WindowUpdate {
        stream: Option<StreamId>,
        increment: u32,
    },
}

/// Write half of the outbound control stream.
///
/// Encoding the frame onto the wire is the implementor's job.
#[async_trait]
pub trait ControlSink: Send + Sync {
    /// Write one frame.
    async fn send_frame(&mut self, frame: &ControlFrame) -> Result<()>;
}

/// What the connection should do after an inbound control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Peer settings arrived; the handshake is complete.
    Settings(Settings),
    /// Peer will not process streams above this id.
    GoAway(StreamId),
    /// Peer granted send credit.
    WindowUpdate {
        stream: Option<StreamId>,
        increment: u32,
    },
}

#[derive(Debug, Default)]
struct InboundSlots {
    control: OnceLock<StreamId>,
    encoder: OnceLock<StreamId>,
    decoder: OnceLock<StreamId>,
}

#[derive(Debug, Default)]
struct PeerState {
    settings: Option<Settings>,
    goaway: Option<StreamId>,
}

/// Outbound control stream plus inbound control bookkeeping.
pub struct ControlChannel {
    sink: tokio::sync::Mutex<Option<Box<dyn ControlSink>>>,
    goaway_sent: Mutex<Option<StreamId>>,
    inbound: InboundSlots,
    peer: Mutex<PeerState>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("goaway_sent", &self.goaway_sent())
            .field("inbound", &self.inbound)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ControlChannel {
    /// Create a channel with no outbound stream attached yet.
    pub fn new() -> Self {
        Self {
            sink: tokio::sync::Mutex::new(None),
            goaway_sent: Mutex::new(None),
            inbound: InboundSlots::default(),
            peer: Mutex::new(PeerState::default()),
        }
    }

    /// Attach the outbound control stream.
    ///
    /// Returns false if one is already attached.
    pub async fn attach(&self, sink: Box<dyn ControlSink>) -> bool {
        let mut slot = self.sink.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(sink);
        true
    }

    async fn send(&self, frame: &ControlFrame) -> Result<()> {
        let mut slot = self.sink.lock().await;
        let sink = slot
            .as_mut()
            .ok_or(Error::ClosedCriticalStream { kind: "control" })?;
        sink.send_frame(frame).await
    }

    /// Send local SETTINGS.
    pub async fn send_settings(&self, settings: Settings) -> Result<()> {
        debug!(?settings, "Sending SETTINGS");
        self.send(&ControlFrame::Settings(settings)).await
    }

    /// Send GOAWAY once.
    ///
    /// The sent flag is recorded before any I/O, so only the first caller
    /// writes. Returns `Ok(false)` for every later call.
    pub async fn send_goaway(&self, last_stream_id: StreamId) -> Result<bool> {
        {
            let mut sent = lock(&self.goaway_sent);
            if sent.is_some() {
                return Ok(false);
            }
            *sent = Some(last_stream_id);
        }
        debug!(%last_stream_id, "Sending GOAWAY");
        self.send(&ControlFrame::GoAway { last_stream_id }).await?;
        Ok(true)
    }

    /// Check if GOAWAY has been sent (or is being sent).
    pub fn goaway_sent(&self) -> bool {
        lock(&self.goaway_sent).is_some()
    }

    /// Register the peer's inbound control stream. First registration wins.
    pub fn set_inbound_control_stream(&self, id: StreamId) -> bool {
        self.inbound.control.set(id).is_ok()
    }

    /// Register the peer's encoder stream. First registration wins.
    pub fn set_inbound_encoder_stream(&self, id: StreamId) -> bool {
        self.inbound.encoder.set(id).is_ok()
    }

    /// Register the peer's decoder stream. First registration wins.
    pub fn set_inbound_decoder_stream(&self, id: StreamId) -> bool {
        self.inbound.decoder.set(id).is_ok()
    }

    /// Register an inbound stream by type.
    ///
    /// Unknown stream types are never registered.
    pub fn register_inbound(&self, kind: UniStreamType, id: StreamId) -> bool {
        match kind {
            UniStreamType::Control => self.set_inbound_control_stream(id),
            UniStreamType::Encoder => self.set_inbound_encoder_stream(id),
            UniStreamType::Decoder => self.set_inbound_decoder_stream(id),
            UniStreamType::Unknown(_) => false,
        }
    }

    /// Registered inbound control stream.
    pub fn inbound_control_stream(&self) -> Option<StreamId> {
        self.inbound.control.get().copied()
    }

    /// Registered inbound encoder stream.
    pub fn inbound_encoder_stream(&self) -> Option<StreamId> {
        self.inbound.encoder.get().copied()
    }

    /// Registered inbound decoder stream.
    pub fn inbound_decoder_stream(&self) -> Option<StreamId> {
        self.inbound.decoder.get().copied()
    }

    /// Validate a frame read from the inbound control stream.
    ///
    /// The first frame must be SETTINGS and SETTINGS may only arrive once.
    /// A peer GOAWAY may repeat but its id must not increase. A
    /// WINDOW_UPDATE must grant some credit.
    pub fn on_control_frame_received(&self, frame: ControlFrame) -> Result<ControlEvent> {
        let mut peer = lock(&self.peer);
        match frame {
            ControlFrame::Settings(settings) => {
                if peer.settings.is_some() {
                    return Err(Error::protocol("duplicate SETTINGS on control stream"));
                }
                settings.validate()?;
                peer.settings = Some(settings);
                Ok(ControlEvent::Settings(settings))
            }
            _ if peer.settings.is_none() => Err(Error::protocol(
                "first frame on control stream must be SETTINGS",
            )),
            ControlFrame::WindowUpdate { increment: 0, .. } => {
                Err(Error::protocol("WINDOW_UPDATE with zero increment"))
            }
            ControlFrame::WindowUpdate { stream, increment } => {
                Ok(ControlEvent::WindowUpdate { stream, increment })
            }
            ControlFrame::GoAway { last_stream_id } => {
                if peer.goaway.is_some_and(|previous| last_stream_id > previous) {
                    return Err(Error::protocol(format!(
                        "GOAWAY id increased to {last_stream_id}"
                    )));
                }
                peer.goaway = Some(last_stream_id);
                Ok(ControlEvent::GoAway(last_stream_id))
            }
        }
    }

    /// Settings received from the peer.
    pub fn peer_settings(&self) -> Option<Settings> {
        lock(&self.peer).settings
    }

    /// Last GOAWAY id received from the peer.
    pub fn peer_goaway(&self) -> Option<StreamId> {
        lock(&self.peer).goaway
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}
