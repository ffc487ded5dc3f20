//! Control sink that records every frame written to it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kmux_core::control::{ControlFrame, ControlSink};
use kmux_core::error::Result;

/// Shared, cloneable record of outbound control frames.
#[derive(Debug, Clone, Default)]
pub struct RecordingControlSink {
    frames: Arc<Mutex<Vec<ControlFrame>>>,
}

impl RecordingControlSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames written so far, in order.
    pub fn frames(&self) -> Vec<ControlFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// Number of GOAWAY frames written.
    pub fn goaway_count(&self) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| matches!(f, ControlFrame::GoAway { .. }))
            .count()
    }
}

#[async_trait]
impl ControlSink for RecordingControlSink {
    async fn send_frame(&mut self, frame: &ControlFrame) -> Result<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}
