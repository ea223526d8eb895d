//! Subtitle Support
//!
//! Decoded cues from the active subtitle stream, queued by presentation time
//! for the overlay renderer.

use crate::decode::{DecodeError, MediaPacket, SubtitleDecoder};
use crate::stream_queue::{PacketHandler, QueueControl};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

// ============================================================================
// Subtitle Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleCue {
    pub start_time: f64, // seconds
    pub end_time: f64,
    pub text: String,
}

impl SubtitleCue {
    pub fn new(start_time: f64, end_time: f64, text: impl Into<String>) -> Self {
        Self {
            start_time,
            end_time,
            text: text.into(),
        }
    }

    pub fn is_visible_at(&self, pts: f64) -> bool {
        pts >= self.start_time && pts < self.end_time
    }
}

// ============================================================================
// Subtitle Queue
// ============================================================================

/// Cues shared between the subtitle decode thread and the renderer
#[derive(Debug, Default)]
pub struct SubtitleQueue {
    cues: Mutex<VecDeque<SubtitleCue>>,
}

impl SubtitleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping start order
    pub fn push(&self, cue: SubtitleCue) {
        let mut cues = self.cues.lock();
        let at = cues
            .iter()
            .position(|c| c.start_time > cue.start_time)
            .unwrap_or(cues.len());
        cues.insert(at, cue);
    }

    /// Cues visible at `pts`; expired ones are discarded
    pub fn visible_at(&self, pts: f64) -> Vec<SubtitleCue> {
        let mut cues = self.cues.lock();
        cues.retain(|c| c.end_time > pts);
        cues.iter().filter(|c| c.is_visible_at(pts)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cues.lock().clear();
    }
}

// ============================================================================
// Decode Role
// ============================================================================

/// Decodes the active subtitle stream into a [`SubtitleQueue`]
pub struct SubtitleRenderer {
    queue: Arc<SubtitleQueue>,
    decoder: Option<Box<dyn SubtitleDecoder>>,
}

impl SubtitleRenderer {
    pub fn new(queue: Arc<SubtitleQueue>) -> Self {
        Self { queue, decoder: None }
    }
}

impl PacketHandler for SubtitleRenderer {
    type Setup = Box<dyn SubtitleDecoder>;

    fn start(&mut self, decoder: Box<dyn SubtitleDecoder>, _ctl: &QueueControl) -> Result<(), DecodeError> {
        self.queue.clear();
        self.decoder = Some(decoder);
        Ok(())
    }

    fn packet(&mut self, packet: MediaPacket, ctl: &QueueControl) -> Result<(), DecodeError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        for cue in decoder.decode(&packet)? {
            ctl.frame_ready(cue.start_time);
            self.queue.push(cue);
        }
        Ok(())
    }

    fn flush(&mut self, _ctl: &QueueControl) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        self.queue.clear();
    }

    fn stop(&mut self, _ctl: &QueueControl) {
        self.decoder = None;
        self.queue.clear();
    }
}

// ============================================================================
// Timing Adjustment
// ============================================================================

/// Shift all cues by offset (positive = later)
pub fn shift_subtitles(cues: &mut [SubtitleCue], offset_seconds: f64) {
    for cue in cues {
        cue.start_time = (cue.start_time + offset_seconds).max(0.0);
        cue.end_time = (cue.end_time + offset_seconds).max(0.0);
    }
}
