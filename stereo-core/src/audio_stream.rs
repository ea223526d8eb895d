//! Audio decode role: decodes the active audio stream into an output device
//! and provides the master clock.

use crate::decode::{AudioDecoder, AudioOutput, DecodeError, MediaPacket, StreamInfo};
use crate::playback::PlayEvent;
use crate::stream_queue::{PacketHandler, QueueControl};
use std::thread;
use std::time::Duration;

/// Device backlog above which decoding waits
const MAX_BUFFERED_SECS: f64 = 0.5;

const WAIT_STEP: Duration = Duration::from_millis(10);

pub struct AudioSetup {
    pub stream: StreamInfo,
    pub decoder: Box<dyn AudioDecoder>,
    pub output: Box<dyn AudioOutput>,
}

struct ActiveAudio {
    decoder: Box<dyn AudioDecoder>,
    output: Box<dyn AudioOutput>,
    /// Pts of the first chunk after start/flush
    base: Option<f64>,
}

impl ActiveAudio {
    fn report(&self, ctl: &QueueControl) {
        let connected = self.output.is_connected();
        ctl.set_disconnected(!connected);
        let clock = match (self.base, self.output.position()) {
            (Some(base), Some(played)) if connected => Some(base + played),
            _ => None,
        };
        // samples queued before a seek must not move the clock back
        ctl.publish_device_clock(clock);
    }
}

#[derive(Default)]
pub struct AudioRenderer {
    active: Option<ActiveAudio>,
}

impl AudioRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketHandler for AudioRenderer {
    type Setup = AudioSetup;

    fn start(&mut self, setup: AudioSetup, _ctl: &QueueControl) -> Result<(), DecodeError> {
        tracing::debug!(
            codec = %setup.stream.codec,
            sample_rate = setup.stream.sample_rate,
            channels = setup.stream.channels,
            "Audio stream attached"
        );
        let mut output = setup.output;
        output.set_paused(true);
        self.active = Some(ActiveAudio {
            decoder: setup.decoder,
            output,
            base: None,
        });
        Ok(())
    }

    fn packet(&mut self, packet: MediaPacket, ctl: &QueueControl) -> Result<(), DecodeError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        for chunk in active.decoder.decode(&packet)? {
            while active.output.is_connected()
                && active.output.buffered() > MAX_BUFFERED_SECS
                && !ctl.is_interrupted()
            {
                thread::sleep(WAIT_STEP);
                active.report(ctl);
            }
            if ctl.is_interrupted() {
                return Ok(());
            }
            if active.base.is_none() {
                active.base = Some(chunk.pts);
            }
            ctl.frame_ready(chunk.pts);

            let written = active.output.write(&chunk);
            active.report(ctl);
            written?;
        }
        Ok(())
    }

    fn flush(&mut self, ctl: &QueueControl) {
        if let Some(active) = self.active.as_mut() {
            active.decoder.flush();
            active.output.flush();
            active.base = None;
        }
        ctl.set_device_clock(None);
    }

    fn end(&mut self, ctl: &QueueControl) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        while active.output.is_connected() && active.output.buffered() > 0.0 && !ctl.is_interrupted() {
            thread::sleep(WAIT_STEP);
            active.report(ctl);
        }
    }

    fn stop(&mut self, ctl: &QueueControl) {
        if let Some(mut active) = self.active.take() {
            active.output.flush();
        }
        ctl.set_device_clock(None);
    }

    fn play_event(&mut self, event: PlayEvent, _ctl: &QueueControl) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match event {
            PlayEvent::Pause => active.output.set_paused(true),
            PlayEvent::Resume => active.output.set_paused(false),
            _ => {}
        }
    }
}
