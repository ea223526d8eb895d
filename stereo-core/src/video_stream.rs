//! Video decode roles.
//!
//! The master decodes the main video stream and pushes decomposed frames
//! into the [`TextureQueue`]. For dual-file stereo pairs a slave decodes the
//! second view and hands its frames to the master, which uploads both eyes
//! as one `SeparateFrames` frame.
//!
//! Pairing by pts, with `tol` half the recent frame delay:
//!
//! ```text
//!  master - slave >  tol     slave frame is stale, drop it and look again
//!  |master - slave| <= tol   pair them
//!  master - slave < -tol     slave is ahead, skip this master frame
//!  master - slave < -6 s     slave frame predates a seek, drop both
//! ```
//!
//! Page-flipped sources (`FrameSequence`) are paired on the master alone:
//! every odd frame is held back and uploaded with the following one.

use crate::decode::{DecodeError, MediaPacket, StreamInfo, VideoDecoder};
use crate::frame_queue::TextureQueue;
use crate::image::Image;
use crate::stereo::{CubemapFormat, StereoFormat, StereoParams};
use crate::stream_queue::{PacketHandler, QueueControl};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Poll step of blocking waits
const WAIT_STEP: Duration = Duration::from_millis(10);

/// How long the master waits for the matching slave frame
const PAIR_TIMEOUT: Duration = Duration::from_secs(1);

/// Slave frames further ahead than this are left over from before a seek
const SEEK_DRIFT: f64 = 6.0;

/// Frame delay assumed until two master frames were decoded
const DEFAULT_FRAME_DELAY: f64 = 0.04;

// ============================================================================
// Frame Handoff
// ============================================================================

/// Result of matching a master frame against the slave's output
#[derive(Debug)]
pub enum Pairing {
    Matched(Image),
    /// The slave is ahead; its frame stays for a later master frame
    Ahead,
    /// Nothing usable arrived in time
    Missing,
}

/// Bounded slave-to-master frame channel
#[derive(Debug)]
pub struct FrameHandoff {
    frames: Mutex<VecDeque<Image>>,
    cond: Condvar,
    capacity: usize,
}

impl FrameHandoff {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Blocks while full. Returns false if interrupted.
    pub fn push(&self, frame: Image, ctl: &QueueControl) -> bool {
        let mut frames = self.frames.lock();
        while frames.len() >= self.capacity {
            if ctl.is_interrupted() {
                return false;
            }
            self.cond.wait_for(&mut frames, WAIT_STEP);
        }
        frames.push_back(frame);
        self.cond.notify_all();
        true
    }

    /// Slave frame whose pts lies within `tolerance` of `pts`.
    /// Older frames are discarded while waiting.
    pub fn take_matching(&self, pts: f64, tolerance: f64, ctl: &QueueControl, timeout: Duration) -> Pairing {
        let mut frames = self.frames.lock();
        let mut waited = Duration::ZERO;
        loop {
            if let Some(diff) = frames.front().map(|head| pts - head.pts) {
                if diff > tolerance {
                    frames.pop_front();
                    self.cond.notify_all();
                    continue;
                }
                if diff < -tolerance {
                    if diff < -SEEK_DRIFT {
                        tracing::debug!("Dropping slave frame {:.3}s ahead of the master", -diff);
                        frames.pop_front();
                        self.cond.notify_all();
                    }
                    return Pairing::Ahead;
                }
                if let Some(frame) = frames.pop_front() {
                    self.cond.notify_all();
                    return Pairing::Matched(frame);
                }
            }
            if ctl.is_interrupted() || waited >= timeout {
                return Pairing::Missing;
            }
            self.cond.wait_for(&mut frames, WAIT_STEP);
            waited += WAIT_STEP;
        }
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Master
// ============================================================================

pub struct VideoSetup {
    pub stream: StreamInfo,
    pub decoder: Box<dyn VideoDecoder>,
    pub params: Arc<StereoParams>,
    /// A slave queue decodes the right view
    pub paired: bool,
}

struct ActiveVideo {
    stream: StreamInfo,
    decoder: Box<dyn VideoDecoder>,
    params: Arc<StereoParams>,
    paired: bool,
    prev_pts: Option<f64>,
    frame_delay: f64,
    /// Left view of a page-flipped pair, waiting for its right view
    held: Option<Image>,
}

impl ActiveVideo {
    fn track_delay(&mut self, pts: f64) {
        if let Some(prev) = self.prev_pts {
            let delay = pts - prev;
            if delay > 0.0 && delay < 1.0 {
                self.frame_delay = delay;
            }
        }
        self.prev_pts = Some(pts);
    }

    fn reset(&mut self) {
        self.prev_pts = None;
        self.held = None;
    }
}

pub struct VideoMaster {
    textures: Arc<TextureQueue>,
    handoff: Arc<FrameHandoff>,
    /// User override, `Auto` when unset
    format_override: Arc<Mutex<StereoFormat>>,
    active: Option<ActiveVideo>,
}

impl VideoMaster {
    pub fn new(
        textures: Arc<TextureQueue>,
        handoff: Arc<FrameHandoff>,
        format_override: Arc<Mutex<StereoFormat>>,
    ) -> Self {
        Self {
            textures,
            handoff,
            format_override,
            active: None,
        }
    }
}

/// Packing for the next frame: override, pair, playlist params, container hint
fn resolve_format(user: StereoFormat, paired: bool, params: &StereoParams, stream: &StreamInfo) -> StereoFormat {
    if user != StereoFormat::Auto {
        return user;
    }
    if paired {
        return StereoFormat::SeparateFrames;
    }
    match params.src_format() {
        StereoFormat::Auto => stream.stereo_format.unwrap_or(StereoFormat::Auto),
        format => format,
    }
}

/// Cubemap layout: playlist params first, then container metadata
fn resolve_cubemap(params: &StereoParams, stream: &StreamInfo) -> CubemapFormat {
    match params.settings().cubemap {
        CubemapFormat::Off => stream.cubemap,
        cubemap => cubemap,
    }
}

impl PacketHandler for VideoMaster {
    type Setup = VideoSetup;

    fn start(&mut self, setup: VideoSetup, _ctl: &QueueControl) -> Result<(), DecodeError> {
        tracing::debug!(
            codec = %setup.stream.codec,
            width = setup.stream.width,
            height = setup.stream.height,
            paired = setup.paired,
            "Video stream attached"
        );
        self.textures.set_has_stream(true);
        self.active = Some(ActiveVideo {
            stream: setup.stream,
            decoder: setup.decoder,
            params: setup.params,
            paired: setup.paired,
            prev_pts: None,
            frame_delay: DEFAULT_FRAME_DELAY,
            held: None,
        });
        Ok(())
    }

    fn packet(&mut self, packet: MediaPacket, ctl: &QueueControl) -> Result<(), DecodeError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        for frame in active.decoder.decode(&packet)? {
            if ctl.is_interrupted() {
                return Ok(());
            }
            let pts = frame.pts;
            active.track_delay(pts);
            let user = *self.format_override.lock();
            let format = resolve_format(user, active.paired, &active.params, &active.stream);
            self.textures.set_cubemap(resolve_cubemap(&active.params, &active.stream));

            let (left, right, format) = if active.paired {
                let tolerance = 0.5 * active.frame_delay;
                match self.handoff.take_matching(pts, tolerance, ctl, PAIR_TIMEOUT) {
                    Pairing::Matched(right) => (frame, Some(right), format),
                    Pairing::Ahead => continue,
                    Pairing::Missing => (frame, None, format),
                }
            } else if format == StereoFormat::FrameSequence {
                match active.held.take() {
                    Some(first) => (first, Some(frame), StereoFormat::SeparateFrames),
                    None => {
                        active.held = Some(frame);
                        continue;
                    }
                }
            } else {
                active.held = None;
                (frame, None, format)
            };
            if ctl.is_interrupted() {
                return Ok(());
            }

            while !self
                .textures
                .push(&left, right.as_ref(), Some(active.params.clone()), format, pts)
            {
                if ctl.is_interrupted() {
                    return Ok(());
                }
                self.textures.wait_space(WAIT_STEP);
            }
            ctl.frame_ready(pts);
        }
        Ok(())
    }

    fn flush(&mut self, _ctl: &QueueControl) {
        if let Some(active) = self.active.as_mut() {
            active.decoder.flush();
            active.reset();
        }
        self.handoff.clear();
        self.textures.clear();
    }

    fn end(&mut self, ctl: &QueueControl) {
        // wait until the renderer consumed everything
        while !self.textures.is_empty() && !ctl.is_interrupted() {
            std::thread::sleep(WAIT_STEP);
        }
    }

    fn stop(&mut self, _ctl: &QueueControl) {
        self.active = None;
        self.handoff.clear();
        self.textures.clear();
        self.textures.set_has_stream(false);
        self.textures.set_cubemap(CubemapFormat::Off);
    }
}

// ============================================================================
// Slave
// ============================================================================

pub struct VideoSlave {
    handoff: Arc<FrameHandoff>,
    decoder: Option<Box<dyn VideoDecoder>>,
}

impl VideoSlave {
    pub fn new(handoff: Arc<FrameHandoff>) -> Self {
        Self { handoff, decoder: None }
    }
}

impl PacketHandler for VideoSlave {
    type Setup = Box<dyn VideoDecoder>;

    fn start(&mut self, decoder: Box<dyn VideoDecoder>, _ctl: &QueueControl) -> Result<(), DecodeError> {
        self.decoder = Some(decoder);
        Ok(())
    }

    fn packet(&mut self, packet: MediaPacket, ctl: &QueueControl) -> Result<(), DecodeError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        for frame in decoder.decode(&packet)? {
            let pts = frame.pts;
            if !self.handoff.push(frame, ctl) {
                break;
            }
            ctl.frame_ready(pts);
        }
        Ok(())
    }

    fn flush(&mut self, _ctl: &QueueControl) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        self.handoff.clear();
    }

    fn stop(&mut self, _ctl: &QueueControl) {
        self.decoder = None;
        self.handoff.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::StreamKind;
    use crate::frame_queue::QueueConfig;
    use crate::image::{ColorModel, PlaneFormat, PlaneId};
    use crate::texture::QuadTexture;
    use crate::texture_data::{DecomposeOptions, TextureData, UploadConfig};
    use crate::test_support::{solid_plane, video_stream, GrayDecoder, RecordingBackend};
    use bytes::Bytes;

    fn packet(stream_index: usize, pts: f64) -> MediaPacket {
        MediaPacket {
            stream_index,
            pts: Some(pts),
            duration: 0.04,
            keyframe: true,
            data: Bytes::new(),
        }
    }

    fn gray(value: u8, pts: f64) -> Image {
        Image::from_plane(solid_plane(PlaneFormat::Gray, 8, 8, [value]), ColorModel::Gray).with_pts(pts)
    }

    struct Rig {
        ctl: QueueControl,
        textures: Arc<TextureQueue>,
        handoff: Arc<FrameHandoff>,
        master: VideoMaster,
    }

    fn rig(params: Arc<StereoParams>, paired: bool) -> Rig {
        let ctl = QueueControl::new("video");
        let textures = Arc::new(TextureQueue::new(QueueConfig {
            max_frames: 8,
            ..QueueConfig::default()
        }));
        let handoff = Arc::new(FrameHandoff::new(4));
        let mut master = VideoMaster::new(
            textures.clone(),
            handoff.clone(),
            Arc::new(Mutex::new(StereoFormat::Auto)),
        );
        let setup = VideoSetup {
            stream: video_stream(0),
            decoder: Box::new(GrayDecoder),
            params,
            paired,
        };
        master.start(setup, &ctl).unwrap();
        Rig {
            ctl,
            textures,
            handoff,
            master,
        }
    }

    /// Upload the oldest queued frame and read both eyes back
    fn first_pair(textures: &TextureQueue) -> (Option<u8>, Option<u8>) {
        let mut backend = RecordingBackend::new();
        textures.update_textures(&mut backend);
        let (left, right) = textures.snapshot(true).unwrap();
        let value = |img: Option<Image>| img.map(|img| img.plane(PlaneId::First).row(0)[0]);
        (value(left), value(right))
    }

    #[test]
    fn test_resolve_format_priority() {
        let stream = StreamInfo {
            stereo_format: Some(StereoFormat::TopBottomLR),
            ..StreamInfo::new(0, StreamKind::Video, "h264")
        };
        let auto = StereoParams::new(StereoFormat::Auto);
        assert_eq!(
            resolve_format(StereoFormat::Auto, false, &auto, &stream),
            StereoFormat::TopBottomLR
        );
        assert_eq!(
            resolve_format(StereoFormat::Auto, true, &auto, &stream),
            StereoFormat::SeparateFrames
        );
        assert_eq!(
            resolve_format(StereoFormat::Mono, true, &auto, &stream),
            StereoFormat::Mono
        );

        let declared = StereoParams::new(StereoFormat::SideBySideLR);
        assert_eq!(
            resolve_format(StereoFormat::Auto, false, &declared, &stream),
            StereoFormat::SideBySideLR
        );
        let bare = StreamInfo::new(0, StreamKind::Video, "h264");
        assert_eq!(resolve_format(StereoFormat::Auto, false, &auto, &bare), StereoFormat::Auto);
    }

    #[test]
    fn test_override_released_after_upload() {
        let stream = StreamInfo {
            stereo_format: Some(StereoFormat::TopBottomLR),
            ..StreamInfo::new(0, StreamKind::Video, "h264")
        };
        let params = StereoParams::new(StereoFormat::Auto);
        let src = Image::from_plane(solid_plane(PlaneFormat::Rgba, 64, 32, [1; 4]), ColorModel::Rgba);

        let format = resolve_format(StereoFormat::SideBySideLR, false, &params, &stream);
        let mut data = TextureData::new();
        data.update_data(&src, None, Some(params.clone()), format, 0.0, DecomposeOptions::default());
        let mut backend = RecordingBackend::new();
        let mut quad = QuadTexture::new();
        while !data.fill_texture(&mut backend, &mut quad, &UploadConfig::default()) {}
        assert_eq!(params.detected_format(), Some(StereoFormat::SideBySideLR));

        // back to Auto: the container hint applies again
        assert_eq!(
            resolve_format(StereoFormat::Auto, false, &params, &stream),
            StereoFormat::TopBottomLR
        );
        let bare = StreamInfo::new(0, StreamKind::Video, "h264");
        assert_eq!(resolve_format(StereoFormat::Auto, false, &params, &bare), StereoFormat::Auto);
    }

    #[test]
    fn test_stale_slave_frames_dropped() {
        let mut rig = rig(StereoParams::new(StereoFormat::SeparateFrames), true);
        for (value, pts) in [(10, 0.0), (11, 0.04), (12, 0.08)] {
            assert!(rig.handoff.push(gray(value, pts), &rig.ctl));
        }
        rig.master.packet(packet(0, 0.08), &rig.ctl).unwrap();
        assert_eq!(rig.textures.len(), 1);
        assert!(rig.handoff.is_empty());
        assert_eq!(first_pair(&rig.textures), (Some(0), Some(12)));
    }

    #[test]
    fn test_slave_ahead_kept_for_later_frame() {
        let mut rig = rig(StereoParams::new(StereoFormat::SeparateFrames), true);
        assert!(rig.handoff.push(gray(20, 0.2), &rig.ctl));

        rig.master.packet(packet(0, 0.16), &rig.ctl).unwrap();
        assert!(rig.textures.is_empty());
        assert_eq!(rig.handoff.len(), 1);

        rig.master.packet(packet(0, 0.2), &rig.ctl).unwrap();
        assert_eq!(rig.textures.len(), 1);
        assert!(rig.handoff.is_empty());
        assert_eq!(first_pair(&rig.textures), (Some(0), Some(20)));
    }

    #[test]
    fn test_slave_far_ahead_treated_as_seek() {
        let mut rig = rig(StereoParams::new(StereoFormat::SeparateFrames), true);
        assert!(rig.handoff.push(gray(30, 10.0), &rig.ctl));
        rig.master.packet(packet(0, 0.0), &rig.ctl).unwrap();
        assert!(rig.textures.is_empty());
        assert!(rig.handoff.is_empty());
    }

    #[test]
    fn test_frame_sequence_pairs_consecutive_frames() {
        let mut rig = rig(StereoParams::new(StereoFormat::FrameSequence), false);
        rig.master.packet(packet(1, 0.0), &rig.ctl).unwrap();
        assert!(rig.textures.is_empty());

        rig.master.packet(packet(2, 0.04), &rig.ctl).unwrap();
        assert_eq!(rig.textures.len(), 1);
        assert_eq!(rig.textures.src_format(), StereoFormat::SeparateFrames);
        assert_eq!(rig.textures.pop_pts_next(), Some(0.04));

        // a flush restarts the sequence with a left view
        rig.master.packet(packet(3, 0.08), &rig.ctl).unwrap();
        rig.master.flush(&rig.ctl);
        rig.master.packet(packet(4, 0.12), &rig.ctl).unwrap();
        rig.master.packet(packet(5, 0.16), &rig.ctl).unwrap();
        assert_eq!(rig.textures.len(), 1);
        assert_eq!(first_pair(&rig.textures), (Some(4), Some(5)));
    }

    #[test]
    fn test_cubemap_from_stream_metadata() {
        let ctl = QueueControl::new("video");
        let textures = Arc::new(TextureQueue::new(QueueConfig::default()));
        let mut master = VideoMaster::new(
            textures.clone(),
            Arc::new(FrameHandoff::new(1)),
            Arc::new(Mutex::new(StereoFormat::Auto)),
        );
        let stream = StreamInfo {
            cubemap: CubemapFormat::Packed,
            ..video_stream(0)
        };
        let params = StereoParams::new(StereoFormat::Mono);
        assert_eq!(resolve_cubemap(&params, &stream), CubemapFormat::Packed);
        params.update(|s| s.cubemap = CubemapFormat::PackedEac);
        assert_eq!(resolve_cubemap(&params, &stream), CubemapFormat::PackedEac);

        let setup = VideoSetup {
            stream,
            decoder: Box::new(GrayDecoder),
            params: StereoParams::new(StereoFormat::Mono),
            paired: false,
        };
        master.start(setup, &ctl).unwrap();
        master.packet(packet(0, 0.0), &ctl).unwrap();
        // 8x8 is no cubemap layout, the frame still goes through flat
        assert_eq!(textures.len(), 1);
    }
}
