//! Shared fixtures for unit tests: a CPU-side recording texture backend,
//! synthetic images and scripted media sources.

use crate::decode::{
    AudioChunk, AudioDecoder, AudioOutput, DecodeError, MediaPacket, MediaSource, SourceOpener, StreamInfo,
    StreamKind, SubtitleDecoder, VideoDecoder,
};
use crate::image::{ColorModel, Image, ImagePlane, Ownership, PlaneFormat};
use crate::subtitles::SubtitleCue;
use crate::texture::{TextureBackend, TextureDesc, TextureError, TextureId, UploadRegion};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Route `tracing` output to the test harness; `RUST_LOG` filters it
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Images
// ============================================================================

/// Plane filled with one pixel value
pub fn solid_plane(format: PlaneFormat, size_x: usize, size_y: usize, pixel: impl AsRef<[u8]>) -> ImagePlane {
    let pixel = pixel.as_ref();
    assert_eq!(pixel.len(), format.bytes_per_pixel());
    let mut data = Vec::with_capacity(size_x * size_y * pixel.len());
    for _ in 0..size_x * size_y {
        data.extend_from_slice(pixel);
    }
    ImagePlane::new(format, size_x, size_y, data, Ownership::Owned)
}

/// Gray plane whose logical row `r` is filled with `r`, stored in the given order
pub fn gradient_rows(size_x: usize, size_y: usize, top_down: bool) -> ImagePlane {
    let mut data = Vec::with_capacity(size_x * size_y);
    for mem_row in 0..size_y {
        let logical = if top_down { mem_row } else { size_y - 1 - mem_row };
        data.extend(std::iter::repeat(logical as u8).take(size_x));
    }
    ImagePlane::new(PlaneFormat::Gray, size_x, size_y, data, Ownership::Owned).top_down(top_down)
}

// ============================================================================
// Recording Backend
// ============================================================================

/// Keeps texture contents in memory so tests can read uploads back
pub struct RecordingBackend {
    textures: HashMap<TextureId, (TextureDesc, Vec<Vec<u8>>)>,
    writes: Vec<(TextureId, UploadRegion)>,
    next_id: u64,
    max_size: u32,
    unpack: bool,
    cubemap: bool,
    unsupported: Vec<PlaneFormat>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            textures: HashMap::new(),
            writes: Vec::new(),
            next_id: 1,
            max_size: 8192,
            unpack: true,
            cubemap: true,
            // same gaps as the wgpu backend
            unsupported: vec![PlaneFormat::Rgb, PlaneFormat::Bgr, PlaneFormat::RgbF, PlaneFormat::BgrF],
        }
    }

    pub fn with_max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_unpack(mut self, unpack: bool) -> Self {
        self.unpack = unpack;
        self
    }

    pub fn with_cubemap(mut self, cubemap: bool) -> Self {
        self.cubemap = cubemap;
        self
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn writes(&self) -> &[(TextureId, UploadRegion)] {
        &self.writes
    }

    /// Tightly packed pixels of one layer
    pub fn pixels(&self, id: TextureId, layer: u32) -> Option<&[u8]> {
        self.textures
            .get(&id)
            .and_then(|(_, layers)| layers.get(layer as usize))
            .map(|l| l.as_slice())
    }
}

impl TextureBackend for RecordingBackend {
    fn max_texture_size(&self) -> u32 {
        self.max_size
    }

    fn has_unpack(&self) -> bool {
        self.unpack
    }

    fn has_cubemap(&self) -> bool {
        self.cubemap
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, TextureError> {
        if self.unsupported.contains(&desc.format) {
            return Err(TextureError::UnsupportedFormat(desc.format));
        }
        let layer = vec![0u8; desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel()];
        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.textures
            .insert(id, (*desc, vec![layer; desc.layers() as usize]));
        Ok(id)
    }

    fn release_texture(&mut self, id: TextureId) {
        self.textures.remove(&id);
    }

    fn write_rows(&mut self, id: TextureId, region: &UploadRegion, data: &[u8]) -> Result<(), TextureError> {
        let (desc, layers) = self.textures.get_mut(&id).ok_or(TextureError::UnknownTexture(id))?;
        if region.x + region.width > desc.width
            || region.y + region.height > desc.height
            || region.layer >= desc.layers()
        {
            return Err(TextureError::OutOfBounds(format!("{:?} in {:?}", region, desc)));
        }
        let bpp = desc.format.bytes_per_pixel();
        let dst_stride = desc.width as usize * bpp;
        let row_len = region.width as usize * bpp;
        let layer = &mut layers[region.layer as usize];
        for r in 0..region.height as usize {
            let src = r * region.row_bytes;
            if src + row_len > data.len() {
                return Err(TextureError::OutOfBounds(format!("row {} of {:?}", r, region)));
            }
            let dst = (region.y as usize + r) * dst_stride + region.x as usize * bpp;
            layer[dst..dst + row_len].copy_from_slice(&data[src..src + row_len]);
        }
        self.writes.push((id, *region));
        Ok(())
    }
}

// ============================================================================
// Scripted Media
// ============================================================================

/// Packets of every stream interleaved at a fixed frame rate
#[derive(Debug, Clone)]
pub struct MediaScript {
    pub streams: Vec<StreamInfo>,
    pub frames: usize,
    pub frame_duration: f64,
}

impl MediaScript {
    pub fn new(streams: Vec<StreamInfo>, frames: usize) -> Self {
        Self {
            streams,
            frames,
            frame_duration: 0.04,
        }
    }

    fn packets(&self) -> Vec<MediaPacket> {
        let mut packets = Vec::with_capacity(self.frames * self.streams.len());
        for i in 0..self.frames {
            for stream in &self.streams {
                packets.push(MediaPacket {
                    stream_index: stream.index,
                    pts: Some(i as f64 * self.frame_duration),
                    duration: self.frame_duration,
                    keyframe: true,
                    data: Bytes::from(format!("{}:{}", stream.index, i)),
                });
            }
        }
        packets
    }
}

pub struct ScriptedSource {
    path: PathBuf,
    streams: Vec<StreamInfo>,
    packets: Vec<MediaPacket>,
    cursor: usize,
    duration: f64,
    log: Arc<OpenerLog>,
}

impl MediaSource for ScriptedSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn read_packet(&mut self) -> Result<Option<MediaPacket>, DecodeError> {
        let packet = self.packets.get(self.cursor).cloned();
        self.cursor += 1;
        Ok(packet)
    }

    fn seek(&mut self, target: f64, stream: Option<usize>, _backward: bool) -> Result<(), DecodeError> {
        self.log.seeks.lock().push((target, stream));
        self.cursor = self
            .packets
            .iter()
            .position(|p| p.pts.unwrap_or_default() >= target)
            .unwrap_or(self.packets.len());
        Ok(())
    }
}

/// Gray 8x8 frame per packet
pub struct GrayDecoder;

impl VideoDecoder for GrayDecoder {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<Image>, DecodeError> {
        let pts = packet.pts.unwrap_or_default();
        let plane = solid_plane(PlaneFormat::Gray, 8, 8, [packet.stream_index as u8]);
        Ok(vec![Image::from_plane(plane, ColorModel::Gray).with_pts(pts)])
    }

    fn flush(&mut self) {}
}

/// One frame-length stereo chunk per packet
pub struct SilenceDecoder;

impl AudioDecoder for SilenceDecoder {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<AudioChunk>, DecodeError> {
        let samples = (packet.duration * 48_000.0) as usize * 2;
        Ok(vec![AudioChunk {
            pts: packet.pts.unwrap_or_default(),
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0.0; samples],
        }])
    }

    fn flush(&mut self) {}
}

/// Packet payload becomes the cue text
pub struct TextDecoder;

impl SubtitleDecoder for TextDecoder {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<SubtitleCue>, DecodeError> {
        let start = packet.pts.unwrap_or_default();
        let text = String::from_utf8_lossy(&packet.data).into_owned();
        Ok(vec![SubtitleCue::new(start, start + packet.duration, text)])
    }
}

/// Discards samples instantly
pub struct NullOutput {
    log: Arc<OpenerLog>,
}

impl AudioOutput for NullOutput {
    fn write(&mut self, chunk: &AudioChunk) -> Result<(), DecodeError> {
        if !self.log.connected.load(Ordering::SeqCst) {
            return Err(DecodeError::Device("device lost".into()));
        }
        self.log.samples.fetch_add(chunk.samples.len(), Ordering::SeqCst);
        Ok(())
    }

    fn set_paused(&mut self, _paused: bool) {}

    fn flush(&mut self) {}

    fn is_connected(&self) -> bool {
        self.log.connected.load(Ordering::SeqCst)
    }
}

/// What the opener was asked to do
#[derive(Debug)]
pub struct OpenerLog {
    pub opened: Mutex<Vec<PathBuf>>,
    pub seeks: Mutex<Vec<(f64, Option<usize>)>>,
    /// Stream indices of created audio decoders
    pub audio_decoders: Mutex<Vec<usize>>,
    pub samples: AtomicUsize,
    pub connected: AtomicBool,
}

impl Default for OpenerLog {
    fn default() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            seeks: Mutex::new(Vec::new()),
            audio_decoders: Mutex::new(Vec::new()),
            samples: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
        }
    }
}

/// Serves scripted files by path
#[derive(Default)]
pub struct ScriptedOpener {
    files: HashMap<PathBuf, MediaScript>,
    pub log: Arc<OpenerLog>,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, script: MediaScript) -> Self {
        self.files.insert(path.into(), script);
        self
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, DecodeError> {
        let script = self.files.get(path).ok_or_else(|| DecodeError::Open {
            path: path.to_path_buf(),
            reason: "No such file".into(),
        })?;
        self.log.opened.lock().push(path.to_path_buf());
        Ok(Box::new(ScriptedSource {
            path: path.to_path_buf(),
            streams: script.streams.clone(),
            packets: script.packets(),
            cursor: 0,
            duration: script.frames as f64 * script.frame_duration,
            log: self.log.clone(),
        }))
    }

    fn video_decoder(&self, _stream: &StreamInfo) -> Result<Box<dyn VideoDecoder>, DecodeError> {
        Ok(Box::new(GrayDecoder))
    }

    fn audio_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn AudioDecoder>, DecodeError> {
        self.log.audio_decoders.lock().push(stream.index);
        Ok(Box::new(SilenceDecoder))
    }

    fn subtitle_decoder(&self, _stream: &StreamInfo) -> Result<Box<dyn SubtitleDecoder>, DecodeError> {
        Ok(Box::new(TextDecoder))
    }

    fn audio_output(&self, _stream: &StreamInfo) -> Result<Box<dyn AudioOutput>, DecodeError> {
        Ok(Box::new(NullOutput { log: self.log.clone() }))
    }
}

pub fn video_stream(index: usize) -> StreamInfo {
    StreamInfo {
        width: 8,
        height: 8,
        ..StreamInfo::new(index, StreamKind::Video, "raw")
    }
}

pub fn audio_stream(index: usize, language: &str) -> StreamInfo {
    StreamInfo {
        sample_rate: 48_000,
        channels: 2,
        ..StreamInfo::new(index, StreamKind::Audio, "pcm").with_language(language)
    }
}

pub fn subtitle_stream(index: usize, language: &str) -> StreamInfo {
    StreamInfo::new(index, StreamKind::Subtitle, "text").with_language(language)
}
