//! # Media Decode Seam
//!
//! Traits for the external collaborators that demux containers and decode
//! compressed streams. The playback engine only sees decoded planar images,
//! PCM chunks and subtitle cues; everything codec specific lives behind
//! these traits.
//!
//! ```text
//! SourceOpener ──open()──► MediaSource ──read_packet()──► MediaPacket
//!      │                                                      │
//!      └──video_decoder()/audio_decoder()/...──► decoders ◄───┘
//! ```

use crate::image::Image;
use crate::stereo::{CubemapFormat, StereoFormat};
use crate::subtitles::SubtitleCue;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("Didn't find any video or audio streams in {0}")]
    NoStreams(PathBuf),
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Seek failed: {0}")]
    SeekFailed(String),
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Streams and Packets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

/// Container stream description
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Index inside its container
    pub index: usize,
    pub kind: StreamKind,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    /// Video only
    pub width: u32,
    pub height: u32,
    /// Audio only
    pub sample_rate: u32,
    pub channels: u16,
    /// Packing declared by container metadata
    pub stereo_format: Option<StereoFormat>,
    /// Projection declared by container metadata
    pub cubemap: CubemapFormat,
}

impl StreamInfo {
    pub fn new(index: usize, kind: StreamKind, codec: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            codec: codec.into(),
            language: None,
            title: None,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            stereo_format: None,
            cubemap: CubemapFormat::Off,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Human readable name for track menus
    pub fn display_name(&self) -> String {
        let mut name = match (&self.language, &self.title) {
            (Some(lang), Some(title)) => format!("{} - {}", lang, title),
            (Some(lang), None) => lang.clone(),
            (None, Some(title)) => title.clone(),
            (None, None) => format!("#{}", self.index + 1),
        };
        match self.kind {
            StreamKind::Audio if self.channels > 0 => {
                name.push_str(&format!(" [{}, {} ch]", self.codec, self.channels));
            }
            _ => name.push_str(&format!(" [{}]", self.codec)),
        }
        name
    }
}

/// Compressed packet read from a container
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub stream_index: usize,
    /// Presentation time in seconds
    pub pts: Option<f64>,
    pub duration: f64,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Decoded interleaved PCM
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub pts: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioChunk {
    /// Length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64)
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Opened container (one per file of a playlist entry)
pub trait MediaSource: Send {
    fn path(&self) -> &Path;

    fn streams(&self) -> &[StreamInfo];

    /// Duration in seconds, 0 if unknown
    fn duration(&self) -> f64;

    /// Next packet, `None` at end of input
    fn read_packet(&mut self) -> Result<Option<MediaPacket>, DecodeError>;

    /// Seek to `target` seconds using `stream` as reference (or the whole container)
    fn seek(&mut self, target: f64, stream: Option<usize>, backward: bool) -> Result<(), DecodeError>;
}

/// Video decoder producing planar images
pub trait VideoDecoder: Send {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<Image>, DecodeError>;

    /// Drop buffered frames
    fn flush(&mut self);
}

pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<AudioChunk>, DecodeError>;

    fn flush(&mut self);
}

pub trait SubtitleDecoder: Send {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<SubtitleCue>, DecodeError>;

    fn flush(&mut self) {}
}

/// Audio device sink
pub trait AudioOutput: Send {
    fn write(&mut self, chunk: &AudioChunk) -> Result<(), DecodeError>;

    /// Seconds played since the last flush, if the device reports it
    fn position(&self) -> Option<f64> {
        None
    }

    /// Seconds written but not played yet
    fn buffered(&self) -> f64 {
        0.0
    }

    fn set_paused(&mut self, paused: bool);

    fn flush(&mut self);

    /// False once the device is lost
    fn is_connected(&self) -> bool {
        true
    }
}

/// Factory for sources, decoders and the audio sink
pub trait SourceOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaSource>, DecodeError>;

    fn video_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn VideoDecoder>, DecodeError>;

    fn audio_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn AudioDecoder>, DecodeError>;

    fn subtitle_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn SubtitleDecoder>, DecodeError>;

    fn audio_output(&self, stream: &StreamInfo) -> Result<Box<dyn AudioOutput>, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        let audio = StreamInfo {
            channels: 6,
            ..StreamInfo::new(1, StreamKind::Audio, "ac3").with_language("eng")
        };
        assert_eq!(audio.display_name(), "eng [ac3, 6 ch]");

        let subs = StreamInfo::new(2, StreamKind::Subtitle, "srt")
            .with_language("fra")
            .with_title("Forced");
        assert_eq!(subs.display_name(), "fra - Forced [srt]");

        let bare = StreamInfo::new(0, StreamKind::Video, "h264");
        assert_eq!(bare.display_name(), "#1 [h264]");
    }

    #[test]
    fn test_chunk_duration() {
        let chunk = AudioChunk {
            pts: 0.0,
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0.0; 48_000],
        };
        assert!((chunk.duration() - 0.5).abs() < 1e-9);
        assert_eq!(AudioChunk { sample_rate: 0, ..chunk }.duration(), 0.0);
    }

    #[test]
    fn test_error_messages() {
        let err = DecodeError::NoStreams(PathBuf::from("clip.mkv"));
        assert_eq!(err.to_string(), "Didn't find any video or audio streams in clip.mkv");
    }
}
