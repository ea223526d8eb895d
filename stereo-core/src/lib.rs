//! # Stereo Core
//!
//! Stereoscopic video playback core: splits decoded frames into per-eye
//! planes, uploads them to GPU textures in bounded chunks and drives the
//! decode threads that feed them.

// ============================================================================
// Frames & Stereo Decomposition
// ============================================================================
pub mod image;
pub mod stereo;

// ============================================================================
// GPU Upload
// ============================================================================
pub mod texture;
pub mod texture_data;
pub mod frame_queue;

// ============================================================================
// Decoding
// ============================================================================
pub mod decode;
pub mod stream_queue;
pub mod video_stream;
pub mod audio_stream;
pub mod subtitles;

// ============================================================================
// Playback Control
// ============================================================================
pub mod signal;
pub mod stream_list;
pub mod sync;
pub mod playlist;
pub mod playback;

#[cfg(test)]
mod test_support;

pub use frame_queue::{QueueConfig, TextureQueue};
pub use playback::{PlayEvent, Playback, PlaybackConfig, PlaybackError, PlaybackState};
pub use stereo::{StereoFormat, StereoParams};
pub use stream_list::StreamList;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
