//! # Stereo Formats
//!
//! Packing conventions for stereoscopic sources, packed cubemap
//! classification and the per-source stereo parameters record.
//!
//! ```text
//!  SideBySideLR     TopBottomLR     RowInterlaced       Tiled4x
//! ┌──────┬──────┐   ┌──────────┐   ┌──────────────┐   ┌──────┬───┐
//! │  L   │  R   │   │    L     │   │ L L L L L L  │   │      │ R │
//! │      │      │   ├──────────┤   │ R R R R R R  │   │  L   │   │
//! │      │      │   │    R     │   │ L L L L L L  │   ├───┬──┴───┤
//! └──────┴──────┘   └──────────┘   └──────────────┘   │ R │ R │  │
//!                                                     └───┴───┴──┘
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// ============================================================================
// Stereo Format
// ============================================================================

/// Declared packing of left/right views inside the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StereoFormat {
    /// Unresolved, detected from the image ratio before decomposition
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "mono")]
    Mono,
    /// Parallel pair, left view in the left half
    #[serde(rename = "parallelPair")]
    SideBySideLR,
    /// Cross-eyed pair, left view in the right half
    #[serde(rename = "crossEyed")]
    SideBySideRL,
    #[serde(rename = "overUnderLR")]
    TopBottomLR,
    #[serde(rename = "overUnderRL")]
    TopBottomRL,
    #[serde(rename = "interlaceRow")]
    RowInterlaced,
    /// Column interleaving, shown as mono here
    #[serde(rename = "interlaceColumn")]
    ColumnInterlaced,
    #[serde(rename = "tiledTwo4x")]
    Tiled4x,
    /// Two independent images (dual-file pairs, frame sequences)
    #[serde(rename = "separateFrames")]
    SeparateFrames,
    /// Page flipping: odd frames carry the left view, even frames the right
    #[serde(rename = "frameSequence")]
    FrameSequence,
    #[serde(rename = "anaglyphRedCyan")]
    AnaglyphRedCyan,
    #[serde(rename = "anaglyphGreenMagenta")]
    AnaglyphGreenMagenta,
    #[serde(rename = "anaglyphYellowBlue")]
    AnaglyphYellowBlue,
}

/// Known side-by-side frame ratios: 2x 4:3, 2x 16:9 and a common anamorphic pair
const SIDE_BY_SIDE_RATIOS: [f32; 3] = [8.0 / 3.0, 32.0 / 9.0, 2.86];
const RATIO_TOLERANCE: f32 = 0.18;

impl StereoFormat {
    pub const ALL: [StereoFormat; 14] = [
        Self::Auto,
        Self::Mono,
        Self::SideBySideLR,
        Self::SideBySideRL,
        Self::TopBottomLR,
        Self::TopBottomRL,
        Self::RowInterlaced,
        Self::ColumnInterlaced,
        Self::Tiled4x,
        Self::SeparateFrames,
        Self::FrameSequence,
        Self::AnaglyphRedCyan,
        Self::AnaglyphGreenMagenta,
        Self::AnaglyphYellowBlue,
    ];

    /// Persistent name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Mono => "mono",
            Self::SideBySideLR => "parallelPair",
            Self::SideBySideRL => "crossEyed",
            Self::TopBottomLR => "overUnderLR",
            Self::TopBottomRL => "overUnderRL",
            Self::RowInterlaced => "interlaceRow",
            Self::ColumnInterlaced => "interlaceColumn",
            Self::Tiled4x => "tiledTwo4x",
            Self::SeparateFrames => "separateFrames",
            Self::FrameSequence => "frameSequence",
            Self::AnaglyphRedCyan => "anaglyphRedCyan",
            Self::AnaglyphGreenMagenta => "anaglyphGreenMagenta",
            Self::AnaglyphYellowBlue => "anaglyphYellowBlue",
        }
    }

    /// Case-insensitive lookup by persistent name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Guess the format from the frame aspect ratio.
    /// Only wide side-by-side frames can be recognized this way.
    pub fn from_ratio(ratio: f32) -> Self {
        if SIDE_BY_SIDE_RATIOS
            .iter()
            .any(|r| (ratio - r).abs() <= RATIO_TOLERANCE)
        {
            Self::SideBySideRL
        } else {
            Self::Mono
        }
    }

    /// Decomposes into two eye planes
    pub fn is_stereo(&self) -> bool {
        matches!(
            self,
            Self::SideBySideLR
                | Self::SideBySideRL
                | Self::TopBottomLR
                | Self::TopBottomRL
                | Self::RowInterlaced
                | Self::Tiled4x
                | Self::SeparateFrames
                | Self::FrameSequence
        )
    }

    /// Layout can be expressed as origin/stride views into the source
    pub fn supports_zero_copy(&self) -> bool {
        matches!(
            self,
            Self::SideBySideLR
                | Self::SideBySideRL
                | Self::TopBottomLR
                | Self::TopBottomRL
                | Self::RowInterlaced
        )
    }

    /// Same layout with the eyes exchanged
    pub fn swapped(&self) -> Self {
        match self {
            Self::SideBySideLR => Self::SideBySideRL,
            Self::SideBySideRL => Self::SideBySideLR,
            Self::TopBottomLR => Self::TopBottomRL,
            Self::TopBottomRL => Self::TopBottomLR,
            other => *other,
        }
    }
}

impl fmt::Display for StereoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StereoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown stereo format: {}", s))
    }
}

/// Which eye a plane or texture belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

// ============================================================================
// Packed Cubemaps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CubemapFormat {
    #[default]
    Off,
    /// Six square faces in a 6:1, 1:6, 3:2 or 2:3 grid
    Packed,
    /// Equi-angular cubemap, always 3x2 or 2x3
    PackedEac,
}

/// Tile grid of a packed cubemap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubeArrangement {
    Row6,     // 6:1
    Column6,  // 1:6
    Grid3x2,  // 3:2
    Grid2x3,  // 2:3
}

impl CubeArrangement {
    /// Detect from exact tile ratios
    pub fn detect(width: usize, height: usize) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        if width == height * 6 {
            Some(Self::Row6)
        } else if height == width * 6 {
            Some(Self::Column6)
        } else if width * 2 == height * 3 {
            Some(Self::Grid3x2)
        } else if width * 3 == height * 2 {
            Some(Self::Grid2x3)
        } else {
            None
        }
    }

    /// EAC layouts ignore measured tiles and only look at orientation
    pub fn from_orientation(width: usize, height: usize) -> Self {
        if width > height {
            Self::Grid3x2
        } else {
            Self::Grid2x3
        }
    }

    /// Tiles across and down
    pub fn grid(&self) -> (usize, usize) {
        match self {
            Self::Row6 => (6, 1),
            Self::Column6 => (1, 6),
            Self::Grid3x2 => (3, 2),
            Self::Grid2x3 => (2, 3),
        }
    }

    /// Size of one face (smaller tile side so the face stays square)
    pub fn face_size(&self, width: usize, height: usize) -> usize {
        let (cols, rows) = self.grid();
        (width / cols).min(height / rows)
    }

    /// Tile column/row of face `face` (+X, -X, +Y, -Y, +Z, -Z)
    pub fn tile(&self, face: usize) -> (usize, usize) {
        match self {
            Self::Row6 => (face, 0),
            Self::Column6 => (0, face),
            Self::Grid3x2 => (face % 3, face / 3),
            Self::Grid2x3 => (face % 2, face / 2),
        }
    }
}

/// Classify a packed cubemap. Returns `Off` if the frame does not fit
/// any supported arrangement.
pub fn classify_cubemap(requested: CubemapFormat, width: usize, height: usize) -> CubemapFormat {
    match requested {
        CubemapFormat::Off => CubemapFormat::Off,
        CubemapFormat::Packed => match CubeArrangement::detect(width, height) {
            Some(_) => CubemapFormat::Packed,
            None => CubemapFormat::Off,
        },
        CubemapFormat::PackedEac => {
            let arrangement = CubeArrangement::from_orientation(width, height);
            if width != height && arrangement.face_size(width, height) > 0 {
                CubemapFormat::PackedEac
            } else {
                CubemapFormat::Off
            }
        }
    }
}

// ============================================================================
// Stereo Parameters
// ============================================================================

/// Panorama projection tag attached to finished textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Panorama {
    #[default]
    Off,
    Sphere,
    Cylinder,
    Cubemap,
}

/// Caller-controlled view settings for one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StereoSettings {
    /// Declared packing of the source. `Auto` lets each frame decide.
    pub src_format: StereoFormat,
    /// Exchange left and right views
    pub swap_lr: bool,
    pub scale: f32,
    pub offset: [f32; 2],
    pub rotation_deg: f32,
    pub panorama: Panorama,
    /// Keep `panorama` regardless of what the frame looks like
    pub stick_panorama: bool,
    /// Packed cubemap layout, `Off` defers to the container
    #[serde(default)]
    pub cubemap: CubemapFormat,
}

impl Default for StereoSettings {
    fn default() -> Self {
        Self {
            src_format: StereoFormat::Auto,
            swap_lr: false,
            scale: 1.0,
            offset: [0.0, 0.0],
            rotation_deg: 0.0,
            panorama: Panorama::Off,
            stick_panorama: false,
            cubemap: CubemapFormat::Off,
        }
    }
}

/// Shared handle to a source's stereo settings.
/// The UI edits the settings. Uploads record the format they actually used
/// separately, so a one-off override never becomes the declared packing.
#[derive(Debug, Default)]
pub struct StereoParams {
    settings: Mutex<StereoSettings>,
    detected: Mutex<Option<StereoFormat>>,
}

impl StereoParams {
    pub fn new(src_format: StereoFormat) -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(StereoSettings {
                src_format,
                ..StereoSettings::default()
            }),
            detected: Mutex::new(None),
        })
    }

    pub fn from_settings(settings: StereoSettings) -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(settings),
            detected: Mutex::new(None),
        })
    }

    pub fn src_format(&self) -> StereoFormat {
        self.settings.lock().src_format
    }

    pub fn set_src_format(&self, format: StereoFormat) {
        self.settings.lock().src_format = format;
    }

    /// Format resolved by the most recent completed upload
    pub fn detected_format(&self) -> Option<StereoFormat> {
        *self.detected.lock()
    }

    pub fn set_detected_format(&self, format: StereoFormat) {
        *self.detected.lock() = Some(format);
    }

    pub fn is_swapped(&self) -> bool {
        self.settings.lock().swap_lr
    }

    pub fn set_swap(&self, swap: bool) {
        self.settings.lock().swap_lr = swap;
    }

    pub fn settings(&self) -> StereoSettings {
        self.settings.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut StereoSettings)) {
        f(&mut self.settings.lock());
    }

    /// Panorama tag for a finished frame
    pub fn panorama_for(&self, cubemap: CubemapFormat) -> Panorama {
        let settings = self.settings.lock();
        if settings.stick_panorama {
            settings.panorama
        } else if cubemap != CubemapFormat::Off {
            Panorama::Cubemap
        } else {
            Panorama::Off
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names_round_trip() {
        for format in StereoFormat::ALL {
            assert_eq!(StereoFormat::from_name(format.name()), Some(format));
        }
        assert_eq!("CROSSEYED".parse::<StereoFormat>(), Ok(StereoFormat::SideBySideRL));
        assert!("sideways".parse::<StereoFormat>().is_err());
    }

    #[test]
    fn test_serde_uses_persistent_names() {
        let json = serde_json::to_string(&StereoFormat::TopBottomLR).unwrap();
        assert_eq!(json, "\"overUnderLR\"");
        let back: StereoFormat = serde_json::from_str("\"interlaceRow\"").unwrap();
        assert_eq!(back, StereoFormat::RowInterlaced);
    }

    #[test]
    fn test_from_ratio() {
        assert_eq!(StereoFormat::from_ratio(3840.0 / 1080.0), StereoFormat::SideBySideRL);
        assert_eq!(StereoFormat::from_ratio(2560.0 / 960.0), StereoFormat::SideBySideRL);
        assert_eq!(StereoFormat::from_ratio(16.0 / 9.0), StereoFormat::Mono);
        assert_eq!(StereoFormat::from_ratio(1.0), StereoFormat::Mono);
    }

    #[test]
    fn test_swapped() {
        assert_eq!(StereoFormat::SideBySideLR.swapped(), StereoFormat::SideBySideRL);
        assert_eq!(StereoFormat::TopBottomRL.swapped(), StereoFormat::TopBottomLR);
        assert_eq!(StereoFormat::Tiled4x.swapped(), StereoFormat::Tiled4x);
    }

    #[test]
    fn test_cubemap_classification() {
        assert_eq!(classify_cubemap(CubemapFormat::Packed, 1536, 256), CubemapFormat::Packed);
        assert_eq!(classify_cubemap(CubemapFormat::Packed, 768, 512), CubemapFormat::Packed);
        assert_eq!(classify_cubemap(CubemapFormat::Packed, 256, 1536), CubemapFormat::Packed);
        assert_eq!(classify_cubemap(CubemapFormat::Packed, 512, 768), CubemapFormat::Packed);
        assert_eq!(classify_cubemap(CubemapFormat::Packed, 1000, 300), CubemapFormat::Off);
        assert_eq!(classify_cubemap(CubemapFormat::Off, 1536, 256), CubemapFormat::Off);

        assert_eq!(CubeArrangement::Row6.face_size(1536, 256), 256);
        assert_eq!(CubeArrangement::Grid3x2.face_size(768, 512), 256);
    }

    #[test]
    fn test_eac_classification() {
        assert_eq!(classify_cubemap(CubemapFormat::PackedEac, 3840, 2560), CubemapFormat::PackedEac);
        assert_eq!(classify_cubemap(CubemapFormat::PackedEac, 512, 512), CubemapFormat::Off);
        assert_eq!(classify_cubemap(CubemapFormat::PackedEac, 2, 1), CubemapFormat::Off);
        assert_eq!(CubeArrangement::from_orientation(100, 300), CubeArrangement::Grid2x3);
    }

    #[test]
    fn test_sticky_panorama() {
        let params = StereoParams::new(StereoFormat::Mono);
        assert_eq!(params.panorama_for(CubemapFormat::Packed), Panorama::Cubemap);
        params.update(|s| {
            s.panorama = Panorama::Sphere;
            s.stick_panorama = true;
        });
        assert_eq!(params.panorama_for(CubemapFormat::Packed), Panorama::Sphere);
    }
}
