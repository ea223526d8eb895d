//! # Image - Decoded Planar Images
//!
//! Decoders hand us frames as up to four colour planes.
//! Each plane knows its own pixel format, dimensions, row stride and
//! row order (top-down or bottom-up), plus who owns the bytes.
//!
//! Planes are stored in `bytes::Bytes` so a shared decoder buffer can be
//! aliased by the decomposer without a copy.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Plane Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlaneFormat {
    #[default]
    Gray,     // 8-bit single channel (also Y/U/V planes)
    Gray16,   // 16-bit single channel
    Rgb,      // 8-bit per channel, packed
    Bgr,      // Windows order
    Rgb32,    // RGB with a padding byte
    Bgr32,    // BGR with a padding byte
    Rgba,     // 8-bit per channel + alpha
    Bgra,     // Windows order with alpha
    GrayF,    // 32-bit float single channel
    RgbF,     // 32-bit float per channel
    BgrF,
    RgbaF,
    BgraF,
}

impl PlaneFormat {
    /// Bytes per pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Gray16 => 2,
            Self::Rgb | Self::Bgr => 3,
            Self::Rgb32 | Self::Bgr32 | Self::Rgba | Self::Bgra => 4,
            Self::GrayF => 4,
            Self::RgbF | Self::BgrF => 12,
            Self::RgbaF | Self::BgraF => 16,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            Self::GrayF | Self::RgbF | Self::BgrF | Self::RgbaF | Self::BgraF
        )
    }
}

// ============================================================================
// Color Model / Range
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorModel {
    #[default]
    Rgb,
    Rgba,
    Gray,
    Yuv,      // planar Y, U, V (+ optional alpha)
    YuvJpeg,  // full-range YUV (JPEG)
    Cmyk,
    Hsv,
    Hsl,
}

/// Sample range of the colour values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorScale {
    #[default]
    Full,   // 0..255
    Mpeg,   // 16..235 luma, 16..240 chroma
}

// ============================================================================
// Planes
// ============================================================================

/// Named plane slot. Images never carry more than four planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneId {
    First,
    Second,
    Third,
    Fourth,
}

impl PlaneId {
    pub const ALL: [PlaneId; 4] = [Self::First, Self::Second, Self::Third, Self::Fourth];

    pub fn index(self) -> usize {
        match self {
            Self::First => 0,
            Self::Second => 1,
            Self::Third => 2,
            Self::Fourth => 3,
        }
    }
}

/// Who owns the bytes behind a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// Plane holds the only handle to its buffer
    #[default]
    Owned,
    /// Reference counted buffer that may be aliased by downstream consumers
    Shared,
    /// Memory owned by someone else, valid only for the current call
    Borrowed,
}

/// One colour plane of a decoded image
#[derive(Debug, Clone, Default)]
pub struct ImagePlane {
    format: PlaneFormat,
    size_x: usize,
    size_y: usize,
    row_bytes: usize,
    top_down: bool,
    ownership: Ownership,
    data: Bytes,
}

impl ImagePlane {
    /// Wrap `data` as a tightly packed, top-down plane.
    pub fn new(
        format: PlaneFormat,
        size_x: usize,
        size_y: usize,
        data: impl Into<Bytes>,
        ownership: Ownership,
    ) -> Self {
        let row_bytes = size_x * format.bytes_per_pixel();
        Self::with_row_bytes(format, size_x, size_y, row_bytes, data, ownership)
    }

    pub fn with_row_bytes(
        format: PlaneFormat,
        size_x: usize,
        size_y: usize,
        row_bytes: usize,
        data: impl Into<Bytes>,
        ownership: Ownership,
    ) -> Self {
        Self {
            format,
            size_x,
            size_y,
            row_bytes,
            top_down: true,
            ownership,
            data: data.into(),
        }
    }

    /// Allocate a zeroed plane with the given stride
    pub fn zeroed(format: PlaneFormat, size_x: usize, size_y: usize) -> Self {
        let row_bytes = size_x * format.bytes_per_pixel();
        Self::new(format, size_x, size_y, vec![0u8; row_bytes * size_y], Ownership::Owned)
    }

    /// Float plane from samples, e.g. HDR stills
    pub fn from_f32(format: PlaneFormat, size_x: usize, size_y: usize, samples: &[f32]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(samples);
        Self::new(format, size_x, size_y, Bytes::copy_from_slice(bytes), Ownership::Owned)
    }

    pub fn top_down(mut self, top_down: bool) -> Self {
        self.top_down = top_down;
        self
    }

    pub fn format(&self) -> PlaneFormat {
        self.format
    }
    pub fn size_x(&self) -> usize {
        self.size_x
    }
    pub fn size_y(&self) -> usize {
        self.size_y
    }
    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }
    pub fn is_top_down(&self) -> bool {
        self.top_down
    }
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }
    pub fn pixel_bytes(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    pub fn is_empty(&self) -> bool {
        self.size_x == 0 || self.size_y == 0 || self.data.is_empty()
    }

    /// True when the buffer can be aliased without copying
    pub fn is_shared(&self) -> bool {
        self.ownership == Ownership::Shared
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Memory row that holds logical (top-down) row `row`
    pub fn physical_row(&self, row: usize) -> usize {
        if self.top_down {
            row
        } else {
            self.size_y - 1 - row
        }
    }

    /// Bytes of logical row `row` starting at pixel column `x`.
    /// Returns an empty slice for rows outside the buffer.
    pub fn row_from(&self, row: usize, x: usize) -> &[u8] {
        if row >= self.size_y {
            return &[];
        }
        let start = self.physical_row(row) * self.row_bytes + x * self.pixel_bytes();
        let end = (self.physical_row(row) * self.row_bytes + self.size_x * self.pixel_bytes())
            .min(self.data.len());
        if start >= end {
            return &[];
        }
        &self.data[start..end]
    }

    /// Bytes of logical row `row`
    pub fn row(&self, row: usize) -> &[u8] {
        self.row_from(row, 0)
    }

    /// Aspect ratio of the plane in pixels
    pub fn ratio(&self) -> f32 {
        if self.size_y == 0 {
            return 1.0;
        }
        self.size_x as f32 / self.size_y as f32
    }
}

// ============================================================================
// Image
// ============================================================================

/// A decoded frame: up to four planes plus colour metadata
#[derive(Debug, Clone)]
pub struct Image {
    planes: [ImagePlane; 4],
    pub color_model: ColorModel,
    pub color_scale: ColorScale,
    /// Pixel aspect ratio (1.0 = square pixels)
    pub pixel_ratio: f32,
    /// Presentation timestamp in seconds
    pub pts: f64,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            planes: Default::default(),
            color_model: ColorModel::Rgb,
            color_scale: ColorScale::Full,
            pixel_ratio: 1.0,
            pts: 0.0,
        }
    }
}

impl Image {
    /// Single-plane packed image
    pub fn from_plane(plane: ImagePlane, color_model: ColorModel) -> Self {
        let mut image = Self {
            color_model,
            ..Self::default()
        };
        image.planes[0] = plane;
        image
    }

    /// Planar image, e.g. Y/U/V
    pub fn from_planes(planes: Vec<ImagePlane>, color_model: ColorModel) -> Self {
        let mut image = Self {
            color_model,
            ..Self::default()
        };
        for (slot, plane) in image.planes.iter_mut().zip(planes) {
            *slot = plane;
        }
        image
    }

    pub fn with_pts(mut self, pts: f64) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_pixel_ratio(mut self, pixel_ratio: f32) -> Self {
        self.pixel_ratio = pixel_ratio;
        self
    }

    pub fn plane(&self, id: PlaneId) -> &ImagePlane {
        &self.planes[id.index()]
    }

    pub fn set_plane(&mut self, id: PlaneId, plane: ImagePlane) {
        self.planes[id.index()] = plane;
    }

    /// Non-empty planes with their slot
    pub fn planes(&self) -> impl Iterator<Item = (PlaneId, &ImagePlane)> {
        PlaneId::ALL
            .into_iter()
            .map(|id| (id, &self.planes[id.index()]))
            .filter(|(_, p)| !p.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.planes[0].is_empty()
    }

    pub fn size_x(&self) -> usize {
        self.planes[0].size_x()
    }

    pub fn size_y(&self) -> usize {
        self.planes[0].size_y()
    }

    /// Display aspect ratio, pixel ratio included
    pub fn ratio(&self) -> f32 {
        self.planes[0].ratio() * self.pixel_ratio
    }

    /// Every populated plane can be aliased and is stored top-down
    pub fn is_shared_top_down(&self) -> bool {
        !self.is_empty() && self.planes().all(|(_, p)| p.is_shared() && p.is_top_down())
    }
}
