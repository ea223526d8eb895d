//! # Texture Data - Stereo Decomposition and Chunked Upload
//!
//! Turns a decoded image (or an image pair) tagged with a stereo format into
//! left/right eye planes, then pushes those planes to GPU textures a few rows
//! at a time so a single frame never stalls the render thread.
//!
//! ## Architecture
//!
//! ```text
//!  decode thread                          render thread
//! ┌──────────────┐   update_data()   ┌─────────────┐  fill_texture()  ┌─────────────┐
//! │ Image (L[,R])│──────────────────►│ TextureData │─────────────────►│ QuadTexture │
//! └──────────────┘                   │  eye views  │  rows [from,+n)  │ (back set)  │
//!                                    └──────┬──────┘                  └─────────────┘
//!                                           │
//!                              ┌────────────┴────────────┐
//!                              │ source alias (zero-copy)│
//!                              │ or owned repack buffer  │
//!                              └─────────────────────────┘
//! ```
//!
//! Output planes are always top-down. The owned buffer is reused across
//! frames and only reallocated when the required size changes.

use crate::image::{ColorModel, ColorScale, Image, ImagePlane, Ownership, PlaneFormat, PlaneId};
use crate::stereo::{classify_cubemap, CubeArrangement, CubemapFormat, Eye, StereoFormat, StereoParams};
use crate::texture::{FrameTexture, FrameTextures, QuadTexture, TextureBackend, TextureId, UploadRegion};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Configuration
// ============================================================================

/// Upload bandwidth limits per `fill_texture` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bytes pushed to the GPU per call (both eyes, all planes)
    pub max_chunk_bytes: usize,
    /// Upper bound of calls needed for one frame
    pub max_iterations: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 8 * 1024 * 1024, // a 1080p RGBA pair in ~2 calls
            max_iterations: 8,
        }
    }
}

/// Per-frame decomposition switches
#[derive(Debug, Clone, Copy, Default)]
pub struct DecomposeOptions {
    /// Device accepts strided uploads, so shared sources may be aliased
    pub prefer_unpack: bool,
    /// Declared packed cubemap layout
    pub cubemap: CubemapFormat,
}

/// Upload cursor of the current frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillProgress {
    pub from_row: usize,
    pub rows: usize,
}

// ============================================================================
// Eye Views
// ============================================================================

/// Window into either the owned buffer or a plane of the aliased source
#[derive(Debug, Clone, Copy, Default)]
struct PlaneView {
    format: PlaneFormat,
    size_x: usize,
    size_y: usize,
    row_bytes: usize,
    offset: usize,
    /// `Some` when aliasing that plane of the source image
    source: Option<PlaneId>,
}

impl PlaneView {
    fn owned(format: PlaneFormat, size_x: usize, size_y: usize) -> Self {
        Self {
            format,
            size_x,
            size_y,
            row_bytes: even(size_x * format.bytes_per_pixel()),
            offset: 0,
            source: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.size_x == 0 || self.size_y == 0
    }

    fn bytes(&self) -> usize {
        self.row_bytes * self.size_y
    }

    /// Bytes from the first pixel to the last pixel
    fn span(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.size_y - 1) * self.row_bytes + self.size_x * self.format.bytes_per_pixel()
    }
}

#[derive(Debug, Clone)]
struct EyeLayout {
    planes: [PlaneView; 4],
    color_model: ColorModel,
    color_scale: ColorScale,
    pixel_ratio: f32,
}

impl Default for EyeLayout {
    fn default() -> Self {
        Self {
            planes: [PlaneView::default(); 4],
            color_model: ColorModel::Rgb,
            color_scale: ColorScale::Full,
            pixel_ratio: 1.0,
        }
    }
}

impl EyeLayout {
    fn first(&self) -> &PlaneView {
        &self.planes[0]
    }
}

/// Read-only plane of a decomposed eye
#[derive(Debug, Clone, Copy)]
pub struct PlaneRef<'a> {
    pub format: PlaneFormat,
    pub size_x: usize,
    pub size_y: usize,
    pub row_bytes: usize,
    data: &'a [u8],
}

impl<'a> PlaneRef<'a> {
    /// Pixel bytes of top-down row `row`
    pub fn row(&self, row: usize) -> &'a [u8] {
        let start = row * self.row_bytes;
        let end = (start + self.size_x * self.format.bytes_per_pixel()).min(self.data.len());
        if row >= self.size_y || start >= end {
            return &[];
        }
        &self.data[start..end]
    }

    /// Raw bytes from the first pixel, stride `row_bytes`
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

#[derive(Debug, Default)]
enum Backing {
    #[default]
    Empty,
    /// Zero-copy: eye views alias this image
    Source(Image),
    /// Repacked copy
    Owned(Vec<u8>),
}

// ============================================================================
// Texture Data
// ============================================================================

/// Decomposed stereo frame plus its upload cursor
#[derive(Debug, Default)]
pub struct TextureData {
    backing: Backing,
    eyes: [EyeLayout; 2],
    params: Option<Arc<StereoParams>>,
    format: StereoFormat,
    cubemap: CubemapFormat,
    pts: f64,
    fill: FillProgress,
    complete: bool,
}

/// One-shot decomposition into a fresh `TextureData`
pub fn decompose(
    left: &Image,
    right: Option<&Image>,
    params: Option<Arc<StereoParams>>,
    format: StereoFormat,
    options: DecomposeOptions,
) -> TextureData {
    let mut data = TextureData::new();
    data.update_data(left, right, params, format, left.pts, options);
    data
}

impl TextureData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decompose a new frame in place. `right` is only read for
    /// `SeparateFrames`; every other format takes both eyes from `left`.
    pub fn update_data(
        &mut self,
        left: &Image,
        right: Option<&Image>,
        params: Option<Arc<StereoParams>>,
        format: StereoFormat,
        pts: f64,
        options: DecomposeOptions,
    ) {
        self.params = params;
        self.pts = pts;
        self.fill = FillProgress::default();
        self.complete = false;
        self.cubemap = CubemapFormat::Off;
        self.eyes = Default::default();

        let format = if format == StereoFormat::Auto {
            StereoFormat::from_ratio(left.ratio())
        } else {
            format
        };
        self.format = format;

        let right = right.filter(|r| !r.is_empty());
        if left.is_empty() && right.is_none() {
            // nothing to show, keep the allocation for the next frame
            if matches!(self.backing, Backing::Source(_)) {
                self.backing = Backing::Empty;
            }
            return;
        }

        for eye in &mut self.eyes {
            eye.color_model = left.color_model;
            eye.color_scale = left.color_scale;
            eye.pixel_ratio = left.pixel_ratio;
        }
        if format == StereoFormat::RowInterlaced {
            for eye in &mut self.eyes {
                eye.pixel_ratio = left.pixel_ratio * 0.5;
            }
        }

        if options.prefer_unpack && format.supports_zero_copy() && left.is_shared_top_down() {
            self.wrap_source(left, format);
        } else {
            self.repack(left, right, format);
        }

        if options.cubemap != CubemapFormat::Off {
            let first = *self.eyes[0].first();
            self.cubemap = classify_cubemap(options.cubemap, first.size_x, first.size_y);
            if self.cubemap == CubemapFormat::Off {
                tracing::debug!(
                    "{}x{} does not match a packed cubemap layout, showing flat",
                    first.size_x,
                    first.size_y
                );
            }
        }
    }

    /// Alias the shared source instead of copying
    fn wrap_source(&mut self, src: &Image, format: StereoFormat) {
        for (id, plane) in src.planes() {
            let bpp = plane.pixel_bytes();
            let (sx, sy, rb) = (plane.size_x(), plane.size_y(), plane.row_bytes());
            let view = |size_x, size_y, row_bytes, offset| PlaneView {
                format: plane.format(),
                size_x,
                size_y,
                row_bytes,
                offset,
                source: Some(id),
            };
            let (first, second) = match format {
                StereoFormat::SideBySideLR | StereoFormat::SideBySideRL => {
                    let half = sx / 2;
                    (view(half, sy, rb, 0), view(half, sy, rb, half * bpp))
                }
                StereoFormat::TopBottomLR | StereoFormat::TopBottomRL => {
                    let half = sy / 2;
                    (view(sx, half, rb, 0), view(sx, half, rb, half * rb))
                }
                // row interlace: every other row, the right eye starts one row down
                _ => (view(sx, sy / 2, rb * 2, 0), view(sx, sy / 2, rb * 2, rb)),
            };
            let (l, r) = if matches!(format, StereoFormat::SideBySideRL | StereoFormat::TopBottomRL) {
                (second, first)
            } else {
                (first, second)
            };
            self.eyes[0].planes[id.index()] = l;
            self.eyes[1].planes[id.index()] = r;
        }
        self.backing = Backing::Source(src.clone());
    }

    /// Copy eye planes into the owned buffer
    fn repack(&mut self, left: &Image, right: Option<&Image>, format: StereoFormat) {
        let second = if format == StereoFormat::SeparateFrames { right } else { None };

        // layout both eyes, plane by plane
        let mut offset = 0;
        for id in PlaneId::ALL {
            let src = left.plane(id);
            let (mut l, mut r) = if src.is_empty() {
                (PlaneView::default(), PlaneView::default())
            } else {
                eye_views(format, src)
            };
            if format == StereoFormat::SeparateFrames {
                r = match second.map(|img| img.plane(id)).filter(|p| !p.is_empty()) {
                    Some(p) => PlaneView::owned(p.format(), p.size_x(), p.size_y()),
                    None => PlaneView::default(),
                };
            }
            for view in [&mut l, &mut r] {
                if !view.is_empty() {
                    view.offset = offset;
                    offset += view.bytes();
                }
            }
            self.eyes[0].planes[id.index()] = l;
            self.eyes[1].planes[id.index()] = r;
        }
        if let Some(img) = second {
            self.eyes[1].color_model = img.color_model;
            self.eyes[1].color_scale = img.color_scale;
            self.eyes[1].pixel_ratio = img.pixel_ratio;
        }

        let required = (aligned_size(left) + right.map_or(0, aligned_size)).max(offset);
        let mut buffer = match std::mem::take(&mut self.backing) {
            Backing::Owned(buf) if buf.len() == required => buf,
            _ => {
                tracing::debug!("Reallocating texture data buffer: {} bytes", required);
                vec![0u8; required]
            }
        };

        for id in PlaneId::ALL {
            let src = left.plane(id);
            let l = self.eyes[0].planes[id.index()];
            let r = self.eyes[1].planes[id.index()];
            match format {
                StereoFormat::SideBySideLR | StereoFormat::SideBySideRL => {
                    let half = src.size_x() / 2;
                    let (lx, rx) = if format == StereoFormat::SideBySideLR { (0, half) } else { (half, 0) };
                    blit(src, lx, 0, 1, &mut buffer, &l, 0, 0, half, src.size_y());
                    blit(src, rx, 0, 1, &mut buffer, &r, 0, 0, half, src.size_y());
                }
                StereoFormat::TopBottomLR | StereoFormat::TopBottomRL => {
                    let half = src.size_y() / 2;
                    let (ly, ry) = if format == StereoFormat::TopBottomLR { (0, half) } else { (half, 0) };
                    blit(src, 0, ly, 1, &mut buffer, &l, 0, 0, src.size_x(), half);
                    blit(src, 0, ry, 1, &mut buffer, &r, 0, 0, src.size_x(), half);
                }
                StereoFormat::RowInterlaced => {
                    let rows = src.size_y() / 2;
                    blit(src, 0, 0, 2, &mut buffer, &l, 0, 0, src.size_x(), rows);
                    blit(src, 0, 1, 2, &mut buffer, &r, 0, 0, src.size_x(), rows);
                }
                StereoFormat::Tiled4x => {
                    let (dx, dy) = (src.size_x() / 3 * 2, src.size_y() / 3 * 2);
                    let (hx, hy) = (dx / 2, dy / 2);
                    blit(src, 0, 0, 1, &mut buffer, &l, 0, 0, dx, dy);
                    // right eye: right tile column, then the bottom strip split in two
                    blit(src, dx, 0, 1, &mut buffer, &r, 0, 0, hx, dy);
                    blit(src, 0, dy, 1, &mut buffer, &r, hx, 0, hx, hy);
                    blit(src, hx, dy, 1, &mut buffer, &r, hx, hy, hx, hy);
                }
                StereoFormat::SeparateFrames => {
                    blit(src, 0, 0, 1, &mut buffer, &l, 0, 0, src.size_x(), src.size_y());
                    if let Some(src_r) = second.map(|img| img.plane(id)) {
                        blit(src_r, 0, 0, 1, &mut buffer, &r, 0, 0, src_r.size_x(), src_r.size_y());
                    }
                }
                _ => {
                    blit(src, 0, 0, 1, &mut buffer, &l, 0, 0, src.size_x(), src.size_y());
                }
            }
        }
        self.backing = Backing::Owned(buffer);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    fn view_bytes(&self, view: &PlaneView) -> &[u8] {
        if view.is_empty() {
            return &[];
        }
        let data: &[u8] = match (&self.backing, view.source) {
            (Backing::Owned(buf), None) => buf.as_slice(),
            (Backing::Source(image), Some(id)) => image.plane(id).data().as_ref(),
            _ => return &[],
        };
        let end = (view.offset + view.span()).min(data.len());
        if view.offset >= end {
            return &[];
        }
        &data[view.offset..end]
    }

    pub fn plane(&self, eye: Eye, id: PlaneId) -> Option<PlaneRef<'_>> {
        let view = &self.eyes[eye.index()].planes[id.index()];
        if view.is_empty() {
            return None;
        }
        Some(PlaneRef {
            format: view.format,
            size_x: view.size_x,
            size_y: view.size_y,
            row_bytes: view.row_bytes,
            data: self.view_bytes(view),
        })
    }

    /// Dimensions of the eye's first plane
    pub fn eye_size(&self, eye: Eye) -> (usize, usize) {
        let first = self.eyes[eye.index()].first();
        (first.size_x, first.size_y)
    }

    pub fn is_eye_empty(&self, eye: Eye) -> bool {
        self.eyes[eye.index()].first().is_empty()
    }

    pub fn pixel_ratio(&self, eye: Eye) -> f32 {
        self.eyes[eye.index()].pixel_ratio
    }

    pub fn color_model(&self, eye: Eye) -> ColorModel {
        self.eyes[eye.index()].color_model
    }

    pub fn pts(&self) -> f64 {
        self.pts
    }

    /// Resolved format of the current frame (never `Auto`)
    pub fn format(&self) -> StereoFormat {
        self.format
    }

    pub fn cubemap(&self) -> CubemapFormat {
        self.cubemap
    }

    pub fn params(&self) -> Option<&Arc<StereoParams>> {
        self.params.as_ref()
    }

    /// Drop the link to the source's stereo parameters
    pub fn reset_params(&mut self) {
        self.params = None;
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self.backing, Backing::Source(_))
    }

    /// Address of the owned repack buffer, if any
    pub fn owned_buffer_ptr(&self) -> Option<*const u8> {
        match &self.backing {
            Backing::Owned(buf) => Some(buf.as_ptr()),
            _ => None,
        }
    }

    pub fn owned_buffer_len(&self) -> usize {
        match &self.backing {
            Backing::Owned(buf) => buf.len(),
            _ => 0,
        }
    }

    pub fn fill_progress(&self) -> FillProgress {
        self.fill
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Release buffers and views
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Owned top-down copies of both eyes
    pub fn snapshot(&self) -> (Option<Image>, Option<Image>) {
        (self.eye_image(Eye::Left), self.eye_image(Eye::Right))
    }

    fn eye_image(&self, eye: Eye) -> Option<Image> {
        let layout = &self.eyes[eye.index()];
        if layout.first().is_empty() {
            return None;
        }
        let planes = PlaneId::ALL
            .into_iter()
            .map(|id| match self.plane(eye, id) {
                Some(plane) => {
                    let mut bytes = Vec::with_capacity(plane.size_x * plane.size_y * plane.format.bytes_per_pixel());
                    for row in 0..plane.size_y {
                        bytes.extend_from_slice(plane.row(row));
                    }
                    ImagePlane::new(plane.format, plane.size_x, plane.size_y, bytes, Ownership::Owned)
                }
                None => ImagePlane::default(),
            })
            .collect();
        let mut image = Image::from_planes(planes, layout.color_model).with_pts(self.pts);
        image.color_scale = layout.color_scale;
        image.pixel_ratio = layout.pixel_ratio;
        Some(image)
    }

    // ========================================================================
    // Upload Scheduler
    // ========================================================================

    /// Push the next chunk of rows into the back textures of `quad`.
    /// Returns `true` once the whole frame is on the GPU.
    pub fn fill_texture<B: TextureBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        quad: &mut QuadTexture,
        config: &UploadConfig,
    ) -> bool {
        if self.complete {
            return true;
        }

        // either eye may be missing, e.g. a slave frame with no master
        let height = self.eye_size(Eye::Left).1.max(self.eye_size(Eye::Right).1);
        if self.fill.rows == 0 || self.fill.from_row == 0 {
            for eye in Eye::BOTH {
                let textures = quad.back_mut(eye);
                self.prepare_textures(backend, textures, eye);
                textures.set_source(None);
            }
            self.fill.from_row = 0;
            self.fill.rows = if self.cubemap != CubemapFormat::Off {
                // faces are sliced in one go
                height
            } else {
                self.chunk_rows(config, height)
            };
        }

        if self.fill.rows == 0 {
            // nothing to upload, avoid a dead loop
            self.complete = true;
            return true;
        }

        let to_row = (self.fill.from_row + self.fill.rows).min(height);
        for eye in Eye::BOTH {
            let textures = quad.back(eye);
            if !textures.is_valid() {
                continue;
            }
            for id in PlaneId::ALL {
                self.upload_plane(backend, textures.plane(id), eye, id, height, to_row);
            }
        }

        self.fill.from_row = to_row;
        if self.fill.from_row < height {
            return false;
        }

        for eye in Eye::BOTH {
            if !self.is_eye_empty(eye) && quad.back(eye).is_valid() {
                self.setup_attributes(quad.back_mut(eye), eye);
            }
        }
        if let Some(params) = &self.params {
            params.set_detected_format(self.format);
        }
        self.complete = true;
        true
    }

    fn chunk_rows(&self, config: &UploadConfig, height: usize) -> usize {
        if height == 0 {
            return 0;
        }
        let total: usize = self
            .eyes
            .iter()
            .flat_map(|eye| eye.planes.iter())
            .map(|view| view.bytes())
            .sum();
        let iterations = total
            .div_ceil(config.max_chunk_bytes.max(1))
            .clamp(1, config.max_iterations.max(1));
        height.div_ceil(iterations)
    }

    fn cube_arrangement(&self, view: &PlaneView) -> Option<CubeArrangement> {
        match self.cubemap {
            CubemapFormat::Off => None,
            CubemapFormat::Packed => CubeArrangement::detect(view.size_x, view.size_y),
            CubemapFormat::PackedEac => Some(CubeArrangement::from_orientation(view.size_x, view.size_y)),
        }
    }

    fn prepare_textures<B: TextureBackend + ?Sized>(
        &self,
        backend: &mut B,
        textures: &mut FrameTextures,
        eye: Eye,
    ) {
        let layout = &self.eyes[eye.index()];
        textures.color_model = layout.color_model;
        textures.color_scale = layout.color_scale;
        for id in PlaneId::ALL {
            let view = layout.planes[id.index()];
            let texture = textures.plane_mut(id);
            if view.is_empty() {
                texture.release(backend);
                continue;
            }
            let (width, height, cubemap) = match self.cube_arrangement(&view) {
                Some(arrangement) => {
                    let face = arrangement.face_size(view.size_x, view.size_y);
                    (face, face, true)
                }
                None => (view.size_x, view.size_y, false),
            };
            if let Err(err) = texture.prepare(backend, width as u32, height as u32, view.format, cubemap) {
                tracing::warn!("Skipping {:?} plane {:?}: {}", eye, id, err);
                texture.release(backend);
            }
        }
    }

    fn upload_plane<B: TextureBackend + ?Sized>(
        &self,
        backend: &mut B,
        texture: &FrameTexture,
        eye: Eye,
        id: PlaneId,
        frame_height: usize,
        to_row: usize,
    ) {
        let view = self.eyes[eye.index()].planes[id.index()];
        let (Some(tex_id), Some(desc)) = (texture.id(), texture.desc()) else {
            return;
        };
        if view.is_empty() {
            return;
        }
        let data = self.view_bytes(&view);
        if desc.cubemap {
            self.upload_faces(backend, tex_id, desc.width as usize, &view, data);
            return;
        }

        // planes with a different height (chroma) follow proportionally
        let from = self.fill.from_row * view.size_y / frame_height;
        let to = if to_row >= frame_height {
            view.size_y
        } else {
            to_row * view.size_y / frame_height
        };
        let to = to.min(desc.height as usize);
        let start = from * view.row_bytes;
        if from >= to || start >= data.len() {
            return;
        }
        let region = UploadRegion {
            layer: 0,
            x: 0,
            y: from as u32,
            width: view.size_x.min(desc.width as usize) as u32,
            height: (to - from) as u32,
            row_bytes: view.row_bytes,
        };
        if let Err(err) = backend.write_rows(tex_id, &region, &data[start..]) {
            tracing::warn!("Upload of {:?} plane {:?} failed: {}", eye, id, err);
        }
    }

    /// Slice a packed cubemap into its six faces (+X, -X, +Y, -Y, +Z, -Z)
    fn upload_faces<B: TextureBackend + ?Sized>(
        &self,
        backend: &mut B,
        tex_id: TextureId,
        face: usize,
        view: &PlaneView,
        data: &[u8],
    ) {
        let Some(arrangement) = self.cube_arrangement(view) else {
            return;
        };
        let eac = self.cubemap == CubemapFormat::PackedEac;
        let bpp = view.format.bytes_per_pixel();
        let (cols, rows) = arrangement.grid();
        let (tile_x, tile_y) = (view.size_x / cols, view.size_y / rows);

        for layer in 0..6 {
            let ((col, row), transpose) = if eac {
                eac_tile(arrangement, layer)
            } else {
                (arrangement.tile(layer), false)
            };
            let start = row * tile_y * view.row_bytes + col * tile_x * bpp;
            if start >= data.len() {
                continue;
            }
            let result = if transpose {
                let patch = transpose_patch(&data[start..], view.row_bytes, face, bpp);
                let region = UploadRegion {
                    layer: layer as u32,
                    x: 0,
                    y: 0,
                    width: face as u32,
                    height: face as u32,
                    row_bytes: face * bpp,
                };
                backend.write_rows(tex_id, &region, &patch)
            } else {
                let region = UploadRegion {
                    layer: layer as u32,
                    x: 0,
                    y: 0,
                    width: face as u32,
                    height: face as u32,
                    row_bytes: view.row_bytes,
                };
                backend.write_rows(tex_id, &region, &data[start..])
            };
            if let Err(err) = result {
                tracing::warn!("Cubemap face {} upload failed: {}", layer, err);
            }
        }
    }

    fn setup_attributes(&self, textures: &mut FrameTextures, eye: Eye) {
        let layout = &self.eyes[eye.index()];
        for id in PlaneId::ALL {
            let view = layout.planes[id.index()];
            if !view.is_empty() {
                textures
                    .plane_mut(id)
                    .setup_data_rectangle(view.size_x, view.size_y, layout.pixel_ratio);
            }
        }
        textures.panorama = match &self.params {
            Some(params) => params.panorama_for(self.cubemap),
            None if self.cubemap != CubemapFormat::Off => crate::stereo::Panorama::Cubemap,
            None => crate::stereo::Panorama::Off,
        };
        textures.set_source(self.params.clone());
    }
}

// ============================================================================
// Layout Helpers
// ============================================================================

fn even(n: usize) -> usize {
    n + (n & 1)
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Buffer reserve for a copy of `image`
fn aligned_size(image: &Image) -> usize {
    image
        .planes()
        .map(|(_, p)| align4(p.size_x()) * align4(p.size_y()) * p.pixel_bytes())
        .sum()
}

/// Owned eye views for single-image formats
fn eye_views(format: StereoFormat, src: &ImagePlane) -> (PlaneView, PlaneView) {
    let (sx, sy, pf) = (src.size_x(), src.size_y(), src.format());
    match format {
        StereoFormat::SideBySideLR | StereoFormat::SideBySideRL => {
            (PlaneView::owned(pf, sx / 2, sy), PlaneView::owned(pf, sx / 2, sy))
        }
        StereoFormat::TopBottomLR | StereoFormat::TopBottomRL | StereoFormat::RowInterlaced => {
            (PlaneView::owned(pf, sx, sy / 2), PlaneView::owned(pf, sx, sy / 2))
        }
        StereoFormat::Tiled4x => {
            let (dx, dy) = (sx / 3 * 2, sy / 3 * 2);
            (PlaneView::owned(pf, dx, dy), PlaneView::owned(pf, dx, dy))
        }
        _ => (PlaneView::owned(pf, sx, sy), PlaneView::default()),
    }
}

/// Copy a `width x height` block of logical source rows `src_y, src_y + step, ...`
/// into `dst` at (`dst_x`, `dst_y`) of `view`. Lengths are clamped to both sides.
#[allow(clippy::too_many_arguments)]
fn blit(
    src: &ImagePlane,
    src_x: usize,
    src_y: usize,
    src_step: usize,
    dst: &mut [u8],
    view: &PlaneView,
    dst_x: usize,
    dst_y: usize,
    width: usize,
    height: usize,
) {
    if src.is_empty() || view.is_empty() {
        return;
    }
    let bpp = src.pixel_bytes();
    let rows = height
        .min(view.size_y.saturating_sub(dst_y))
        .min(src.size_y().saturating_sub(src_y).div_ceil(src_step));

    // whole rows with identical stride: one bulk copy
    if src_x == 0
        && dst_x == 0
        && src_step == 1
        && width >= src.size_x()
        && src.is_top_down()
        && src.row_bytes() == view.row_bytes
    {
        let from = src_y * src.row_bytes();
        let to = view.offset + dst_y * view.row_bytes;
        if from >= src.data().len() || to >= dst.len() {
            return;
        }
        let len = (rows * view.row_bytes)
            .min(src.data().len().saturating_sub(from))
            .min(dst.len().saturating_sub(to));
        dst[to..to + len].copy_from_slice(&src.data()[from..from + len]);
        return;
    }

    let dst_row_len = view.size_x.saturating_sub(dst_x) * bpp;
    for r in 0..rows {
        let src_row = src.row_from(src_y + r * src_step, src_x);
        let to = view.offset + (dst_y + r) * view.row_bytes + dst_x * bpp;
        if to >= dst.len() {
            break;
        }
        let len = (width * bpp)
            .min(src_row.len())
            .min(dst_row_len)
            .min(dst.len().saturating_sub(to));
        dst[to..to + len].copy_from_slice(&src_row[..len]);
    }
}

/// EAC tile of a face and whether it is stored transposed.
/// 3x2 layout: left, front, right on top; bottom, back, top below.
fn eac_tile(arrangement: CubeArrangement, face: usize) -> ((usize, usize), bool) {
    const EAC_3X2: [(usize, usize, bool); 6] = [
        (2, 0, false), // +X right
        (0, 0, false), // -X left
        (2, 1, true),  // +Y top
        (0, 1, true),  // -Y bottom
        (1, 0, false), // +Z front
        (1, 1, false), // -Z back
    ];
    let (col, row, transpose) = EAC_3X2[face];
    match arrangement {
        CubeArrangement::Grid2x3 => ((row, col), transpose),
        _ => ((col, row), transpose),
    }
}

fn transpose_patch(data: &[u8], row_bytes: usize, face: usize, bpp: usize) -> Vec<u8> {
    let mut out = vec![0u8; face * face * bpp];
    for y in 0..face {
        for x in 0..face {
            let from = x * row_bytes + y * bpp;
            let to = (y * face + x) * bpp;
            if from + bpp <= data.len() {
                out[to..to + bpp].copy_from_slice(&data[from..from + bpp]);
            }
        }
    }
    out
}
