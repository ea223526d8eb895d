//! GPU texture storage for decomposed stereo frames
//!
//! A [`QuadTexture`] holds front and back texture sets for both eyes.
//! Uploads always target the back set; the front set is what the display
//! renderer samples. The actual GPU API sits behind [`TextureBackend`] so the
//! upload scheduler can be driven by wgpu or by a recording backend in tests.

use crate::image::{ColorModel, ColorScale, PlaneFormat, PlaneId};
use crate::stereo::{Eye, Panorama, StereoParams};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TextureError {
    #[error("Unsupported plane format: {0:?}")]
    UnsupportedFormat(PlaneFormat),
    #[error("Degenerate texture size {width}x{height}")]
    DegenerateSize { width: u32, height: u32 },
    #[error("Unknown texture {0:?}")]
    UnknownTexture(TextureId),
    #[error("Upload out of bounds: {0}")]
    OutOfBounds(String),
    #[error("GPU backend error: {0}")]
    Backend(String),
}

/// Handle issued by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// Allocated storage for one plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PlaneFormat,
    /// Six square layers instead of one 2D image
    pub cubemap: bool,
}

impl TextureDesc {
    pub fn layers(&self) -> u32 {
        if self.cubemap {
            6
        } else {
            1
        }
    }
}

/// Destination rectangle of one upload call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadRegion {
    /// Cubemap face, 0 for flat textures
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Source stride in bytes
    pub row_bytes: usize,
}

/// GPU API seam used by the upload scheduler
pub trait TextureBackend {
    /// Largest width/height a texture may have
    fn max_texture_size(&self) -> u32;

    /// Strided sub-region uploads are supported (enables zero-copy views)
    fn has_unpack(&self) -> bool;

    fn has_cubemap(&self) -> bool;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, TextureError>;

    fn release_texture(&mut self, id: TextureId);

    /// Copy `region.height` rows of `data` (stride `region.row_bytes`) into the texture
    fn write_rows(&mut self, id: TextureId, region: &UploadRegion, data: &[u8]) -> Result<(), TextureError>;
}

// ============================================================================
// Frame Textures
// ============================================================================

/// Texture storage for one plane of one eye
#[derive(Debug, Clone, Default)]
pub struct FrameTexture {
    texture: Option<(TextureId, TextureDesc)>,
    /// Filled fraction of the allocated texture (x, y)
    data_size: [f32; 2],
    display_ratio: f32,
}

impl FrameTexture {
    pub fn is_valid(&self) -> bool {
        self.texture.is_some()
    }

    pub fn id(&self) -> Option<TextureId> {
        self.texture.map(|(id, _)| id)
    }

    pub fn desc(&self) -> Option<TextureDesc> {
        self.texture.map(|(_, desc)| desc)
    }

    pub fn data_size(&self) -> [f32; 2] {
        self.data_size
    }

    pub fn display_ratio(&self) -> f32 {
        self.display_ratio
    }

    /// Make sure storage of at least `width x height` in `format` exists.
    /// Textures only grow, unless the format or target changes; cubemaps must match exactly.
    pub fn prepare<B: TextureBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
        format: PlaneFormat,
        cubemap: bool,
    ) -> Result<(), TextureError> {
        let max = backend.max_texture_size();
        let width = width.min(max);
        let height = height.min(max);
        if width == 0 || height == 0 {
            self.release(backend);
            return Err(TextureError::DegenerateSize { width, height });
        }

        if let Some((_, desc)) = self.texture {
            let same_kind = desc.format == format && desc.cubemap == cubemap;
            let fits = if cubemap {
                desc.width == width && desc.height == height
            } else {
                desc.width >= width && desc.height >= height
            };
            if same_kind && fits {
                return Ok(());
            }
            self.release(backend);
        }

        let desc = TextureDesc {
            width,
            height,
            format,
            cubemap,
        };
        let id = backend.create_texture(&desc)?;
        tracing::debug!("Texture {:?} allocated {}x{} {:?}", id, width, height, format);
        self.texture = Some((id, desc));
        Ok(())
    }

    pub fn release<B: TextureBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some((id, _)) = self.texture.take() {
            backend.release_texture(id);
        }
        self.data_size = [0.0, 0.0];
    }

    /// Record the filled rectangle of a `size_x x size_y` plane
    pub fn setup_data_rectangle(&mut self, size_x: usize, size_y: usize, pixel_ratio: f32) {
        let Some((_, desc)) = self.texture else {
            return;
        };
        if desc.cubemap {
            self.data_size = [1.0, 1.0];
            self.display_ratio = 1.0;
            return;
        }
        let sx = (size_x as f32).min(desc.width as f32);
        let sy = (size_y as f32).min(desc.height as f32);
        self.data_size = [
            (sx / desc.width as f32).min(1.0),
            (sy / desc.height as f32).min(1.0),
        ];
        self.display_ratio = if sy > 0.0 { pixel_ratio * sx / sy } else { 1.0 };
    }
}

/// All planes of one eye
#[derive(Debug, Clone, Default)]
pub struct FrameTextures {
    planes: [FrameTexture; 4],
    pub color_model: ColorModel,
    pub color_scale: ColorScale,
    pub panorama: Panorama,
    source: Option<Arc<StereoParams>>,
}

impl FrameTextures {
    pub fn plane(&self, id: PlaneId) -> &FrameTexture {
        &self.planes[id.index()]
    }

    pub fn plane_mut(&mut self, id: PlaneId) -> &mut FrameTexture {
        &mut self.planes[id.index()]
    }

    /// First plane holds storage
    pub fn is_valid(&self) -> bool {
        self.planes[0].is_valid()
    }

    /// Stereo parameters of the frame currently stored here
    pub fn source(&self) -> Option<&Arc<StereoParams>> {
        self.source.as_ref()
    }

    pub fn set_source(&mut self, params: Option<Arc<StereoParams>>) {
        self.source = params;
    }

    pub fn release<B: TextureBackend + ?Sized>(&mut self, backend: &mut B) {
        for plane in &mut self.planes {
            plane.release(backend);
        }
        self.source = None;
    }
}

/// Front/back texture pairs for both eyes
#[derive(Debug, Clone, Default)]
pub struct QuadTexture {
    sets: [[FrameTextures; 2]; 2],
    front: usize,
}

impl QuadTexture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Textures the renderer samples
    pub fn front(&self, eye: Eye) -> &FrameTextures {
        &self.sets[self.front][eye.index()]
    }

    pub fn back(&self, eye: Eye) -> &FrameTextures {
        &self.sets[1 - self.front][eye.index()]
    }

    pub fn back_mut(&mut self, eye: Eye) -> &mut FrameTextures {
        &mut self.sets[1 - self.front][eye.index()]
    }

    /// Exchange front and back
    pub fn swap(&mut self) {
        self.front = 1 - self.front;
    }

    pub fn release_back<B: TextureBackend + ?Sized>(&mut self, backend: &mut B) {
        for eye in Eye::BOTH {
            self.back_mut(eye).release(backend);
        }
    }

    pub fn release<B: TextureBackend + ?Sized>(&mut self, backend: &mut B) {
        for set in &mut self.sets {
            for textures in set {
                textures.release(backend);
            }
        }
    }
}

// ============================================================================
// wgpu Backend
// ============================================================================

#[cfg(feature = "wgpu-backend")]
pub use self::wgpu_backend::WgpuBackend;

#[cfg(feature = "wgpu-backend")]
mod wgpu_backend {
    use super::*;
    use std::collections::HashMap;

    /// wgpu texture format for a plane, `None` if it has no direct equivalent
    fn texture_format(format: PlaneFormat) -> Option<wgpu::TextureFormat> {
        match format {
            PlaneFormat::Gray => Some(wgpu::TextureFormat::R8Unorm),
            PlaneFormat::Rgba | PlaneFormat::Rgb32 => Some(wgpu::TextureFormat::Rgba8Unorm),
            PlaneFormat::Bgra | PlaneFormat::Bgr32 => Some(wgpu::TextureFormat::Bgra8Unorm),
            PlaneFormat::GrayF => Some(wgpu::TextureFormat::R32Float),
            PlaneFormat::RgbaF => Some(wgpu::TextureFormat::Rgba32Float),
            // 3-channel and 16-bit layouts need a conversion pass
            PlaneFormat::Gray16
            | PlaneFormat::Rgb
            | PlaneFormat::Bgr
            | PlaneFormat::RgbF
            | PlaneFormat::BgrF
            | PlaneFormat::BgraF => None,
        }
    }

    /// Texture backend on top of a wgpu device/queue pair
    pub struct WgpuBackend {
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        textures: HashMap<TextureId, wgpu::Texture>,
        next_id: u64,
        max_size: u32,
    }

    impl WgpuBackend {
        pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
            let max_size = device.limits().max_texture_dimension_2d;
            Self {
                device,
                queue,
                textures: HashMap::new(),
                next_id: 1,
                max_size,
            }
        }

        /// Headless device, used for offscreen decoding
        pub fn new_headless() -> Result<Self, TextureError> {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
            let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            }))
            .ok_or_else(|| TextureError::Backend("no suitable GPU adapter".into()))?;

            let (device, queue) = pollster::block_on(adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("stereo_upload_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            ))
            .map_err(|e| TextureError::Backend(e.to_string()))?;

            tracing::info!("wgpu upload backend on {}", adapter.get_info().name);
            Ok(Self::new(Arc::new(device), Arc::new(queue)))
        }

        pub fn texture(&self, id: TextureId) -> Option<&wgpu::Texture> {
            self.textures.get(&id)
        }
    }

    impl TextureBackend for WgpuBackend {
        fn max_texture_size(&self) -> u32 {
            self.max_size
        }

        fn has_unpack(&self) -> bool {
            // write_texture takes an arbitrary bytes_per_row
            true
        }

        fn has_cubemap(&self) -> bool {
            true
        }

        fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, TextureError> {
            let format =
                texture_format(desc.format).ok_or(TextureError::UnsupportedFormat(desc.format))?;
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(if desc.cubemap { "stereo_cubemap" } else { "stereo_plane" }),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: desc.layers(),
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let id = TextureId(self.next_id);
            self.next_id += 1;
            self.textures.insert(id, texture);
            Ok(id)
        }

        fn release_texture(&mut self, id: TextureId) {
            if let Some(texture) = self.textures.remove(&id) {
                texture.destroy();
            }
        }

        fn write_rows(&mut self, id: TextureId, region: &UploadRegion, data: &[u8]) -> Result<(), TextureError> {
            let texture = self.textures.get(&id).ok_or(TextureError::UnknownTexture(id))?;
            if region.width == 0 || region.height == 0 {
                return Ok(());
            }
            let row_bytes = u32::try_from(region.row_bytes)
                .map_err(|_| TextureError::OutOfBounds(format!("stride {}", region.row_bytes)))?;

            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: region.x,
                        y: region.y,
                        z: region.layer,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(row_bytes),
                    rows_per_image: Some(region.height),
                },
                wgpu::Extent3d {
                    width: region.width,
                    height: region.height,
                    depth_or_array_layers: 1,
                },
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingBackend;

    #[test]
    fn test_textures_only_grow() {
        let mut backend = RecordingBackend::new();
        let mut tex = FrameTexture::default();

        tex.prepare(&mut backend, 640, 480, PlaneFormat::Rgba, false).unwrap();
        let first = tex.id();
        tex.prepare(&mut backend, 320, 240, PlaneFormat::Rgba, false).unwrap();
        assert_eq!(tex.id(), first);

        tex.prepare(&mut backend, 1280, 720, PlaneFormat::Rgba, false).unwrap();
        assert_ne!(tex.id(), first);
        assert_eq!(backend.live_textures(), 1);
    }

    #[test]
    fn test_format_change_reallocates() {
        let mut backend = RecordingBackend::new();
        let mut tex = FrameTexture::default();
        tex.prepare(&mut backend, 64, 64, PlaneFormat::Rgba, false).unwrap();
        let first = tex.id();
        tex.prepare(&mut backend, 64, 64, PlaneFormat::Gray, false).unwrap();
        assert_ne!(tex.id(), first);
        assert_eq!(backend.live_textures(), 1);
    }

    #[test]
    fn test_size_clamped_to_device_limit() {
        let mut backend = RecordingBackend::new().with_max_size(1024);
        let mut tex = FrameTexture::default();
        tex.prepare(&mut backend, 4096, 512, PlaneFormat::Rgba, false).unwrap();
        let desc = tex.desc().unwrap();
        assert_eq!((desc.width, desc.height), (1024, 512));
    }

    #[test]
    fn test_data_rectangle() {
        let mut backend = RecordingBackend::new();
        let mut tex = FrameTexture::default();
        tex.prepare(&mut backend, 200, 100, PlaneFormat::Rgba, false).unwrap();
        tex.setup_data_rectangle(100, 100, 1.0);
        assert_eq!(tex.data_size(), [0.5, 1.0]);
        assert!((tex.display_ratio() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_quad_swap() {
        let mut backend = RecordingBackend::new();
        let mut quad = QuadTexture::new();
        quad.back_mut(Eye::Left)
            .plane_mut(PlaneId::First)
            .prepare(&mut backend, 8, 8, PlaneFormat::Gray, false)
            .unwrap();
        assert!(!quad.front(Eye::Left).is_valid());
        quad.swap();
        assert!(quad.front(Eye::Left).is_valid());
        assert!(!quad.back(Eye::Left).is_valid());
    }
}
