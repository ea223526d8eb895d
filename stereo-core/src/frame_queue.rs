//! # Frame Queue - Decoded Stereo Frames Waiting for Upload
//!
//! This module sits between the video decode thread and the render thread:
//! - Fixed ring of reusable `TextureData` slots (no per-frame allocation)
//! - Chunked uploads of the front slot into the back textures
//! - Front/back texture swap authorized by the video timer
//! - Instant clear for seeking, frame dropping when playback falls behind
//! - Snapshot of the last uploaded frame
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ push() ┌──────────────┐ update_textures() ┌──────────────┐
//! │ Decoder  │───────►│ TextureQueue │──────────────────►│ QuadTexture  │
//! │ Thread   │        │  (ring)      │                   │ back ─► front│
//! └──────────┘        └──────┬───────┘                   └──────▲───────┘
//!                            │ pop_pts_next()                   │ swap_fb()
//!                      ┌─────┴──────┐                           │
//!                      │ VideoTimer │───────────────────────────┘
//!                      └────────────┘
//! ```
//!
//! Lock order: upload side, push lock, ring, swap counter.

use crate::image::Image;
use crate::stereo::{CubemapFormat, StereoFormat, StereoParams};
use crate::texture::{QuadTexture, TextureBackend};
use crate::texture_data::{DecomposeOptions, TextureData, UploadConfig};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Frame Queue Configuration
// ============================================================================

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Ring slots; one is always kept back for the frame being uploaded
    pub max_frames: usize,
    /// Upload chunking
    pub upload: UploadConfig,
    /// Release back textures and slot buffers right after use
    pub compress_memory: bool,
    /// Alias shared frames instead of copying them when the backend allows it
    pub prefer_unpack: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_frames: 4,
            upload: UploadConfig::default(),
            compress_memory: false,
            prefer_unpack: true,
        }
    }
}

/// Capabilities of the backend doing the uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BackendCaps {
    unpack: bool,
    cubemap: bool,
}

impl BackendCaps {
    fn of<B: TextureBackend + ?Sized>(backend: &B) -> Self {
        Self {
            unpack: backend.has_unpack(),
            cubemap: backend.has_cubemap(),
        }
    }
}

/// Result of a swap attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    /// No finished frame in the back textures
    Nothing,
    /// Back and front exchanged
    Swapped,
    /// Frame is ready but the timer has not authorized the swap yet
    WaitLimit,
}

#[derive(Debug)]
struct Ring {
    front: usize,
    back: usize,
    size: usize,
    /// Presentation time per slot
    pts: Vec<f64>,
    /// Last uploaded slot
    snapshot: Option<usize>,
    curr_pts: f64,
    src_format: StereoFormat,
}

#[derive(Debug, Default)]
struct SwapCounter {
    count: usize,
    ready: bool,
}

#[derive(Debug, Default)]
struct UploadSide {
    quad: QuadTexture,
    in_update: bool,
}

// ============================================================================
// Texture Queue
// ============================================================================

/// Ring of decomposed frames shared by the decode and render threads
pub struct TextureQueue {
    config: QueueConfig,

    /// Reused frame slots
    slots: Vec<Mutex<TextureData>>,

    /// Render-thread state; also serializes clear/drop against uploads
    upload: Mutex<UploadSide>,

    /// Serializes producers
    push_lock: Mutex<()>,

    ring: Mutex<Ring>,

    swap: Mutex<SwapCounter>,

    /// Signalled whenever a slot frees up
    space_cond: Condvar,

    /// Declared packed cubemap layout of the attached stream
    cubemap: Mutex<CubemapFormat>,

    /// Unknown until the render thread first calls `update_textures`
    caps: Mutex<Option<BackendCaps>>,

    has_stream: AtomicBool,
    new_shot: AtomicBool,

    frames_pushed: AtomicU64,
    frames_uploaded: AtomicU64,
    frames_shown: AtomicU64,
    frames_dropped: AtomicU64,
    frames_zero_copy: AtomicU64,
}

impl TextureQueue {
    /// Create a new texture queue
    pub fn new(config: QueueConfig) -> Self {
        let slots_count = config.max_frames.max(2);
        Self {
            slots: (0..slots_count).map(|_| Mutex::new(TextureData::new())).collect(),
            upload: Mutex::new(UploadSide::default()),
            push_lock: Mutex::new(()),
            ring: Mutex::new(Ring {
                front: 0,
                back: 0,
                size: 0,
                pts: vec![0.0; slots_count],
                snapshot: None,
                curr_pts: 0.0,
                src_format: StereoFormat::Mono,
            }),
            swap: Mutex::new(SwapCounter::default()),
            space_cond: Condvar::new(),
            cubemap: Mutex::new(CubemapFormat::Off),
            caps: Mutex::new(None),
            has_stream: AtomicBool::new(false),
            new_shot: AtomicBool::new(false),
            frames_pushed: AtomicU64::new(0),
            frames_uploaded: AtomicU64::new(0),
            frames_shown: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_zero_copy: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Declared packed cubemap layout for following frames
    pub fn set_cubemap(&self, cubemap: CubemapFormat) {
        *self.cubemap.lock() = cubemap;
    }

    /// Record what the upload backend can do. `update_textures` does this
    /// on every call; call it earlier to have the very first frame use it.
    pub fn attach_backend<B: TextureBackend + ?Sized>(&self, backend: &B) {
        let caps = BackendCaps::of(backend);
        let mut current = self.caps.lock();
        if *current != Some(caps) {
            tracing::debug!(unpack = caps.unpack, cubemap = caps.cubemap, "Texture backend attached");
            *current = Some(caps);
        }
    }

    /// Decomposition options for the next frame.
    /// Zero-copy needs a backend known to take strided uploads.
    fn decompose_options(&self) -> DecomposeOptions {
        let caps = *self.caps.lock();
        let cubemap = *self.cubemap.lock();
        DecomposeOptions {
            prefer_unpack: self.config.prefer_unpack && caps.is_some_and(|c| c.unpack),
            cubemap: if caps.map_or(true, |c| c.cubemap) {
                cubemap
            } else {
                CubemapFormat::Off
            },
        }
    }

    // ========================================================================
    // Producer API (Decoder Thread)
    // ========================================================================

    /// Decompose a frame into the next free slot.
    /// Returns false if queue is full.
    pub fn push(
        &self,
        left: &Image,
        right: Option<&Image>,
        params: Option<Arc<StereoParams>>,
        format: StereoFormat,
        pts: f64,
    ) -> bool {
        let _producer = self.push_lock.lock();
        let index = {
            let ring = self.ring.lock();
            if ring.size + 1 >= self.capacity() {
                return false;
            }
            if ring.size == 0 {
                ring.front
            } else {
                (ring.back + 1) % self.capacity()
            }
        };

        let options = self.decompose_options();
        let resolved = {
            let mut slot = self.slots[index].lock();
            slot.update_data(left, right, params, format, pts, options);
            if slot.is_zero_copy() {
                self.frames_zero_copy.fetch_add(1, Ordering::Relaxed);
            }
            slot.format()
        };

        let mut ring = self.ring.lock();
        ring.back = index;
        ring.pts[index] = pts;
        ring.src_format = resolved;
        ring.size += 1;
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Block until a slot is free or `timeout` passes
    pub fn wait_space(&self, timeout: Duration) -> bool {
        let mut ring = self.ring.lock();
        if ring.size + 1 < self.capacity() {
            return true;
        }
        self.space_cond.wait_for(&mut ring, timeout);
        ring.size + 1 < self.capacity()
    }

    /// Mark whether a decoder is attached (keeps `pts_curr` valid on an empty queue)
    pub fn set_has_stream(&self, has_stream: bool) {
        self.has_stream.store(has_stream, Ordering::SeqCst);
    }

    // ========================================================================
    // Consumer API (Render Thread)
    // ========================================================================

    /// Upload the next chunk of the front frame and perform an authorized swap.
    /// Returns true when the front textures changed.
    pub fn update_textures<B: TextureBackend + ?Sized>(&self, backend: &mut B) -> bool {
        self.attach_backend(&*backend);
        let mut side = self.upload.lock();
        let state = self.swap_on_ready(&mut side.quad, backend);
        if state == SwapState::WaitLimit {
            // back textures hold a finished frame, nothing may overwrite them
            return false;
        }

        let front = {
            let ring = self.ring.lock();
            if !side.in_update {
                side.in_update = ring.size != 0;
            } else if ring.size == 0 {
                side.in_update = false;
            }
            if !side.in_update {
                return state == SwapState::Swapped;
            }
            ring.front
        };

        {
            let side = &mut *side;
            let mut slot = self.slots[front].lock();
            if slot.fill_texture(backend, &mut side.quad, &self.config.upload) {
                self.swap.lock().ready = true;
                let pts = slot.pts();
                if self.config.compress_memory {
                    slot.reset();
                }
                drop(slot);

                let mut ring = self.ring.lock();
                ring.curr_pts = pts;
                ring.snapshot = (!self.config.compress_memory).then_some(front);
                ring.front = (ring.front + 1) % self.capacity();
                ring.size = ring.size.saturating_sub(1);
                side.in_update = false;
                self.new_shot.store(true, Ordering::SeqCst);
                self.frames_uploaded.fetch_add(1, Ordering::Relaxed);
                self.space_cond.notify_all();
            }
        }

        // try early swap
        let already = state == SwapState::Swapped;
        self.swap_on_ready(&mut side.quad, backend) == SwapState::Swapped || already
    }

    fn swap_on_ready<B: TextureBackend + ?Sized>(&self, quad: &mut QuadTexture, backend: &mut B) -> SwapState {
        {
            let mut swap = self.swap.lock();
            if !swap.ready {
                return SwapState::Nothing;
            }
            if swap.count == 0 {
                return SwapState::WaitLimit;
            }
            swap.ready = false;
            swap.count -= 1;
        }
        quad.swap();
        if self.config.compress_memory {
            quad.release_back(backend);
        }
        self.frames_shown.fetch_add(1, Ordering::Relaxed);
        SwapState::Swapped
    }

    /// Authorize one front/back swap. `limit` caps pending authorizations (0 = no cap).
    pub fn swap_fb(&self, limit: usize) -> bool {
        let mut swap = self.swap.lock();
        if limit == 0 || swap.count < limit {
            swap.count += 1;
            true
        } else {
            false
        }
    }

    /// Read the current textures
    pub fn with_textures<R>(&self, f: impl FnOnce(&QuadTexture) -> R) -> R {
        f(&self.upload.lock().quad)
    }

    /// Release all GPU storage
    pub fn release_textures<B: TextureBackend + ?Sized>(&self, backend: &mut B) {
        self.upload.lock().quad.release(backend);
    }

    /// Copy of the last uploaded frame, `None` if nothing new since the last call
    pub fn snapshot(&self, force: bool) -> Option<(Option<Image>, Option<Image>)> {
        if !self.new_shot.load(Ordering::SeqCst) && !force {
            return None;
        }
        let _side = self.upload.lock();
        let index = self.ring.lock().snapshot?;
        let copy = self.slots[index].lock().snapshot();
        self.new_shot.store(false, Ordering::SeqCst);
        Some(copy)
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Drop every queued frame (for seeking)
    pub fn clear(&self) {
        let mut side = self.upload.lock();
        let _producer = self.push_lock.lock();
        let mut ring = self.ring.lock();
        let mut swap = self.swap.lock();

        let mut index = ring.front;
        for _ in 0..ring.size {
            self.slots[index].lock().reset_params();
            index = (index + 1) % self.capacity();
        }
        ring.size = 0;
        ring.back = ring.front;
        ring.snapshot = None;
        swap.count = 0;
        // invalidate the frame already uploaded into the back textures
        swap.ready = false;
        side.in_update = false;

        self.space_cond.notify_all();
        tracing::debug!("Texture queue cleared");
    }

    /// Skip up to `count` frames, always keeping the newest one
    pub fn drop_frames(&self, count: usize) {
        let mut side = self.upload.lock();
        let _producer = self.push_lock.lock();
        let mut ring = self.ring.lock();
        if ring.size < 2 {
            return;
        }
        let decr = count.min(ring.size - 1);
        for _ in 0..decr {
            self.slots[ring.front].lock().reset_params();
            ring.front = (ring.front + 1) % self.capacity();
        }
        ring.size -= decr;
        side.in_update = false;
        self.frames_dropped.fetch_add(decr as u64, Ordering::Relaxed);
        self.space_cond.notify_all();
    }

    // ========================================================================
    // Status API
    // ========================================================================

    pub fn len(&self) -> usize {
        self.ring.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().size + 1 >= self.capacity()
    }

    /// A decoder is attached or frames are still queued
    pub fn has_stream(&self) -> bool {
        self.has_stream.load(Ordering::SeqCst) || !self.is_empty()
    }

    /// Presentation time of the shown frame, -1 if there is no stream
    pub fn pts_curr(&self) -> f64 {
        let ring = self.ring.lock();
        if self.has_stream.load(Ordering::SeqCst) || ring.size != 0 {
            ring.curr_pts
        } else {
            -1.0
        }
    }

    /// Presentation time of the next frame to upload
    pub fn pop_pts_next(&self) -> Option<f64> {
        let ring = self.ring.lock();
        (ring.size > 0).then(|| ring.pts[ring.front])
    }

    /// Resolved format of the most recently pushed frame
    pub fn src_format(&self) -> StereoFormat {
        self.ring.lock().src_format
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        let ring = self.ring.lock();
        QueueStats {
            buffered_frames: ring.size,
            capacity: self.capacity() - 1,
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_uploaded: self.frames_uploaded.load(Ordering::Relaxed),
            frames_shown: self.frames_shown.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_zero_copy: self.frames_zero_copy.load(Ordering::Relaxed),
            curr_pts: ring.curr_pts,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub buffered_frames: usize,
    pub capacity: usize,
    pub frames_pushed: u64,
    pub frames_uploaded: u64,
    pub frames_shown: u64,
    pub frames_dropped: u64,
    /// Frames decomposed as views into their shared source
    pub frames_zero_copy: u64,
    pub curr_pts: f64,
}

// ============================================================================
// Tests
// ============================================================================
