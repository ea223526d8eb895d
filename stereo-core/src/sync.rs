//! Audio/Video Synchronization
//!
//! Audio is the master clock when an audio stream plays, otherwise the video
//! stream's own timer. A dedicated thread authorizes texture swaps when the
//! uploaded frame is due and drops queued frames that fell behind.

use crate::frame_queue::TextureQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sync action for video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Display,
    Drop,
    Wait(Duration),
}

/// Longest single wait of the timer thread
const MAX_WAIT: Duration = Duration::from_millis(5);

/// What to do with a frame at `frame_pts` given the master clock
pub fn sync_action(frame_pts: f64, clock: f64, drop_threshold: f64) -> SyncAction {
    let drift = frame_pts - clock;
    if drift > 0.0 {
        // Video ahead - wait
        SyncAction::Wait(Duration::from_secs_f64(drift).min(MAX_WAIT))
    } else if -drift > drop_threshold {
        SyncAction::Drop
    } else {
        SyncAction::Display
    }
}

// ============================================================================
// Playback Timer
// ============================================================================

#[derive(Debug)]
struct TimerState {
    base: f64,
    started: Option<Instant>,
}

/// Stream-time stopwatch: seconds since `restart`, frozen while paused
#[derive(Debug)]
pub struct PlaybackTimer {
    state: Mutex<TimerState>,
}

impl PlaybackTimer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                base: 0.0,
                started: None,
            }),
        }
    }

    /// Jump to `seconds`, keeping the running state
    pub fn restart(&self, seconds: f64) {
        let mut state = self.state.lock();
        state.base = seconds;
        if state.started.is_some() {
            state.started = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if let Some(started) = state.started.take() {
            state.base += started.elapsed().as_secs_f64();
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.started.is_none() {
            state.started = Some(Instant::now());
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().started.is_some()
    }

    pub fn seconds(&self) -> f64 {
        let state = self.state.lock();
        state.base + state.started.map_or(0.0, |s| s.elapsed().as_secs_f64())
    }
}

impl Default for PlaybackTimer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Video Timer
// ============================================================================

/// Master clock read by the video timer, in seconds
pub type MasterClock = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Debug, Default)]
struct TimerStats {
    swaps: AtomicU64,
    dropped: AtomicU64,
}

/// Thread pacing front/back swaps of a texture queue against the master clock
pub struct VideoTimer {
    quit: Arc<AtomicBool>,
    stats: Arc<TimerStats>,
    thread: Option<JoinHandle<()>>,
}

impl VideoTimer {
    pub fn spawn(queue: Arc<TextureQueue>, clock: MasterClock, drop_threshold: f64) -> std::io::Result<Self> {
        let quit = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(TimerStats::default());
        let thread = {
            let quit = quit.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name("video-timer".into())
                .spawn(move || run_timer(&queue, &clock, drop_threshold, &quit, &stats))?
        };
        Ok(Self {
            quit,
            stats,
            thread: Some(thread),
        })
    }

    /// (swaps authorized, frames dropped)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.swaps.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
        )
    }

    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Video timer thread panicked");
            }
        }
    }
}

impl Drop for VideoTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(queue: &TextureQueue, clock: &MasterClock, drop_threshold: f64, quit: &AtomicBool, stats: &TimerStats) {
    let mut authorized = queue.stats().frames_uploaded;
    while !quit.load(Ordering::SeqCst) {
        let now = clock();

        if let Some(next) = queue.pop_pts_next() {
            if queue.len() > 1 && sync_action(next, now, drop_threshold) == SyncAction::Drop {
                queue.drop_frames(1);
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(pts = next, clock = now, "Dropped late frame");
            }
        }

        let current = queue.stats();
        let mut pause = Duration::from_millis(1);
        if current.frames_uploaded > authorized {
            match sync_action(current.curr_pts, now, drop_threshold) {
                SyncAction::Wait(wait) => pause = wait,
                SyncAction::Display | SyncAction::Drop => {
                    // the uploaded frame is never dropped, only shown late
                    if queue.swap_fb(1) {
                        authorized = current.frames_uploaded;
                        stats.swaps.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        thread::sleep(pause.max(Duration::from_micros(500)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_queue::QueueConfig;
    use crate::image::{ColorModel, Image, PlaneFormat};
    use crate::stereo::StereoFormat;
    use crate::test_support::{solid_plane, RecordingBackend};

    #[test]
    fn test_sync_action() {
        assert_eq!(sync_action(1.0, 1.0, 0.1), SyncAction::Display);
        assert_eq!(sync_action(0.95, 1.0, 0.1), SyncAction::Display);
        assert_eq!(sync_action(0.5, 1.0, 0.1), SyncAction::Drop);
        assert_eq!(sync_action(1.002, 1.0, 0.1), SyncAction::Wait(Duration::from_secs_f64(1.002 - 1.0)));
        assert_eq!(sync_action(3.0, 1.0, 0.1), SyncAction::Wait(MAX_WAIT));
    }

    #[test]
    fn test_playback_timer() {
        let timer = PlaybackTimer::new();
        assert!(!timer.is_running());
        timer.restart(5.0);
        assert_eq!(timer.seconds(), 5.0);

        timer.resume();
        thread::sleep(Duration::from_millis(20));
        assert!(timer.seconds() > 5.0);

        timer.pause();
        let frozen = timer.seconds();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.seconds(), frozen);

        timer.restart(1.0);
        assert_eq!(timer.seconds(), 1.0);
        assert!(!timer.is_running());
    }

    fn frame() -> Image {
        Image::from_plane(solid_plane(PlaneFormat::Gray, 8, 8, [1]), ColorModel::Gray)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_timer_swaps_due_frames_only() {
        let queue = Arc::new(TextureQueue::new(QueueConfig::default()));
        let now = Arc::new(Mutex::new(0.0f64));
        let clock: MasterClock = {
            let now = now.clone();
            Arc::new(move || *now.lock())
        };
        let mut timer = VideoTimer::spawn(queue.clone(), clock, 0.1).unwrap();
        let mut backend = RecordingBackend::new();

        queue.push(&frame(), None, None, StereoFormat::Mono, 0.0);
        queue.push(&frame(), None, None, StereoFormat::Mono, 1.0);
        assert!(wait_until(|| queue.update_textures(&mut backend)));
        assert_eq!(queue.stats().frames_shown, 1);

        // second frame uploaded but not due yet
        for _ in 0..10 {
            assert!(!queue.update_textures(&mut backend));
            thread::sleep(Duration::from_millis(2));
        }

        *now.lock() = 1.0;
        assert!(wait_until(|| queue.update_textures(&mut backend)));
        assert_eq!(queue.pts_curr(), 1.0);
        assert_eq!(queue.stats().frames_shown, 2);

        timer.stop();
        assert_eq!(timer.stats().0, 2);
    }

    #[test]
    fn test_timer_drops_late_frames() {
        let queue = Arc::new(TextureQueue::new(QueueConfig {
            max_frames: 6,
            ..QueueConfig::default()
        }));
        for pts in [0.0, 0.04, 0.08, 0.12, 5.0] {
            queue.push(&frame(), None, None, StereoFormat::Mono, pts);
        }
        let clock: MasterClock = Arc::new(|| 4.0);
        let timer = VideoTimer::spawn(queue.clone(), clock, 0.1).unwrap();

        assert!(wait_until(|| queue.len() == 1));
        assert_eq!(queue.pop_pts_next(), Some(5.0));
        assert_eq!(timer.stats().1, 4);
    }
}
