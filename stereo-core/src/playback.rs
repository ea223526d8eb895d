//! # Playback - Session Orchestration
//!
//! Owns the decode threads and sequences them through play, pause, seek,
//! next-file and stop requests.
//!
//! ## Threads
//!
//! ```text
//!                    push_play_event()
//!   UI ──────────────┬───────────────────────────────┐
//!                    │ Resume/Pause/Seek (sync)      │ event slot
//!                    ▼                               ▼
//!   ┌─────────────────────────────┐        ┌──────────────────┐
//!   │ video │ slave │ audio │ subs │◄──────│ main packet loop │◄── MediaSource(s)
//!   └───┬─────────────────────────┘ packets└──────────────────┘
//!       │ decomposed frames
//!       ▼
//!   TextureQueue ◄── VideoTimer (swap authorization)
//!       │
//!       ▼ update_textures() on the render thread
//! ```

use crate::audio_stream::{AudioRenderer, AudioSetup};
use crate::decode::{DecodeError, MediaPacket, MediaSource, SourceOpener, StreamInfo, StreamKind};
use crate::frame_queue::TextureQueue;
use crate::playlist::{Playlist, PlaylistEntry};
use crate::signal::Signal;
use crate::stereo::StereoFormat;
use crate::stream_list::{StreamList, NO_STREAM};
use crate::stream_queue::{ErrorSink, PacketHandler, StreamQueue};
use crate::subtitles::{SubtitleQueue, SubtitleRenderer};
use crate::sync::{MasterClock, VideoTimer};
use crate::video_stream::{FrameHandoff, VideoMaster, VideoSetup, VideoSlave};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Playlist entry has no files")]
    EmptyEntry,
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Request from the UI
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PlayEvent {
    #[default]
    None,
    Resume,
    Pause,
    /// Target in seconds
    Seek(f64),
    /// Open the playlist's current entry
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Loading,
    Playing,
    Paused,
}

// ============================================================================
// Configuration
// ============================================================================

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Packets buffered per decode thread
    pub packet_queue_limit: usize,
    /// Frames later than this (seconds) are dropped
    pub drop_threshold: f64,
    /// Backward retries when a seek fails
    pub seek_retries: u32,
    /// Step of each retry in seconds
    pub seek_step: f64,
    /// Right-eye frames buffered for dual-file pairs
    pub pair_buffer: usize,
    /// Wrap to the first entry after the last one
    pub loop_playlist: bool,
    /// Start playing as soon as a file opens
    pub auto_play: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            packet_queue_limit: 64,
            drop_threshold: 0.1,
            seek_retries: 10,
            seek_step: 1.0,
            pair_buffer: 2,
            loop_playlist: false,
            auto_play: true,
        }
    }
}

impl PlaybackConfig {
    /// Parse from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, PlaybackError> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Debug, Default)]
struct EventSlot {
    event: PlayEvent,
    seek_back: bool,
}

impl EventSlot {
    /// A pending Next survives anything but another Next
    fn record(&mut self, event: PlayEvent, seek_back: bool) {
        if self.event != PlayEvent::Next || event == PlayEvent::Next {
            self.event = event;
            self.seek_back = seek_back;
        }
    }
}

struct Shared {
    config: PlaybackConfig,
    opener: Arc<dyn SourceOpener>,
    textures: Arc<TextureQueue>,
    playlist: Arc<Playlist>,

    video: StreamQueue<VideoMaster>,
    slave: StreamQueue<VideoSlave>,
    audio: StreamQueue<AudioRenderer>,
    subtitles: StreamQueue<SubtitleRenderer>,
    subtitle_queue: Arc<SubtitleQueue>,

    audio_streams: StreamList,
    subtitle_streams: StreamList,

    /// Held while a play event reaches the decode queues.
    /// Lock order: play lock, then event slot.
    play_lock: Mutex<()>,

    event: Mutex<EventSlot>,
    event_cond: Condvar,
    quit: AtomicBool,
    stop_requested: AtomicBool,

    state: Mutex<PlaybackState>,
    duration: Mutex<f64>,
    format_override: Arc<Mutex<StereoFormat>>,

    on_error: Arc<Signal<PlaybackError>>,
    on_loaded: Signal<PathBuf>,
}

impl Shared {
    fn report(&self, error: PlaybackError) {
        tracing::error!("Playback error: {}", error);
        self.on_error.emit(&error);
    }

    fn set_state(&self, state: PlaybackState) {
        *self.state.lock() = state;
    }

    fn position(&self) -> f64 {
        let _play = self.play_lock.lock();
        self.read_position()
    }

    /// Caller holds `play_lock`
    fn read_position(&self) -> f64 {
        let audio = if self.audio.is_active() {
            self.audio.position()
        } else {
            -1.0
        };
        let pts = if audio > 0.0 { audio } else { self.video.position() };
        pts.max(0.0)
    }

    /// Clock the video timer paces frames against
    fn master_clock(&self) -> f64 {
        let _play = self.play_lock.lock();
        if self.audio.is_playing() {
            self.audio.position()
        } else {
            self.video.position()
        }
    }

    fn queues_play_event(&self, event: PlayEvent) {
        let _play = self.play_lock.lock();
        self.apply_to_queues(event);
    }

    /// Caller holds `play_lock`
    fn apply_to_queues(&self, event: PlayEvent) {
        self.video.push_play_event(event);
        self.slave.push_play_event(event);
        self.audio.push_play_event(event);
        self.subtitles.push_play_event(event);
    }

    /// Seek every queue to the current position; returns that position
    fn resync_queues(&self) -> f64 {
        let _play = self.play_lock.lock();
        let position = self.read_position();
        self.apply_to_queues(PlayEvent::Seek(position));
        position
    }

    /// Ask the packet loop to close the current file
    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.queues_play_event(PlayEvent::Pause);
        let _slot = self.event.lock();
        self.event_cond.notify_all();
    }

    fn post_event(&self, event: PlayEvent, seek_back: bool) {
        self.event.lock().record(event, seek_back);
        self.event_cond.notify_all();
    }

    /// Block until an event is pending; `None` on shutdown
    fn wait_event(&self) -> Option<(PlayEvent, bool)> {
        let mut slot = self.event.lock();
        loop {
            if self.quit.load(Ordering::SeqCst) {
                return None;
            }
            if slot.event != PlayEvent::None {
                let taken = std::mem::take(&mut *slot);
                return Some((taken.event, taken.seek_back));
            }
            self.event_cond.wait(&mut slot);
        }
    }

    fn take_event(&self) -> Option<(PlayEvent, bool)> {
        let mut slot = self.event.lock();
        if slot.event == PlayEvent::None {
            return None;
        }
        let taken = std::mem::take(&mut *slot);
        Some((taken.event, taken.seek_back))
    }

    fn wait_event_for(&self, timeout: Duration) {
        let mut slot = self.event.lock();
        if slot.event == PlayEvent::None && !self.quit.load(Ordering::SeqCst) {
            self.event_cond.wait_for(&mut slot, timeout);
        }
    }

    /// The packet loop must stop blocking and look at the event slot
    fn is_interrupt_pending(&self) -> bool {
        if self.quit.load(Ordering::SeqCst) || self.stop_requested.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.event.lock().event, PlayEvent::Next | PlayEvent::Seek(_))
    }
}

// ============================================================================
// Playback
// ============================================================================

/// Playback engine; dropping it stops every thread
pub struct Playback {
    shared: Arc<Shared>,
    main: Option<JoinHandle<()>>,
    timer: Option<VideoTimer>,
}

impl Playback {
    /// Spawn the decode threads, the main loop and the video timer
    pub fn new(
        config: PlaybackConfig,
        opener: Arc<dyn SourceOpener>,
        textures: Arc<TextureQueue>,
    ) -> Result<Self, PlaybackError> {
        let on_error = Arc::new(Signal::new());
        let sink: ErrorSink = {
            let on_error = on_error.clone();
            Arc::new(move |e: DecodeError| {
                on_error.emit(&PlaybackError::Decode(e));
            })
        };
        let limit = config.packet_queue_limit;
        let handoff = Arc::new(FrameHandoff::new(config.pair_buffer));
        let format_override = Arc::new(Mutex::new(StereoFormat::Auto));
        let subtitle_queue = Arc::new(SubtitleQueue::new());

        let video = StreamQueue::spawn(
            "video",
            VideoMaster::new(textures.clone(), handoff.clone(), format_override.clone()),
            limit,
            sink.clone(),
        )?;
        let slave = StreamQueue::spawn("video-slave", VideoSlave::new(handoff), limit, sink.clone())?;
        let audio = StreamQueue::spawn("audio", AudioRenderer::new(), limit, sink.clone())?;
        let subtitles = StreamQueue::spawn("subtitles", SubtitleRenderer::new(subtitle_queue.clone()), limit, sink)?;

        let shared = Arc::new(Shared {
            config,
            opener,
            textures: textures.clone(),
            playlist: Arc::new(Playlist::new()),
            video,
            slave,
            audio,
            subtitles,
            subtitle_queue,
            audio_streams: StreamList::new(),
            subtitle_streams: StreamList::new(),
            play_lock: Mutex::new(()),
            event: Mutex::new(EventSlot::default()),
            event_cond: Condvar::new(),
            quit: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            state: Mutex::new(PlaybackState::Stopped),
            duration: Mutex::new(0.0),
            format_override,
            on_error,
            on_loaded: Signal::new(),
        });

        let clock: MasterClock = {
            let shared = shared.clone();
            Arc::new(move || shared.master_clock())
        };
        let timer = VideoTimer::spawn(textures, clock, shared.config.drop_threshold)?;

        let main = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("playback".into())
                .spawn(move || run_main_loop(&shared))?
        };

        tracing::info!("Playback engine started");
        Ok(Self {
            shared,
            main: Some(main),
            timer: Some(timer),
        })
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Apply `Resume`/`Pause`/`Seek` to the decode threads and record the event
    /// for the main loop. `Next` only records the intent.
    pub fn push_play_event(&self, event: PlayEvent) {
        let shared = &self.shared;
        match event {
            PlayEvent::None => {}
            PlayEvent::Next => shared.post_event(PlayEvent::Next, false),
            PlayEvent::Resume | PlayEvent::Pause | PlayEvent::Seek(_) => {
                let _play = shared.play_lock.lock();
                let prev = shared.read_position();
                shared.apply_to_queues(event);
                {
                    let mut state = shared.state.lock();
                    match (event, *state) {
                        (PlayEvent::Resume, PlaybackState::Paused) => *state = PlaybackState::Playing,
                        (PlayEvent::Pause, PlaybackState::Playing) => *state = PlaybackState::Paused,
                        _ => {}
                    }
                }
                let seek_back = matches!(event, PlayEvent::Seek(target) if target < prev);
                shared.post_event(event, seek_back);
            }
        }
    }

    pub fn play(&self) {
        self.push_play_event(PlayEvent::Resume);
    }

    pub fn pause(&self) {
        self.push_play_event(PlayEvent::Pause);
    }

    pub fn seek(&self, target: f64) {
        self.push_play_event(PlayEvent::Seek(target.max(0.0)));
    }

    /// Seek relative to the current position, clamped at zero
    pub fn seek_relative(&self, delta: f64) {
        self.seek(self.shared.position() + delta);
    }

    /// Close the current file
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Play the playlist entry at `index`
    pub fn open_entry(&self, index: usize) -> bool {
        if !self.shared.playlist.set_current(index) {
            return false;
        }
        self.push_play_event(PlayEvent::Next);
        true
    }

    /// Stop every thread; also done on drop
    pub fn shutdown(&mut self) {
        let Some(main) = self.main.take() else {
            return;
        };
        self.shared.quit.store(true, Ordering::SeqCst);
        {
            let _slot = self.shared.event.lock();
            self.shared.event_cond.notify_all();
        }
        if main.join().is_err() {
            tracing::error!("Playback thread panicked");
        }
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        self.shared.video.shutdown();
        self.shared.slave.shutdown();
        self.shared.audio.shutdown();
        self.shared.subtitles.shutdown();
        tracing::info!("Playback engine stopped");
    }

    /// Override the packing of the source (`Auto` restores detection)
    pub fn set_src_format(&self, format: StereoFormat) {
        *self.shared.format_override.lock() = format;
    }

    /// Override, or the format of the most recent frame
    pub fn src_format(&self) -> StereoFormat {
        match *self.shared.format_override.lock() {
            StereoFormat::Auto => self.shared.textures.src_format(),
            format => format,
        }
    }

    // ========================================================================
    // Status API
    // ========================================================================

    /// Seconds; audio clock preferred
    pub fn position(&self) -> f64 {
        self.shared.position()
    }

    pub fn duration(&self) -> f64 {
        *self.shared.duration.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.video.is_playing() || self.shared.audio.is_playing()
    }

    pub fn playback_state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    pub fn is_video_played(&self) -> bool {
        self.shared.video.is_playing()
    }

    pub fn is_audio_played(&self) -> bool {
        self.shared.audio.is_playing()
    }

    pub fn is_audio_disconnected(&self) -> bool {
        self.shared.audio.is_disconnected()
    }

    pub fn playlist(&self) -> &Arc<Playlist> {
        &self.shared.playlist
    }

    pub fn audio_streams(&self) -> &StreamList {
        &self.shared.audio_streams
    }

    pub fn subtitle_streams(&self) -> &StreamList {
        &self.shared.subtitle_streams
    }

    pub fn subtitles(&self) -> &Arc<SubtitleQueue> {
        &self.shared.subtitle_queue
    }

    pub fn texture_queue(&self) -> &Arc<TextureQueue> {
        &self.shared.textures
    }

    /// (swaps authorized, late frames dropped)
    pub fn timer_stats(&self) -> (u64, u64) {
        self.timer.as_ref().map_or((0, 0), VideoTimer::stats)
    }

    pub fn on_error(&self) -> &Signal<PlaybackError> {
        &self.shared.on_error
    }

    pub fn on_loaded(&self) -> &Signal<PathBuf> {
        &self.shared.on_loaded
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Main Loop
// ============================================================================

enum Outcome {
    /// Input drained
    Finished,
    /// Next requested, re-posted for the main loop
    Interrupted,
    Stopped,
    Quit,
}

fn run_main_loop(shared: &Shared) {
    while let Some((mut event, _)) = shared.wait_event() {
        loop {
            let Some(entry) = shared.playlist.current() else {
                shared.set_state(PlaybackState::Stopped);
                break;
            };
            let mut session = Session::new(shared);
            if let Err(e) = session.open_source(&entry) {
                session.close();
                shared.set_state(PlaybackState::Stopped);
                shared.report(e);
                break;
            }

            if let PlayEvent::Seek(target) = event {
                session.seek(target, false);
            }
            if event != PlayEvent::Pause && shared.config.auto_play {
                shared.queues_play_event(PlayEvent::Resume);
                shared.set_state(PlaybackState::Playing);
            } else {
                shared.set_state(PlaybackState::Paused);
            }

            let outcome = session.packets_loop();
            session.close();
            match outcome {
                Outcome::Finished => {
                    if !shared.playlist.walk_to_next(shared.config.loop_playlist) {
                        shared.set_state(PlaybackState::Stopped);
                        break;
                    }
                    event = PlayEvent::Resume;
                }
                Outcome::Interrupted => break,
                Outcome::Stopped => {
                    shared.set_state(PlaybackState::Stopped);
                    break;
                }
                Outcome::Quit => return,
            }
        }
    }
    tracing::debug!("Playback main loop finished");
}

/// Which stream of which opened file feeds a decode thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    context: usize,
    stream: usize,
}

struct Context {
    source: Box<dyn MediaSource>,
    eof: bool,
}

/// One opened playlist entry
struct Session<'a> {
    shared: &'a Shared,
    contexts: Vec<Context>,
    master: Option<Route>,
    slave: Option<Route>,
    audio: Option<Route>,
    subtitle: Option<Route>,
    audio_choices: Vec<(usize, StreamInfo)>,
    subtitle_choices: Vec<(usize, StreamInfo)>,
    next_context: usize,
}

impl<'a> Session<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            contexts: Vec::new(),
            master: None,
            slave: None,
            audio: None,
            subtitle: None,
            audio_choices: Vec::new(),
            subtitle_choices: Vec::new(),
            next_context: 0,
        }
    }

    /// Open every file of the entry and attach the default streams
    fn open_source(&mut self, entry: &PlaylistEntry) -> Result<(), PlaybackError> {
        let shared = self.shared;
        // a stop from here on applies to this entry
        shared.stop_requested.store(false, Ordering::SeqCst);
        self.close();
        shared.set_state(PlaybackState::Loading);

        let first = entry.files.first().cloned().ok_or(PlaybackError::EmptyEntry)?;
        for path in &entry.files {
            let source = shared.opener.open(path)?;
            tracing::info!(path = %path.display(), streams = source.streams().len(), "Opened source");
            self.contexts.push(Context { source, eof: false });
        }

        let mut videos = Vec::new();
        for (index, context) in self.contexts.iter().enumerate() {
            for stream in context.source.streams() {
                match stream.kind {
                    StreamKind::Video => videos.push((index, stream.clone())),
                    StreamKind::Audio => self.audio_choices.push((index, stream.clone())),
                    StreamKind::Subtitle => self.subtitle_choices.push((index, stream.clone())),
                    StreamKind::Data => {}
                }
            }
        }
        if videos.is_empty() && self.audio_choices.is_empty() {
            return Err(DecodeError::NoStreams(first).into());
        }

        // right view: first video of the second file, or second video of a
        // single file declared as separate frames
        let slave = match videos.first() {
            Some((master_ctx, _)) if self.contexts.len() > 1 => videos.iter().find(|(c, _)| c != master_ctx),
            Some(_) if entry.params.src_format() == StereoFormat::SeparateFrames => videos.get(1),
            _ => None,
        }
        .cloned();

        if let Some((context, stream)) = videos.first().cloned() {
            let decoder = shared.opener.video_decoder(&stream)?;
            self.master = Some(Route {
                context,
                stream: stream.index,
            });
            shared.video.start(VideoSetup {
                stream,
                decoder,
                params: entry.params.clone(),
                paired: slave.is_some(),
            });
        }
        if let Some((context, stream)) = slave {
            let decoder = shared.opener.video_decoder(&stream)?;
            self.slave = Some(Route {
                context,
                stream: stream.index,
            });
            shared.slave.start(decoder);
        }
        shared.textures.set_has_stream(self.master.is_some());

        let audio_names = self.audio_choices.iter().map(|(_, s)| s.display_name()).collect();
        let first_audio = if self.audio_choices.is_empty() { NO_STREAM } else { 0 };
        shared.audio_streams.set_list(audio_names, first_audio);
        if first_audio != NO_STREAM {
            if let Err(e) = self.start_audio(0) {
                shared.report(e);
            }
        }
        let subtitle_names = self.subtitle_choices.iter().map(|(_, s)| s.display_name()).collect();
        shared.subtitle_streams.set_list(subtitle_names, NO_STREAM);

        let duration = self
            .contexts
            .iter()
            .map(|c| c.source.duration())
            .fold(0.0f64, f64::max);
        *shared.duration.lock() = duration;

        shared.on_loaded.emit(&first);
        Ok(())
    }

    fn start_audio(&mut self, choice: usize) -> Result<(), PlaybackError> {
        let Some((context, stream)) = self.audio_choices.get(choice).cloned() else {
            return Ok(());
        };
        let decoder = self.shared.opener.audio_decoder(&stream)?;
        let output = self.shared.opener.audio_output(&stream)?;
        self.audio = Some(Route {
            context,
            stream: stream.index,
        });
        self.shared.audio.start(AudioSetup {
            stream,
            decoder,
            output,
        });
        Ok(())
    }

    fn start_subtitles(&mut self, choice: usize) -> Result<(), PlaybackError> {
        let Some((context, stream)) = self.subtitle_choices.get(choice).cloned() else {
            return Ok(());
        };
        let decoder = self.shared.opener.subtitle_decoder(&stream)?;
        self.subtitle = Some(Route {
            context,
            stream: stream.index,
        });
        self.shared.subtitles.start(decoder);
        Ok(())
    }

    /// Detach all decode threads and drop the sources
    fn close(&mut self) {
        let shared = self.shared;
        shared.video.deinit();
        shared.slave.deinit();
        shared.audio.deinit();
        shared.subtitles.deinit();
        shared.textures.clear();
        shared.textures.set_has_stream(false);
        if !self.contexts.is_empty() {
            tracing::info!("Closed source");
        }
        self.contexts.clear();
        self.master = None;
        self.slave = None;
        self.audio = None;
        self.subtitle = None;
        self.audio_choices.clear();
        self.subtitle_choices.clear();
        shared.audio_streams.clear_list();
        shared.subtitle_streams.clear_list();
        *shared.duration.lock() = 0.0;
    }

    fn flush_all(&mut self) {
        let shared = self.shared;
        shared.video.flush();
        shared.slave.flush();
        shared.audio.flush();
        shared.subtitles.flush();
        shared.textures.clear();
        shared.subtitle_queue.clear();
    }

    /// Seek every source, then drop everything decoded so far
    fn seek(&mut self, target: f64, seek_back: bool) {
        tracing::info!(target, seek_back, "Seek");
        let config = &self.shared.config;
        for (index, context) in self.contexts.iter_mut().enumerate() {
            let references: Vec<Option<usize>> = [self.master, self.audio]
                .into_iter()
                .flatten()
                .filter(|r| r.context == index)
                .map(|r| Some(r.stream))
                .chain(std::iter::once(None))
                .collect();
            if !seek_context(context.source.as_mut(), &references, target, seek_back, config) {
                tracing::warn!(path = %context.source.path().display(), target, "Seek failed");
            }
            context.eof = false;
        }
        self.flush_all();
    }

    /// Re-sync all decode threads at the current position
    fn reseek(&mut self) {
        let position = self.shared.resync_queues();
        self.seek(position, true);
    }

    fn switch_audio(&mut self) {
        let shared = self.shared;
        let value = shared.audio_streams.value();
        tracing::debug!(value, "Switching audio stream");
        shared.audio.deinit();
        self.audio = None;
        if let Ok(choice) = usize::try_from(value) {
            if let Err(e) = self.start_audio(choice) {
                shared.report(e);
            }
        }
    }

    fn switch_subtitles(&mut self) {
        let shared = self.shared;
        let value = shared.subtitle_streams.value();
        shared.subtitles.deinit();
        shared.subtitle_queue.clear();
        self.subtitle = None;
        if let Ok(choice) = usize::try_from(value) {
            if let Err(e) = self.start_subtitles(choice) {
                shared.report(e);
            }
        }
    }

    /// Resume the freshly attached streams if the session plays
    fn resume_if_playing(&self) {
        if *self.shared.state.lock() == PlaybackState::Playing {
            self.shared.queues_play_event(PlayEvent::Resume);
        }
    }

    fn packets_loop(&mut self) -> Outcome {
        let shared = self.shared;
        let mut at_end = false;
        loop {
            if shared.quit.load(Ordering::SeqCst) {
                return Outcome::Quit;
            }
            if shared.stop_requested.swap(false, Ordering::SeqCst) {
                self.flush_all();
                return Outcome::Stopped;
            }

            match shared.take_event() {
                Some((PlayEvent::Next, _)) => {
                    self.flush_all();
                    shared.post_event(PlayEvent::Next, false);
                    return Outcome::Interrupted;
                }
                Some((PlayEvent::Seek(target), seek_back)) => {
                    self.seek(target, seek_back);
                    at_end = false;
                }
                _ => {}
            }

            if shared.audio_streams.was_changed() {
                self.switch_audio();
                self.reseek();
                self.resume_if_playing();
                at_end = false;
            }
            if shared.subtitle_streams.was_changed() {
                self.switch_subtitles();
                self.reseek();
                self.resume_if_playing();
                at_end = false;
            }

            if at_end {
                if self.is_drained() {
                    return Outcome::Finished;
                }
                shared.wait_event_for(Duration::from_millis(10));
                continue;
            }

            match self.read_next() {
                Some((context, packet)) => self.route(context, packet),
                None => {
                    tracing::debug!("End of input");
                    shared.video.push_end();
                    shared.slave.push_end();
                    shared.audio.push_end();
                    shared.subtitles.push_end();
                    at_end = true;
                }
            }
        }
    }

    /// Next packet round-robin over the sources, `None` once all are exhausted
    fn read_next(&mut self) -> Option<(usize, MediaPacket)> {
        let count = self.contexts.len();
        for step in 0..count {
            let index = (self.next_context + step) % count;
            let context = &mut self.contexts[index];
            if context.eof {
                continue;
            }
            match context.source.read_packet() {
                Ok(Some(packet)) => {
                    self.next_context = (index + 1) % count;
                    return Some((index, packet));
                }
                Ok(None) => context.eof = true,
                Err(e) => {
                    context.eof = true;
                    self.shared.report(e.into());
                }
            }
        }
        None
    }

    fn route(&self, context: usize, packet: MediaPacket) {
        let shared = self.shared;
        let target = Some(Route {
            context,
            stream: packet.stream_index,
        });
        if target == self.master {
            self.feed(&shared.video, packet);
        } else if target == self.slave {
            self.feed(&shared.slave, packet);
        } else if target == self.audio {
            self.feed(&shared.audio, packet);
        } else if target == self.subtitle {
            self.feed(&shared.subtitles, packet);
        }
    }

    /// Push, waiting for room unless an interrupting event arrives
    fn feed<H: PacketHandler>(&self, queue: &StreamQueue<H>, packet: MediaPacket) {
        while queue.is_full() {
            if self.shared.is_interrupt_pending() {
                return;
            }
            queue.wait_space(Duration::from_millis(10));
        }
        queue.push(packet);
    }

    fn is_drained(&self) -> bool {
        let shared = self.shared;
        shared.video.is_ended() && shared.slave.is_ended() && shared.audio.is_ended() && shared.subtitles.is_ended()
    }
}

/// Try each reference stream, stepping back on failure
fn seek_context(
    source: &mut dyn MediaSource,
    references: &[Option<usize>],
    target: f64,
    seek_back: bool,
    config: &PlaybackConfig,
) -> bool {
    for &stream in references {
        for attempt in 0..=config.seek_retries {
            let at = (target - f64::from(attempt) * config.seek_step).max(0.0);
            match source.seek(at, stream, seek_back || attempt > 0) {
                Ok(()) => return true,
                Err(e) => tracing::debug!(at, ?stream, "Seek attempt failed: {}", e),
            }
            if at <= 0.0 {
                break;
            }
        }
    }
    false
}
