//! # Stream Queue - One Decode Thread per Stream Role
//!
//! Bounded packet queue plus play-event state for one decoding role (video
//! master, video slave, audio, subtitles). The packet loop feeds packets,
//! a worker thread hands them to the role's [`PacketHandler`].
//!
//! ```text
//! packet loop ──push()──► [Start|Data|Flush|End|Stop|Quit] ──► worker ──► handler
//! UI ──push_play_event()──► EventState ─────────────────────────► handler
//! ```

use crate::decode::{DecodeError, MediaPacket};
use crate::playback::PlayEvent;
use crate::sync::PlaybackTimer;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Work item for a decode thread
#[derive(Debug)]
pub enum Packet<S> {
    /// Attach a stream
    Start(S),
    Data(MediaPacket),
    /// Drop decoder state (after seek)
    Flush,
    /// No more packets for this session
    End,
    /// Detach the stream
    Stop,
    Quit,
}

/// Role-specific packet consumer, owned by the worker thread
pub trait PacketHandler: Send + 'static {
    type Setup: Send + 'static;

    fn start(&mut self, setup: Self::Setup, ctl: &QueueControl) -> Result<(), DecodeError>;

    fn packet(&mut self, packet: MediaPacket, ctl: &QueueControl) -> Result<(), DecodeError>;

    fn flush(&mut self, ctl: &QueueControl);

    /// Input exhausted; may block until output drained, polling `ctl.is_interrupted()`
    fn end(&mut self, _ctl: &QueueControl) {}

    fn stop(&mut self, ctl: &QueueControl);

    /// Resume/Pause/Seek accepted by the queue
    fn play_event(&mut self, _event: PlayEvent, _ctl: &QueueControl) {}
}

/// Receives handler failures
pub type ErrorSink = Arc<dyn Fn(DecodeError) + Send + Sync>;

#[derive(Debug)]
struct EventState {
    playing: bool,
    pending: PlayEvent,
    seek_target: f64,
    /// Clock held until the first frame after start/seek
    awaiting_frame: bool,
}

// ============================================================================
// Queue Control (shared with the handler)
// ============================================================================

/// State visible to both the queue owner and the worker's handler
#[derive(Debug)]
pub struct QueueControl {
    name: String,
    events: Mutex<EventState>,
    timer: PlaybackTimer,
    device_clock: Mutex<Option<f64>>,
    last_pts: Mutex<f64>,
    flushing: AtomicUsize,
    quit: AtomicBool,
    active: AtomicBool,
    busy: AtomicBool,
    ended: AtomicBool,
    disconnected: AtomicBool,
}

impl QueueControl {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: Mutex::new(EventState {
                playing: false,
                pending: PlayEvent::None,
                seek_target: 0.0,
                awaiting_frame: true,
            }),
            timer: PlaybackTimer::new(),
            device_clock: Mutex::new(None),
            last_pts: Mutex::new(0.0),
            flushing: AtomicUsize::new(0),
            quit: AtomicBool::new(false),
            active: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A flush, stop or quit is pending; blocking work should be abandoned
    pub fn is_interrupted(&self) -> bool {
        self.flushing.load(Ordering::SeqCst) > 0 || self.quit.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.events.lock().playing
    }

    pub fn seek_target(&self) -> f64 {
        self.events.lock().seek_target
    }

    /// First output after start/seek anchors the clock at `pts`
    pub fn frame_ready(&self, pts: f64) {
        // output decoded before a pending flush is stale
        if self.is_interrupted() {
            return;
        }
        *self.last_pts.lock() = pts;
        let mut events = self.events.lock();
        if events.awaiting_frame {
            events.awaiting_frame = false;
            self.timer.restart(pts);
            if events.playing {
                self.timer.resume();
            }
        }
    }

    /// Position reported by an output device, overriding the timer
    pub fn set_device_clock(&self, seconds: Option<f64>) {
        *self.device_clock.lock() = seconds;
    }

    /// Publish a device position unless a seek or flush holds the clock.
    /// Returns false when the value was discarded.
    pub fn publish_device_clock(&self, seconds: Option<f64>) -> bool {
        let events = self.events.lock();
        if events.awaiting_frame || self.is_interrupted() {
            return false;
        }
        *self.device_clock.lock() = seconds;
        true
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    pub fn last_pts(&self) -> f64 {
        *self.last_pts.lock()
    }

    /// Stream clock in seconds
    pub fn position(&self) -> f64 {
        let device = *self.device_clock.lock();
        device.unwrap_or_else(|| self.timer.seconds())
    }
}

// ============================================================================
// Stream Queue
// ============================================================================

struct Shared<S> {
    control: QueueControl,
    packets: Mutex<VecDeque<Packet<S>>>,
    /// Worker wake-up
    cond: Condvar,
    /// Producer wake-up
    space: Condvar,
    limit: usize,
}

enum Work<S> {
    Event(PlayEvent),
    Packet(Packet<S>),
}

impl<S> Shared<S> {
    fn next_work(&self) -> Work<S> {
        let mut packets = self.packets.lock();
        loop {
            let event = std::mem::replace(&mut self.control.events.lock().pending, PlayEvent::None);
            if event != PlayEvent::None {
                return Work::Event(event);
            }
            if let Some(packet) = packets.pop_front() {
                self.control.busy.store(true, Ordering::SeqCst);
                return Work::Packet(packet);
            }
            self.cond.wait(&mut packets);
        }
    }

    fn push(&self, packet: Packet<S>) {
        self.packets.lock().push_back(packet);
        self.cond.notify_all();
    }

    fn wake(&self) {
        let _packets = self.packets.lock();
        self.cond.notify_all();
    }
}

/// Packet queue with its own decode thread
pub struct StreamQueue<H: PacketHandler> {
    shared: Arc<Shared<H::Setup>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: PacketHandler> StreamQueue<H> {
    /// Spawn the worker thread. `limit` caps queued data packets.
    pub fn spawn(name: &str, handler: H, limit: usize, on_error: ErrorSink) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            control: QueueControl::new(name),
            packets: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            space: Condvar::new(),
            limit: limit.max(1),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{}-decode", name))
                .spawn(move || run_worker(handler, &shared, &on_error))?
        };
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn control(&self) -> &QueueControl {
        &self.shared.control
    }

    // ========================================================================
    // Session API (packet loop thread)
    // ========================================================================

    /// Attach a new stream; the queue starts paused with its clock held
    pub fn start(&self, setup: H::Setup) {
        let ctl = &self.shared.control;
        {
            let mut events = ctl.events.lock();
            events.playing = false;
            events.pending = PlayEvent::None;
            events.seek_target = 0.0;
            events.awaiting_frame = true;
        }
        ctl.timer.pause();
        ctl.timer.restart(0.0);
        ctl.set_device_clock(None);
        ctl.set_disconnected(false);
        ctl.ended.store(false, Ordering::SeqCst);
        ctl.active.store(true, Ordering::SeqCst);
        self.shared.push(Packet::Start(setup));
    }

    /// Detach the stream, dropping queued packets
    pub fn deinit(&self) {
        let ctl = &self.shared.control;
        if !ctl.active.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut events = ctl.events.lock();
            events.playing = false;
            events.pending = PlayEvent::None;
        }
        ctl.timer.pause();
        ctl.flushing.fetch_add(1, Ordering::SeqCst);
        {
            let mut packets = self.shared.packets.lock();
            packets.clear();
            packets.push_back(Packet::Flush);
            packets.push_back(Packet::Stop);
        }
        self.shared.cond.notify_all();
        self.shared.space.notify_all();
    }

    /// Queue a data packet. Returns false if queue is full.
    pub fn push(&self, packet: MediaPacket) -> bool {
        {
            let mut packets = self.shared.packets.lock();
            if packets.len() >= self.shared.limit {
                return false;
            }
            packets.push_back(Packet::Data(packet));
        }
        self.shared.control.ended.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        true
    }

    /// Block until there is room or `timeout` passes
    pub fn wait_space(&self, timeout: Duration) -> bool {
        let mut packets = self.shared.packets.lock();
        if packets.len() < self.shared.limit {
            return true;
        }
        self.shared.space.wait_for(&mut packets, timeout);
        packets.len() < self.shared.limit
    }

    /// Drop pending packets and decoder state
    pub fn flush(&self) {
        let ctl = &self.shared.control;
        ctl.flushing.fetch_add(1, Ordering::SeqCst);
        ctl.ended.store(false, Ordering::SeqCst);
        {
            let mut events = ctl.events.lock();
            ctl.set_device_clock(None);
            events.awaiting_frame = true;
            ctl.timer.pause();
            ctl.timer.restart(events.seek_target);
        }
        {
            let mut packets = self.shared.packets.lock();
            packets.retain(|p| !matches!(p, Packet::Data(_) | Packet::End));
            packets.push_back(Packet::Flush);
        }
        self.shared.cond.notify_all();
        self.shared.space.notify_all();
    }

    /// Mark end of input
    pub fn push_end(&self) {
        self.shared.push(Packet::End);
    }

    /// Apply a play event. `Resume` is ignored while playing, `Pause` while paused.
    pub fn push_play_event(&self, event: PlayEvent) -> bool {
        let ctl = &self.shared.control;
        {
            let mut events = ctl.events.lock();
            match event {
                PlayEvent::Resume => {
                    if events.playing {
                        return false;
                    }
                    events.playing = true;
                    if !events.awaiting_frame {
                        ctl.timer.resume();
                    }
                }
                PlayEvent::Pause => {
                    if !events.playing {
                        return false;
                    }
                    events.playing = false;
                    ctl.timer.pause();
                }
                PlayEvent::Seek(target) => {
                    events.seek_target = target;
                    events.awaiting_frame = true;
                    ctl.timer.pause();
                    ctl.timer.restart(target);
                    ctl.set_device_clock(None);
                }
                PlayEvent::Next | PlayEvent::None => return false,
            }
            events.pending = event;
        }
        self.shared.wake();
        true
    }

    // ========================================================================
    // Status API
    // ========================================================================

    pub fn is_active(&self) -> bool {
        self.shared.control.active.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.is_active() && self.shared.control.is_playing()
    }

    /// End packet processed (or nothing attached)
    pub fn is_ended(&self) -> bool {
        !self.is_active() || self.shared.control.ended.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.control.disconnected.load(Ordering::SeqCst)
    }

    pub fn seek_target(&self) -> f64 {
        self.shared.control.seek_target()
    }

    pub fn position(&self) -> f64 {
        self.shared.control.position()
    }

    pub fn len(&self) -> usize {
        self.shared.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.shared.limit
    }

    /// No queued packets and the worker is waiting
    pub fn is_idle(&self) -> bool {
        self.is_empty() && !self.shared.control.busy.load(Ordering::SeqCst)
    }

    /// Stop the worker thread
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.shared.control.quit.store(true, Ordering::SeqCst);
        self.shared.push(Packet::Quit);
        self.shared.space.notify_all();
        if worker.join().is_err() {
            tracing::error!(queue = self.shared.control.name(), "Decode thread panicked");
        }
    }
}

impl<H: PacketHandler> Drop for StreamQueue<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<H: PacketHandler>(mut handler: H, shared: &Shared<H::Setup>, on_error: &ErrorSink) {
    let ctl = &shared.control;
    // one report per attached stream
    let mut reported = false;
    loop {
        match shared.next_work() {
            Work::Event(event) => handler.play_event(event, ctl),
            Work::Packet(Packet::Start(setup)) => {
                reported = false;
                if let Err(e) = handler.start(setup, ctl) {
                    tracing::warn!(queue = ctl.name(), "Stream init failed: {}", e);
                    ctl.active.store(false, Ordering::SeqCst);
                    reported = true;
                    on_error(e);
                }
            }
            Work::Packet(Packet::Data(packet)) => {
                if let Err(e) = handler.packet(packet, ctl) {
                    tracing::warn!(queue = ctl.name(), "Decode error: {}", e);
                    if !reported {
                        reported = true;
                        on_error(e);
                    }
                }
            }
            Work::Packet(Packet::Flush) => {
                handler.flush(ctl);
                ctl.flushing.fetch_sub(1, Ordering::SeqCst);
            }
            Work::Packet(Packet::End) => {
                handler.end(ctl);
                if !ctl.is_interrupted() {
                    ctl.ended.store(true, Ordering::SeqCst);
                }
            }
            Work::Packet(Packet::Stop) => handler.stop(ctl),
            Work::Packet(Packet::Quit) => {
                handler.stop(ctl);
                break;
            }
        }
        ctl.busy.store(false, Ordering::SeqCst);
        shared.space.notify_all();
    }
    tracing::debug!(queue = ctl.name(), "Decode thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[derive(Default)]
    struct Log {
        entries: Mutex<Vec<String>>,
    }

    struct LoggingHandler {
        log: Arc<Log>,
        fail_on: Option<usize>,
        delay: Duration,
    }

    impl PacketHandler for LoggingHandler {
        type Setup = &'static str;

        fn start(&mut self, setup: &'static str, _ctl: &QueueControl) -> Result<(), DecodeError> {
            self.log.entries.lock().push(format!("start {}", setup));
            Ok(())
        }

        fn packet(&mut self, packet: MediaPacket, ctl: &QueueControl) -> Result<(), DecodeError> {
            thread::sleep(self.delay);
            if Some(packet.stream_index) == self.fail_on {
                return Err(DecodeError::DecodeFailed("bad packet".into()));
            }
            ctl.frame_ready(packet.pts.unwrap_or_default());
            self.log.entries.lock().push(format!("data {}", packet.stream_index));
            Ok(())
        }

        fn flush(&mut self, _ctl: &QueueControl) {
            self.log.entries.lock().push("flush".into());
        }

        fn stop(&mut self, _ctl: &QueueControl) {
            self.log.entries.lock().push("stop".into());
        }

        fn play_event(&mut self, event: PlayEvent, _ctl: &QueueControl) {
            self.log.entries.lock().push(format!("{:?}", event));
        }
    }

    fn packet(index: usize, pts: f64) -> MediaPacket {
        MediaPacket {
            stream_index: index,
            pts: Some(pts),
            duration: 0.04,
            keyframe: true,
            data: Bytes::from_static(b"x"),
        }
    }

    fn spawn(fail_on: Option<usize>) -> (StreamQueue<LoggingHandler>, Arc<Log>, Arc<Mutex<Vec<String>>>) {
        spawn_slow(fail_on, Duration::ZERO)
    }

    fn spawn_slow(
        fail_on: Option<usize>,
        delay: Duration,
    ) -> (StreamQueue<LoggingHandler>, Arc<Log>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Log::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink: ErrorSink = {
            let errors = errors.clone();
            Arc::new(move |e| errors.lock().push(e.to_string()))
        };
        let queue = StreamQueue::spawn(
            "test",
            LoggingHandler {
                log: log.clone(),
                fail_on,
                delay,
            },
            4,
            sink,
        )
        .unwrap();
        (queue, log, errors)
    }

    fn settle<H: PacketHandler>(queue: &StreamQueue<H>) {
        for _ in 0..200 {
            if queue.is_idle() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_packets_reach_handler_in_order() {
        let (queue, log, _) = spawn(None);
        queue.start("video");
        assert!(queue.push(packet(1, 0.0)));
        assert!(queue.push(packet(2, 0.1)));
        queue.push_end();
        settle(&queue);
        thread::sleep(Duration::from_millis(10));

        assert_eq!(*log.entries.lock(), vec!["start video", "data 1", "data 2"]);
        assert!(queue.is_ended());
        assert_eq!(queue.control().last_pts(), 0.1);
    }

    #[test]
    fn test_limit() {
        let (queue, _, _) = spawn_slow(None, Duration::from_millis(50));
        queue.start("video");
        let accepted = (0..10).filter(|i| queue.push(packet(*i, 0.0))).count();
        assert!(accepted <= 5);
        assert!(queue.is_full());
        assert!(queue.wait_space(Duration::from_secs(1)));
    }

    #[test]
    fn test_play_event_rules() {
        let (queue, log, _) = spawn(None);
        queue.start("audio");
        assert!(!queue.push_play_event(PlayEvent::Pause));
        assert!(queue.push_play_event(PlayEvent::Resume));
        assert!(!queue.push_play_event(PlayEvent::Resume));
        assert!(queue.is_playing());
        assert!(queue.push_play_event(PlayEvent::Seek(12.5)));
        assert_eq!(queue.seek_target(), 12.5);
        assert_eq!(queue.position(), 12.5);
        assert!(!queue.push_play_event(PlayEvent::Next));
        settle(&queue);
        thread::sleep(Duration::from_millis(10));

        let entries = log.entries.lock().clone();
        assert!(entries.contains(&"Seek(12.5)".to_string()));
    }

    #[test]
    fn test_clock_held_until_first_frame() {
        let (queue, _, _) = spawn(None);
        queue.start("video");
        queue.push_play_event(PlayEvent::Resume);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.position(), 0.0);

        queue.push(packet(0, 3.0));
        settle(&queue);
        thread::sleep(Duration::from_millis(20));
        assert!(queue.position() > 3.0);
    }

    #[test]
    fn test_flush_and_deinit() {
        let (queue, log, _) = spawn(None);
        queue.start("subs");
        queue.flush();
        settle(&queue);
        assert!(!queue.control().is_interrupted());

        queue.deinit();
        assert!(!queue.is_active());
        assert!(queue.is_ended());
        settle(&queue);
        thread::sleep(Duration::from_millis(10));
        let entries = log.entries.lock().clone();
        assert_eq!(entries.last().map(String::as_str), Some("stop"));
    }

    #[test]
    fn test_errors_reported_once_per_stream() {
        let (queue, _, errors) = spawn(Some(7));
        queue.start("video");
        queue.push(packet(7, 0.0));
        queue.push(packet(7, 0.1));
        settle(&queue);
        queue.start("video");
        queue.push(packet(7, 0.2));
        settle(&queue);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(errors.lock().len(), 2);
        assert_eq!(errors.lock()[0], "Decode failed: bad packet");
    }
}
