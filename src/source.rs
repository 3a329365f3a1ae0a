use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::events::{EngineEvent, EventHub};

/// Playback state of a source. Transitions are the only signal the mixer
/// uses to decide whether to pull from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Stopped,
    Playing,
    Paused,
    Buffering,
    EndOfStream,
    Error,
}

impl SourceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SourceState::Stopped,
            1 => SourceState::Playing,
            2 => SourceState::Paused,
            3 => SourceState::Buffering,
            4 => SourceState::EndOfStream,
            _ => SourceState::Error,
        }
    }
}

/// Result of a clock-positioned read.
#[derive(Debug, Clone, Default)]
pub struct ReadResult {
    pub frames_read: usize,
    pub error: Option<String>,
}

/// An f64 stored as raw bits in an AtomicU64. Positions advance by
/// fractional frame counts once tempo is in play, so u64 frames won't do.
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    pub fn fetch_add(&self, delta: f64) -> f64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return f64::from_bits(current),
                Err(observed) => current = observed,
            }
        }
    }
}

/// State common to every source type: identity, volume, loop flag, the
/// playback state machine, and the content position. Concrete sources
/// compose this rather than inherit behavior.
pub struct SourceShared {
    id: Uuid,
    name: String,
    state: AtomicU8,
    /// Volume as f32 bits; clamped to [0.0, 2.0].
    volume: AtomicU32,
    looping: AtomicBool,
    /// Content position in frames (fractional under tempo).
    position_frames: AtomicF64,
    duration: f64,
    sample_rate: u32,
    channels: u16,
    events: Mutex<Option<Arc<EventHub>>>,
}

impl SourceShared {
    pub fn new(name: impl Into<String>, duration: f64, sample_rate: u32, channels: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: AtomicU8::new(SourceState::Stopped as u8),
            volume: AtomicU32::new(1.0f32.to_bits()),
            looping: AtomicBool::new(false),
            position_frames: AtomicF64::new(0.0),
            duration,
            sample_rate,
            channels,
            events: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn duration_frames(&self) -> u64 {
        (self.duration * self.sample_rate as f64).round() as u64
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition the state machine, emitting a StateChanged event when the
    /// state actually changes. Returns the previous state.
    pub fn set_state(&self, new: SourceState) -> SourceState {
        let old = SourceState::from_u8(self.state.swap(new as u8, Ordering::AcqRel));
        if old != new {
            self.emit(EngineEvent::StateChanged {
                source_id: self.id,
                old,
                new,
            });
        }
        old
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 2.0);
        self.volume.store(clamped.to_bits(), Ordering::Release);
    }

    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }

    /// Content position in frames, clamped to the duration.
    pub fn position_frames(&self) -> f64 {
        self.position_frames
            .load()
            .min(self.duration_frames() as f64)
    }

    pub fn position_seconds(&self) -> f64 {
        self.position_frames() / self.sample_rate as f64
    }

    pub fn set_position_frames(&self, frames: f64) {
        self.position_frames.store(frames);
    }

    pub fn advance_position(&self, frames: f64) {
        self.position_frames.fetch_add(frames);
    }

    /// Wire this source's events into an engine-wide hub.
    pub fn bind_events(&self, hub: Arc<EventHub>) {
        if let Ok(mut events) = self.events.lock() {
            *events = Some(hub);
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Ok(events) = self.events.lock() {
            if let Some(hub) = events.as_ref() {
                hub.emit(event);
            }
        }
    }
}

/// The behavior every mixable source provides. Common state lives in
/// [`SourceShared`]; this trait is the three behavioral seams (read, seek,
/// lifecycle) plus accessors the mixer needs.
pub trait AudioSource: Send + Sync {
    fn shared(&self) -> &SourceShared;

    /// Begin playback. May block briefly while buffers prime.
    fn play(&self) -> Result<()>;

    fn pause(&self);

    fn stop(&self);

    /// Reposition to `seconds`. Out-of-range positions are an error; the
    /// source stays where it was.
    fn seek(&self, seconds: f64) -> EngineResult<()>;

    /// Pull up to `frames` interleaved frames into `out`, returning the
    /// number delivered. Never blocks.
    fn read_samples(&self, out: &mut [f32], frames: usize) -> usize;

    /// Frames deliverable right now without a short read. Sources that are
    /// always ready (silence, generators) report `usize::MAX`; the offline
    /// mixer waits on this before pulling.
    fn buffered_frames(&self) -> usize {
        usize::MAX
    }

    /// Downcast seam for sources that can render against a master clock.
    fn as_clock_source(&self) -> Option<&dyn MasterClockSource> {
        None
    }

    fn id(&self) -> Uuid {
        self.shared().id()
    }

    fn state(&self) -> SourceState {
        self.shared().state()
    }

    fn duration(&self) -> f64 {
        self.shared().duration()
    }

    fn position(&self) -> f64 {
        self.shared().position_seconds()
    }
}

/// Join a worker thread within `timeout`. On timeout the stop flag the
/// caller already raised stays set, the handle is detached, and a
/// teardown-timeout error is returned so disposal can proceed.
pub(crate) fn join_worker(
    handle: std::thread::JoinHandle<()>,
    timeout: std::time::Duration,
    name: &str,
) -> EngineResult<()> {
    let deadline = std::time::Instant::now() + timeout;
    while !handle.is_finished() {
        if std::time::Instant::now() >= deadline {
            return Err(crate::error::EngineError::TeardownTimeout {
                name: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    let _ = handle.join();
    Ok(())
}

/// Sources that can render positioned against a master timestamp.
pub trait MasterClockSource: Send + Sync {
    fn is_attached_to_clock(&self) -> bool;

    /// Pull `frames` frames positioned for master time `timestamp`. The
    /// bool is false when the read degraded (drift resync in progress,
    /// underrun, source error); `ReadResult` carries the detail either way.
    fn read_samples_at_time(
        &self,
        timestamp: f64,
        out: &mut [f32],
        frames: usize,
    ) -> (bool, ReadResult);
}
