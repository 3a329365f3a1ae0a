use anyhow::Result;
use log::{debug, info};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{EngineError, EngineResult};
use crate::source::{AtomicF64, AudioSource, SourceShared, SourceState};

pub const GHOST_TEMPO_MIN: f32 = 0.1;
pub const GHOST_TEMPO_MAX: f32 = 4.0;

/// Receives ghost state fan-out. Callbacks run synchronously on the thread
/// that mutated the ghost and must be quick and idempotent.
pub trait GhostTrackObserver: Send + Sync {
    fn on_state_changed(&self, state: SourceState);
    fn on_position_changed(&self, frame: u64);
    fn on_tempo_changed(&self, tempo: f32);
    fn on_pitch_changed(&self, semitones: f32);
    fn on_loop_changed(&self, looping: bool);
}

/// A silent source whose position is the authoritative timeline of a sync
/// group.
///
/// Output is always zero; what matters is `current_frame`, which advances
/// by `frames_read × tempo` so observers follow the ghost's content
/// timeline rather than wall-clock. The frame total is resizable to the
/// longest attached member.
pub struct GhostSource {
    shared: SourceShared,
    total_frames: AtomicU64,
    current_frame: AtomicF64,
    tempo: AtomicU32,
    pitch_semitones: AtomicU32,
    observers: Mutex<Vec<Weak<dyn GhostTrackObserver>>>,
}

impl GhostSource {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            shared: SourceShared::new("ghost", 0.0, sample_rate, channels),
            total_frames: AtomicU64::new(0),
            current_frame: AtomicF64::new(0.0),
            tempo: AtomicU32::new(1.0f32.to_bits()),
            pitch_semitones: AtomicU32::new(0.0f32.to_bits()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Acquire)
    }

    /// Grow or shrink the timeline; the position is clamped into range.
    pub fn resize_frames(&self, total_frames: u64) {
        self.total_frames.store(total_frames, Ordering::Release);
        let current = self.current_frame.load();
        if current > total_frames as f64 {
            self.current_frame.store(total_frames as f64);
        }
        debug!("Ghost resized to {} frames", total_frames);
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame.load() as u64
    }

    pub fn current_timestamp(&self) -> f64 {
        self.current_frame.load() / self.shared.sample_rate() as f64
    }

    pub fn tempo(&self) -> f32 {
        f32::from_bits(self.tempo.load(Ordering::Acquire))
    }

    pub fn set_tempo(&self, tempo: f32) {
        let clamped = tempo.clamp(GHOST_TEMPO_MIN, GHOST_TEMPO_MAX);
        self.tempo.store(clamped.to_bits(), Ordering::Release);
        info!("Ghost tempo set to {}", clamped);
        self.broadcast(|observer| observer.on_tempo_changed(clamped));
    }

    pub fn pitch_semitones(&self) -> f32 {
        f32::from_bits(self.pitch_semitones.load(Ordering::Acquire))
    }

    pub fn set_pitch_semitones(&self, semitones: f32) {
        let clamped = semitones.clamp(-12.0, 12.0);
        self.pitch_semitones
            .store(clamped.to_bits(), Ordering::Release);
        self.broadcast(|observer| observer.on_pitch_changed(clamped));
    }

    pub fn set_looping_all(&self, looping: bool) {
        self.shared.set_looping(looping);
        self.broadcast(|observer| observer.on_loop_changed(looping));
    }

    /// Attach an observer. A source observes at most one ghost; enforcing
    /// that is the subscriber's job (see `FileSource::observe_ghost`).
    pub fn subscribe(&self, observer: &Arc<dyn GhostTrackObserver>) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(Arc::downgrade(observer));
        }
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn GhostTrackObserver>) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.retain(|candidate| match candidate.upgrade() {
                Some(live) => !Arc::ptr_eq(&live, observer),
                None => false,
            });
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .map(|observers| observers.iter().filter(|o| o.upgrade().is_some()).count())
            .unwrap_or(0)
    }

    /// Synchronous fan-out in subscription order; dead weak refs are pruned.
    fn broadcast<F: Fn(&Arc<dyn GhostTrackObserver>)>(&self, call: F) {
        let live: Vec<Arc<dyn GhostTrackObserver>> = {
            let Ok(mut observers) = self.observers.lock() else {
                return;
            };
            observers.retain(|o| o.upgrade().is_some());
            observers.iter().filter_map(|o| o.upgrade()).collect()
        };
        for observer in &live {
            call(observer);
        }
    }
}

impl AudioSource for GhostSource {
    fn shared(&self) -> &SourceShared {
        &self.shared
    }

    fn duration(&self) -> f64 {
        self.total_frames() as f64 / self.shared.sample_rate() as f64
    }

    fn position(&self) -> f64 {
        self.current_timestamp()
    }

    fn play(&self) -> Result<()> {
        self.shared.set_state(SourceState::Playing);
        self.broadcast(|observer| observer.on_state_changed(SourceState::Playing));
        Ok(())
    }

    fn pause(&self) {
        self.shared.set_state(SourceState::Paused);
        self.broadcast(|observer| observer.on_state_changed(SourceState::Paused));
    }

    fn stop(&self) {
        self.shared.set_state(SourceState::Stopped);
        self.current_frame.store(0.0);
        self.broadcast(|observer| observer.on_state_changed(SourceState::Stopped));
        self.broadcast(|observer| observer.on_position_changed(0));
    }

    fn seek(&self, seconds: f64) -> EngineResult<()> {
        let duration = self.duration();
        if seconds < 0.0 || seconds > duration {
            return Err(EngineError::SeekOutOfRange {
                requested: seconds,
                duration,
            });
        }
        let frame = seconds * self.shared.sample_rate() as f64;
        self.current_frame.store(frame);
        self.broadcast(|observer| observer.on_position_changed(frame as u64));
        Ok(())
    }

    /// Zero the buffer and advance the timeline by `frames × tempo`.
    fn read_samples(&self, out: &mut [f32], frames: usize) -> usize {
        let samples = frames * self.shared.channels() as usize;
        let len = samples.min(out.len());
        for slot in out[..len].iter_mut() {
            *slot = 0.0;
        }

        if self.shared.state() != SourceState::Playing {
            return frames;
        }

        let advance = frames as f64 * self.tempo() as f64;
        let position = self.current_frame.fetch_add(advance) + advance;
        let total = self.total_frames() as f64;

        if total > 0.0 && position >= total {
            if self.shared.looping() {
                self.current_frame.store(position % total);
                self.broadcast(|observer| {
                    observer.on_position_changed((position % total) as u64)
                });
            } else {
                self.current_frame.store(total);
                self.shared.set_state(SourceState::EndOfStream);
                self.broadcast(|observer| observer.on_state_changed(SourceState::EndOfStream));
            }
        }
        frames
    }
}
