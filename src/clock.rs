use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// How the mixer paces its cycles against this clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// The sink's blocking send paces the loop; the clock advances
    /// unconditionally each cycle.
    Realtime,
    /// The mixer may wait on sources before advancing; rendering is
    /// deterministic.
    Offline,
}

/// Monotonic master timeline, counted in frames.
///
/// Exactly one thread (the mixer) calls [`advance`](MasterClock::advance);
/// everyone else only reads. The frame counter never decreases except
/// through an explicit [`reset`](MasterClock::reset) while the mixer is
/// stopped.
pub struct MasterClock {
    sample_position: AtomicU64,
    sample_rate: u32,
    channels: u16,
    mode: AtomicU8,
}

impl MasterClock {
    pub fn new(sample_rate: u32, channels: u16, mode: ClockMode) -> Self {
        Self {
            sample_position: AtomicU64::new(0),
            sample_rate,
            channels,
            mode: AtomicU8::new(mode as u8),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Current position on the timeline, in frames.
    pub fn current_sample_position(&self) -> u64 {
        self.sample_position.load(Ordering::Acquire)
    }

    /// Current position on the timeline, in seconds.
    pub fn current_timestamp(&self) -> f64 {
        self.current_sample_position() as f64 / self.sample_rate as f64
    }

    pub fn mode(&self) -> ClockMode {
        match self.mode.load(Ordering::Acquire) {
            0 => ClockMode::Realtime,
            _ => ClockMode::Offline,
        }
    }

    pub fn set_mode(&self, mode: ClockMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Advance the timeline. Mixer thread only.
    pub fn advance(&self, frames: u64) {
        self.sample_position.fetch_add(frames, Ordering::AcqRel);
    }

    /// Rewind to zero. Only valid while the mixer is stopped.
    pub fn reset(&self) {
        self.sample_position.store(0, Ordering::Release);
    }
}
