//! # mixr: real-time audio mixing and synchronization engine
//!
//! A cross-platform engine that ingests multiple concurrent audio sources
//! (decoded files, silent clock tracks), keeps them sample-accurately
//! aligned on a shared timeline, applies per-source time-stretch and
//! pitch-shift, mixes them into one interleaved float stream, and delivers
//! it to an output device without glitches.
//!
//! ## Overview
//!
//! Four subsystems carry the load:
//!
//! 1. A **master clock** timeline, in frames, that every attached source
//!    renders against.
//! 2. **File sources** with a background decode thread, a lock-free ring
//!    buffer, continuous drift correction, and a tempo/pitch pipeline.
//! 3. A **mixer** that pulls timestamped audio from the active sources,
//!    combines them with vectorized kernels, runs master effects, and
//!    pushes the result to the sink.
//! 4. A **sink layer** presenting a blocking pull/push device interface,
//!    with a pump thread adapting it to lock-free producers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mixr::{EngineConfig, Mixer, FileSource, SineDecoder, NullSink};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let config = EngineConfig::default();
//!
//!     let decoder = SineDecoder::new(440.0, 2.0, config.sample_rate, config.channels);
//!     let source = FileSource::new("tone", Box::new(decoder), &config)?;
//!
//!     let mut mixer = Mixer::new(config.clone(), Box::new(NullSink::new(config.frames_per_buffer)))?;
//!     mixer.add_source(source)?;
//!     mixer.start()?;
//!     // ... run ...
//!     mixer.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Threading Model
//!
//! Dedicated OS threads, not a task runtime: one elevated-priority mixing
//! thread, one decode thread per file source, one pump thread per sink
//! adapter, and the device's own realtime callback. The only async surface
//! is the outward-facing wrappers of blocking device lifecycle calls.
//!
//! ## Synchronization Model
//!
//! A sync group is a silent ghost source plus the file sources observing
//! it. The ghost cascades transport, tempo, pitch, and loop changes to its
//! members; sample alignment itself comes from the master-clock render
//! path, where each source measures its drift against the mixer timestamp
//! and corrects with a seek relative to its current file position.

/// Engine configuration with validation and TOML persistence
pub mod config;

/// Typed error taxonomy for engine failures
pub mod error;

/// Runtime event stream (underruns, dropouts, state changes)
pub mod events;

/// Lock-free single-producer single-consumer sample ring buffer
pub mod ring_buffer;

/// Reusable frame buffer pool for the zero-alloc decode path
pub mod frame_pool;

/// Tempo and pitch transform (WSOLA plus resampler pitch stage)
pub mod time_stretch;

/// Monotonic master timeline in frames
pub mod clock;

/// Frame decoder interface and deterministic signal decoders
pub mod decoder;

/// Source state machine and the shared source behavior traits
pub mod source;

/// Background-decoding file source with drift correction
pub mod file_source;

/// Silent clock-authority source with observer fan-out
pub mod ghost_source;

/// Ghost plus members: group transport and duration tracking
pub mod sync_group;

/// Pull-based mixer: clock owner, mixing thread, master effects
pub mod mixer;

/// Vectorized mix kernels with scalar fallback
pub mod simd;

/// Master and per-source effect chain
pub mod effects;

/// Post-effects WAV capture of the master bus
pub mod recorder;

/// Audio sink interface, device façade, and async wrappers
pub mod sink;

/// cpal-backed platform sink
pub mod cpal_sink;

/// Lock-free producer adapter over a blocking sink
pub mod sink_pump;

#[cfg(test)]
pub mod tests;

// Re-export main types for convenience
pub use clock::{ClockMode, MasterClock};
pub use config::{ConfigManager, EngineConfig};
pub use cpal_sink::CpalSink;
pub use decoder::{FrameDecoder, FrameReadStatus, FrameResult, SilenceDecoder, SineDecoder, StreamInfo};
pub use effects::{AudioEffect, EffectChain, FadeInEffect, GainEffect, SoftClipEffect};
pub use error::{EngineError, EngineResult};
pub use events::{DropoutKind, EngineEvent, EventHub};
pub use file_source::FileSource;
pub use frame_pool::{FramePool, PooledFrame};
pub use ghost_source::{GhostSource, GhostTrackObserver};
pub use mixer::Mixer;
pub use recorder::{RecordFormat, WavRecorder};
pub use ring_buffer::SampleRing;
pub use sink::{AudioDevice, AudioSink, BufferSink, DeviceInfo, NullSink};
pub use sink_pump::SinkPump;
pub use source::{AudioSource, MasterClockSource, ReadResult, SourceState};
pub use sync_group::SyncGroup;
pub use time_stretch::TimeStretch;
