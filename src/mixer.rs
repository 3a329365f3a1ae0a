use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::clock::{ClockMode, MasterClock};
use crate::config::EngineConfig;
use crate::effects::{AudioEffect, EffectChain};
use crate::error::EngineError;
use crate::events::{DropoutKind, EngineEvent, EventHub};
use crate::recorder::{RecordFormat, WavRecorder};
use crate::sink::AudioSink;
use crate::source::{AudioSource, MasterClockSource as _, join_worker};

/// How long an offline-mode cycle waits for one source before giving up.
const OFFLINE_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Park interval while the mixer is paused.
const PAUSE_PARK: Duration = Duration::from_millis(100);
/// Join bound for the mixing thread on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Pull-based aggregator: owns the master clock, the active source set,
/// the mixing thread, master effects, level meters, and the recorder.
///
/// The cycle is uninterruptible by per-source failures; those become
/// events and the failing source contributes silence. The sink's blocking
/// send is the only blocking call in a realtime cycle and paces the loop.
pub struct Mixer {
    config: EngineConfig,
    clock: Arc<MasterClock>,
    /// Value carries the insertion sequence so the mix order is stable:
    /// float addition order must not vary between runs in offline mode.
    sources: Arc<Mutex<HashMap<Uuid, (u64, Arc<dyn AudioSource>)>>>,
    source_seq: AtomicU64,
    sources_dirty: Arc<AtomicBool>,
    master_volume: Arc<AtomicU32>,
    effects: Arc<Mutex<EffectChain>>,
    events: Arc<EventHub>,
    recorder: Arc<Mutex<WavRecorder>>,
    running: Arc<AtomicBool>,
    should_stop: Arc<AtomicBool>,
    pause_gate: Arc<(Mutex<()>, Condvar)>,
    peak_levels: Arc<Vec<AtomicU32>>,
    total_mixed_frames: Arc<AtomicU64>,
    sink: Option<Box<dyn AudioSink>>,
    mix_thread: Option<JoinHandle<()>>,
}

impl Mixer {
    /// Build a mixer around an un-initialized sink. The sink is initialized
    /// with the engine configuration and started when mixing starts.
    pub fn new(config: EngineConfig, sink: Box<dyn AudioSink>) -> Result<Self> {
        config.validate()?;
        crate::simd::log_capabilities();

        let peak_levels = (0..config.channels)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect();

        Ok(Self {
            clock: Arc::new(MasterClock::new(
                config.sample_rate,
                config.channels,
                ClockMode::Realtime,
            )),
            config,
            sources: Arc::new(Mutex::new(HashMap::new())),
            source_seq: AtomicU64::new(0),
            sources_dirty: Arc::new(AtomicBool::new(false)),
            master_volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            effects: Arc::new(Mutex::new(EffectChain::new())),
            events: Arc::new(EventHub::new()),
            recorder: Arc::new(Mutex::new(WavRecorder::new())),
            running: Arc::new(AtomicBool::new(false)),
            should_stop: Arc::new(AtomicBool::new(false)),
            pause_gate: Arc::new((Mutex::new(()), Condvar::new())),
            peak_levels: Arc::new(peak_levels),
            total_mixed_frames: Arc::new(AtomicU64::new(0)),
            sink: Some(sink),
            mix_thread: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<MasterClock> {
        &self.clock
    }

    /// Subscribe to the engine event stream.
    pub fn events(&self) -> crossbeam::channel::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn rendering_mode(&self) -> ClockMode {
        self.clock.mode()
    }

    /// Switch between realtime (sink-paced, dropouts are events) and
    /// offline (mixer-paced, deterministic) rendering.
    pub fn set_rendering_mode(&self, mode: ClockMode) {
        self.clock.set_mode(mode);
    }

    pub fn master_volume(&self) -> f32 {
        f32::from_bits(self.master_volume.load(Ordering::Acquire))
    }

    pub fn set_master_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 2.0);
        self.master_volume
            .store(clamped.to_bits(), Ordering::Release);
    }

    /// Per-channel peak levels of the last mixed buffer.
    pub fn peak_levels(&self) -> Vec<f32> {
        self.peak_levels
            .iter()
            .map(|bits| f32::from_bits(bits.load(Ordering::Acquire)))
            .collect()
    }

    pub fn total_mixed_frames(&self) -> u64 {
        self.total_mixed_frames.load(Ordering::Acquire)
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_mixing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Add a source to the active set. Capped; the snapshot cache goes
    /// stale and is rebuilt by the mixing thread at its next cycle. A
    /// stopped source added while mixing is started automatically.
    pub fn add_source(&self, source: Arc<dyn AudioSource>) -> Result<()> {
        {
            let mut sources = self
                .sources
                .lock()
                .map_err(|_| anyhow!("source map lock poisoned"))?;
            if sources.len() >= self.config.max_sources {
                return Err(EngineError::SourceLimit {
                    limit: self.config.max_sources,
                }
                .into());
            }
            source.shared().bind_events(Arc::clone(&self.events));
            let seq = self.source_seq.fetch_add(1, Ordering::Relaxed);
            sources.insert(source.id(), (seq, Arc::clone(&source)));
        }
        self.sources_dirty.store(true, Ordering::Release);

        if self.is_mixing() && source.state() == crate::source::SourceState::Stopped {
            if let Err(e) = source.play() {
                warn!("Auto-start of added source failed: {}", e);
            }
        }
        debug!("Added source {} ({} active)", source.id(), self.source_count());
        Ok(())
    }

    /// Remove a source; its buffers go with it once the last Arc drops.
    pub fn remove_source(&self, id: Uuid) -> Option<Arc<dyn AudioSource>> {
        let removed = self.sources.lock().ok()?.remove(&id).map(|(_, s)| s);
        if removed.is_some() {
            self.sources_dirty.store(true, Ordering::Release);
            debug!("Removed source {}", id);
        }
        removed
    }

    /// Append a master effect; it is initialized with the engine config
    /// and runs after mixing and master volume, in registration order.
    pub fn add_master_effect(&self, mut effect: Box<dyn AudioEffect>) -> Result<()> {
        effect.initialize(&self.config)?;
        self.effects
            .lock()
            .map_err(|_| anyhow!("effect chain lock poisoned"))?
            .add(effect);
        Ok(())
    }

    pub fn remove_master_effect(&self, name: &str) -> bool {
        self.effects
            .lock()
            .map(|mut chain| chain.remove(name))
            .unwrap_or(false)
    }

    pub fn clear_master_effects(&self) {
        if let Ok(mut chain) = self.effects.lock() {
            chain.clear();
        }
    }

    /// Record the post-effects master bus to a WAV file.
    pub fn start_recording(&self, path: impl AsRef<Path>, format: RecordFormat) -> Result<()> {
        self.start_recording_limited(path, format, None)
    }

    /// Record at most `max_frames` frames; the file is finalized exactly
    /// there even while mixing continues.
    pub fn start_recording_limited(
        &self,
        path: impl AsRef<Path>,
        format: RecordFormat,
        max_frames: Option<u64>,
    ) -> Result<()> {
        let mut recorder = self
            .recorder
            .lock()
            .map_err(|_| anyhow!("recorder lock poisoned"))?;
        recorder.set_frame_limit(max_frames);
        recorder.start(path, &self.config, format)
    }

    /// Frames written by the active (or last) recording.
    pub fn recorded_frames(&self) -> u64 {
        self.recorder
            .lock()
            .map(|r| r.frames_written())
            .unwrap_or(0)
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.recorder
            .lock()
            .map_err(|_| anyhow!("recorder lock poisoned"))?
            .stop()
    }

    /// Start (or resume) mixing. The first call initializes and starts the
    /// sink and spawns the mixing thread at elevated priority.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.mix_thread.is_none() {
            let mut sink = self
                .sink
                .take()
                .ok_or_else(|| anyhow!("Mixer was stopped; create a new one to mix again"))?;
            sink.initialize(&self.config)?;
            sink.start()?;

            let worker = MixWorker {
                config: self.config.clone(),
                clock: Arc::clone(&self.clock),
                sources: Arc::clone(&self.sources),
                sources_dirty: Arc::clone(&self.sources_dirty),
                master_volume: Arc::clone(&self.master_volume),
                effects: Arc::clone(&self.effects),
                events: Arc::clone(&self.events),
                recorder: Arc::clone(&self.recorder),
                running: Arc::clone(&self.running),
                should_stop: Arc::clone(&self.should_stop),
                pause_gate: Arc::clone(&self.pause_gate),
                peak_levels: Arc::clone(&self.peak_levels),
                total_mixed_frames: Arc::clone(&self.total_mixed_frames),
                sink,
            };

            self.mix_thread = Some(
                thread::Builder::new()
                    .name("mixer".to_string())
                    .spawn(move || worker.run())
                    .map_err(|e| anyhow!("Failed to spawn mixing thread: {}", e))?,
            );
        }

        self.running.store(true, Ordering::Release);
        self.pause_gate.1.notify_all();
        info!("Mixer started");
        Ok(())
    }

    /// Pause mixing; the thread parks until `start` is called again.
    pub fn pause(&self) {
        self.running.store(false, Ordering::Release);
        info!("Mixer paused");
    }

    /// Stop mixing for good: joins the mixing thread (2s bound) and
    /// disposes the sink. A stop during a mid-cycle sink send is fine:
    /// the cycle completes and the loop exits at the top.
    pub fn stop(&mut self) -> Result<()> {
        self.should_stop.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.pause_gate.1.notify_all();

        if let Some(handle) = self.mix_thread.take() {
            if let Err(e) = join_worker(handle, STOP_TIMEOUT, "mixer") {
                error!("{}", e);
                return Err(e.into());
            }
        }
        if let Err(e) = self.stop_recording() {
            warn!("Recorder did not finalize cleanly: {}", e);
        }
        info!(
            "Mixer stopped after {} frames",
            self.total_mixed_frames.load(Ordering::Acquire)
        );
        Ok(())
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        if self.mix_thread.is_some() {
            let _ = self.stop();
        }
    }
}

/// Everything the mixing thread owns.
struct MixWorker {
    config: EngineConfig,
    clock: Arc<MasterClock>,
    sources: Arc<Mutex<HashMap<Uuid, (u64, Arc<dyn AudioSource>)>>>,
    sources_dirty: Arc<AtomicBool>,
    master_volume: Arc<AtomicU32>,
    effects: Arc<Mutex<EffectChain>>,
    events: Arc<EventHub>,
    recorder: Arc<Mutex<WavRecorder>>,
    running: Arc<AtomicBool>,
    should_stop: Arc<AtomicBool>,
    pause_gate: Arc<(Mutex<()>, Condvar)>,
    peak_levels: Arc<Vec<AtomicU32>>,
    total_mixed_frames: Arc<AtomicU64>,
    sink: Box<dyn AudioSink>,
}

impl MixWorker {
    fn run(mut self) {
        set_realtime_priority();
        info!("Mixing thread started");

        let frames = self.config.frames_per_buffer;
        let channels = self.config.channels as usize;
        let samples = frames * channels;

        let mut snapshot: Vec<Arc<dyn AudioSource>> = Vec::new();
        let mut mix_buffer = vec![0.0f32; samples];
        let mut scratch = vec![0.0f32; samples];

        while !self.should_stop.load(Ordering::Acquire) {
            if !self.running.load(Ordering::Acquire) {
                let (lock, condvar) = &*self.pause_gate;
                if let Ok(guard) = lock.lock() {
                    let _ = condvar.wait_timeout(guard, PAUSE_PARK);
                }
                continue;
            }

            // Refresh the cached source array only when flagged stale;
            // add/remove never block the cycle.
            if self.sources_dirty.swap(false, Ordering::AcqRel) {
                snapshot = self
                    .sources
                    .lock()
                    .map(|sources| {
                        let mut entries: Vec<(u64, Arc<dyn AudioSource>)> =
                            sources.values().cloned().collect();
                        entries.sort_by_key(|(seq, _)| *seq);
                        entries.into_iter().map(|(_, source)| source).collect()
                    })
                    .unwrap_or_default();
                debug!("Source snapshot refreshed: {} sources", snapshot.len());
            }

            mix_buffer.fill(0.0);
            let timestamp = self.clock.current_timestamp();
            let offline = self.clock.mode() == ClockMode::Offline;
            let mut contributed = false;

            for source in &snapshot {
                if source.state() != crate::source::SourceState::Playing {
                    continue;
                }

                if offline {
                    self.wait_for_source(source.as_ref(), frames);
                }

                if let Some(clock_source) = source.as_clock_source() {
                    if clock_source.is_attached_to_clock() {
                        let (ok, result) =
                            clock_source.read_samples_at_time(timestamp, &mut scratch, frames);
                        // Partial output still goes into the mix: dropouts
                        // are missing tails, and adding what arrived keeps
                        // the other sources aligned.
                        if result.frames_read > 0 {
                            crate::simd::mix_add(
                                &mut mix_buffer,
                                &scratch[..result.frames_read * channels],
                            );
                            contributed = true;
                        }
                        if !ok {
                            self.events.emit(EngineEvent::TrackDropout {
                                source_id: source.id(),
                                kind: DropoutKind::ShortRead,
                                timestamp,
                                missing_frames: frames.saturating_sub(result.frames_read),
                                reason: result
                                    .error
                                    .unwrap_or_else(|| "short read".to_string()),
                            });
                        }
                        continue;
                    }
                }

                let read = source.read_samples(&mut scratch, frames);
                if read > 0 {
                    crate::simd::mix_add(&mut mix_buffer, &scratch[..read * channels]);
                    contributed = true;
                }
            }

            if contributed {
                let master = f32::from_bits(self.master_volume.load(Ordering::Acquire));
                if (master - 1.0).abs() > f32::EPSILON {
                    crate::simd::scale(&mut mix_buffer, master);
                }
                if let Ok(mut chain) = self.effects.lock() {
                    chain.process_all(&mut mix_buffer, frames);
                }
            }

            self.update_peaks(&mix_buffer, channels);

            if let Ok(mut recorder) = self.recorder.lock() {
                if recorder.is_recording() {
                    if let Err(e) = recorder.write(&mix_buffer) {
                        self.events.emit(EngineEvent::SourceError {
                            source_id: Uuid::nil(),
                            message: format!("recording stopped: {}", e),
                        });
                    }
                }
            }

            // Silence still goes out and the clock still advances; the
            // timeline must keep moving with no sources contributing.
            self.sink.send_frames(&mix_buffer);
            self.clock.advance(frames as u64);
            self.total_mixed_frames
                .fetch_add(frames as u64, Ordering::AcqRel);
        }

        if let Err(e) = self.sink.stop() {
            warn!("Sink stop failed: {}", e);
        }
        self.sink.dispose();
        info!("Mixing thread exited");
    }

    /// Offline mode: block (bounded) until the source can satisfy a full
    /// read, so renders are deterministic and underruns become errors.
    fn wait_for_source(&self, source: &dyn AudioSource, frames: usize) {
        let deadline = Instant::now() + OFFLINE_READ_TIMEOUT;
        while source.buffered_frames() < frames
            && source.state() == crate::source::SourceState::Playing
            && !self.should_stop.load(Ordering::Acquire)
        {
            if Instant::now() >= deadline {
                self.events.emit(EngineEvent::TrackDropout {
                    source_id: source.id(),
                    kind: DropoutKind::SourceFailed,
                    timestamp: self.clock.current_timestamp(),
                    missing_frames: frames,
                    reason: "offline read timed out".to_string(),
                });
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn update_peaks(&self, buffer: &[f32], channels: usize) {
        for (ch, slot) in self.peak_levels.iter().enumerate().take(channels) {
            let mut peak = 0.0f32;
            let mut index = ch;
            while index < buffer.len() {
                let magnitude = buffer[index].abs();
                if magnitude > peak {
                    peak = magnitude;
                }
                index += channels;
            }
            slot.store(peak.to_bits(), Ordering::Release);
        }
    }
}

/// Raise the calling thread to realtime scheduling where the platform
/// allows it. Failure is logged, never fatal.
pub fn set_realtime_priority() {
    #[cfg(target_os = "linux")]
    {
        let result = unsafe {
            let param = libc::sched_param { sched_priority: 80 };
            libc::sched_setscheduler(0, libc::SCHED_FIFO, &param)
        };

        if result == 0 {
            info!("Mixing thread running with SCHED_FIFO priority 80");
        } else {
            warn!(
                "Failed to set realtime scheduling: {}. Running with normal priority.",
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(target_os = "macos")]
    {
        let result = unsafe {
            let thread = libc::pthread_self();
            let mut policy: i32 = 0;
            let mut param = libc::sched_param { sched_priority: 0 };

            if libc::pthread_getschedparam(thread, &mut policy, &mut param) == 0 {
                param.sched_priority = 63;
                if libc::pthread_setschedparam(thread, policy, &param) == 0 {
                    0
                } else {
                    -1
                }
            } else {
                -1
            }
        };

        if result == 0 {
            info!("Mixing thread running with elevated priority");
        } else {
            warn!(
                "Failed to set thread priority: {}. Running with normal priority.",
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        warn!("Realtime scheduling not implemented for this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SineDecoder;
    use crate::file_source::FileSource;
    use crate::sink::{BufferSink, NullSink};

    fn sine_source(duration: f64, config: &EngineConfig) -> Arc<FileSource> {
        let decoder = SineDecoder::new(440.0, duration, config.sample_rate, config.channels);
        FileSource::new("sine", Box::new(decoder), config).unwrap()
    }

    #[test]
    fn test_source_cap_enforced() {
        let mut config = EngineConfig::default();
        config.max_sources = 2;
        let mixer = Mixer::new(config.clone(), Box::new(NullSink::new(512))).unwrap();

        mixer.add_source(sine_source(1.0, &config)).unwrap();
        mixer.add_source(sine_source(1.0, &config)).unwrap();
        let err = mixer.add_source(sine_source(1.0, &config)).unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_remove_returns_source() {
        let config = EngineConfig::default();
        let mixer = Mixer::new(config.clone(), Box::new(NullSink::new(512))).unwrap();
        let source = sine_source(1.0, &config);
        let id = source.id();

        mixer.add_source(source).unwrap();
        assert_eq!(mixer.source_count(), 1);
        assert!(mixer.remove_source(id).is_some());
        assert_eq!(mixer.source_count(), 0);
        assert!(mixer.remove_source(id).is_none());
    }

    #[test]
    fn test_empty_mixer_sends_silence_and_advances_clock() {
        let config = EngineConfig::default();
        let sink = BufferSink::new(config.frames_per_buffer);
        let captured = sink.captured();

        let mut mixer = Mixer::new(config.clone(), Box::new(sink)).unwrap();
        mixer.set_rendering_mode(ClockMode::Offline);
        mixer.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while mixer.total_mixed_frames() < config.frames_per_buffer as u64 * 4
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(1));
        }
        mixer.stop().unwrap();

        let frames = mixer.total_mixed_frames();
        assert!(frames >= config.frames_per_buffer as u64 * 4);
        assert_eq!(mixer.clock().current_sample_position(), frames);

        let captured = captured.lock().unwrap();
        assert!(captured.len() as u64 >= frames * config.channels as u64);
        assert!(captured.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_stop_joins_within_bound() {
        let config = EngineConfig::default();
        let mut mixer = Mixer::new(config, Box::new(NullSink::new(512))).unwrap();
        mixer.start().unwrap();

        let begun = Instant::now();
        mixer.stop().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(!mixer.is_mixing());
    }

    #[test]
    fn test_restart_after_stop_is_an_error() {
        let config = EngineConfig::default();
        let mut mixer = Mixer::new(config, Box::new(NullSink::new(512))).unwrap();
        mixer.start().unwrap();
        mixer.stop().unwrap();
        assert!(mixer.start().is_err());
    }

    #[test]
    fn test_master_volume_clamps() {
        let config = EngineConfig::default();
        let mixer = Mixer::new(config, Box::new(NullSink::new(512))).unwrap();
        mixer.set_master_volume(9.0);
        assert_eq!(mixer.master_volume(), 2.0);
    }

    #[test]
    fn test_master_effect_registration() {
        let config = EngineConfig::default();
        let mixer = Mixer::new(config, Box::new(NullSink::new(512))).unwrap();
        mixer
            .add_master_effect(Box::new(crate::effects::GainEffect::new(0.5)))
            .unwrap();
        assert!(mixer.remove_master_effect("gain"));
        assert!(!mixer.remove_master_effect("gain"));
    }
}
