use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::decoder::{FrameDecoder, FrameResult};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::frame_pool::FramePool;
use crate::ghost_source::{GhostSource, GhostTrackObserver};
use crate::ring_buffer::SampleRing;
use crate::source::{
    AtomicF64, AudioSource, MasterClockSource, ReadResult, SourceShared, SourceState, join_worker,
};
use crate::time_stretch::TimeStretch;

/// How long `play` waits for the ring to prime before returning anyway.
const PREBUFFER_TIMEOUT: Duration = Duration::from_millis(50);
/// Ring fill ratio `play` waits for.
const PREBUFFER_TARGET: f32 = 0.25;
/// Ring fill ratio above which the decode loop backs off.
const DECODE_HIGH_WATER: f32 = 0.75;
/// Decoder park interval while not playing.
const DECODE_PARK: Duration = Duration::from_millis(100);
/// Join bound for the decode thread on disposal.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Decode-thread mailbox: pending seek plus the wakeup for state changes.
struct DecodeControl {
    signals: Mutex<Option<f64>>,
    wake: Condvar,
    should_stop: AtomicBool,
}

impl DecodeControl {
    fn new() -> Self {
        Self {
            signals: Mutex::new(None),
            wake: Condvar::new(),
            should_stop: AtomicBool::new(false),
        }
    }

    fn post_seek(&self, position: f64) {
        if let Ok(mut pending) = self.signals.lock() {
            *pending = Some(position);
        }
        self.wake.notify_all();
    }

    fn take_seek(&self) -> Option<f64> {
        self.signals.lock().ok().and_then(|mut pending| pending.take())
    }

    fn seek_pending(&self) -> bool {
        self.signals.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    fn park(&self) {
        if let Ok(guard) = self.signals.lock() {
            if guard.is_none() {
                let _ = self.wake.wait_timeout(guard, DECODE_PARK);
            }
        }
    }

    fn notify(&self) {
        self.wake.notify_all();
    }
}

/// A decoded-file source: background decode thread feeding an SPSC ring
/// through an optional time-stretch stage, consumed by the mixer.
///
/// Content position (the decoder timeline) and track-local time (the master
/// timeline this source last rendered at) are tracked separately; tempo
/// makes their relationship path-dependent, which is why drift correction
/// seeks *relative* to the current file position rather than to an absolute
/// `t × tempo` target.
pub struct FileSource {
    shared: Arc<SourceShared>,
    control: Arc<DecodeControl>,
    ring: Arc<SampleRing>,
    pool: Arc<FramePool>,
    stretch: Arc<Mutex<TimeStretch>>,
    decoder: Arc<Mutex<Box<dyn FrameDecoder>>>,
    eof: Arc<AtomicBool>,
    thread_running: Arc<AtomicBool>,
    decode_thread: Mutex<Option<JoinHandle<()>>>,

    frames_per_buffer: usize,
    sample_rate: u32,
    channels: usize,

    attached_to_clock: AtomicBool,
    /// Master-domain time this source last rendered up to. NaN = not yet
    /// rendered since attach; initialized from the first clock read.
    track_local_time: AtomicF64,
    /// Content-frame deadline before which drift correction is suppressed.
    ignore_sync_until: AtomicF64,
    drift_tolerance_frames: u64,
    underruns: AtomicU64,

    ghost: Mutex<Option<Arc<GhostSource>>>,
}

impl FileSource {
    /// Wrap a decoder producing frames at the engine rate and channel count.
    /// Decoders with internal resampling expose their configured target via
    /// `stream_info`; a mismatch here is a construction error, not a
    /// runtime surprise.
    pub fn new(
        name: impl Into<String>,
        decoder: Box<dyn FrameDecoder>,
        config: &EngineConfig,
    ) -> Result<Arc<Self>> {
        let info = decoder.stream_info();
        if info.sample_rate != config.sample_rate {
            return Err(anyhow!(
                "Decoder sample rate {} does not match engine rate {}",
                info.sample_rate,
                config.sample_rate
            ));
        }
        if info.channels != config.channels {
            return Err(anyhow!(
                "Decoder channel count {} does not match engine channels {}",
                info.channels,
                config.channels
            ));
        }

        let frame_bytes = config.samples_per_buffer() * std::mem::size_of::<f32>();
        let stretch = TimeStretch::new(config.sample_rate, config.channels)?;

        let source = Arc::new(Self {
            shared: Arc::new(SourceShared::new(
                name,
                info.duration,
                config.sample_rate,
                config.channels,
            )),
            control: Arc::new(DecodeControl::new()),
            ring: Arc::new(SampleRing::new(config.ring_buffer_capacity())),
            pool: Arc::new(FramePool::new(frame_bytes, 8)),
            stretch: Arc::new(Mutex::new(stretch)),
            decoder: Arc::new(Mutex::new(decoder)),
            eof: Arc::new(AtomicBool::new(false)),
            thread_running: Arc::new(AtomicBool::new(false)),
            decode_thread: Mutex::new(None),
            frames_per_buffer: config.frames_per_buffer,
            sample_rate: config.sample_rate,
            channels: config.channels as usize,
            attached_to_clock: AtomicBool::new(false),
            track_local_time: AtomicF64::new(f64::NAN),
            ignore_sync_until: AtomicF64::new(0.0),
            drift_tolerance_frames: config.drift_tolerance_frames,
            underruns: AtomicU64::new(0),
            ghost: Mutex::new(None),
        });

        info!(
            "Created file source '{}' ({:.3}s, {} Hz, {} ch)",
            source.shared.name(),
            info.duration,
            info.sample_rate,
            info.channels
        );
        Ok(source)
    }

    pub fn set_looping(&self, looping: bool) {
        self.shared.set_looping(looping);
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.set_volume(volume);
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.shared.state() == SourceState::EndOfStream
    }

    pub fn tempo(&self) -> f32 {
        self.stretch.lock().map(|s| s.tempo()).unwrap_or(1.0)
    }

    pub fn pitch_semitones(&self) -> f32 {
        self.stretch.lock().map(|s| s.pitch_semitones()).unwrap_or(0.0)
    }

    /// Set playback tempo. Clamped; opens a half-second grace period while
    /// the stretch pipeline resettles.
    pub fn set_tempo(&self, tempo: f32) {
        if let Ok(mut stretch) = self.stretch.lock() {
            if let Err(e) = stretch.set_tempo(tempo) {
                warn!("Tempo change rejected: {}", e);
                return;
            }
        }
        self.open_grace_period();
        debug!("Source '{}' tempo -> {}", self.shared.name(), tempo);
    }

    /// Set pitch shift in semitones. Clamped; opens the same grace period.
    pub fn set_pitch_semitones(&self, semitones: f32) {
        if let Ok(mut stretch) = self.stretch.lock() {
            if let Err(e) = stretch.set_pitch_semitones(semitones) {
                warn!("Pitch change rejected: {}", e);
                return;
            }
        }
        self.open_grace_period();
    }

    fn open_grace_period(&self) {
        let deadline = self.shared.position_frames() + self.sample_rate as f64 / 2.0;
        self.ignore_sync_until.store(deadline);
    }

    fn grace_expired(&self) -> bool {
        self.shared.position_frames() >= self.ignore_sync_until.load()
    }

    /// Wire this source to render against the master clock.
    pub fn attach_to_clock(&self) {
        self.attached_to_clock.store(true, Ordering::Release);
        self.track_local_time.store(f64::NAN);
    }

    pub fn detach_from_clock(&self) {
        self.attached_to_clock.store(false, Ordering::Release);
        self.track_local_time.store(f64::NAN);
    }

    /// Follow a ghost's transport/tempo/pitch fan-out. A source observes at
    /// most one ghost; observing a new one drops the previous subscription.
    pub fn observe_ghost(self: &Arc<Self>, ghost: &Arc<GhostSource>) {
        self.release_ghost();
        let as_observer: Arc<dyn GhostTrackObserver> = Arc::clone(self) as _;
        ghost.subscribe(&as_observer);
        if let Ok(mut slot) = self.ghost.lock() {
            *slot = Some(Arc::clone(ghost));
        }
    }

    pub fn release_ghost(self: &Arc<Self>) {
        let previous = self.ghost.lock().ok().and_then(|mut slot| slot.take());
        if let Some(ghost) = previous {
            let as_observer: Arc<dyn GhostTrackObserver> = Arc::clone(self) as _;
            ghost.unsubscribe(&as_observer);
        }
    }

    fn observed_ghost(&self) -> Option<Arc<GhostSource>> {
        self.ghost.lock().ok().and_then(|slot| slot.clone())
    }

    fn ensure_decode_thread(&self) -> Result<()> {
        let mut slot = self
            .decode_thread
            .lock()
            .map_err(|_| anyhow!("decode thread lock poisoned"))?;

        if self.thread_running.load(Ordering::Acquire) {
            return Ok(());
        }
        // Reap a previous incarnation that ran to end of stream.
        if let Some(handle) = slot.take() {
            let _ = handle.join();
        }

        self.control.should_stop.store(false, Ordering::Release);
        self.eof.store(false, Ordering::Release);
        self.thread_running.store(true, Ordering::Release);

        let worker = DecodeWorker {
            shared: Arc::clone(&self.shared),
            control: Arc::clone(&self.control),
            ring: Arc::clone(&self.ring),
            pool: Arc::clone(&self.pool),
            stretch: Arc::clone(&self.stretch),
            decoder: Arc::clone(&self.decoder),
            eof: Arc::clone(&self.eof),
            thread_running: Arc::clone(&self.thread_running),
            frames_per_buffer: self.frames_per_buffer,
            sample_rate: self.sample_rate,
            channels: self.channels,
        };

        let handle = thread::Builder::new()
            .name(format!("decode-{}", self.shared.name()))
            .spawn(move || worker.run())
            .map_err(|e| anyhow!("Failed to spawn decode thread: {}", e))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Apply per-source volume to the first `samples` slots.
    fn apply_volume(&self, out: &mut [f32], samples: usize) {
        let volume = self.shared.volume();
        if (volume - 1.0).abs() > f32::EPSILON {
            crate::simd::scale(&mut out[..samples], volume);
        }
    }

    /// Advance the content position, wrapping when looping. A looped source
    /// shorter than one buffer can wrap more than once per read, hence the
    /// modulo rather than a single subtraction.
    fn advance_content(&self, frames: f64) {
        let duration = self.shared.duration_frames() as f64;
        let mut position = self.shared.position_frames() + frames;
        if self.shared.looping() && duration > 0.0 && position >= duration {
            position %= duration;
        }
        self.shared.set_position_frames(position);
    }

    fn settle_end_of_stream(&self) {
        if self.eof.load(Ordering::Acquire) && self.ring.is_empty() && !self.shared.looping() {
            self.shared.set_state(SourceState::EndOfStream);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_sync_state(&self, file_position_secs: f64, track_local_time: f64) {
        self.shared
            .set_position_frames(file_position_secs * self.sample_rate as f64);
        self.track_local_time.store(track_local_time);
        self.ignore_sync_until.store(0.0);
    }

}

impl AudioSource for FileSource {
    fn shared(&self) -> &SourceShared {
        &self.shared
    }

    /// Begin playback. Lazily starts the decode thread on first call, then
    /// blocks until the ring is a quarter full or 50ms have passed.
    fn play(&self) -> Result<()> {
        if self.shared.state() == SourceState::Playing {
            return Ok(());
        }

        self.ensure_decode_thread()?;
        self.shared.set_state(SourceState::Playing);
        self.control.notify();

        let deadline = Instant::now() + PREBUFFER_TIMEOUT;
        while self.ring.fill_ratio() < PREBUFFER_TARGET
            && Instant::now() < deadline
            && !self.eof.load(Ordering::Acquire)
        {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn pause(&self) {
        self.shared.set_state(SourceState::Paused);
        self.control.notify();
    }

    fn stop(&self) {
        self.shared.set_state(SourceState::Stopped);
        self.ring.clear();
        if self.thread_running.load(Ordering::Acquire) {
            self.control.post_seek(0.0);
        } else if let Ok(mut decoder) = self.decoder.lock() {
            if let Err(e) = decoder.try_seek(0.0) {
                warn!("Rewind on stop failed: {}", e);
            }
        }
        self.shared.set_position_frames(0.0);
        self.eof.store(false, Ordering::Release);
        self.control.notify();
    }

    fn seek(&self, seconds: f64) -> EngineResult<()> {
        let duration = self.shared.duration();
        if seconds < 0.0 || seconds > duration {
            return Err(EngineError::SeekOutOfRange {
                requested: seconds,
                duration,
            });
        }

        if self.thread_running.load(Ordering::Acquire) {
            // Consumed at the decode loop's next iteration.
            self.control.post_seek(seconds);
            self.ring.clear();
        } else {
            let mut decoder = self
                .decoder
                .lock()
                .map_err(|_| EngineError::SeekFailed("decoder lock poisoned".into()))?;
            decoder.try_seek(seconds)?;
            self.ring.clear();
            if let Ok(mut stretch) = self.stretch.lock() {
                stretch.clear();
            }
        }

        self.shared
            .set_position_frames(seconds * self.sample_rate as f64);
        self.eof.store(false, Ordering::Release);
        Ok(())
    }

    fn read_samples(&self, out: &mut [f32], frames: usize) -> usize {
        let samples = (frames * self.channels).min(out.len());

        if self.shared.state() != SourceState::Playing {
            out[..samples].fill(0.0);
            return 0;
        }

        // Ghost-following drift check for sources not on the master clock.
        if !self.attached_to_clock.load(Ordering::Acquire) {
            if let Some(ghost) = self.observed_ghost() {
                let drift =
                    (ghost.current_frame() as f64 - self.shared.position_frames()).abs();
                if drift > self.drift_tolerance_frames as f64 && self.grace_expired() {
                    let target = ghost.current_frame() as f64 / self.sample_rate as f64;
                    debug!(
                        "Source '{}' drifted {:.0} frames from ghost, resyncing to {:.3}s",
                        self.shared.name(),
                        drift,
                        target
                    );
                    if let Err(e) = self.seek(target.min(self.shared.duration())) {
                        warn!("Ghost resync seek failed: {}", e);
                    }
                }
            }
        }

        let read = self.ring.read(&mut out[..samples]);
        let frames_read = read / self.channels;
        out[read..samples].fill(0.0);

        if read < samples && !self.eof.load(Ordering::Acquire) {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            self.shared.emit(EngineEvent::BufferUnderrun {
                source_id: self.shared.id(),
                missing_frames: frames - frames_read,
                frame_position: self.shared.position_frames() as u64,
            });
        }

        self.apply_volume(out, read);
        let tempo = self.tempo() as f64;
        self.advance_content(frames_read as f64 * tempo);
        self.settle_end_of_stream();

        frames_read
    }

    fn buffered_frames(&self) -> usize {
        if self.eof.load(Ordering::Acquire) {
            // Whatever is left is all there will ever be.
            usize::MAX
        } else {
            self.ring.available_read() / self.channels
        }
    }

    fn as_clock_source(&self) -> Option<&dyn MasterClockSource> {
        Some(self)
    }
}

impl MasterClockSource for FileSource {
    fn is_attached_to_clock(&self) -> bool {
        self.attached_to_clock.load(Ordering::Acquire)
    }

    fn read_samples_at_time(
        &self,
        timestamp: f64,
        out: &mut [f32],
        frames: usize,
    ) -> (bool, ReadResult) {
        let samples = (frames * self.channels).min(out.len());
        out[..samples].fill(0.0);

        if self.shared.state() != SourceState::Playing {
            return (true, ReadResult::default());
        }

        // First render since attach defines the time mapping.
        let local = self.track_local_time.load();
        if local.is_nan() {
            self.track_local_time.store(timestamp);
        }
        let local = self.track_local_time.load();

        let drift = timestamp - local;
        let tolerance = self.drift_tolerance_frames as f64 / self.sample_rate as f64;
        let cycle_secs = frames as f64 / self.sample_rate as f64;

        let mut degraded: Option<String> = None;

        if drift.abs() > tolerance && self.grace_expired() {
            // Relative correction: the file-position history is
            // path-dependent under tempo changes, so an absolute
            // `t × tempo` target would land in the wrong place.
            let tempo = self.tempo() as f64;
            let target = self.shared.position_seconds() + drift * tempo;

            if target < 0.0 || target > self.shared.duration() {
                degraded = Some(format!(
                    "drift {:.3}s puts resync target {:.3}s out of range",
                    drift, target
                ));
            } else {
                match self.seek(target) {
                    Ok(()) => {
                        self.track_local_time.store(timestamp);
                        degraded = Some(format!(
                            "resyncing {:.1}ms of drift to {:.3}s",
                            drift * 1000.0,
                            target
                        ));
                    }
                    Err(e) => degraded = Some(format!("drift resync failed: {}", e)),
                }
            }
        }

        let read = self.ring.read(&mut out[..samples]);
        let frames_read = read / self.channels;
        out[read..samples].fill(0.0);

        if frames_read < frames && degraded.is_none() && !self.eof.load(Ordering::Acquire) {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            self.shared.emit(EngineEvent::BufferUnderrun {
                source_id: self.shared.id(),
                missing_frames: frames - frames_read,
                frame_position: self.shared.position_frames() as u64,
            });
            degraded = Some(format!("buffer underrun, {} frames short", frames - frames_read));
        }

        self.apply_volume(out, read);

        // The master timeline consumed a full buffer slot either way.
        self.track_local_time.fetch_add(cycle_secs);
        let tempo = self.tempo() as f64;
        self.advance_content(frames_read as f64 * tempo);
        self.settle_end_of_stream();

        let ok = degraded.is_none();
        (
            ok,
            ReadResult {
                frames_read,
                error: degraded,
            },
        )
    }
}

impl FileSource {
    /// Stop the decode thread and release the decoder. Bounded at 2s; a
    /// worker that won't die is detached with its stop flag left raised.
    pub fn dispose(&self) {
        self.control.should_stop.store(true, Ordering::Release);
        self.control.notify();

        let handle = self.decode_thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if let Err(e) = join_worker(handle, DISPOSE_TIMEOUT, "decode") {
                error!("{}", e);
            }
        }
        if let Ok(mut decoder) = self.decoder.lock() {
            decoder.dispose();
        }
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl GhostTrackObserver for FileSource {
    fn on_state_changed(&self, state: SourceState) {
        match state {
            SourceState::Playing => {
                if let Err(e) = self.play() {
                    warn!("Ghost play fan-out failed: {}", e);
                }
            }
            SourceState::Paused => self.pause(),
            SourceState::Stopped => self.stop(),
            _ => {}
        }
    }

    fn on_position_changed(&self, frame: u64) {
        let seconds = frame as f64 / self.sample_rate as f64;
        let clamped = seconds.min(self.shared.duration());
        if let Err(e) = self.seek(clamped) {
            warn!("Ghost position fan-out seek failed: {}", e);
        }
    }

    fn on_tempo_changed(&self, tempo: f32) {
        self.set_tempo(tempo);
    }

    fn on_pitch_changed(&self, semitones: f32) {
        self.set_pitch_semitones(semitones);
    }

    fn on_loop_changed(&self, looping: bool) {
        self.set_looping(looping);
    }
}

/// Everything the decode thread owns. Runs until told to stop or the
/// stream ends without looping.
struct DecodeWorker {
    shared: Arc<SourceShared>,
    control: Arc<DecodeControl>,
    ring: Arc<SampleRing>,
    pool: Arc<FramePool>,
    stretch: Arc<Mutex<TimeStretch>>,
    decoder: Arc<Mutex<Box<dyn FrameDecoder>>>,
    eof: Arc<AtomicBool>,
    thread_running: Arc<AtomicBool>,
    frames_per_buffer: usize,
    sample_rate: u32,
    channels: usize,
}

impl DecodeWorker {
    fn run(self) {
        info!("Decode thread for '{}' started", self.shared.name());

        // Scratch sized 4x a mixer buffer, accumulation 8x: the stretch
        // stage emits ragged batches but the ring is always fed in exact
        // frames_per_buffer chunks for stable downstream timing.
        let chunk_samples = self.frames_per_buffer * self.channels;
        let mut scratch: Vec<f32> = Vec::with_capacity(chunk_samples * 4);
        let mut receive_buf = vec![0.0f32; chunk_samples * 4];
        let mut accumulation: Vec<f32> = Vec::with_capacity(chunk_samples * 8);
        let mut decode_pos = self.shared.position_seconds();

        'outer: while !self.control.should_stop.load(Ordering::Acquire) {
            if self.shared.state() != SourceState::Playing && !self.control.seek_pending() {
                self.control.park();
                continue;
            }

            if let Some(target) = self.control.take_seek() {
                self.perform_seek(target, &mut decode_pos, &mut accumulation);
                continue;
            }

            if self.ring.fill_ratio() >= DECODE_HIGH_WATER {
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            let outcome = {
                let Ok(mut decoder) = self.decoder.lock() else {
                    break;
                };
                decoder.decode_next_frame(&self.pool, self.frames_per_buffer, decode_pos)
            };

            match outcome {
                Ok(FrameResult::Frame(frame)) => {
                    scratch.clear();
                    let sample_count = frame.copy_samples_into(&mut scratch);
                    self.pool.give_back(frame);
                    decode_pos += (sample_count / self.channels) as f64 / self.sample_rate as f64;

                    let active = self
                        .stretch
                        .lock()
                        .map(|s| s.is_active())
                        .unwrap_or(false);

                    if active {
                        if let Ok(mut stretch) = self.stretch.lock() {
                            stretch.put(&scratch);
                            loop {
                                let got = stretch.receive(&mut receive_buf);
                                if got == 0 {
                                    break;
                                }
                                accumulation
                                    .extend_from_slice(&receive_buf[..got * self.channels]);
                            }
                        }
                        // Fixed-chunk discipline into the ring.
                        while accumulation.len() >= chunk_samples {
                            if !self.write_backpressured(&accumulation[..chunk_samples]) {
                                continue 'outer;
                            }
                            accumulation.drain(..chunk_samples);
                        }
                    } else if !self.write_backpressured(&scratch) {
                        continue 'outer;
                    }
                }
                Ok(FrameResult::EndOfStream) => {
                    if !self.handle_end_of_stream(&mut decode_pos, &mut accumulation, &mut receive_buf) {
                        break;
                    }
                }
                Err(e) => {
                    error!("Decoder failed for '{}': {}", self.shared.name(), e);
                    self.shared.emit(EngineEvent::SourceError {
                        source_id: self.shared.id(),
                        message: e.to_string(),
                    });
                    self.eof.store(true, Ordering::Release);
                    self.shared.set_state(SourceState::Error);
                    break;
                }
            }
        }

        self.thread_running.store(false, Ordering::Release);
        info!("Decode thread for '{}' exited", self.shared.name());
    }

    fn perform_seek(&self, target: f64, decode_pos: &mut f64, accumulation: &mut Vec<f32>) {
        let result = match self.decoder.lock() {
            Ok(mut decoder) => decoder.try_seek(target),
            Err(_) => Err(EngineError::SeekFailed("decoder lock poisoned".into())),
        };
        match result {
            Ok(()) => {
                *decode_pos = target;
                self.ring.clear();
                if let Ok(mut stretch) = self.stretch.lock() {
                    stretch.clear();
                }
                accumulation.clear();
                self.eof.store(false, Ordering::Release);
                self.shared
                    .set_position_frames(target * self.sample_rate as f64);
                debug!("Decode thread sought '{}' to {:.3}s", self.shared.name(), target);
            }
            Err(e) => {
                warn!("Async seek failed for '{}': {}", self.shared.name(), e);
                self.shared.emit(EngineEvent::SourceError {
                    source_id: self.shared.id(),
                    message: format!("seek failed: {}", e),
                });
            }
        }
    }

    /// Returns true when decoding should continue (the loop flag rewound the
    /// stream, or a seek arrived while draining); false when the thread
    /// should exit.
    fn handle_end_of_stream(
        &self,
        decode_pos: &mut f64,
        accumulation: &mut Vec<f32>,
        receive_buf: &mut [f32],
    ) -> bool {
        // Drain stretch residuals; at end of stream a partial final chunk
        // is allowed into the ring.
        if let Ok(mut stretch) = self.stretch.lock() {
            if stretch.is_active() {
                stretch.flush();
                loop {
                    let got = stretch.receive(receive_buf);
                    if got == 0 {
                        break;
                    }
                    accumulation.extend_from_slice(&receive_buf[..got * self.channels]);
                }
            }
        }
        if !accumulation.is_empty() {
            let pending: Vec<f32> = accumulation.drain(..).collect();
            if !self.write_backpressured(&pending) {
                return true;
            }
        }

        if self.shared.looping() {
            let rewound = match self.decoder.lock() {
                Ok(mut decoder) => decoder.try_seek(0.0).is_ok(),
                Err(_) => false,
            };
            if rewound {
                *decode_pos = 0.0;
                if let Ok(mut stretch) = self.stretch.lock() {
                    stretch.clear();
                }
                return true;
            }
            warn!("Loop rewind failed for '{}'", self.shared.name());
        }

        self.eof.store(true, Ordering::Release);

        // Let the consumer drain what's buffered, then exit. A seek posted
        // meanwhile revives the stream instead.
        while !self.control.should_stop.load(Ordering::Acquire) {
            if self.control.seek_pending() {
                return true;
            }
            if self.ring.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Write with bounded back-off; bails out early on stop or a pending
    /// seek so control changes never wait behind a full ring.
    fn write_backpressured(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            if self.control.should_stop.load(Ordering::Acquire) || self.control.seek_pending() {
                return false;
            }
            let written = self.ring.write(&samples[offset..]);
            offset += written;
            if written == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        true
    }
}
