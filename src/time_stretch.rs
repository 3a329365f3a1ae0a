use anyhow::{Result, anyhow};
use log::debug;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Minimum deviation from neutral before processing engages.
pub const ACTIVATION_EPSILON: f32 = 0.001;

pub const TEMPO_MIN: f32 = 0.5;
pub const TEMPO_MAX: f32 = 2.0;
pub const PITCH_MIN: f32 = -12.0;
pub const PITCH_MAX: f32 = 12.0;

/// Tempo / pitch transform with a put/receive accumulation contract.
///
/// The tempo stage is WSOLA: windowed segments are overlap-added at a fixed
/// synthesis hop while the analysis position advances at `tempo / pitch_ratio`
/// input frames per hop, with a correlation search (±`search` frames) keeping
/// segment joins phase-aligned. The pitch stage then resamples by
/// `2^(-semitones/12)` through rubato, restoring the original duration while
/// moving the pitch.
///
/// `put` accepts any amount of interleaved input; `receive` returns whole
/// frames and may come up short while the pipeline accumulates. `flush`
/// drains residuals at end of stream; `clear` discards all internal state
/// (used on seek).
pub struct TimeStretch {
    sample_rate: u32,
    channels: usize,
    tempo: f32,
    pitch_semitones: f32,

    win: usize,
    hop: usize,
    search: usize,
    window: Vec<f32>,

    /// Per-channel input FIFO in content order; `analysis_pos` indexes into it.
    input: Vec<Vec<f32>>,
    analysis_pos: f64,
    /// Mono continuation of the previously chosen segment; correlation target.
    reference: Option<Vec<f32>>,
    /// Per-channel tail of the previous windowed segment awaiting overlap-add.
    overlap: Vec<Vec<f32>>,
    primed: bool,

    /// Per-channel staging between the WSOLA stage and the resampler.
    pitch_in: Vec<Vec<f32>>,
    resampler: Option<FastFixedIn<f32>>,

    /// Final interleaved output FIFO.
    ready: Vec<f32>,

    frames_in: u64,
    frames_out: u64,
}

impl TimeStretch {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        if channels == 0 {
            return Err(anyhow!("Time stretch requires at least one channel"));
        }
        let channels = channels as usize;

        // ~21ms analysis window at 48kHz, power of two for cheap indexing.
        let win = ((sample_rate as usize / 50).max(256)).next_power_of_two();
        let hop = win / 2;
        let search = win / 4;

        let window: Vec<f32> = (0..win)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * i as f64 / win as f64;
                (0.5 * (1.0 - phase.cos())) as f32
            })
            .collect();

        Ok(Self {
            sample_rate,
            channels,
            tempo: 1.0,
            pitch_semitones: 0.0,
            win,
            hop,
            search,
            window,
            input: vec![Vec::new(); channels],
            analysis_pos: 0.0,
            reference: None,
            overlap: vec![vec![0.0; win - hop]; channels],
            primed: false,
            pitch_in: vec![Vec::new(); channels],
            resampler: None,
            ready: Vec::new(),
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn pitch_semitones(&self) -> f32 {
        self.pitch_semitones
    }

    /// Whether the transform does anything at the current parameters.
    pub fn is_active(&self) -> bool {
        (self.tempo - 1.0).abs() > ACTIVATION_EPSILON
            || self.pitch_semitones.abs() > ACTIVATION_EPSILON
    }

    pub fn set_tempo(&mut self, tempo: f32) -> Result<()> {
        self.tempo = tempo.clamp(TEMPO_MIN, TEMPO_MAX);
        self.update_resampler()
    }

    pub fn set_pitch_semitones(&mut self, semitones: f32) -> Result<()> {
        self.pitch_semitones = semitones.clamp(PITCH_MIN, PITCH_MAX);
        self.update_resampler()
    }

    fn pitch_ratio(&self) -> f64 {
        2f64.powf(self.pitch_semitones as f64 / 12.0)
    }

    /// Output frames produced per input frame by the whole pipeline.
    pub fn stretch_ratio(&self) -> f64 {
        1.0 / self.tempo as f64
    }

    /// Input frames consumed per synthesis hop by the WSOLA stage.
    fn analysis_advance(&self) -> f64 {
        self.hop as f64 * self.tempo as f64 / self.pitch_ratio()
    }

    fn update_resampler(&mut self) -> Result<()> {
        let needs_pitch = self.pitch_semitones.abs() > ACTIVATION_EPSILON;
        if !needs_pitch {
            self.resampler = None;
            return Ok(());
        }

        let ratio = 1.0 / self.pitch_ratio();
        match self.resampler.as_mut() {
            Some(resampler) => resampler
                .set_resample_ratio(ratio, false)
                .map_err(|e| anyhow!("Failed to update resample ratio: {}", e))?,
            None => {
                let resampler = FastFixedIn::<f32>::new(
                    ratio,
                    4.0,
                    PolynomialDegree::Cubic,
                    self.hop,
                    self.channels,
                )
                .map_err(|e| anyhow!("Failed to create resampler: {}", e))?;
                self.resampler = Some(resampler);
            }
        }
        Ok(())
    }

    /// Accept interleaved input samples (whole frames).
    pub fn put(&mut self, samples: &[f32]) {
        let frames = samples.len() / self.channels;
        self.frames_in += frames as u64;
        for frame in 0..frames {
            for ch in 0..self.channels {
                self.input[ch].push(samples[frame * self.channels + ch]);
            }
        }
        self.process_available(false);
    }

    /// Pull processed interleaved frames into `out`; returns frames written.
    pub fn receive(&mut self, out: &mut [f32]) -> usize {
        let want_frames = out.len() / self.channels;
        let have_frames = self.ready.len() / self.channels;
        let frames = want_frames.min(have_frames);
        let samples = frames * self.channels;

        out[..samples].copy_from_slice(&self.ready[..samples]);
        self.ready.drain(..samples);
        self.frames_out += frames as u64;
        frames
    }

    /// Frames currently ready to receive.
    pub fn available(&self) -> usize {
        self.ready.len() / self.channels
    }

    /// Drain residual frames at end of stream.
    pub fn flush(&mut self) {
        // Enough steps to walk the analysis position across all real data,
        // with zero padding so the final windows have something to read.
        let remaining = (self.input[0].len() as f64 - self.analysis_pos).max(0.0);
        let steps = (remaining / self.analysis_advance()).ceil() as usize;
        let pad = self.win + self.search + 2 * self.hop + self.analysis_advance() as usize;
        for ch in 0..self.channels {
            self.input[ch].extend(std::iter::repeat(0.0).take(pad));
        }
        for _ in 0..steps {
            if !self.wsola_step_ready() {
                break;
            }
            self.wsola_step();
        }
        self.drain_pitch_stage(true);
        debug!(
            "Time stretch flushed: {} frames in, {} frames out",
            self.frames_in, self.frames_out
        );
    }

    /// Discard all buffered state (seek / parameter reset).
    pub fn clear(&mut self) {
        for ch in 0..self.channels {
            self.input[ch].clear();
            self.pitch_in[ch].clear();
            self.overlap[ch].fill(0.0);
        }
        self.analysis_pos = 0.0;
        self.reference = None;
        self.primed = false;
        self.ready.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    pub fn stats(&self) -> TimeStretchStats {
        TimeStretchStats {
            frames_in: self.frames_in,
            frames_out: self.frames_out,
            buffered_input_frames: self.input[0].len(),
            ready_frames: self.available(),
        }
    }

    fn process_available(&mut self, _flushing: bool) {
        while self.wsola_step_ready() {
            self.wsola_step();
        }
        self.drain_pitch_stage(false);
    }

    fn wsola_step_ready(&self) -> bool {
        let base = self.analysis_pos as usize;
        self.input[0].len() >= base + self.search + self.win + self.hop
    }

    fn wsola_step(&mut self) {
        let nominal = self.analysis_pos.round() as usize;
        let chosen = match &self.reference {
            Some(reference) if self.primed => self.best_offset(nominal, reference),
            _ => nominal,
        };

        if self.primed {
            // Head of the segment overlap-adds with the previous tail.
            for ch in 0..self.channels {
                for i in 0..self.hop {
                    let windowed = self.input[ch][chosen + i] * self.window[i];
                    self.pitch_in[ch].push(self.overlap[ch][i] + windowed);
                }
            }
        } else {
            // First segment has no predecessor; emit it unweighted.
            for ch in 0..self.channels {
                for i in 0..self.hop {
                    self.pitch_in[ch].push(self.input[ch][chosen + i]);
                }
            }
            self.primed = true;
        }

        // Stash the windowed tail for the next overlap-add.
        for ch in 0..self.channels {
            for i in 0..(self.win - self.hop) {
                self.overlap[ch][i] =
                    self.input[ch][chosen + self.hop + i] * self.window[self.hop + i];
            }
        }

        // Natural continuation becomes the next correlation target.
        let mut reference = vec![0.0f32; self.hop];
        for (i, slot) in reference.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for ch in 0..self.channels {
                acc += self.input[ch][chosen + self.hop + i];
            }
            *slot = acc / self.channels as f32;
        }
        self.reference = Some(reference);

        self.analysis_pos += self.analysis_advance();
        self.compact_input();
    }

    /// Pick the segment start within ±search of `nominal` that best matches
    /// the reference continuation (maximum unnormalized cross-correlation).
    fn best_offset(&self, nominal: usize, reference: &[f32]) -> usize {
        let lo = nominal.saturating_sub(self.search);
        let hi = nominal + self.search;
        let mut best = nominal;
        let mut best_score = f32::MIN;

        let mut candidate = lo;
        while candidate <= hi {
            let mut score = 0.0f32;
            for (i, &r) in reference.iter().enumerate() {
                let mut acc = 0.0f32;
                for ch in 0..self.channels {
                    acc += self.input[ch][candidate + i];
                }
                score += r * (acc / self.channels as f32);
            }
            if score > best_score {
                best_score = score;
                best = candidate;
            }
            candidate += 2;
        }
        best
    }

    fn compact_input(&mut self) {
        let keep_from = (self.analysis_pos as usize).saturating_sub(self.search);
        if keep_from < self.win {
            return;
        }
        for ch in 0..self.channels {
            self.input[ch].drain(..keep_from);
        }
        self.analysis_pos -= keep_from as f64;
    }

    fn drain_pitch_stage(&mut self, flushing: bool) {
        let Some(resampler) = self.resampler.as_mut() else {
            // Pitch neutral: interleave the WSOLA output straight through.
            let frames = self.pitch_in[0].len();
            for frame in 0..frames {
                for ch in 0..self.channels {
                    self.ready.push(self.pitch_in[ch][frame]);
                }
            }
            for ch in 0..self.channels {
                self.pitch_in[ch].clear();
            }
            return;
        };

        loop {
            let need = resampler.input_frames_next();
            if self.pitch_in[0].len() < need {
                break;
            }
            let chunk: Vec<&[f32]> = self.pitch_in.iter().map(|ch| &ch[..need]).collect();
            match resampler.process(&chunk, None) {
                Ok(output) => {
                    let out_frames = output[0].len();
                    for frame in 0..out_frames {
                        for channel in &output {
                            self.ready.push(channel[frame]);
                        }
                    }
                }
                Err(e) => {
                    debug!("Resampler error, dropping chunk: {}", e);
                }
            }
            for ch in 0..self.channels {
                self.pitch_in[ch].drain(..need);
            }
        }

        if flushing && !self.pitch_in[0].is_empty() {
            let chunk: Vec<&[f32]> = self.pitch_in.iter().map(|ch| ch.as_slice()).collect();
            if let Ok(output) = resampler.process_partial(Some(&chunk), None) {
                let out_frames = output[0].len();
                for frame in 0..out_frames {
                    for channel in &output {
                        self.ready.push(channel[frame]);
                    }
                }
            }
            for ch in 0..self.channels {
                self.pitch_in[ch].clear();
            }
        }
    }
}

/// Time stretch statistics
#[derive(Debug, Clone)]
pub struct TimeStretchStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub buffered_input_frames: usize,
    pub ready_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frames: usize, channels: usize, freq: f64, rate: f64) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let s = (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() as f32;
            for _ in 0..channels {
                out.push(s);
            }
        }
        out
    }

    fn drain_all(stretch: &mut TimeStretch) -> Vec<f32> {
        let mut out = Vec::new();
        let mut buf = vec![0.0f32; 1024];
        loop {
            let frames = stretch.receive(&mut buf);
            if frames == 0 {
                break;
            }
            out.extend_from_slice(&buf[..frames * 2]);
        }
        out
    }

    #[test]
    fn test_neutral_parameters_are_inactive() {
        let stretch = TimeStretch::new(48000, 2).unwrap();
        assert!(!stretch.is_active());
    }

    #[test]
    fn test_parameters_clamp() {
        let mut stretch = TimeStretch::new(48000, 2).unwrap();
        stretch.set_tempo(5.0).unwrap();
        assert_eq!(stretch.tempo(), TEMPO_MAX);
        stretch.set_tempo(0.1).unwrap();
        assert_eq!(stretch.tempo(), TEMPO_MIN);
        stretch.set_pitch_semitones(24.0).unwrap();
        assert_eq!(stretch.pitch_semitones(), PITCH_MAX);
    }

    #[test]
    fn test_receive_before_put_returns_zero() {
        let mut stretch = TimeStretch::new(48000, 2).unwrap();
        let mut buf = vec![0.0f32; 256];
        assert_eq!(stretch.receive(&mut buf), 0);
    }

    #[test]
    fn test_double_tempo_halves_duration() {
        let mut stretch = TimeStretch::new(48000, 2).unwrap();
        stretch.set_tempo(2.0).unwrap();

        let input_frames = 48000;
        stretch.put(&sine(input_frames, 2, 440.0, 48000.0));
        stretch.flush();
        let out = drain_all(&mut stretch);
        let out_frames = out.len() / 2;

        let expected = input_frames / 2;
        let slack = expected / 10;
        assert!(
            out_frames + slack > expected && out_frames < expected + slack,
            "expected ~{} frames, got {}",
            expected,
            out_frames
        );
    }

    #[test]
    fn test_half_tempo_doubles_duration() {
        let mut stretch = TimeStretch::new(48000, 2).unwrap();
        stretch.set_tempo(0.5).unwrap();

        let input_frames = 24000;
        stretch.put(&sine(input_frames, 2, 440.0, 48000.0));
        stretch.flush();
        let out_frames = drain_all(&mut stretch).len() / 2;

        let expected = input_frames * 2;
        let slack = expected / 10;
        assert!(
            out_frames + slack > expected && out_frames < expected + slack,
            "expected ~{} frames, got {}",
            expected,
            out_frames
        );
    }

    #[test]
    fn test_pitch_shift_preserves_duration() {
        let mut stretch = TimeStretch::new(48000, 2).unwrap();
        stretch.set_pitch_semitones(7.0).unwrap();
        assert!(stretch.is_active());

        let input_frames = 48000;
        stretch.put(&sine(input_frames, 2, 440.0, 48000.0));
        stretch.flush();
        let out_frames = drain_all(&mut stretch).len() / 2;

        let slack = input_frames / 10;
        assert!(
            out_frames + slack > input_frames && out_frames < input_frames + slack,
            "expected ~{} frames, got {}",
            input_frames,
            out_frames
        );
    }

    #[test]
    fn test_output_amplitude_stays_bounded() {
        let mut stretch = TimeStretch::new(48000, 1).unwrap();
        stretch.set_tempo(1.3).unwrap();

        stretch.put(&sine(24000, 1, 440.0, 48000.0));
        stretch.flush();

        let mut buf = vec![0.0f32; 512];
        loop {
            let frames = stretch.receive(&mut buf);
            if frames == 0 {
                break;
            }
            for &s in &buf[..frames] {
                assert!(s.abs() <= 1.2, "sample out of range: {}", s);
            }
        }
    }

    #[test]
    fn test_clear_discards_pending_output() {
        let mut stretch = TimeStretch::new(48000, 2).unwrap();
        stretch.set_tempo(1.5).unwrap();
        stretch.put(&sine(8192, 2, 440.0, 48000.0));
        assert!(stretch.available() > 0);

        stretch.clear();
        assert_eq!(stretch.available(), 0);
        let mut buf = vec![0.0f32; 128];
        assert_eq!(stretch.receive(&mut buf), 0);
    }
}
