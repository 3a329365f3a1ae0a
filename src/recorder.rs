use anyhow::{Result, Context};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::config::EngineConfig;

/// Sample format written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Float32,
    Int16,
}

/// Captures the post-effects master bus to a RIFF/WAVE file.
///
/// Not thread-safe on its own; the mixer keeps it behind a dedicated mutex
/// off the hot path and feeds it one buffer per cycle while recording.
pub struct WavRecorder {
    writer: Option<WavWriter<BufWriter<File>>>,
    format: RecordFormat,
    frames_written: u64,
    channels: u16,
    /// Stop after exactly this many frames when set.
    frame_limit: Option<u64>,
}

impl WavRecorder {
    pub fn new() -> Self {
        Self {
            writer: None,
            format: RecordFormat::Float32,
            frames_written: 0,
            channels: 2,
            frame_limit: None,
        }
    }

    /// Cap the recording at `limit` frames; the file is finalized exactly
    /// there even if more buffers keep arriving.
    pub fn set_frame_limit(&mut self, limit: Option<u64>) {
        self.frame_limit = limit;
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Open `path` and start capturing at the engine configuration.
    pub fn start(
        &mut self,
        path: impl AsRef<Path>,
        config: &EngineConfig,
        format: RecordFormat,
    ) -> Result<()> {
        if self.writer.is_some() {
            warn!("Recorder already running, restarting");
            self.stop()?;
        }

        let spec = WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate,
            bits_per_sample: match format {
                RecordFormat::Float32 => 32,
                RecordFormat::Int16 => 16,
            },
            sample_format: match format {
                RecordFormat::Float32 => SampleFormat::Float,
                RecordFormat::Int16 => SampleFormat::Int,
            },
        };

        let writer = WavWriter::create(path.as_ref(), spec)
            .context("Failed to create WAV file for recording")?;

        info!(
            "Recording started: {:?} ({} Hz, {} ch, {:?})",
            path.as_ref(),
            config.sample_rate,
            config.channels,
            format
        );

        self.writer = Some(writer);
        self.format = format;
        self.frames_written = 0;
        self.channels = config.channels;
        Ok(())
    }

    /// Append one interleaved buffer. A write failure stops the recording
    /// but leaves the caller's audio path untouched.
    pub fn write(&mut self, samples: &[f32]) -> Result<()> {
        let mut take = samples.len();
        if let Some(limit) = self.frame_limit {
            let remaining = limit.saturating_sub(self.frames_written) as usize
                * self.channels as usize;
            take = take.min(remaining);
        }

        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let samples = &samples[..take];

        let result = match self.format {
            RecordFormat::Float32 => samples
                .iter()
                .try_for_each(|&s| writer.write_sample(s)),
            RecordFormat::Int16 => samples.iter().try_for_each(|&s| {
                let clamped = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer.write_sample(clamped)
            }),
        };

        match result {
            Ok(()) => {
                self.frames_written += (samples.len() / self.channels as usize) as u64;
                if self
                    .frame_limit
                    .is_some_and(|limit| self.frames_written >= limit)
                {
                    self.stop()?;
                }
                Ok(())
            }
            Err(e) => {
                warn!("Recorder write failed, stopping recording: {}", e);
                self.writer = None;
                Err(anyhow::anyhow!("recorder write failed: {}", e))
            }
        }
    }

    /// Finalize the file. Safe to call when not recording.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .context("Failed to finalize WAV recording")?;
            info!("Recording stopped after {} frames", self.frames_written);
        }
        Ok(())
    }
}

impl Default for WavRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to finalize recording on drop: {}", e);
        }
    }
}
