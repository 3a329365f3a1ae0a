//! Shared fixtures for the integration suites.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::decoder::{FrameDecoder, FrameReadStatus, SineDecoder, StreamInfo};
use crate::error::EngineResult;
use crate::sink::{AudioSink, BufferSink, DeviceInfo};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A decoder that cannot keep up with real time: every read stalls first.
/// Wraps a sine so the payload is still recognizable in the mix.
pub struct SlowDecoder {
    inner: SineDecoder,
    stall: Duration,
}

impl SlowDecoder {
    pub fn new(inner: SineDecoder, stall: Duration) -> Self {
        Self { inner, stall }
    }
}

impl FrameDecoder for SlowDecoder {
    fn stream_info(&self) -> StreamInfo {
        self.inner.stream_info()
    }

    fn read_frames(&mut self, buffer: &mut [u8]) -> EngineResult<FrameReadStatus> {
        std::thread::sleep(self.stall);
        self.inner.read_frames(buffer)
    }

    fn try_seek(&mut self, position: f64) -> EngineResult<()> {
        self.inner.try_seek(position)
    }
}

/// A capture sink that paces like a real device: each send sleeps for the
/// buffer's duration, so a realtime mixer loop runs at wall-clock speed.
pub struct PacedSink {
    inner: BufferSink,
    sample_rate: u32,
    channels: usize,
}

impl PacedSink {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            inner: BufferSink::new(config.frames_per_buffer),
            sample_rate: config.sample_rate,
            channels: config.channels as usize,
        }
    }

    pub fn captured(&self) -> std::sync::Arc<std::sync::Mutex<Vec<f32>>> {
        self.inner.captured()
    }
}

impl AudioSink for PacedSink {
    fn initialize(&mut self, config: &EngineConfig) -> anyhow::Result<()> {
        self.sample_rate = config.sample_rate;
        self.channels = config.channels as usize;
        self.inner.initialize(config)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.inner.start()
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.inner.stop()
    }

    fn send_frames(&mut self, samples: &[f32]) {
        let frames = samples.len() / self.channels;
        std::thread::sleep(Duration::from_secs_f64(
            frames as f64 / self.sample_rate as f64,
        ));
        self.inner.send_frames(samples);
    }

    fn try_send_frames(&mut self, samples: &[f32]) -> anyhow::Result<usize> {
        self.inner.try_send_frames(samples)
    }

    fn receive_frames(&mut self, out: &mut [f32]) -> usize {
        self.inner.receive_frames(out)
    }

    fn enumerate_outputs(&self) -> anyhow::Result<Vec<DeviceInfo>> {
        self.inner.enumerate_outputs()
    }

    fn enumerate_inputs(&self) -> anyhow::Result<Vec<DeviceInfo>> {
        self.inner.enumerate_inputs()
    }

    fn default_output(&self) -> Option<DeviceInfo> {
        self.inner.default_output()
    }

    fn default_input(&self) -> Option<DeviceInfo> {
        self.inner.default_input()
    }

    fn frames_per_buffer(&self) -> usize {
        self.inner.frames_per_buffer()
    }
}
