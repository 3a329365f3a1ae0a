use anyhow::{Result, anyhow};
use log::info;
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;

/// A physical or virtual audio endpoint.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub max_channels: u16,
    pub default_sample_rate: u32,
}

/// Platform output/capture endpoint consumed by the engine.
///
/// `send_frames` may block up to roughly one device period under
/// back-pressure and is the mixer's pacing signal in realtime mode;
/// `try_send_frames` never blocks. Lifecycle calls can be slow
/// (50-5000ms for `initialize`, up to 2s for `stop`); the async wrappers
/// on [`AudioDevice`] exist for callers that cannot afford to block.
pub trait AudioSink: Send {
    fn initialize(&mut self, config: &EngineConfig) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Deliver interleaved samples, blocking until the device accepts them.
    fn send_frames(&mut self, samples: &[f32]);

    /// Deliver what fits right now; returns the accepted sample count.
    fn try_send_frames(&mut self, samples: &[f32]) -> Result<usize>;

    /// Capture path: fill `out`, returning samples produced.
    fn receive_frames(&mut self, out: &mut [f32]) -> usize;

    fn enumerate_outputs(&self) -> Result<Vec<DeviceInfo>>;

    fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>>;

    fn default_output(&self) -> Option<DeviceInfo>;

    fn default_input(&self) -> Option<DeviceInfo>;

    fn frames_per_buffer(&self) -> usize;

    fn dispose(&mut self) {}
}

/// Sink that accepts everything instantly. Pacing-free, which is exactly
/// what offline rendering wants.
pub struct NullSink {
    frames_per_buffer: usize,
    samples_accepted: u64,
}

impl NullSink {
    pub fn new(frames_per_buffer: usize) -> Self {
        Self {
            frames_per_buffer,
            samples_accepted: 0,
        }
    }

    pub fn samples_accepted(&self) -> u64 {
        self.samples_accepted
    }
}

impl AudioSink for NullSink {
    fn initialize(&mut self, config: &EngineConfig) -> Result<()> {
        self.frames_per_buffer = config.frames_per_buffer;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn send_frames(&mut self, samples: &[f32]) {
        self.samples_accepted += samples.len() as u64;
    }

    fn try_send_frames(&mut self, samples: &[f32]) -> Result<usize> {
        self.samples_accepted += samples.len() as u64;
        Ok(samples.len())
    }

    fn receive_frames(&mut self, out: &mut [f32]) -> usize {
        out.fill(0.0);
        0
    }

    fn enumerate_outputs(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            name: "null".to_string(),
            is_default: true,
            max_channels: 8,
            default_sample_rate: 48000,
        }])
    }

    fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>> {
        Ok(Vec::new())
    }

    fn default_output(&self) -> Option<DeviceInfo> {
        self.enumerate_outputs().ok()?.into_iter().next()
    }

    fn default_input(&self) -> Option<DeviceInfo> {
        None
    }

    fn frames_per_buffer(&self) -> usize {
        self.frames_per_buffer
    }
}

/// Sink that appends everything into a shared buffer, for offline renders
/// kept in memory and for inspecting mixer output in tests.
pub struct BufferSink {
    frames_per_buffer: usize,
    buffer: Arc<Mutex<Vec<f32>>>,
}

impl BufferSink {
    pub fn new(frames_per_buffer: usize) -> Self {
        Self {
            frames_per_buffer,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the captured samples.
    pub fn captured(&self) -> Arc<Mutex<Vec<f32>>> {
        Arc::clone(&self.buffer)
    }
}

impl AudioSink for BufferSink {
    fn initialize(&mut self, config: &EngineConfig) -> Result<()> {
        self.frames_per_buffer = config.frames_per_buffer;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn send_frames(&mut self, samples: &[f32]) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(samples);
        }
    }

    fn try_send_frames(&mut self, samples: &[f32]) -> Result<usize> {
        self.send_frames(samples);
        Ok(samples.len())
    }

    fn receive_frames(&mut self, out: &mut [f32]) -> usize {
        out.fill(0.0);
        0
    }

    fn enumerate_outputs(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            name: "buffer".to_string(),
            is_default: true,
            max_channels: 8,
            default_sample_rate: 48000,
        }])
    }

    fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>> {
        Ok(Vec::new())
    }

    fn default_output(&self) -> Option<DeviceInfo> {
        self.enumerate_outputs().ok()?.into_iter().next()
    }

    fn default_input(&self) -> Option<DeviceInfo> {
        None
    }

    fn frames_per_buffer(&self) -> usize {
        self.frames_per_buffer
    }
}

/// Lifecycle state of an [`AudioDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Created,
    Initialized,
    Started,
    Stopped,
    Disposed,
}

/// Device façade over a boxed sink: lifecycle tracking, enumeration, and
/// async wrappers that push the documented-blocking calls onto a worker.
///
/// Cheaply cloneable; clones share the sink and its lifecycle state.
#[derive(Clone)]
pub struct AudioDevice {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    sink: Mutex<Box<dyn AudioSink>>,
    state: Mutex<DeviceState>,
}

impl AudioDevice {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                sink: Mutex::new(sink),
                state: Mutex::new(DeviceState::Created),
            }),
        }
    }

    pub fn state(&self) -> DeviceState {
        *self.inner.state.lock().expect("device state lock poisoned")
    }

    fn set_state(&self, state: DeviceState) {
        *self.inner.state.lock().expect("device state lock poisoned") = state;
    }

    /// Blocking init; may take 50-5000ms on real hardware.
    pub fn initialize(&self, config: &EngineConfig) -> Result<()> {
        config.validate()?;
        self.inner
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .initialize(config)?;
        self.set_state(DeviceState::Initialized);
        info!("Audio device initialized");
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.inner
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .start()?;
        self.set_state(DeviceState::Started);
        Ok(())
    }

    /// Blocking stop; bounded at ~2s on real hardware.
    pub fn stop(&self) -> Result<()> {
        self.inner
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .stop()?;
        self.set_state(DeviceState::Stopped);
        Ok(())
    }

    pub fn send_frames(&self, samples: &[f32]) -> Result<()> {
        self.inner
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .send_frames(samples);
        Ok(())
    }

    pub fn receive_frames(&self, out: &mut [f32]) -> Result<usize> {
        Ok(self
            .inner
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .receive_frames(out))
    }

    pub fn enumerate_outputs(&self) -> Result<Vec<DeviceInfo>> {
        self.inner
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .enumerate_outputs()
    }

    pub fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>> {
        self.inner
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .enumerate_inputs()
    }

    pub fn dispose(&self) -> Result<()> {
        self.inner
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .dispose();
        self.set_state(DeviceState::Disposed);
        Ok(())
    }

    /// Async wrapper: initialization on a blocking worker.
    pub async fn initialize_async(&self, config: EngineConfig) -> Result<()> {
        let device = self.clone();
        tokio::task::spawn_blocking(move || device.initialize(&config)).await?
    }

    /// Async wrapper: stop on a blocking worker.
    pub async fn stop_async(&self) -> Result<()> {
        let device = self.clone();
        tokio::task::spawn_blocking(move || device.stop()).await?
    }

    /// Async wrapper: device enumeration on a blocking worker.
    pub async fn enumerate_outputs_async(&self) -> Result<Vec<DeviceInfo>> {
        let device = self.clone();
        tokio::task::spawn_blocking(move || device.enumerate_outputs()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_counts_samples() {
        let mut sink = NullSink::new(512);
        sink.send_frames(&[0.0; 1024]);
        assert_eq!(sink.samples_accepted(), 1024);
        assert_eq!(sink.try_send_frames(&[0.0; 8]).unwrap(), 8);
    }

    #[test]
    fn test_buffer_sink_captures() {
        let mut sink = BufferSink::new(512);
        let captured = sink.captured();
        sink.send_frames(&[0.25, -0.25]);
        assert_eq!(*captured.lock().unwrap(), vec![0.25, -0.25]);
    }

    #[test]
    fn test_device_lifecycle_states() {
        let device = AudioDevice::new(Box::new(NullSink::new(512)));
        assert_eq!(device.state(), DeviceState::Created);

        device.initialize(&EngineConfig::default()).unwrap();
        assert_eq!(device.state(), DeviceState::Initialized);

        device.start().unwrap();
        assert_eq!(device.state(), DeviceState::Started);

        device.stop().unwrap();
        assert_eq!(device.state(), DeviceState::Stopped);

        device.dispose().unwrap();
        assert_eq!(device.state(), DeviceState::Disposed);
    }

    #[test]
    fn test_device_rejects_invalid_config() {
        let device = AudioDevice::new(Box::new(NullSink::new(512)));
        let mut config = EngineConfig::default();
        config.channels = 0;
        assert!(device.initialize(&config).is_err());
    }

    #[tokio::test]
    async fn test_async_wrappers_delegate() {
        let device = Arc::new(AudioDevice::new(Box::new(NullSink::new(512))));
        device
            .initialize_async(EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(device.state(), DeviceState::Initialized);

        let outputs = device.enumerate_outputs_async().await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "null");

        device.stop_async().await.unwrap();
        assert_eq!(device.state(), DeviceState::Stopped);
    }
}
