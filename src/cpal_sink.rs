use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam::channel::{bounded, Sender};
use log::{error, info, warn};
use ringbuf::{HeapRb, traits::*};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::sink::{AudioSink, DeviceInfo};

/// Maximum time `send_frames` will wait for the device to drain before
/// dropping the remainder (covers a stalled or never-started stream).
const SEND_STALL_LIMIT: Duration = Duration::from_millis(500);

enum HostCommand {
    Start,
    Stop,
    Shutdown,
}

/// cpal-backed output/capture sink.
///
/// cpal streams are not `Send`, so they live on a dedicated host thread for
/// the sink's whole lifetime; this type only holds the lock-free ring halves
/// and a command channel, which keeps it movable onto the mixer thread. The
/// render callback pops from the output ring and zero-fills shortfalls; the
/// capture callback pushes into the input ring and drops on overflow.
pub struct CpalSink {
    frames_per_buffer: usize,
    channels: usize,
    output_producer: Option<ringbuf::HeapProd<f32>>,
    input_consumer: Option<ringbuf::HeapCons<f32>>,
    commands: Option<Sender<HostCommand>>,
    host_thread: Option<JoinHandle<()>>,
    callback_underruns: Arc<AtomicU64>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            frames_per_buffer: 512,
            channels: 2,
            output_producer: None,
            input_consumer: None,
            commands: None,
            host_thread: None,
            callback_underruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Underruns observed by the device render callback.
    pub fn callback_underruns(&self) -> u64 {
        self.callback_underruns.load(Ordering::Relaxed)
    }

    fn describe(device: &cpal::Device, is_default: bool) -> DeviceInfo {
        let (max_channels, default_sample_rate) = device
            .default_output_config()
            .or_else(|_| {
                device
                    .default_input_config()
            })
            .map(|c| (c.channels(), c.sample_rate().0))
            .unwrap_or((2, 48000));

        DeviceInfo {
            name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
            is_default,
            max_channels,
            default_sample_rate,
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalSink {
    fn initialize(&mut self, config: &EngineConfig) -> Result<()> {
        if self.host_thread.is_some() {
            return Err(anyhow!("Sink already initialized"));
        }

        info!(
            "Initializing cpal sink: {} Hz, {} ch, {} frames/buffer",
            config.sample_rate, config.channels, config.frames_per_buffer
        );

        self.frames_per_buffer = config.frames_per_buffer;
        self.channels = config.channels as usize;

        // Output ring holds several device buffers so a late mixer cycle
        // doesn't immediately starve the callback.
        let out_capacity = config.samples_per_buffer() * 8;
        let output_rb = HeapRb::<f32>::new(out_capacity);
        let (output_producer, mut output_consumer) = output_rb.split();

        let in_capacity = config.samples_per_buffer() * 8;
        let input_rb = HeapRb::<f32>::new(in_capacity);
        let (mut input_producer, input_consumer) = input_rb.split();

        self.output_producer = Some(output_producer);
        self.input_consumer = Some(input_consumer);

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: SampleRate(config.sample_rate),
            buffer_size: BufferSize::Fixed(config.frames_per_buffer as u32),
        };

        let (command_tx, command_rx) = bounded::<HostCommand>(4);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);
        let underruns = Arc::clone(&self.callback_underruns);

        let host_thread = std::thread::Builder::new()
            .name("cpal-sink-host".to_string())
            .spawn(move || {
                let host = cpal::default_host();

                let output_device = match host.default_output_device() {
                    Some(device) => device,
                    None => {
                        let _ = ready_tx.send(Err("No default output device available".into()));
                        return;
                    }
                };

                let output_stream = match output_device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let popped = output_consumer.pop_slice(data);
                        if popped < data.len() {
                            data[popped..].fill(0.0);
                            underruns.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    |err| {
                        error!("Audio output stream error: {}", err);
                    },
                    None,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Failed to build output stream: {}", e)));
                        return;
                    }
                };

                // Capture is best-effort: missing input hardware is not fatal.
                let input_stream = host.default_input_device().and_then(|device| {
                    device
                        .build_input_stream(
                            &stream_config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                let _ = input_producer.push_slice(data);
                            },
                            |err| {
                                error!("Audio input stream error: {}", err);
                            },
                            None,
                        )
                        .map_err(|e| warn!("No capture stream: {}", e))
                        .ok()
                });

                let _ = ready_tx.send(Ok(()));

                while let Ok(command) = command_rx.recv() {
                    match command {
                        HostCommand::Start => {
                            if let Err(e) = output_stream.play() {
                                error!("Failed to start output stream: {}", e);
                            }
                            if let Some(input) = &input_stream {
                                if let Err(e) = input.play() {
                                    warn!("Failed to start capture stream: {}", e);
                                }
                            }
                        }
                        HostCommand::Stop => {
                            if let Err(e) = output_stream.pause() {
                                warn!("Failed to pause output stream: {}", e);
                            }
                            if let Some(input) = &input_stream {
                                let _ = input.pause();
                            }
                        }
                        HostCommand::Shutdown => break,
                    }
                }
                // Streams drop here, on the thread that created them.
            })
            .map_err(|e| anyhow!("Failed to spawn sink host thread: {}", e))?;

        self.host_thread = Some(host_thread);
        self.commands = Some(command_tx);

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(anyhow!(message)),
            Err(_) => Err(anyhow!("Timed out waiting for audio host thread")),
        }
    }

    fn start(&mut self) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| anyhow!("Sink not initialized"))?
            .send(HostCommand::Start)
            .map_err(|_| anyhow!("Audio host thread is gone"))
    }

    fn stop(&mut self) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| anyhow!("Sink not initialized"))?
            .send(HostCommand::Stop)
            .map_err(|_| anyhow!("Audio host thread is gone"))
    }

    fn send_frames(&mut self, samples: &[f32]) {
        let Some(producer) = self.output_producer.as_mut() else {
            return;
        };

        let mut offset = 0;
        let deadline = Instant::now() + SEND_STALL_LIMIT;
        while offset < samples.len() {
            let pushed = producer.push_slice(&samples[offset..]);
            offset += pushed;
            if offset < samples.len() {
                if Instant::now() >= deadline {
                    warn!(
                        "Sink stalled, dropping {} samples",
                        samples.len() - offset
                    );
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn try_send_frames(&mut self, samples: &[f32]) -> Result<usize> {
        let producer = self
            .output_producer
            .as_mut()
            .ok_or_else(|| anyhow!("Sink not initialized"))?;
        Ok(producer.push_slice(samples))
    }

    fn receive_frames(&mut self, out: &mut [f32]) -> usize {
        match self.input_consumer.as_mut() {
            Some(consumer) => consumer.pop_slice(out),
            None => 0,
        }
    }

    fn enumerate_outputs(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host
            .default_output_device()
            .and_then(|d| d.name().ok());

        let devices = host
            .output_devices()
            .map_err(|e| anyhow!("Failed to enumerate output devices: {}", e))?;

        Ok(devices
            .map(|device| {
                let is_default = default_name.as_deref() == device.name().ok().as_deref();
                Self::describe(&device, is_default)
            })
            .collect())
    }

    fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let devices = host
            .input_devices()
            .map_err(|e| anyhow!("Failed to enumerate input devices: {}", e))?;

        Ok(devices
            .map(|device| {
                let is_default = default_name.as_deref() == device.name().ok().as_deref();
                Self::describe(&device, is_default)
            })
            .collect())
    }

    fn default_output(&self) -> Option<DeviceInfo> {
        let host = cpal::default_host();
        host.default_output_device()
            .map(|device| Self::describe(&device, true))
    }

    fn default_input(&self) -> Option<DeviceInfo> {
        let host = cpal::default_host();
        host.default_input_device()
            .map(|device| Self::describe(&device, true))
    }

    fn frames_per_buffer(&self) -> usize {
        self.frames_per_buffer
    }

    fn dispose(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(HostCommand::Shutdown);
        }
        if let Some(handle) = self.host_thread.take() {
            if handle.join().is_err() {
                error!("Audio host thread panicked during shutdown");
            }
        }
        self.output_producer = None;
        self.input_consumer = None;
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.dispose();
    }
}
