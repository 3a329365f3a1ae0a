use anyhow::{Result, anyhow};
use log::{error, info, warn};
use ringbuf::{HeapRb, traits::*};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::sink::AudioSink;
use crate::source::join_worker;

/// Adapts a blocking [`AudioSink`] to a lock-free producer API.
///
/// `push` writes into an SPSC ring sized for several device buffers and
/// returns immediately with the accepted count; a dedicated pump thread
/// drains the ring into the sink's blocking `send_frames`. When the ring is
/// empty the pump sleeps a small fraction of a buffer period rather than
/// spinning.
pub struct SinkPump {
    producer: ringbuf::HeapProd<f32>,
    should_stop: Arc<AtomicBool>,
    pump_thread: Option<JoinHandle<()>>,
    pushed_samples: Arc<AtomicU64>,
    pumped_samples: Arc<AtomicU64>,
}

impl SinkPump {
    /// Take ownership of an initialized sink and start pumping.
    pub fn start(mut sink: Box<dyn AudioSink>, config: &EngineConfig) -> Result<Self> {
        // At least two device buffers of slack, per the adapter contract;
        // four keeps a late producer from back-to-back overflows.
        let capacity = config.samples_per_buffer() * 4;
        let ring = HeapRb::<f32>::new(capacity);
        let (producer, mut consumer) = ring.split();

        let should_stop = Arc::new(AtomicBool::new(false));
        let pushed_samples = Arc::new(AtomicU64::new(0));
        let pumped_samples = Arc::new(AtomicU64::new(0));

        let idle_sleep = Duration::from_secs_f64(config.buffer_duration_secs() / 4.0);
        let chunk = config.samples_per_buffer();

        let thread_stop = Arc::clone(&should_stop);
        let thread_pumped = Arc::clone(&pumped_samples);

        let pump_thread = thread::Builder::new()
            .name("sink-pump".to_string())
            .spawn(move || {
                info!("Sink pump thread started");
                let mut scratch = vec![0.0f32; chunk];

                while !thread_stop.load(Ordering::Relaxed) {
                    let popped = consumer.pop_slice(&mut scratch);
                    if popped == 0 {
                        thread::sleep(idle_sleep);
                        continue;
                    }
                    sink.send_frames(&scratch[..popped]);
                    thread_pumped.fetch_add(popped as u64, Ordering::Relaxed);
                }

                // Drain what producers managed to push before the stop flag.
                let popped = consumer.pop_slice(&mut scratch);
                if popped > 0 {
                    sink.send_frames(&scratch[..popped]);
                    thread_pumped.fetch_add(popped as u64, Ordering::Relaxed);
                }
                sink.dispose();
                info!("Sink pump thread stopped");
            })
            .map_err(|e| anyhow!("Failed to spawn pump thread: {}", e))?;

        Ok(Self {
            producer,
            should_stop,
            pump_thread: Some(pump_thread),
            pushed_samples,
            pumped_samples,
        })
    }

    /// Non-blocking write; returns how many samples were accepted. A short
    /// count means the pump is falling behind the producer.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let pushed = self.producer.push_slice(samples);
        self.pushed_samples
            .fetch_add(pushed as u64, Ordering::Relaxed);
        if pushed < samples.len() {
            warn!(
                "Sink pump overflow: dropped {} samples",
                samples.len() - pushed
            );
        }
        pushed
    }

    pub fn pushed_samples(&self) -> u64 {
        self.pushed_samples.load(Ordering::Relaxed)
    }

    pub fn pumped_samples(&self) -> u64 {
        self.pumped_samples.load(Ordering::Relaxed)
    }

    /// Stop the pump thread, waiting up to 2 seconds for it to drain.
    pub fn stop(&mut self) -> Result<()> {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.pump_thread.take() {
            if let Err(e) = join_worker(handle, Duration::from_secs(2), "sink-pump") {
                error!("{}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

impl Drop for SinkPump {
    fn drop(&mut self) {
        if self.pump_thread.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferSink;

    #[test]
    fn test_pump_delivers_pushed_samples() {
        let config = EngineConfig::default();
        let sink = BufferSink::new(config.frames_per_buffer);
        let captured = sink.captured();

        let mut pump = SinkPump::start(Box::new(sink), &config).unwrap();

        let payload: Vec<f32> = (0..512).map(|i| i as f32).collect();
        let mut offset = 0;
        while offset < payload.len() {
            offset += pump.push(&payload[offset..]);
            thread::sleep(Duration::from_millis(1));
        }

        // Wait for the pump thread to drain the ring.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pump.pumped_samples() < 512 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        pump.stop().unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 512);
        assert_eq!(captured[0], 0.0);
        assert_eq!(captured[511], 511.0);
    }

    #[test]
    fn test_push_reports_short_count_on_overflow() {
        let mut config = EngineConfig::default();
        config.frames_per_buffer = 32;
        config.channels = 1;

        let sink = BufferSink::new(config.frames_per_buffer);
        let mut pump = SinkPump::start(Box::new(sink), &config).unwrap();

        // Capacity is 128 samples; pushing far more must come up short on
        // some call rather than blocking.
        let payload = vec![0.5f32; 4096];
        let accepted = pump.push(&payload);
        assert!(accepted <= 128);

        pump.stop().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_enough() {
        let config = EngineConfig::default();
        let sink = BufferSink::new(config.frames_per_buffer);
        let mut pump = SinkPump::start(Box::new(sink), &config).unwrap();
        pump.stop().unwrap();
        pump.stop().unwrap();
    }
}
