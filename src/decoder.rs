use crate::error::{EngineError, EngineResult};
use crate::frame_pool::{FramePool, PooledFrame};

/// Stream properties reported by a decoder before playback starts.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub channels: u16,
    pub sample_rate: u32,
    /// Total duration in seconds.
    pub duration: f64,
    /// Bit depth of the underlying stream (informational; payloads are f32).
    pub bit_depth: u16,
}

impl StreamInfo {
    pub fn duration_frames(&self) -> u64 {
        (self.duration * self.sample_rate as f64).round() as u64
    }
}

/// Outcome of a raw read into a caller-provided byte buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameReadStatus {
    /// Whole frames (one sample per channel) written into the buffer.
    pub frames_read: usize,
    pub is_eof: bool,
}

/// Outcome of a pooled decode step.
#[derive(Debug)]
pub enum FrameResult {
    /// A frame with at least one sample of payload.
    Frame(PooledFrame),
    EndOfStream,
}

/// A decoded-audio producer. Concrete codecs live outside the engine; the
/// engine only requires interleaved f32 frames at the decoder's native rate
/// and channel count (or at a target the decoder resamples to internally).
///
/// Decoders are driven from a single decode thread; implementations need
/// `Send` but not `Sync`.
pub trait FrameDecoder: Send {
    fn stream_info(&self) -> StreamInfo;

    /// Fill `buffer` with as many whole interleaved f32 frames as fit.
    /// A short count with `is_eof: false` is legal (e.g. packet boundaries).
    fn read_frames(&mut self, buffer: &mut [u8]) -> EngineResult<FrameReadStatus>;

    /// Reposition to `position` seconds from the start.
    fn try_seek(&mut self, position: f64) -> EngineResult<()>;

    /// Release decoder resources. Called once; reads after this are invalid.
    fn dispose(&mut self) {}

    /// Decode up to `frames` frames into a pooled buffer stamped `pts`.
    fn decode_next_frame(
        &mut self,
        pool: &FramePool,
        frames: usize,
        pts: f64,
    ) -> EngineResult<FrameResult> {
        let info = self.stream_info();
        let bytes_per_frame = info.channels as usize * std::mem::size_of::<f32>();
        let mut frame = pool.rent(pts, frames * bytes_per_frame);

        let status = match self.read_frames(frame.bytes_mut()) {
            Ok(status) => status,
            Err(e) => {
                pool.give_back(frame);
                return Err(e);
            }
        };

        if status.frames_read == 0 {
            pool.give_back(frame);
            return Ok(FrameResult::EndOfStream);
        }

        frame.truncate_samples(status.frames_read * info.channels as usize);
        Ok(FrameResult::Frame(frame))
    }
}

/// Deterministic sine-tone decoder for demos and tests.
pub struct SineDecoder {
    frequency: f64,
    amplitude: f32,
    sample_rate: u32,
    channels: u16,
    duration: f64,
    position_frames: u64,
}

impl SineDecoder {
    pub fn new(frequency: f64, duration: f64, sample_rate: u32, channels: u16) -> Self {
        Self {
            frequency,
            amplitude: 1.0,
            sample_rate,
            channels,
            duration,
            position_frames: 0,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    fn total_frames(&self) -> u64 {
        (self.duration * self.sample_rate as f64).round() as u64
    }
}

impl FrameDecoder for SineDecoder {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            channels: self.channels,
            sample_rate: self.sample_rate,
            duration: self.duration,
            bit_depth: 32,
        }
    }

    fn read_frames(&mut self, buffer: &mut [u8]) -> EngineResult<FrameReadStatus> {
        let bytes_per_frame = self.channels as usize * 4;
        let want = buffer.len() / bytes_per_frame;
        let remaining = self.total_frames().saturating_sub(self.position_frames) as usize;
        let frames = want.min(remaining);

        let omega = 2.0 * std::f64::consts::PI * self.frequency / self.sample_rate as f64;
        for i in 0..frames {
            let t = (self.position_frames + i as u64) as f64;
            let sample = (self.amplitude as f64 * (omega * t).sin()) as f32;
            for ch in 0..self.channels as usize {
                let off = (i * self.channels as usize + ch) * 4;
                buffer[off..off + 4].copy_from_slice(&sample.to_le_bytes());
            }
        }

        self.position_frames += frames as u64;
        Ok(FrameReadStatus {
            frames_read: frames,
            is_eof: self.position_frames >= self.total_frames(),
        })
    }

    fn try_seek(&mut self, position: f64) -> EngineResult<()> {
        if position < 0.0 || position > self.duration {
            return Err(EngineError::SeekOutOfRange {
                requested: position,
                duration: self.duration,
            });
        }
        self.position_frames = (position * self.sample_rate as f64).round() as u64;
        Ok(())
    }
}

/// Decoder producing silence; handy for clock-only tracks and tests.
pub struct SilenceDecoder {
    sample_rate: u32,
    channels: u16,
    duration: f64,
    position_frames: u64,
}

impl SilenceDecoder {
    pub fn new(duration: f64, sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            duration,
            position_frames: 0,
        }
    }

    fn total_frames(&self) -> u64 {
        (self.duration * self.sample_rate as f64).round() as u64
    }
}

impl FrameDecoder for SilenceDecoder {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            channels: self.channels,
            sample_rate: self.sample_rate,
            duration: self.duration,
            bit_depth: 32,
        }
    }

    fn read_frames(&mut self, buffer: &mut [u8]) -> EngineResult<FrameReadStatus> {
        let bytes_per_frame = self.channels as usize * 4;
        let want = buffer.len() / bytes_per_frame;
        let remaining = self.total_frames().saturating_sub(self.position_frames) as usize;
        let frames = want.min(remaining);

        buffer[..frames * bytes_per_frame].fill(0);
        self.position_frames += frames as u64;
        Ok(FrameReadStatus {
            frames_read: frames,
            is_eof: self.position_frames >= self.total_frames(),
        })
    }

    fn try_seek(&mut self, position: f64) -> EngineResult<()> {
        if position < 0.0 || position > self.duration {
            return Err(EngineError::SeekOutOfRange {
                requested: position,
                duration: self.duration,
            });
        }
        self.position_frames = (position * self.sample_rate as f64).round() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_decoder_reports_duration() {
        let dec = SineDecoder::new(440.0, 1.0, 48000, 2);
        let info = dec.stream_info();
        assert_eq!(info.duration_frames(), 48000);
        assert_eq!(info.channels, 2);
    }

    #[test]
    fn test_sine_decoder_reads_until_eof() {
        let mut dec = SineDecoder::new(440.0, 0.01, 48000, 1);
        let mut buf = vec![0u8; 480 * 4];

        let status = dec.read_frames(&mut buf).unwrap();
        assert_eq!(status.frames_read, 480);
        assert!(status.is_eof);

        let status = dec.read_frames(&mut buf).unwrap();
        assert_eq!(status.frames_read, 0);
        assert!(status.is_eof);
    }

    #[test]
    fn test_sine_decoder_channels_carry_same_sample() {
        let mut dec = SineDecoder::new(1000.0, 0.01, 48000, 2);
        let mut buf = vec![0u8; 16 * 2 * 4];
        dec.read_frames(&mut buf).unwrap();

        for frame in buf.chunks_exact(8) {
            let left = f32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let right = f32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            assert_eq!(left, right);
        }
    }

    #[test]
    fn test_seek_validates_range() {
        let mut dec = SineDecoder::new(440.0, 1.0, 48000, 2);
        assert!(dec.try_seek(0.0).is_ok());
        assert!(dec.try_seek(1.0).is_ok());
        assert!(dec.try_seek(-0.1).is_err());
        assert!(dec.try_seek(1.1).is_err());
    }

    #[test]
    fn test_decode_next_frame_returns_pooled_payload() {
        let pool = FramePool::new(4096, 4);
        let mut dec = SineDecoder::new(440.0, 1.0, 48000, 2);

        match dec.decode_next_frame(&pool, 256, 0.0).unwrap() {
            FrameResult::Frame(frame) => {
                assert_eq!(frame.sample_count(), 512);
                pool.give_back(frame);
            }
            FrameResult::EndOfStream => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_silence_decoder_is_silent() {
        let pool = FramePool::new(4096, 2);
        let mut dec = SilenceDecoder::new(0.5, 48000, 2);
        match dec.decode_next_frame(&pool, 128, 0.0).unwrap() {
            FrameResult::Frame(frame) => {
                let mut samples = Vec::new();
                frame.copy_samples_into(&mut samples);
                assert!(samples.iter().all(|&s| s == 0.0));
            }
            FrameResult::EndOfStream => panic!("expected a frame"),
        }
    }
}
