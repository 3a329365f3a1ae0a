use anyhow::Result;
use log::warn;

use crate::config::EngineConfig;

/// A DSP unit on a source or the master bus. Effects process in place and
/// must not allocate in their steady state; `process` is called from the
/// mixing thread with one buffer per cycle.
pub trait AudioEffect: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self, config: &EngineConfig) -> Result<()>;

    /// Transform `frames` interleaved frames in `buffer` in place.
    fn process(&mut self, buffer: &mut [f32], frames: usize) -> Result<()>;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    fn dispose(&mut self) {}
}

/// Ordered effect list. Disabled effects are skipped; a failing effect is
/// logged and skipped for that cycle so the mix is never interrupted.
pub struct EffectChain {
    effects: Vec<Box<dyn AudioEffect>>,
}

impl EffectChain {
    pub fn new() -> Self {
        Self {
            effects: Vec::new(),
        }
    }

    pub fn add(&mut self, effect: Box<dyn AudioEffect>) {
        self.effects.push(effect);
    }

    /// Remove the first effect with this name; returns whether one was found.
    pub fn remove(&mut self, name: &str) -> bool {
        if let Some(index) = self.effects.iter().position(|e| e.name() == name) {
            let mut effect = self.effects.remove(index);
            effect.dispose();
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        for effect in self.effects.iter_mut() {
            effect.dispose();
        }
        self.effects.clear();
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn initialize_all(&mut self, config: &EngineConfig) -> Result<()> {
        for effect in self.effects.iter_mut() {
            effect.initialize(config)?;
        }
        Ok(())
    }

    /// Run every enabled effect in registration order.
    pub fn process_all(&mut self, buffer: &mut [f32], frames: usize) {
        for effect in self.effects.iter_mut() {
            if !effect.is_enabled() {
                continue;
            }
            if let Err(e) = effect.process(buffer, frames) {
                warn!("Effect '{}' failed, skipping this cycle: {}", effect.name(), e);
            }
        }
    }
}

impl Default for EffectChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant gain.
pub struct GainEffect {
    gain: f32,
    enabled: bool,
}

impl GainEffect {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: gain.clamp(0.0, 4.0),
            enabled: true,
        }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 4.0);
    }
}

impl AudioEffect for GainEffect {
    fn name(&self) -> &str {
        "gain"
    }

    fn initialize(&mut self, _config: &EngineConfig) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, buffer: &mut [f32], frames: usize) -> Result<()> {
        let _ = frames;
        crate::simd::scale(buffer, self.gain);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Smooth saturation keeping the master bus inside [-1, 1].
pub struct SoftClipEffect {
    drive: f32,
    enabled: bool,
}

impl SoftClipEffect {
    pub fn new(drive: f32) -> Self {
        Self {
            drive: drive.clamp(0.5, 8.0),
            enabled: true,
        }
    }
}

impl AudioEffect for SoftClipEffect {
    fn name(&self) -> &str {
        "soft_clip"
    }

    fn initialize(&mut self, _config: &EngineConfig) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, buffer: &mut [f32], _frames: usize) -> Result<()> {
        let inv = 1.0 / self.drive.tanh();
        for sample in buffer.iter_mut() {
            *sample = (*sample * self.drive).tanh() * inv;
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Linear fade-in over a fixed duration from the moment playback starts.
pub struct FadeInEffect {
    duration_secs: f32,
    total_frames: u64,
    elapsed_frames: u64,
    channels: usize,
    enabled: bool,
}

impl FadeInEffect {
    pub fn new(duration_secs: f32) -> Self {
        Self {
            duration_secs: duration_secs.max(0.0),
            total_frames: 0,
            elapsed_frames: 0,
            channels: 2,
            enabled: true,
        }
    }

    pub fn reset(&mut self) {
        self.elapsed_frames = 0;
    }
}

impl AudioEffect for FadeInEffect {
    fn name(&self) -> &str {
        "fade_in"
    }

    fn initialize(&mut self, config: &EngineConfig) -> Result<()> {
        self.total_frames = (self.duration_secs as f64 * config.sample_rate as f64) as u64;
        self.channels = config.channels as usize;
        self.elapsed_frames = 0;
        Ok(())
    }

    fn process(&mut self, buffer: &mut [f32], frames: usize) -> Result<()> {
        if self.elapsed_frames >= self.total_frames {
            return Ok(());
        }
        for frame in 0..frames {
            let t = (self.elapsed_frames + frame as u64) as f32;
            let gain = (t / self.total_frames as f32).min(1.0);
            for ch in 0..self.channels {
                let idx = frame * self.channels + ch;
                if idx < buffer.len() {
                    buffer[idx] *= gain;
                }
            }
        }
        self.elapsed_frames += frames as u64;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingEffect;

    impl AudioEffect for FailingEffect {
        fn name(&self) -> &str {
            "failing"
        }
        fn initialize(&mut self, _config: &EngineConfig) -> Result<()> {
            Ok(())
        }
        fn process(&mut self, _buffer: &mut [f32], _frames: usize) -> Result<()> {
            anyhow::bail!("broken effect")
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn set_enabled(&mut self, _enabled: bool) {}
    }

    #[test]
    fn test_gain_effect_scales_buffer() {
        let mut chain = EffectChain::new();
        chain.add(Box::new(GainEffect::new(0.5)));

        let mut buffer = vec![1.0f32; 8];
        chain.process_all(&mut buffer, 4);
        assert!(buffer.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_disabled_effect_is_skipped() {
        let mut gain = GainEffect::new(0.0);
        gain.set_enabled(false);

        let mut chain = EffectChain::new();
        chain.add(Box::new(gain));

        let mut buffer = vec![1.0f32; 4];
        chain.process_all(&mut buffer, 2);
        assert!(buffer.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_failing_effect_does_not_poison_chain() {
        let mut chain = EffectChain::new();
        chain.add(Box::new(FailingEffect));
        chain.add(Box::new(GainEffect::new(2.0)));

        let mut buffer = vec![0.5f32; 4];
        chain.process_all(&mut buffer, 2);
        // The gain effect after the failing one still ran.
        assert!(buffer.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_remove_by_name() {
        let mut chain = EffectChain::new();
        chain.add(Box::new(GainEffect::new(1.0)));
        chain.add(Box::new(SoftClipEffect::new(2.0)));

        assert!(chain.remove("gain"));
        assert!(!chain.remove("gain"));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_soft_clip_bounds_output() {
        let mut clip = SoftClipEffect::new(2.0);
        let mut buffer = vec![3.0f32, -3.0, 0.0, 0.5];
        clip.process(&mut buffer, 2).unwrap();
        assert!(buffer.iter().all(|&s| s.abs() <= 1.0 + 1e-6));
        assert_eq!(buffer[2], 0.0);
    }

    #[test]
    fn test_fade_in_ramps_from_silence() {
        let config = EngineConfig {
            sample_rate: 100,
            channels: 1,
            ..EngineConfig::default()
        };
        let mut fade = FadeInEffect::new(1.0);
        fade.initialize(&config).unwrap();

        let mut buffer = vec![1.0f32; 100];
        fade.process(&mut buffer, 100).unwrap();
        assert_eq!(buffer[0], 0.0);
        assert!(buffer[50] > 0.4 && buffer[50] < 0.6);
        assert!(buffer[99] > 0.98);

        // Fully faded in afterwards.
        let mut buffer = vec![1.0f32; 10];
        fade.process(&mut buffer, 10).unwrap();
        assert!(buffer.iter().all(|&s| s == 1.0));
    }
}
