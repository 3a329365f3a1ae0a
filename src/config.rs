use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use anyhow::{Result, Context, anyhow};
use log::{info, warn, error};

/// Engine audio configuration. Immutable after the engine is constructed;
/// every collaborator receives a copy at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Audio sample rate in Hz (default: 48kHz)
    pub sample_rate: u32,
    /// Channel count (default: stereo)
    pub channels: u16,
    /// Frames delivered per mixer cycle (default: 512)
    pub frames_per_buffer: usize,
    /// Hard cap on concurrently attached sources
    pub max_sources: usize,
    /// Drift tolerance for clock-attached sources, in frames (~10ms at 48kHz)
    pub drift_tolerance_frames: u64,
    /// Ring buffer sizing factor in units of frames_per_buffer (minimum 2)
    pub ring_buffer_factor: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            frames_per_buffer: 512,
            max_sources: 16,
            drift_tolerance_frames: 512,
            ring_buffer_factor: 4,
        }
    }
}

impl EngineConfig {
    /// Interleaved samples in one mixer buffer (all channels).
    pub fn samples_per_buffer(&self) -> usize {
        self.frames_per_buffer * self.channels as usize
    }

    /// Per-source ring buffer capacity in samples.
    pub fn ring_buffer_capacity(&self) -> usize {
        self.samples_per_buffer() * self.ring_buffer_factor
    }

    /// One buffer's duration.
    pub fn buffer_duration_secs(&self) -> f64 {
        self.frames_per_buffer as f64 / self.sample_rate as f64
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate < 8000 || self.sample_rate > 192000 {
            return Err(anyhow!("Sample rate must be between 8kHz and 192kHz"));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(anyhow!("Channels must be between 1 and 8"));
        }
        if self.frames_per_buffer < 32 || self.frames_per_buffer > 16384 {
            return Err(anyhow!("Frames per buffer must be between 32 and 16384"));
        }
        if self.max_sources == 0 || self.max_sources > 256 {
            return Err(anyhow!("Max sources must be between 1 and 256"));
        }
        if self.ring_buffer_factor < 2 {
            return Err(anyhow!("Ring buffer factor must be at least 2"));
        }
        Ok(())
    }
}

/// Loads and saves an [`EngineConfig`] under the platform config directory.
///
/// The engine itself never reads from disk; this is a convenience for hosts
/// that want their last-used settings back.
pub struct ConfigManager {
    config_path: PathBuf,
    config: EngineConfig,
}

impl ConfigManager {
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config_path: PathBuf::from("mixr_config.toml"),
            config,
        }
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn get_config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save_config()
    }

    pub fn save_config(&self) -> Result<()> {
        let config_str = toml::to_string_pretty(&self.config)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        fs::write(&self.config_path, config_str)
            .context("Failed to write configuration file")?;

        info!("Configuration saved to: {:?}", self.config_path);
        Ok(())
    }

    fn load_or_create_config(config_path: &PathBuf) -> Result<EngineConfig> {
        if config_path.exists() {
            info!("Loading configuration from: {:?}", config_path);
            let config_str = fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;

            match toml::from_str::<EngineConfig>(&config_str) {
                Ok(config) => {
                    if let Err(e) = config.validate() {
                        warn!("Configuration file invalid: {}. Using defaults.", e);
                        return Ok(EngineConfig::default());
                    }
                    info!("Configuration loaded successfully");
                    Ok(config)
                }
                Err(e) => {
                    warn!("Failed to parse configuration file: {}. Using defaults.", e);
                    let default_config = EngineConfig::default();
                    if let Err(save_err) = Self::save_config_to_path(&default_config, config_path) {
                        error!("Failed to save default configuration: {}", save_err);
                    }
                    Ok(default_config)
                }
            }
        } else {
            info!("No configuration file found. Creating default configuration.");
            let default_config = EngineConfig::default();

            Self::save_config_to_path(&default_config, config_path)?;

            Ok(default_config)
        }
    }

    fn save_config_to_path(config: &EngineConfig, path: &PathBuf) -> Result<()> {
        let config_str = toml::to_string_pretty(config)
            .context("Failed to serialize default configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        fs::write(path, config_str)
            .context("Failed to write default configuration file")?;

        info!("Default configuration saved to: {:?}", path);
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("mixr")
        } else {
            let home_dir = dirs::home_dir()
                .context("Could not determine home directory")?;
            home_dir.join(".mixr")
        };

        Ok(config_dir.join("config.toml"))
    }
}
