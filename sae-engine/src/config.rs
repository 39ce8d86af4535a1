//! Engine settings for sae-engine
//!
//! Static settings for the lifetime of an engine process. Per-session audio
//! configuration (buffer time, effects, crossfade) is separate and arrives
//! through `configure` actions; see [`sae_common::config`].
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments
//! 2. Environment variables (`SAE_*`)
//! 3. TOML settings file
//! 4. Built-in defaults (code constants)

use crate::dsp::resampler::ResamplerQuality;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Highest supported output channel count
pub const MAX_OUTPUT_CHANNELS: u16 = 8;

/// Engine settings loaded from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Device sample rate every buffer is resampled to
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Device channel count every buffer is mixed to
    #[serde(default = "default_output_channels")]
    pub output_channels: u16,

    /// Quality used for every resampler this engine acquires
    #[serde(default)]
    pub resampler_quality: ResamplerQuality,

    /// Cap on buffers a non-active source may produce per drain
    #[serde(default = "default_max_background_buffers")]
    pub max_background_buffers: usize,

    /// Per-key resampler allocation count above which a leak warning is logged
    #[serde(default = "default_leak_threshold")]
    pub leak_threshold: usize,

    /// Folder that file references are resolved against
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_output_sample_rate() -> u32 {
    48000
}

fn default_output_channels() -> u16 {
    2
}

fn default_max_background_buffers() -> usize {
    8
}

fn default_leak_threshold() -> usize {
    4
}

fn default_log_filter() -> String {
    "sae_engine=info,sae_common=info".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output_sample_rate: default_output_sample_rate(),
            output_channels: default_output_channels(),
            resampler_quality: ResamplerQuality::default(),
            max_background_buffers: default_max_background_buffers(),
            leak_threshold: default_leak_threshold(),
            root_folder: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineSettings {
    /// Parse and validate settings from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: EngineSettings = toml::from_str(text)
            .map_err(|e| Error::Config(format!("Invalid settings file: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    ///
    /// # Errors
    /// - File cannot be read
    /// - TOML is malformed or contains unknown keys
    /// - A value is out of range
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read settings file {}: {}", path.display(), e))
        })?;
        let settings = Self::from_toml_str(&text)?;
        info!("Loaded engine settings from {}", path.display());
        Ok(settings)
    }

    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<()> {
        if self.output_sample_rate == 0 {
            return Err(Error::Config("output_sample_rate must be non-zero".to_string()));
        }
        if self.output_channels == 0 || self.output_channels > MAX_OUTPUT_CHANNELS {
            return Err(Error::Config(format!(
                "output_channels must be between 1 and {}, got {}",
                MAX_OUTPUT_CHANNELS, self.output_channels
            )));
        }
        if self.max_background_buffers == 0 {
            return Err(Error::Config("max_background_buffers must be non-zero".to_string()));
        }
        if self.leak_threshold == 0 {
            return Err(Error::Config("leak_threshold must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::from_toml_str("").unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.output_sample_rate, 48000);
        assert_eq!(settings.output_channels, 2);
        assert_eq!(settings.leak_threshold, 4);
    }

    #[test]
    fn test_partial_override() {
        let settings = EngineSettings::from_toml_str(
            r#"
            output_sample_rate = 44100
            resampler_quality = "best"

            [logging]
            filter = "sae_engine=debug"
            "#,
        )
        .unwrap();
        assert_eq!(settings.output_sample_rate, 44100);
        assert_eq!(settings.resampler_quality, ResamplerQuality::Best);
        assert_eq!(settings.output_channels, 2);
        assert_eq!(settings.logging.filter, "sae_engine=debug");
    }

    #[test]
    fn test_invalid_values() {
        assert!(EngineSettings::from_toml_str("output_channels = 0").is_err());
        assert!(EngineSettings::from_toml_str("output_channels = 9").is_err());
        assert!(EngineSettings::from_toml_str("output_sample_rate = 0").is_err());
        assert!(EngineSettings::from_toml_str("max_background_buffers = 0").is_err());
        assert!(EngineSettings::from_toml_str("port = 80").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "output_channels = 1").unwrap();
        let settings = EngineSettings::load(file.path()).unwrap();
        assert_eq!(settings.output_channels, 1);

        let missing = EngineSettings::load(Path::new("/nonexistent/sae.toml"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
