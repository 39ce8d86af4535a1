//! Audio configuration and validation
//!
//! The configuration lives for the lifetime of an engine and is mutated only
//! through `configure`. Every update is validated in full against a candidate
//! copy before it replaces the current configuration, so a rejected update
//! never partially applies.

use crate::effects::{validate_effects, EffectSpec};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shortest accepted buffer duration
pub const MIN_BUFFER_TIME_SECONDS: f64 = 0.4;

/// Longest accepted buffer duration
pub const MAX_BUFFER_TIME_SECONDS: f64 = 1.2;

/// Buffer durations must be a multiple of this step
pub const BUFFER_TIME_STEP_SECONDS: f64 = 0.1;

/// Longest accepted crossfade
pub const MAX_CROSSFADE_SECONDS: f64 = 5.0;

const STEP_TOLERANCE: f64 = 1e-9;

/// Keys accepted by `configure`
pub const CONFIGURATION_KEYS: [&str; 5] = [
    "bufferTimeSeconds",
    "loudnessNormalization",
    "silenceTrimming",
    "crossfadeDurationSeconds",
    "effects",
];

/// Current audio configuration of one engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    buffer_time_seconds: Option<f64>,
    /// Normalize each buffer toward the reference loudness
    pub loudness_normalization: bool,
    /// Skip leading silent buffers after load and seek
    pub silence_trimming: bool,
    /// Overlap between outgoing and incoming tracks, 0 disables crossfade
    pub crossfade_duration_seconds: f64,
    /// Filter stages after resample and channel mix
    pub effects: Vec<EffectSpec>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            buffer_time_seconds: None,
            loudness_normalization: true,
            silence_trimming: false,
            crossfade_duration_seconds: 0.0,
            effects: Vec::new(),
        }
    }
}

impl Configuration {
    /// Configured buffer duration in seconds
    ///
    /// # Errors
    /// Returns `Error::Config` if no buffer time has been configured yet
    pub fn buffer_time_seconds(&self) -> Result<f64> {
        self.buffer_time_seconds
            .ok_or_else(|| Error::Config("buffer time not set".to_string()))
    }

    /// Validate and apply a partial update
    ///
    /// All keys are checked before anything changes. On error the current
    /// configuration is left exactly as it was.
    pub fn apply(&mut self, update: ConfigurationUpdate) -> Result<()> {
        let mut candidate = self.clone();

        if let Some(buffer_time) = update.buffer_time_seconds {
            validate_buffer_time(buffer_time)?;
            candidate.buffer_time_seconds = Some(buffer_time);
        }
        if let Some(enabled) = update.loudness_normalization {
            candidate.loudness_normalization = enabled;
        }
        if let Some(enabled) = update.silence_trimming {
            candidate.silence_trimming = enabled;
        }
        if let Some(crossfade) = update.crossfade_duration_seconds {
            validate_crossfade(crossfade)?;
            candidate.crossfade_duration_seconds = crossfade;
        }
        if let Some(effects) = update.effects {
            validate_effects(&effects)?;
            candidate.effects = effects;
        }

        *self = candidate;
        Ok(())
    }

    /// Number of buffers needed to cover the crossfade at the configured buffer time
    pub fn crossfade_buffer_count(&self) -> Result<usize> {
        let buffer_time = self.buffer_time_seconds()?;
        if self.crossfade_duration_seconds <= 0.0 {
            return Ok(0);
        }
        Ok((self.crossfade_duration_seconds / buffer_time - STEP_TOLERANCE).ceil() as usize)
    }
}

/// Partial configuration carried by a `configure` action
///
/// Absent keys leave the current value untouched. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigurationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_time_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loudness_normalization: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silence_trimming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crossfade_duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects: Option<Vec<EffectSpec>>,
}

impl ConfigurationUpdate {
    /// Parse a raw `configure` payload
    ///
    /// # Errors
    /// Returns `Error::Config` naming the first unknown key, or describing the
    /// first value of the wrong type.
    pub fn from_json(map: Map<String, Value>) -> Result<Self> {
        if let Some(key) = map.keys().find(|k| !CONFIGURATION_KEYS.contains(&k.as_str())) {
            return Err(Error::Config(format!("Unknown configuration key: {}", key)));
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::Config(format!("Invalid configuration value: {}", e)))
    }

    /// Update that only sets the buffer time
    pub fn with_buffer_time(buffer_time_seconds: f64) -> Self {
        Self {
            buffer_time_seconds: Some(buffer_time_seconds),
            ..Default::default()
        }
    }
}

/// Check a buffer duration: positive, in range, and a multiple of 0.1
pub fn validate_buffer_time(seconds: f64) -> Result<()> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(Error::Config(format!(
            "bufferTimeSeconds must be positive, got {}",
            seconds
        )));
    }
    let steps = seconds / BUFFER_TIME_STEP_SECONDS;
    if (steps - steps.round()).abs() > STEP_TOLERANCE * steps.max(1.0) {
        return Err(Error::Config(format!(
            "bufferTimeSeconds must be a multiple of {}, got {}",
            BUFFER_TIME_STEP_SECONDS, seconds
        )));
    }
    if seconds < MIN_BUFFER_TIME_SECONDS - STEP_TOLERANCE
        || seconds > MAX_BUFFER_TIME_SECONDS + STEP_TOLERANCE
    {
        return Err(Error::Config(format!(
            "bufferTimeSeconds {} outside [{}, {}]",
            seconds, MIN_BUFFER_TIME_SECONDS, MAX_BUFFER_TIME_SECONDS
        )));
    }
    Ok(())
}

/// Check a crossfade duration against `[0, MAX_CROSSFADE_SECONDS]`
pub fn validate_crossfade(seconds: f64) -> Result<()> {
    if !seconds.is_finite() || !(0.0..=MAX_CROSSFADE_SECONDS).contains(&seconds) {
        return Err(Error::Config(format!(
            "crossfadeDurationSeconds {} outside [0, {}]",
            seconds, MAX_CROSSFADE_SECONDS
        )));
    }
    Ok(())
}
