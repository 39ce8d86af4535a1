//! Loudness normalization and silence detection
//!
//! Measurement is EBU R128 through `ebur128`: K-weighted momentary loudness
//! over 400 ms windows, gated integrated loudness over the last 30 s of
//! history, and the sample peak. Until 3 s of audio have been seen the gain
//! follows a smoothed momentary loudness instead of the integrated value.

use crate::error::{Error, Result};
use ebur128::{EbuR128, Mode};

/// Windows at or below this loudness are treated as silence (LUFS)
pub const SILENCE_THRESHOLD_DB: f64 = -65.0;

/// Loudness every track is normalized towards (LUFS)
pub const REFERENCE_LOUDNESS_DB: f64 = -18.0;

/// Largest boost applied to quiet material (dB)
pub const MAX_GAIN_OFFSET_DB: f64 = 12.0;

/// Momentary window length
pub const WINDOW_SECONDS: f64 = 0.4;

/// History required before integrated loudness is used
pub const INTEGRATED_MIN_SECONDS: f64 = 3.0;

/// Longest history kept for integrated loudness
pub const INTEGRATED_MAX_SECONDS: f64 = 30.0;

/// Analysis result for one buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferLoudness {
    /// Gain reached at the end of the buffer
    pub gain: f32,
    /// Every momentary window was at or below the silence threshold
    pub is_entirely_silent: bool,
}

struct Meter {
    ebur: EbuR128,
    channels: u32,
    sample_rate: u32,
    frames_added: u64,
}

/// Per-source loudness state
pub struct LoudnessAnalyzer {
    meter: Option<Meter>,
    /// Exponentially smoothed momentary loudness
    momentary_average: Option<f64>,
    current_gain: f32,
}

impl std::fmt::Debug for LoudnessAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoudnessAnalyzer")
            .field("frames_added", &self.meter.as_ref().map(|m| m.frames_added))
            .field("momentary_average", &self.momentary_average)
            .field("current_gain", &self.current_gain)
            .finish()
    }
}

impl Default for LoudnessAnalyzer {
    fn default() -> Self {
        Self {
            meter: None,
            momentary_average: None,
            current_gain: 1.0,
        }
    }
}

fn meter_error(context: &str, err: ebur128::Error) -> Error {
    Error::Internal(format!("{}: {:?}", context, err))
}

impl Meter {
    fn new(channels: u32, sample_rate: u32) -> Result<Self> {
        let mut ebur = EbuR128::new(channels, sample_rate, Mode::I | Mode::M | Mode::SAMPLE_PEAK)
            .map_err(|e| meter_error("Failed to create EBU R128 analyzer", e))?;
        ebur.set_max_history((INTEGRATED_MAX_SECONDS * 1000.0) as u32)
            .map_err(|e| meter_error("Failed to set loudness history", e))?;
        Ok(Self {
            ebur,
            channels,
            sample_rate,
            frames_added: 0,
        })
    }

    fn peak(&self) -> f64 {
        (0..self.channels)
            .filter_map(|ch| self.ebur.sample_peak(ch).ok())
            .fold(0.0, f64::max)
    }
}

impl LoudnessAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gain applied at the end of the last processed buffer
    pub fn current_gain(&self) -> f32 {
        self.current_gain
    }

    /// Forget history and return to unity gain (new track)
    pub fn reset(&mut self) {
        self.meter = None;
        self.momentary_average = None;
        self.current_gain = 1.0;
    }

    /// Build the meter on first use or when the stream format changes
    fn prepare_meter(&mut self, channels: u32, sample_rate: u32) -> Result<()> {
        let stale = self
            .meter
            .as_ref()
            .map_or(true, |m| m.channels != channels || m.sample_rate != sample_rate);
        if stale {
            self.meter = Some(Meter::new(channels, sample_rate)?);
            self.momentary_average = None;
        }
        Ok(())
    }

    /// Analyze one buffer and, if `normalize` is set, apply the gain ramp
    ///
    /// # Arguments
    /// - `samples`: Interleaved frames, modified in place when normalizing
    /// - `channels`: Channel count of `samples`
    /// - `sample_rate`: Rate of `samples`
    /// - `normalize`: Apply gain; otherwise only detect silence
    pub fn process(
        &mut self,
        samples: &mut [f32],
        channels: u16,
        sample_rate: u32,
        normalize: bool,
    ) -> Result<BufferLoudness> {
        let channel_count = channels.max(1) as usize;
        let frames = samples.len() / channel_count;
        if frames == 0 {
            return Ok(BufferLoudness {
                gain: self.current_gain,
                is_entirely_silent: true,
            });
        }
        let samples = &mut samples[..frames * channel_count];

        let window_frames = ((sample_rate as f64 * WINDOW_SECONDS) as usize).max(1);
        self.prepare_meter(channel_count as u32, sample_rate)?;
        let mut momentary = Vec::new();
        let mut momentary_average = self.momentary_average;
        let meter = self
            .meter
            .as_mut()
            .ok_or_else(|| Error::Internal("loudness meter missing".to_string()))?;

        for window in samples.chunks(window_frames * channel_count) {
            meter
                .ebur
                .add_frames_f32(window)
                .map_err(|e| meter_error("Failed to add frames", e))?;
            meter.frames_added += (window.len() / channel_count) as u64;

            if meter.frames_added >= window_frames as u64 {
                let loudness = meter
                    .ebur
                    .loudness_momentary()
                    .map_err(|e| meter_error("Momentary loudness failed", e))?;
                momentary_average = Some(match momentary_average {
                    Some(average) if average.is_finite() => average * 0.3 + loudness * 0.7,
                    _ => loudness,
                });
                momentary.push(loudness);
            }
        }

        let is_entirely_silent =
            !momentary.is_empty() && momentary.iter().all(|l| *l <= SILENCE_THRESHOLD_DB);
        let enough_history =
            meter.frames_added as f64 >= INTEGRATED_MIN_SECONDS * sample_rate as f64;
        let integrated = if normalize && enough_history {
            Some(
                meter
                    .ebur
                    .loudness_global()
                    .map_err(|e| meter_error("Integrated loudness failed", e))?,
            )
        } else {
            None
        };
        let peak = meter.peak();
        self.momentary_average = momentary_average;

        if !normalize {
            return Ok(BufferLoudness {
                gain: 1.0,
                is_entirely_silent,
            });
        }

        let loudness = integrated
            .or(self.momentary_average)
            .unwrap_or(f64::NEG_INFINITY);
        let target = if loudness <= SILENCE_THRESHOLD_DB || peak <= 0.0 {
            self.current_gain
        } else {
            let offset_db = (REFERENCE_LOUDNESS_DB - loudness).min(MAX_GAIN_OFFSET_DB);
            10.0_f64.powf(offset_db / 20.0).min(1.0 / peak) as f32
        };

        self.apply_ramp(samples, channel_count, target);

        Ok(BufferLoudness {
            gain: target,
            is_entirely_silent,
        })
    }

    /// Linear ramp from the previous gain to `target` across the buffer
    fn apply_ramp(&mut self, samples: &mut [f32], channels: usize, target: f32) {
        let start = self.current_gain;
        let frames = samples.len() / channels;
        if start == target {
            if target != 1.0 {
                samples.iter_mut().for_each(|s| *s *= target);
            }
        } else {
            let step = (target - start) / frames as f32;
            for (i, frame) in samples.chunks_exact_mut(channels).enumerate() {
                let gain = start + step * (i + 1) as f32;
                frame.iter_mut().for_each(|s| *s *= gain);
            }
        }
        self.current_gain = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_quiet_material_boost_is_capped() {
        let mut analyzer = LoudnessAnalyzer::new();
        let mut samples = sine(0.01, 48000);
        let result = analyzer.process(&mut samples, 1, 48000, true).unwrap();

        let expected = 10.0_f32.powf(MAX_GAIN_OFFSET_DB as f32 / 20.0);
        assert!((result.gain - expected).abs() < 1e-3);
        assert!(!result.is_entirely_silent);
        // Ramp ends at the target gain
        let last_peak = samples[47000..].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((last_peak - 0.01 * expected).abs() < 1e-3);
    }

    #[test]
    fn test_loud_material_is_attenuated() {
        let mut analyzer = LoudnessAnalyzer::new();
        let mut samples = sine(0.9, 48000);
        let result = analyzer.process(&mut samples, 1, 48000, true).unwrap();

        // Roughly -4.6 LUFS for a full-scale-ish 440 Hz tone, so about -13 dB of gain
        assert!(result.gain > 0.17 && result.gain < 0.25, "gain {}", result.gain);
    }

    #[test]
    fn test_silence_is_detected_and_left_alone() {
        let mut analyzer = LoudnessAnalyzer::new();
        let mut samples = vec![0.0; 96000];
        let result = analyzer.process(&mut samples, 2, 48000, true).unwrap();
        assert!(result.is_entirely_silent);
        assert_eq!(result.gain, 1.0);
        assert!(samples.iter().all(|s| *s == 0.0));

        // Channel count change rebuilds the meter
        let mut faint = sine(1e-5, 48000);
        let result = analyzer.process(&mut faint, 1, 48000, false).unwrap();
        assert!(result.is_entirely_silent);
    }

    #[test]
    fn test_detection_only_leaves_samples_untouched() {
        let mut analyzer = LoudnessAnalyzer::new();
        let original = sine(0.5, 24000);
        let mut samples = original.clone();
        let result = analyzer.process(&mut samples, 1, 48000, false).unwrap();
        assert_eq!(samples, original);
        assert_eq!(result.gain, 1.0);
        assert!(!result.is_entirely_silent);
    }

    #[test]
    fn test_short_buffer_is_not_judged_silent() {
        let mut analyzer = LoudnessAnalyzer::new();
        let mut samples = vec![0.0; 4800];
        let result = analyzer.process(&mut samples, 1, 48000, false).unwrap();
        assert!(!result.is_entirely_silent);
    }

    #[test]
    fn test_gain_is_ramped_from_previous_value() {
        let mut analyzer = LoudnessAnalyzer::new();
        let original = sine(0.5, 19200);
        let mut samples = original.clone();
        let result = analyzer.process(&mut samples, 1, 48000, true).unwrap();

        assert!(result.gain < 1.0);
        // Early frames are still close to unity, the last ones at the target
        assert!(samples[10] / original[10] > 0.99);
        let end_ratio = samples[19190] / original[19190];
        assert!((end_ratio - result.gain).abs() < 1e-3, "{} vs {}", end_ratio, result.gain);
        assert_eq!(analyzer.current_gain(), result.gain);

        analyzer.reset();
        assert_eq!(analyzer.current_gain(), 1.0);
    }

    #[test]
    fn test_integrated_history_smooths_changes() {
        let mut analyzer = LoudnessAnalyzer::new();
        for _ in 0..4 {
            let mut samples = sine(0.3, 48000);
            analyzer.process(&mut samples, 1, 48000, true).unwrap();
        }
        let settled = analyzer.current_gain();

        // One louder second is diluted by the 4 s of history before it
        let mut loud = sine(0.8, 48000);
        let mut fresh_loud = loud.clone();
        let result = analyzer.process(&mut loud, 1, 48000, true).unwrap();
        let fresh = LoudnessAnalyzer::new()
            .process(&mut fresh_loud, 1, 48000, true)
            .unwrap();
        assert!(result.gain < settled);
        assert!(result.gain > fresh.gain * 1.3, "{} vs {}", result.gain, fresh.gain);
    }
}
