//! Per-buffer filter stages
//!
//! Order is fixed: noise sharpening → bass boost → equalizer. Each stage is a
//! no-op while its strength or gains are all zero.
//!
//! Filter coefficients are computed lazily. Each biquad stage keeps a `dirty`
//! flag and the sample rate its coefficients were computed for; coefficients
//! are rewritten only when the controlling value or the sample rate changed.
//! Every rewrite bumps a counter so the behavior can be observed from tests.

use sae_common::effects::{
    BandKind, EffectSpec, EqualizerGains, EQUALIZER_BANDS, EQUALIZER_BAND_COUNT,
};
use std::f64::consts::PI;
use tracing::debug;

/// Bass boost low-shelf corner frequency in Hz
pub const BASS_BOOST_FREQUENCY: f64 = 100.0;

/// Bass boost gain in dB at full effect size
pub const BASS_BOOST_MAX_GAIN_DB: f64 = 12.0;

/// Peaking band Q
const PEAKING_Q: f64 = std::f64::consts::SQRT_2;

/// Filter output below this magnitude is flushed to zero
const DENORMAL_THRESHOLD: f64 = 1e-20;

/// Normalized biquad coefficients (a0 = 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Default for BiquadCoefficients {
    fn default() -> Self {
        Self::identity()
    }
}

impl BiquadCoefficients {
    /// Pass-through filter
    pub fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Coefficients for one band shape (Audio EQ Cookbook, shelf slope 1)
    pub fn design(kind: BandKind, frequency: f64, sample_rate: u32, gain_db: f64) -> Self {
        if gain_db == 0.0 || sample_rate == 0 {
            return Self::identity();
        }
        let sample_rate = sample_rate as f64;
        // Keep the corner below Nyquist for low device rates
        let frequency = frequency.min(sample_rate * 0.45);

        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * frequency / sample_rate;
        let sn = omega.sin();
        let cs = omega.cos();

        let (b0, b1, b2, a0, a1, a2) = match kind {
            BandKind::Peaking => {
                let alpha = sn / (2.0 * PEAKING_Q);
                (
                    1.0 + alpha * a,
                    -2.0 * cs,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cs,
                    1.0 - alpha / a,
                )
            }
            BandKind::LowShelf => {
                let beta = 2.0 * a.sqrt() * (sn / 2.0) * std::f64::consts::SQRT_2;
                (
                    a * ((a + 1.0) - (a - 1.0) * cs + beta),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cs),
                    a * ((a + 1.0) - (a - 1.0) * cs - beta),
                    (a + 1.0) + (a - 1.0) * cs + beta,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cs),
                    (a + 1.0) + (a - 1.0) * cs - beta,
                )
            }
            BandKind::HighShelf => {
                let beta = 2.0 * a.sqrt() * (sn / 2.0) * std::f64::consts::SQRT_2;
                (
                    a * ((a + 1.0) + (a - 1.0) * cs + beta),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cs),
                    a * ((a + 1.0) + (a - 1.0) * cs - beta),
                    (a + 1.0) - (a - 1.0) * cs + beta,
                    2.0 * ((a - 1.0) - (a + 1.0) * cs),
                    (a + 1.0) - (a - 1.0) * cs - beta,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Magnitude at DC
    pub fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// Magnitude at Nyquist
    pub fn nyquist_gain(&self) -> f64 {
        (self.b0 - self.b1 + self.b2) / (1.0 - self.a1 + self.a2)
    }
}

/// Direct form I history for one channel of one biquad
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl BiquadState {
    #[inline]
    fn process(&mut self, c: &BiquadCoefficients, x: f64) -> f64 {
        let mut y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        if y.abs() < DENORMAL_THRESHOLD {
            y = 0.0;
        }
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

fn resize_states<T: Default + Clone>(states: &mut Vec<T>, channels: usize) {
    if states.len() != channels {
        states.clear();
        states.resize(channels, T::default());
    }
}

/// First-difference high-frequency emphasis
///
/// `s[i] += e × (s[i] − s[i−1])` per channel, walked backward through the
/// buffer so every difference uses unmodified input.
#[derive(Debug, Default)]
pub struct NoiseSharpening {
    effect_size: f32,
    /// Last input frame of the previous buffer
    previous: Vec<f32>,
}

impl NoiseSharpening {
    pub fn set_effect_size(&mut self, effect_size: f64) {
        self.effect_size = effect_size as f32;
    }

    pub fn is_enabled(&self) -> bool {
        self.effect_size != 0.0
    }

    pub fn reset(&mut self) {
        self.previous.clear();
    }

    pub fn process(&mut self, samples: &mut [f32], channels: usize) {
        if !self.is_enabled() || channels == 0 || samples.len() < channels {
            return;
        }
        let frames = samples.len() / channels;
        let e = self.effect_size;

        let mut last_input = vec![0.0; channels];
        last_input.copy_from_slice(&samples[(frames - 1) * channels..frames * channels]);

        for i in (1..frames).rev() {
            for c in 0..channels {
                let current = samples[i * channels + c];
                let before = samples[(i - 1) * channels + c];
                samples[i * channels + c] = current + e * (current - before);
            }
        }
        if self.previous.len() == channels {
            for c in 0..channels {
                samples[c] += e * (samples[c] - self.previous[c]);
            }
        }

        self.previous = last_input;
    }
}

/// Low-shelf boost scaled by effect size
#[derive(Debug, Default)]
pub struct BassBoost {
    effect_size: f64,
    dirty: bool,
    cached_sample_rate: Option<u32>,
    coefficients: BiquadCoefficients,
    states: Vec<BiquadState>,
    coefficient_writes: u64,
}

impl BassBoost {
    pub fn set_effect_size(&mut self, effect_size: f64) {
        if effect_size != self.effect_size {
            self.effect_size = effect_size;
            self.dirty = true;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.effect_size != 0.0
    }

    pub fn coefficient_writes(&self) -> u64 {
        self.coefficient_writes
    }

    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(|s| *s = BiquadState::default());
    }

    pub fn process(&mut self, samples: &mut [f32], channels: usize, sample_rate: u32) {
        if !self.is_enabled() || channels == 0 {
            return;
        }
        if self.dirty || self.cached_sample_rate != Some(sample_rate) {
            self.coefficients = BiquadCoefficients::design(
                BandKind::LowShelf,
                BASS_BOOST_FREQUENCY,
                sample_rate,
                self.effect_size * BASS_BOOST_MAX_GAIN_DB,
            );
            self.dirty = false;
            self.cached_sample_rate = Some(sample_rate);
            self.coefficient_writes += 1;
        }
        resize_states(&mut self.states, channels);

        for frame in samples.chunks_exact_mut(channels) {
            for (sample, state) in frame.iter_mut().zip(self.states.iter_mut()) {
                *sample = state.process(&self.coefficients, *sample as f64) as f32;
            }
        }
    }
}

/// Ten band equalizer: low shelf, eight peaking bands, high shelf
#[derive(Debug, Default)]
pub struct Equalizer {
    gains: EqualizerGains,
    dirty: bool,
    cached_sample_rate: Option<u32>,
    coefficients: [BiquadCoefficients; EQUALIZER_BAND_COUNT],
    states: Vec<[BiquadState; EQUALIZER_BAND_COUNT]>,
    coefficient_writes: u64,
}

impl Equalizer {
    pub fn set_gains(&mut self, gains: EqualizerGains) {
        if gains != self.gains {
            self.gains = gains;
            self.dirty = true;
        }
    }

    pub fn gains(&self) -> &EqualizerGains {
        &self.gains
    }

    pub fn is_enabled(&self) -> bool {
        self.gains.iter().any(|g| *g != 0.0)
    }

    /// Number of times the coefficient block has been rewritten
    pub fn coefficient_writes(&self) -> u64 {
        self.coefficient_writes
    }

    pub fn reset(&mut self) {
        for channel in self.states.iter_mut() {
            *channel = [BiquadState::default(); EQUALIZER_BAND_COUNT];
        }
    }

    fn update_coefficients(&mut self, sample_rate: u32) {
        if !self.dirty && self.cached_sample_rate == Some(sample_rate) {
            return;
        }
        for (i, band) in EQUALIZER_BANDS.iter().enumerate() {
            self.coefficients[i] =
                BiquadCoefficients::design(band.kind, band.frequency, sample_rate, self.gains[i]);
        }
        self.dirty = false;
        self.cached_sample_rate = Some(sample_rate);
        self.coefficient_writes += 1;
        debug!("Equalizer coefficients recomputed for {} Hz", sample_rate);
    }

    pub fn process(&mut self, samples: &mut [f32], channels: usize, sample_rate: u32) {
        if !self.is_enabled() || channels == 0 {
            return;
        }
        self.update_coefficients(sample_rate);
        resize_states(&mut self.states, channels);

        for frame in samples.chunks_exact_mut(channels) {
            for (sample, bands) in frame.iter_mut().zip(self.states.iter_mut()) {
                let mut value = *sample as f64;
                for (state, coefficients) in bands.iter_mut().zip(self.coefficients.iter()) {
                    if coefficients.is_identity() {
                        continue;
                    }
                    value = state.process(coefficients, value);
                }
                *sample = value as f32;
            }
        }
    }
}

/// One source handle's filter stages
#[derive(Debug, Default)]
pub struct EffectChain {
    noise_sharpening: NoiseSharpening,
    bass_boost: BassBoost,
    equalizer: Equalizer,
}

impl EffectChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an effect list; effects missing from the list are switched off
    pub fn configure(&mut self, effects: &[EffectSpec]) {
        let mut sharpening = 0.0;
        let mut bass = 0.0;
        let mut gains = [0.0; EQUALIZER_BAND_COUNT];
        for effect in effects {
            match effect {
                EffectSpec::NoiseSharpening { effect_size } => sharpening = *effect_size,
                EffectSpec::BassBoost { effect_size } => bass = *effect_size,
                EffectSpec::Equalizer { gains: g } => gains = *g,
            }
        }
        self.noise_sharpening.set_effect_size(sharpening);
        self.bass_boost.set_effect_size(bass);
        self.equalizer.set_gains(gains);
    }

    /// True when at least one stage would touch the samples
    pub fn is_active(&self) -> bool {
        self.noise_sharpening.is_enabled()
            || self.bass_boost.is_enabled()
            || self.equalizer.is_enabled()
    }

    /// Run all stages in order over interleaved samples
    pub fn process(&mut self, samples: &mut [f32], channels: u16, sample_rate: u32) {
        let channels = channels as usize;
        self.noise_sharpening.process(samples, channels);
        self.bass_boost.process(samples, channels, sample_rate);
        self.equalizer.process(samples, channels, sample_rate);
    }

    /// Clear filter history, keeping coefficients
    pub fn reset(&mut self) {
        self.noise_sharpening.reset();
        self.bass_boost.reset();
        self.equalizer.reset();
    }

    pub fn equalizer(&self) -> &Equalizer {
        &self.equalizer
    }

    pub fn bass_boost(&self) -> &BassBoost {
        &self.bass_boost
    }
}
