//! Effect specifications for the per-buffer filter stages
//!
//! Effects are configured as a list of tagged specs, mirroring the wire
//! format consumers send inside `configure`:
//!
//! ```json
//! [
//!   { "name": "noise-sharpening", "effectSize": 0.6 },
//!   { "name": "bass-boost", "effectSize": 0.3 },
//!   { "name": "equalizer", "gains": [0, 0, 2, 3, 3, 3, 2, 0, 0, 0] }
//! ]
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Number of equalizer bands
pub const EQUALIZER_BAND_COUNT: usize = 10;

/// Equalizer gain range in decibels
pub const EQUALIZER_MIN_GAIN_DB: f64 = -12.0;
pub const EQUALIZER_MAX_GAIN_DB: f64 = 12.0;

/// Noise sharpening strength range
pub const NOISE_SHARPENING_MAX_EFFECT_SIZE: f64 = 2.0;

/// Bass boost strength range
pub const BASS_BOOST_MAX_EFFECT_SIZE: f64 = 1.0;

/// Ten band gain vector, lowest band first
pub type EqualizerGains = [f64; EQUALIZER_BAND_COUNT];

/// Filter shape used by one equalizer band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BandKind {
    LowShelf,
    Peaking,
    HighShelf,
}

/// One fixed equalizer band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqualizerBand {
    /// Center (peaking) or corner (shelf) frequency in Hz
    pub frequency: f64,
    pub kind: BandKind,
}

/// The fixed band layout: a low shelf, eight peaking bands, a high shelf
pub const EQUALIZER_BANDS: [EqualizerBand; EQUALIZER_BAND_COUNT] = [
    EqualizerBand { frequency: 70.0, kind: BandKind::LowShelf },
    EqualizerBand { frequency: 180.0, kind: BandKind::Peaking },
    EqualizerBand { frequency: 320.0, kind: BandKind::Peaking },
    EqualizerBand { frequency: 600.0, kind: BandKind::Peaking },
    EqualizerBand { frequency: 1000.0, kind: BandKind::Peaking },
    EqualizerBand { frequency: 3000.0, kind: BandKind::Peaking },
    EqualizerBand { frequency: 6000.0, kind: BandKind::Peaking },
    EqualizerBand { frequency: 12000.0, kind: BandKind::Peaking },
    EqualizerBand { frequency: 14000.0, kind: BandKind::Peaking },
    EqualizerBand { frequency: 16000.0, kind: BandKind::HighShelf },
];

/// Named equalizer presets
pub const EQUALIZER_PRESETS: &[(&str, EqualizerGains)] = &[
    ("Flat", [0.0; EQUALIZER_BAND_COUNT]),
    (
        "Classical",
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -4.65, -4.65, -4.65, -6.19],
    ),
    ("Club", [0.0, 0.0, 1.94, 3.48, 3.48, 3.48, 1.94, 0.0, 0.0, 0.0]),
    (
        "Dance",
        [5.81, 4.26, 1.16, 0.0, 0.0, -3.87, -4.65, -4.65, 0.0, 0.0],
    ),
    (
        "Full Bass",
        [5.81, 5.81, 5.81, 3.48, 0.77, -2.71, -5.42, -6.58, -6.97, -6.97],
    ),
];

/// A single effect stage configuration
///
/// Each effect is a no-op when its strength (or every gain) is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum EffectSpec {
    /// High frequency emphasis by first-order differencing
    NoiseSharpening {
        #[serde(rename = "effectSize")]
        effect_size: f64,
    },

    /// Low shelf boost scaled by effect size
    BassBoost {
        #[serde(rename = "effectSize")]
        effect_size: f64,
    },

    /// Ten band parametric equalizer
    Equalizer { gains: EqualizerGains },
}

impl EffectSpec {
    /// Wire name of this effect
    pub fn name(&self) -> &'static str {
        match self {
            EffectSpec::NoiseSharpening { .. } => "noise-sharpening",
            EffectSpec::BassBoost { .. } => "bass-boost",
            EffectSpec::Equalizer { .. } => "equalizer",
        }
    }

    /// Build an equalizer spec from a named preset
    ///
    /// # Errors
    /// Returns `Error::InvalidInput` when no preset has that name
    pub fn equalizer_preset(name: &str) -> Result<EffectSpec> {
        EQUALIZER_PRESETS
            .iter()
            .find(|(preset, _)| preset.eq_ignore_ascii_case(name))
            .map(|(_, gains)| EffectSpec::Equalizer { gains: *gains })
            .ok_or_else(|| Error::InvalidInput(format!("Unknown equalizer preset: {}", name)))
    }

    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<()> {
        match self {
            EffectSpec::NoiseSharpening { effect_size } => {
                check_range(self.name(), *effect_size, 0.0, NOISE_SHARPENING_MAX_EFFECT_SIZE)
            }
            EffectSpec::BassBoost { effect_size } => {
                check_range(self.name(), *effect_size, 0.0, BASS_BOOST_MAX_EFFECT_SIZE)
            }
            EffectSpec::Equalizer { gains } => {
                for gain in gains {
                    check_range(self.name(), *gain, EQUALIZER_MIN_GAIN_DB, EQUALIZER_MAX_GAIN_DB)?;
                }
                Ok(())
            }
        }
    }

    /// True when applying this effect would change the signal
    pub fn is_effective(&self) -> bool {
        match self {
            EffectSpec::NoiseSharpening { effect_size } | EffectSpec::BassBoost { effect_size } => {
                *effect_size != 0.0
            }
            EffectSpec::Equalizer { gains } => gains.iter().any(|g| *g != 0.0),
        }
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(Error::Config(format!(
            "{} value {} outside [{}, {}]",
            name, value, min, max
        )));
    }
    Ok(())
}

/// Validate a complete effect list: every spec in range, each name at most once
pub fn validate_effects(effects: &[EffectSpec]) -> Result<()> {
    for (index, effect) in effects.iter().enumerate() {
        effect.validate()?;
        if effects[..index].iter().any(|e| e.name() == effect.name()) {
            return Err(Error::Config(format!(
                "Effect {} specified more than once",
                effect.name()
            )));
        }
    }
    Ok(())
}
