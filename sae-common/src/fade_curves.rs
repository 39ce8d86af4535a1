//! Fade curves for crossfade handoffs
//!
//! During a crossfade the outgoing track's tail buffers are faded out while
//! the incoming track's first buffers are faded in. The consumer sums the
//! overlapping buffers, so the pair of curves decides how loud the overlap
//! sounds.

use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Shape of a fade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FadeCurve {
    /// v(t) = t
    Linear,

    /// v(t) = sin(t × π/2), constant perceived loudness across the overlap
    #[default]
    EqualPower,
}

/// Whether a fade raises or lowers the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FadeDirection {
    In,
    Out,
}

impl FadeCurve {
    /// Fade-in multiplier at a normalized position (0.0 start, 1.0 end)
    pub fn fade_in(&self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }

    /// Fade-out multiplier at a normalized position (1.0 at start, 0.0 at end)
    pub fn fade_out(&self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => 1.0 - t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).cos(),
        }
    }

    /// Multiplier for either direction
    pub fn gain(&self, direction: FadeDirection, position: f32) -> f32 {
        match direction {
            FadeDirection::In => self.fade_in(position),
            FadeDirection::Out => self.fade_out(position),
        }
    }
}
