//! Up/down-mixing to the device channel count
//!
//! Channel layouts follow the usual ordering: stereo is `L R`, quad is
//! `L R SL SR`, 5.1 is `L R C LFE SL SR`. Known layout pairs use dedicated
//! fold-down or spread rules; the LFE channel is dropped on fold-down and
//! never fed on upmix. Any other pair copies the shared leading channels
//! and pads the rest with silence.

use crate::error::{Error, Result};
use std::f32::consts::FRAC_1_SQRT_2;

// 5.1 channel positions
const L: usize = 0;
const R: usize = 1;
const C: usize = 2;
const LFE: usize = 3;
const SL: usize = 4;
const SR: usize = 5;

/// Mixes interleaved frames to a fixed destination channel count
#[derive(Debug, Clone, Copy)]
pub struct ChannelMixer {
    destination_channels: u16,
}

impl ChannelMixer {
    pub fn new(destination_channels: u16) -> Self {
        Self {
            destination_channels,
        }
    }

    pub fn destination_channels(&self) -> u16 {
        self.destination_channels
    }

    /// True when `input_channels` differs from the destination
    pub fn needs_mixing(&self, input_channels: u16) -> bool {
        input_channels != self.destination_channels
    }

    /// Mix interleaved `input` into `output`
    ///
    /// # Arguments
    /// - `input`: Interleaved frames with `input_channels` channels
    /// - `input_channels`: Channel count of `input`
    /// - `output`: Destination, at least `frames × destination_channels` long
    ///
    /// # Returns
    /// Number of frames written
    pub fn mix(&self, input: &[f32], input_channels: u16, output: &mut [f32]) -> Result<usize> {
        if input_channels == 0 || self.destination_channels == 0 {
            return Err(Error::InvalidState(format!(
                "unsupported channel mix {} -> {}",
                input_channels, self.destination_channels
            )));
        }
        let in_ch = input_channels as usize;
        let out_ch = self.destination_channels as usize;
        let frames = input.len() / in_ch;
        if output.len() < frames * out_ch {
            return Err(Error::Internal(format!(
                "channel mix output too small: {} < {}",
                output.len(),
                frames * out_ch
            )));
        }

        if in_ch == out_ch {
            output[..frames * in_ch].copy_from_slice(&input[..frames * in_ch]);
            return Ok(frames);
        }

        let frames_in = input.chunks_exact(in_ch);
        let frames_out = output.chunks_exact_mut(out_ch);
        let mix_frame: fn(&[f32], &mut [f32]) = match (in_ch, out_ch) {
            (2, 1) => |s, d| d[0] = (s[0] + s[1]) / 2.0,
            (4, 1) => |s, d| d[0] = (s[0] + s[1] + s[2] + s[3]) / 4.0,
            (6, 1) => |s, d| {
                d[0] = FRAC_1_SQRT_2 * (s[L] + s[R]) + s[C] + 0.5 * (s[SL] + s[SR]);
            },
            (1, 2) => |s, d| d.fill(s[0]),
            (4, 2) => |s, d| {
                d[0] = (s[0] + s[2]) / 2.0;
                d[1] = (s[1] + s[3]) / 2.0;
            },
            (6, 2) => |s, d| {
                d[0] = s[L] + FRAC_1_SQRT_2 * (s[C] + s[SL]);
                d[1] = s[R] + FRAC_1_SQRT_2 * (s[C] + s[SR]);
            },
            (1, 4) => |s, d| {
                d[..2].fill(s[0]);
                d[2..].fill(0.0);
            },
            (6, 4) => |s, d| {
                d[0] = s[L] + FRAC_1_SQRT_2 * s[C];
                d[1] = s[R] + FRAC_1_SQRT_2 * s[C];
                d[2] = s[SL];
                d[3] = s[SR];
            },
            (1, 6) => |s, d| {
                d.fill(0.0);
                d[C] = s[0];
            },
            (4, 6) => |s, d| {
                d[..2].copy_from_slice(&s[..2]);
                d[C] = 0.0;
                d[LFE] = 0.0;
                d[SL] = s[2];
                d[SR] = s[3];
            },
            // 2 -> 4 and 2 -> 6 land here too: L/R copied, the rest silent
            _ => |s, d| {
                let shared = s.len().min(d.len());
                d[..shared].copy_from_slice(&s[..shared]);
                d[shared..].fill(0.0);
            },
        };
        for (src, dst) in frames_in.zip(frames_out) {
            mix_frame(src, dst);
        }

        Ok(frames)
    }
}
