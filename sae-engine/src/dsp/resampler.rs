//! Audio resampling using rubato
//!
//! Converts each source buffer to the device sample rate. One [`Resampler`]
//! processes fixed-size chunks of `chunk_frames` input frames, which matches
//! the per-buffer decode size, plus one shorter final chunk at end of stream.
//!
//! Output length is tracked cumulatively: after `n` input frames in total the
//! resampler has emitted exactly `round(n × out_rate / in_rate)` frames, so a
//! single buffer of `N` frames yields `round(N × ratio)` frames within ±1.
//!
//! The interpolator's warm-up output (`output_delay` frames) is trimmed after
//! every reset. The frames this leaves missing from the first chunk are
//! emitted as leading silence, and the final partial chunk flushes the
//! filter so the end of the stream is not held back.

use crate::error::{Error, Result};
use rubato::{
    FastFixedIn, PolynomialDegree, Resampler as RubatoResampler, SincFixedIn,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Resampling quality / CPU tradeoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplerQuality {
    /// Linear polynomial interpolation
    Low,
    /// Cubic polynomial interpolation
    #[default]
    Medium,
    /// Septic polynomial interpolation
    High,
    /// Windowed sinc interpolation
    Best,
}

/// Pool key: instances are only interchangeable when all four fields match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResamplerKey {
    pub channels: u16,
    pub input_rate: u32,
    pub output_rate: u32,
    pub quality: ResamplerQuality,
}

impl ResamplerKey {
    pub fn ratio(&self) -> f64 {
        self.output_rate as f64 / self.input_rate as f64
    }
}

impl std::fmt::Display for ResamplerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}ch {}Hz->{}Hz {:?}",
            self.channels, self.input_rate, self.output_rate, self.quality
        )
    }
}

enum Interpolator {
    Polynomial(FastFixedIn<f32>),
    Sinc(SincFixedIn<f32>),
}

macro_rules! with_interpolator {
    ($interp:expr, $r:ident => $body:expr) => {
        match $interp {
            Interpolator::Polynomial($r) => $body,
            Interpolator::Sinc($r) => $body,
        }
    };
}

/// Stateful rubato wrapper for one channel layout and rate pair
pub struct Resampler {
    key: ResamplerKey,
    chunk_frames: usize,
    interpolator: Interpolator,
    planar_in: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,
    /// Interleaved frames produced by rubato but not yet emitted
    carry: Vec<f32>,
    /// Warm-up frames still to be dropped from the front of the output
    delay_remaining: usize,
    frames_in_total: u64,
    frames_out_total: u64,
}

impl Resampler {
    /// Create a resampler for `key` processing chunks of `chunk_frames`
    pub fn new(key: ResamplerKey, chunk_frames: usize) -> Result<Self> {
        if key.channels == 0 || key.input_rate == 0 || key.output_rate == 0 || chunk_frames == 0 {
            return Err(Error::Resample(format!(
                "invalid resampler parameters {} chunk={}",
                key, chunk_frames
            )));
        }
        let interpolator = Self::create_interpolator(&key, chunk_frames)?;
        let channels = key.channels as usize;
        let max_out = with_interpolator!(&interpolator, r => r.output_frames_max());
        let delay_remaining = warm_up_frames(&interpolator);

        debug!("Created resampler {} chunk={} frames", key, chunk_frames);

        Ok(Self {
            key,
            chunk_frames,
            interpolator,
            planar_in: vec![Vec::with_capacity(chunk_frames); channels],
            planar_out: vec![vec![0.0; max_out]; channels],
            carry: Vec::new(),
            delay_remaining,
            frames_in_total: 0,
            frames_out_total: 0,
        })
    }

    fn create_interpolator(key: &ResamplerKey, chunk_frames: usize) -> Result<Interpolator> {
        let ratio = key.ratio();
        let channels = key.channels as usize;
        let degree = match key.quality {
            ResamplerQuality::Low => PolynomialDegree::Linear,
            ResamplerQuality::Medium => PolynomialDegree::Cubic,
            ResamplerQuality::High => PolynomialDegree::Septic,
            ResamplerQuality::Best => {
                let params = SincInterpolationParameters {
                    sinc_len: 256,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: 256,
                    window: WindowFunction::BlackmanHarris2,
                };
                let sinc = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk_frames, channels)
                    .map_err(|e| Error::Resample(format!("Failed to create sinc resampler: {}", e)))?;
                return Ok(Interpolator::Sinc(sinc));
            }
        };
        let fast = FastFixedIn::<f32>::new(ratio, 1.0, degree, chunk_frames, channels)
            .map_err(|e| Error::Resample(format!("Failed to create resampler: {}", e)))?;
        Ok(Interpolator::Polynomial(fast))
    }

    pub fn key(&self) -> ResamplerKey {
        self.key
    }

    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    /// Clear all filter history and counters
    pub fn reset(&mut self) {
        with_interpolator!(&mut self.interpolator, r => r.reset());
        self.carry.clear();
        self.delay_remaining = warm_up_frames(&self.interpolator);
        self.frames_in_total = 0;
        self.frames_out_total = 0;
    }

    /// Reset, rebuilding the interpolator if the chunk size changed
    pub fn prepare(&mut self, chunk_frames: usize) -> Result<()> {
        if chunk_frames != self.chunk_frames {
            debug!(
                "Rebuilding resampler {} for chunk {} -> {} frames",
                self.key, self.chunk_frames, chunk_frames
            );
            *self = Self::new(self.key, chunk_frames)?;
            return Ok(());
        }
        self.reset();
        Ok(())
    }

    /// Interpolator latency in output frames
    pub fn output_delay(&self) -> usize {
        with_interpolator!(&self.interpolator, r => r.output_delay())
    }

    /// Upper bound on frames `process` emits for `input_frames` input frames
    pub fn max_output_frames(&self, input_frames: usize) -> usize {
        (input_frames as f64 * self.key.ratio()).ceil() as usize + 1
    }

    /// Resample one chunk of interleaved frames
    ///
    /// # Arguments
    /// - `input`: Interleaved frames, at most `chunk_frames` of them; fewer
    ///   only for the final chunk of a stream
    /// - `output`: Destination with room for `max_output_frames` frames
    ///
    /// # Returns
    /// Number of interleaved frames written to `output`
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<usize> {
        let channels = self.key.channels as usize;
        let frames = input.len() / channels;
        if frames > self.chunk_frames {
            return Err(Error::Resample(format!(
                "chunk of {} frames exceeds resampler chunk size {}",
                frames, self.chunk_frames
            )));
        }
        if frames == 0 {
            return Ok(0);
        }

        deinterleave_into(input, channels, &mut self.planar_in);

        let (_, produced) = if frames == self.chunk_frames {
            with_interpolator!(&mut self.interpolator, r => r.process_into_buffer(
                self.planar_in.as_slice(),
                self.planar_out.as_mut_slice(),
                None,
            ))
        } else {
            with_interpolator!(&mut self.interpolator, r => r.process_partial_into_buffer(
                Some(self.planar_in.as_slice()),
                self.planar_out.as_mut_slice(),
                None,
            ))
        }
        .map_err(|e| Error::Resample(format!("Resampling failed: {}", e)))?;

        interleave_append(&self.planar_out, produced, &mut self.carry);

        if frames < self.chunk_frames {
            let (_, flushed) = with_interpolator!(&mut self.interpolator, r => r.process_partial_into_buffer(
                None::<&[Vec<f32>]>,
                self.planar_out.as_mut_slice(),
                None,
            ))
            .map_err(|e| Error::Resample(format!("Resampler flush failed: {}", e)))?;
            interleave_append(&self.planar_out, flushed, &mut self.carry);
        }

        if self.delay_remaining > 0 {
            let skip = self.delay_remaining.min(self.carry.len() / channels);
            self.carry.drain(..skip * channels);
            self.delay_remaining -= skip;
        }

        self.frames_in_total += frames as u64;
        let target_total = (self.frames_in_total as f64 * self.key.ratio()).round() as u64;
        let emit = target_total.saturating_sub(self.frames_out_total) as usize;
        if output.len() < emit * channels {
            return Err(Error::Internal(format!(
                "resampler output too small: {} < {}",
                output.len(),
                emit * channels
            )));
        }

        let available = self.carry.len() / channels;
        if available < emit {
            // Shortfall left by the trimmed warm-up; silence goes first so it
            // never lands between two chunks of signal
            let missing = (emit - available) * channels;
            self.carry.splice(0..0, std::iter::repeat(0.0).take(missing));
        }
        output[..emit * channels].copy_from_slice(&self.carry[..emit * channels]);
        self.carry.drain(..emit * channels);
        self.frames_out_total = target_total;

        Ok(emit)
    }
}

/// Warm-up frames to drop so the first kept frame lines up with input frame 0
fn warm_up_frames(interpolator: &Interpolator) -> usize {
    with_interpolator!(interpolator, r => r.output_delay()).saturating_sub(1)
}

/// Convert interleaved samples to planar format, reusing `planar`.
///
/// Input:  [L, R, L, R, L, R, ...]
/// Output: [[L, L, L, ...], [R, R, R, ...]]
fn deinterleave_into(samples: &[f32], channels: usize, planar: &mut [Vec<f32>]) {
    for channel in planar.iter_mut() {
        channel.clear();
    }
    for frame in samples.chunks_exact(channels) {
        for (ch_idx, sample) in frame.iter().enumerate() {
            planar[ch_idx].push(*sample);
        }
    }
}

/// Append the first `frames` frames of planar samples in interleaved format.
///
/// Input:  [[L, L, L, ...], [R, R, R, ...]]
/// Output: [..., L, R, L, R, L, R]
fn interleave_append(planar: &[Vec<f32>], frames: usize, interleaved: &mut Vec<f32>) {
    interleaved.reserve(frames * planar.len());
    for frame_idx in 0..frames {
        for channel in planar {
            interleaved.push(channel[frame_idx]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(channels: u16, input_rate: u32, output_rate: u32, quality: ResamplerQuality) -> ResamplerKey {
        ResamplerKey {
            channels,
            input_rate,
            output_rate,
            quality,
        }
    }

    fn sine(frames: usize, channels: usize, rate: u32) -> Vec<f32> {
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let t = i as f32 / rate as f32;
            let sample = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5;
            for _ in 0..channels {
                samples.push(sample);
            }
        }
        samples
    }

    #[test]
    fn test_deinterleave() {
        let interleaved = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 3 stereo frames
        let mut planar = vec![Vec::new(), Vec::new()];
        deinterleave_into(&interleaved, 2, &mut planar);

        assert_eq!(planar[0], vec![1.0, 3.0, 5.0]); // Left channel
        assert_eq!(planar[1], vec![2.0, 4.0, 6.0]); // Right channel
    }

    #[test]
    fn test_interleave() {
        let planar = vec![vec![1.0, 3.0, 5.0], vec![2.0, 4.0, 6.0]];
        let mut interleaved = vec![0.0, 0.0];
        interleave_append(&planar, 2, &mut interleaved);

        assert_eq!(interleaved, vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_single_chunk_frame_count() {
        let cases = [
            (44100, 48000, ResamplerQuality::Medium),
            (48000, 44100, ResamplerQuality::High),
            (22050, 48000, ResamplerQuality::Low),
            (96000, 44100, ResamplerQuality::Best),
        ];
        for (input_rate, output_rate, quality) in cases {
            let chunk = input_rate as usize / 10;
            let mut resampler = Resampler::new(key(2, input_rate, output_rate, quality), chunk).unwrap();
            let input = sine(chunk, 2, input_rate);
            let mut output = vec![0.0; resampler.max_output_frames(chunk) * 2];

            let frames = resampler.process(&input, &mut output).unwrap();
            let expected = (chunk as f64 * output_rate as f64 / input_rate as f64).round() as i64;
            assert!(
                (frames as i64 - expected).abs() <= 1,
                "{}->{}: got {} frames, expected {}",
                input_rate,
                output_rate,
                frames,
                expected
            );
        }
    }

    #[test]
    fn test_cumulative_frame_count_with_partial_tail() {
        let chunk = 4410;
        let mut resampler =
            Resampler::new(key(1, 44100, 48000, ResamplerQuality::Medium), chunk).unwrap();
        let mut output = vec![0.0; resampler.max_output_frames(chunk)];

        let mut total = 0;
        for _ in 0..5 {
            total += resampler.process(&sine(chunk, 1, 44100), &mut output).unwrap();
        }
        total += resampler.process(&sine(1000, 1, 44100), &mut output).unwrap();

        let input_frames = 5 * chunk + 1000;
        let expected = (input_frames as f64 * 48000.0 / 44100.0).round() as usize;
        assert_eq!(total, expected);
    }

    #[test]
    fn test_warm_up_is_trimmed_without_gaps_between_chunks() {
        let chunk = 4410;
        let mut resampler =
            Resampler::new(key(1, 44100, 48000, ResamplerQuality::Best), chunk).unwrap();
        let delay = resampler.output_delay();
        assert!(delay > 1, "sinc interpolation has a warm-up");

        let input = sine(3 * chunk, 1, 44100);
        let mut output = Vec::new();
        let mut scratch = vec![0.0; resampler.max_output_frames(chunk)];
        for piece in input.chunks(chunk) {
            let frames = resampler.process(piece, &mut scratch).unwrap();
            output.extend_from_slice(&scratch[..frames]);
        }
        assert_eq!(output.len(), 3 * 4800);

        // Signal starts within the warm-up, never later
        let onset = output.iter().position(|s| s.abs() > 0.1).unwrap();
        assert!(onset <= delay + 10, "onset {} with delay {}", onset, delay);

        // No stretch of padding once the signal is running
        let gap = output[onset..]
            .windows(4)
            .position(|w| w.iter().all(|s| s.abs() < 1e-6));
        assert_eq!(gap, None);
    }

    #[test]
    fn test_final_partial_chunk_flushes_the_tail() {
        let chunk = 4410;
        let mut resampler =
            Resampler::new(key(1, 44100, 48000, ResamplerQuality::Best), chunk).unwrap();
        let mut output = vec![0.0; resampler.max_output_frames(chunk)];

        resampler.process(&sine(chunk, 1, 44100), &mut output).unwrap();
        let tail_input = &sine(2 * chunk, 1, 44100)[chunk..chunk + 4000];
        let frames = resampler.process(tail_input, &mut output).unwrap();
        let total = ((chunk + 4000) as f64 * 48000.0 / 44100.0).round() as usize;
        assert_eq!(frames, total - 4800);

        // The last frames are signal released by the flush, not silence
        let last = &output[frames - 100..frames];
        assert!(last.iter().any(|s| s.abs() > 0.1), "{:?}", last);
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut resampler =
            Resampler::new(key(1, 44100, 48000, ResamplerQuality::Low), 100).unwrap();
        let mut output = vec![0.0; 1000];
        assert!(resampler.process(&vec![0.0; 101], &mut output).is_err());
    }

    #[test]
    fn test_prepare_rebuilds_on_chunk_change() {
        let mut resampler =
            Resampler::new(key(2, 44100, 48000, ResamplerQuality::Low), 441).unwrap();
        resampler.prepare(882).unwrap();
        assert_eq!(resampler.chunk_frames(), 882);

        let mut output = vec![0.0; resampler.max_output_frames(882) * 2];
        let frames = resampler.process(&sine(882, 2, 44100), &mut output).unwrap();
        assert_eq!(frames, 960);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(Resampler::new(key(0, 44100, 48000, ResamplerQuality::Low), 100).is_err());
        assert!(Resampler::new(key(2, 0, 48000, ResamplerQuality::Low), 100).is_err());
        assert!(Resampler::new(key(2, 44100, 48000, ResamplerQuality::Low), 0).is_err());
    }
}
