//! One track's decode, seek and fill state
//!
//! An [`AudioSource`] owns a decoder, a scratch buffer, at most one leased
//! resampler, an effect chain and a loudness analyzer. All of it sits behind
//! one async mutex, and every operation is tagged with a cancellation token
//! from the source's own [`CancellationEpoch`].
//!
//! Per buffer the pipeline is: decode `round(bufferTime × inRate)` frames →
//! resample → channel-mix → loudness normalization → noise sharpening →
//! bass boost → equalizer → crossfade fade. Stages that have nothing to do
//! are skipped. The finished samples are copied out of scratch memory into
//! a fresh `Vec` whose ownership moves to the consumer.

use super::decoder::{catch_decoder_panic, Decoder, DecoderFactory};
use crate::cancel::{CancellationEpoch, CancellationToken, InFlightGuard, Outcome};
use crate::dsp::effects::EffectChain;
use crate::dsp::loudness::LoudnessAnalyzer;
use crate::dsp::resampler_pool::ResamplerLease;
use crate::dsp::scratch::{allocate_samples, ScratchBuffer};
use crate::dsp::DspContext;
use crate::error::{Error, Result};
use sae_common::events::{
    BufferDescriptor, BufferExtraData, BufferFillType, DemuxData, LoadRequest, SourceId,
};
use sae_common::{Configuration, FadeCurve, FadeDirection};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Longest run of leading silence skipped by silence trimming
pub const MAX_TRIMMED_SILENCE_SECONDS: f64 = 30.0;

/// Lifecycle phase of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourcePhase {
    Idle = 0,
    Loading = 1,
    Ready = 2,
    Seeking = 3,
    Destroyed = 4,
}

impl SourcePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SourcePhase::Idle,
            1 => SourcePhase::Loading,
            2 => SourcePhase::Ready,
            3 => SourcePhase::Seeking,
            _ => SourcePhase::Destroyed,
        }
    }
}

impl fmt::Display for SourcePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourcePhase::Idle => "idle",
            SourcePhase::Loading => "loading",
            SourcePhase::Ready => "ready",
            SourcePhase::Seeking => "seeking",
            SourcePhase::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// What a completed load reports
#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    pub demux_data: DemuxData,
    /// Track position of the first frame
    pub base_time: f64,
}

/// One buffer ready for delivery
#[derive(Debug)]
pub struct ProducedBuffer {
    pub descriptor: BufferDescriptor,
    pub fill_type: BufferFillType,
    pub extra_data: Option<BufferExtraData>,
    pub channel_data: Vec<f32>,
}

/// Parameters of one fill loop
#[derive(Debug, Clone)]
pub struct FillOptions {
    /// Token the whole loop runs under
    pub token: CancellationToken,
    /// Fill type of the first buffer; later ones are `Regular`
    pub first_fill_type: BufferFillType,
    /// Attached to the first buffer only
    pub extra_data: Option<BufferExtraData>,
    /// Mark every buffer as a background buffer
    pub background: bool,
    /// Audio configuration snapshot for this loop
    pub config: Configuration,
    /// Number of buffers the consumer expects overall, for logging only
    pub total_buffers_hint: Option<usize>,
}

/// Exclusive right to run one fill loop on a source
///
/// Counts as an in-flight operation from the moment it is claimed.
pub struct FillClaim {
    filling: Arc<AtomicBool>,
    token: CancellationToken,
    _in_flight: InFlightGuard,
}

impl FillClaim {
    pub fn token(&self) -> CancellationToken {
        self.token
    }
}

impl Drop for FillClaim {
    // Runs before the in-flight guard drops, so whoever awaits the
    // acknowledgement can claim the next fill right away
    fn drop(&mut self) {
        self.filling.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
struct Fade {
    direction: FadeDirection,
    curve: FadeCurve,
    total_frames: usize,
    elapsed_frames: usize,
}

impl Fade {
    fn apply(&mut self, samples: &mut [f32], channels: usize) {
        for frame in samples.chunks_exact_mut(channels) {
            let position = if self.total_frames == 0 {
                1.0
            } else {
                self.elapsed_frames as f32 / self.total_frames as f32
            };
            let gain = self.curve.gain(self.direction, position);
            frame.iter_mut().for_each(|s| *s *= gain);
            self.elapsed_frames = self.elapsed_frames.saturating_add(1);
        }
    }

    fn is_finished(&self) -> bool {
        self.direction == FadeDirection::In && self.elapsed_frames >= self.total_frames
    }
}

struct SourceState {
    decoder: Option<Box<dyn Decoder>>,
    demux: Option<DemuxData>,
    scratch: ScratchBuffer,
    resampler: Option<ResamplerLease>,
    effects: EffectChain,
    loudness: LoudnessAnalyzer,
    fade: Option<Fade>,
    /// Track time of the next decoded frame
    position: f64,
    /// Leading silence may still be trimmed
    at_transition_start: bool,
    trimmed_seconds: f64,
}

/// Decode and fill state for one track
pub struct AudioSource {
    id: SourceId,
    epoch: CancellationEpoch,
    phase: AtomicU8,
    filling: Arc<AtomicBool>,
    ended: AtomicBool,
    background: AtomicBool,
    dsp: Arc<DspContext>,
    factory: Arc<dyn DecoderFactory>,
    state: Mutex<SourceState>,
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("generation", &self.epoch.generation())
            .finish()
    }
}

impl AudioSource {
    pub fn new(id: SourceId, dsp: Arc<DspContext>, factory: Arc<dyn DecoderFactory>) -> Arc<Self> {
        Arc::new(Self {
            id,
            epoch: CancellationEpoch::new(),
            phase: AtomicU8::new(SourcePhase::Idle as u8),
            filling: Arc::new(AtomicBool::new(false)),
            ended: AtomicBool::new(false),
            background: AtomicBool::new(false),
            dsp,
            factory,
            state: Mutex::new(SourceState {
                decoder: None,
                demux: None,
                scratch: ScratchBuffer::new(),
                resampler: None,
                effects: EffectChain::new(),
                loudness: LoudnessAnalyzer::new(),
                fade: None,
                position: 0.0,
                at_transition_start: true,
                trimmed_seconds: 0.0,
            }),
        })
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn phase(&self) -> SourcePhase {
        SourcePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SourcePhase) {
        // Destroyed is terminal
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == SourcePhase::Destroyed as u8 {
                    None
                } else {
                    Some(phase as u8)
                }
            });
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase() == SourcePhase::Destroyed
    }

    /// The decoder reached end of stream; cleared by a seek
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn is_buffer_filling_in_progress(&self) -> bool {
        self.filling.load(Ordering::Acquire)
    }

    /// Mark every buffer produced from now on as a background buffer
    pub fn mark_background(&self) {
        self.background.store(true, Ordering::Release);
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::Acquire)
    }

    /// Token for the current generation
    pub fn token(&self) -> CancellationToken {
        self.epoch.token()
    }

    pub fn is_cancelled(&self, token: &CancellationToken) -> bool {
        self.epoch.is_cancelled(token)
    }

    /// Supersede every outstanding operation and return the new generation's token
    pub fn cancel_all_operations(&self) -> CancellationToken {
        let token = self.epoch.bump();
        trace!("[Source {}] Operations cancelled, generation {}", self.id, token.generation());
        token
    }

    /// Resolves once every superseded operation has unwound
    pub async fn buffer_operation_cancellation_acknowledged(&self) {
        self.epoch.acknowledged().await
    }

    /// Claim the fill loop for `token`
    ///
    /// # Returns
    /// - `Ok(Completed(claim))`: the caller may run one fill loop
    /// - `Ok(Cancelled)`: `token` is stale
    ///
    /// # Errors
    /// `Error::InvalidState` when a fill loop is already running
    pub fn claim_fill(&self, token: CancellationToken) -> Result<Outcome<FillClaim>> {
        if self
            .filling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidState("invalid parallel buffer fill loop".to_string()));
        }
        let Some(in_flight) = self.epoch.begin(&token) else {
            self.filling.store(false, Ordering::Release);
            return Ok(Outcome::Cancelled);
        };
        Ok(Outcome::Completed(FillClaim {
            filling: Arc::clone(&self.filling),
            token,
            _in_flight: in_flight,
        }))
    }

    /// Open the track and position it
    ///
    /// Waits for superseded operations to unwind first. With `progress > 0`
    /// and a known duration the decoder is moved to `progress × duration`.
    pub async fn load(
        &self,
        request: &LoadRequest,
        token: CancellationToken,
        config: &Configuration,
    ) -> Result<Outcome<LoadResult>> {
        self.epoch.acknowledged().await;
        let Some(_in_flight) = self.epoch.begin(&token) else {
            return Ok(Outcome::Cancelled);
        };
        let buffer_time = config.buffer_time_seconds()?;
        self.set_phase(SourcePhase::Loading);
        debug!("[Source {}] Loading {}", self.id, request.file_reference);

        let factory = Arc::clone(&self.factory);
        let file_reference = request.file_reference.clone();
        let mut decoder = tokio::task::spawn_blocking(move || {
            catch_decoder_panic("open", || factory.open(&file_reference))
        })
        .await
        .map_err(|e| Error::Internal(format!("decoder open task failed: {}", e)))??;

        if self.epoch.is_cancelled(&token) {
            return Ok(Outcome::Cancelled);
        }

        let demux = decoder.demux_data().clone();
        if demux.sample_rate == 0 || demux.channels == 0 {
            return Err(Error::Decode(format!(
                "unsupported stream format: {} Hz, {} channels",
                demux.sample_rate, demux.channels
            )));
        }

        let mut state = self.state.lock().await;
        if self.epoch.is_cancelled(&token) {
            return Ok(Outcome::Cancelled);
        }

        let base_time = match demux.duration_seconds {
            Some(duration) if request.progress > 0.0 => {
                tokio::task::yield_now().await;
                if self.epoch.is_cancelled(&token) {
                    return Ok(Outcome::Cancelled);
                }
                let target = request.progress.min(1.0) * duration;
                catch_decoder_panic("seek", || decoder.seek(target))?
            }
            _ => 0.0,
        };

        if let Some(previous) = state.resampler.take() {
            self.dsp.release_resampler(previous);
        }
        if demux.sample_rate != self.dsp.output_sample_rate() {
            let chunk_frames = chunk_frames(buffer_time, demux.sample_rate);
            state.resampler =
                Some(self.dsp.acquire_resampler(demux.channels, demux.sample_rate, chunk_frames)?);
        }

        state.decoder = Some(decoder);
        state.demux = Some(demux.clone());
        state.position = base_time;
        state.effects.reset();
        state.loudness.reset();
        state.fade = None;
        state.at_transition_start = true;
        state.trimmed_seconds = 0.0;
        self.ended.store(false, Ordering::Release);
        self.set_phase(SourcePhase::Ready);

        debug!(
            "[Source {}] Loaded: {} Hz, {} ch, codec={}, base_time={:.3}s",
            self.id, demux.sample_rate, demux.channels, demux.codec, base_time
        );

        Ok(Outcome::Completed(LoadResult {
            demux_data: demux,
            base_time,
        }))
    }

    /// Move to `time` seconds, reusing the same decoder
    ///
    /// The caller bumps the epoch first; this waits for the superseded
    /// operations to acknowledge before touching the decoder.
    pub async fn seek(&self, time: f64, token: CancellationToken) -> Result<Outcome<f64>> {
        self.epoch.acknowledged().await;
        let Some(_in_flight) = self.epoch.begin(&token) else {
            return Ok(Outcome::Cancelled);
        };

        let mut guard = self.state.lock().await;
        if self.epoch.is_cancelled(&token) {
            return Ok(Outcome::Cancelled);
        }
        self.set_phase(SourcePhase::Seeking);

        let state = &mut *guard;
        let Some(decoder) = state.decoder.as_mut() else {
            return Err(Error::InvalidState(format!("source {} is not loaded", self.id)));
        };
        let reached = match catch_decoder_panic("seek", || decoder.seek(time)) {
            Ok(reached) => reached,
            Err(e) => {
                self.set_phase(SourcePhase::Ready);
                return Err(e);
            }
        };

        if let Some(resampler) = state.resampler.as_mut() {
            resampler.reset();
        }
        state.effects.reset();
        state.position = reached;
        state.at_transition_start = true;
        state.trimmed_seconds = 0.0;
        self.ended.store(false, Ordering::Release);
        self.set_phase(SourcePhase::Ready);

        debug!("[Source {}] Seeked to {:.3}s", self.id, reached);
        Ok(Outcome::Completed(reached))
    }

    /// Start a fade over `duration_seconds` from the next produced frame
    pub async fn start_fade(&self, direction: FadeDirection, duration_seconds: f64) {
        let mut state = self.state.lock().await;
        let rate = self.dsp.output_sample_rate() as f64;
        state.fade = Some(Fade {
            direction,
            curve: FadeCurve::EqualPower,
            total_frames: (duration_seconds.max(0.0) * rate).round() as usize,
            elapsed_frames: 0,
        });
        debug!("[Source {}] Fade {:?} over {:.1}s", self.id, direction, duration_seconds);
    }

    /// Produce up to `count` buffers, calling `on_ready` for each
    ///
    /// The token is checked before every decoder call and again right before
    /// `on_ready`. Stops early at end of stream.
    ///
    /// # Returns
    /// Number of buffers handed to `on_ready`, or `Cancelled`
    pub async fn fill_buffers<F>(
        &self,
        claim: FillClaim,
        count: usize,
        options: FillOptions,
        mut on_ready: F,
    ) -> Result<Outcome<usize>>
    where
        F: FnMut(ProducedBuffer) + Send,
    {
        let token = claim.token();
        let mut fill_type = options.first_fill_type;
        let mut extra_data = options.extra_data.clone();
        let mut produced = 0;

        trace!(
            "[Source {}] Fill {} buffers ({}), hint {:?}",
            self.id,
            count,
            fill_type,
            options.total_buffers_hint
        );

        while produced < count {
            tokio::task::yield_now().await;
            if self.epoch.is_cancelled(&token) {
                return Ok(Outcome::Cancelled);
            }

            let mut state = self.state.lock().await;
            if self.epoch.is_cancelled(&token) {
                return Ok(Outcome::Cancelled);
            }
            if self.is_ended() {
                break;
            }

            let background = options.background || self.is_background();
            let Some(mut buffer) = self.produce_buffer(&mut state, &options.config, background)?
            else {
                continue;
            };
            drop(state);

            if self.epoch.is_cancelled(&token) {
                return Ok(Outcome::Cancelled);
            }

            let is_last = buffer.descriptor.is_last_buffer;
            buffer.fill_type = fill_type;
            if let Some(extra) = extra_data.take() {
                buffer.descriptor.base_time = Some(extra.base_time);
                buffer.extra_data = Some(extra);
            }
            on_ready(buffer);
            produced += 1;
            fill_type = BufferFillType::Regular;

            if is_last {
                break;
            }
        }

        drop(claim);
        Ok(Outcome::Completed(produced))
    }

    /// Decode and process one buffer
    ///
    /// Returns `None` when the buffer was leading silence that got trimmed.
    fn produce_buffer(
        &self,
        state: &mut SourceState,
        config: &Configuration,
        background: bool,
    ) -> Result<Option<ProducedBuffer>> {
        let buffer_time = config.buffer_time_seconds()?;
        let SourceState {
            decoder,
            demux,
            scratch,
            resampler,
            effects,
            loudness,
            fade,
            position,
            at_transition_start,
            trimmed_seconds,
        } = state;
        let (Some(decoder), Some(demux)) = (decoder.as_mut(), demux.as_ref()) else {
            return Err(Error::InvalidState(format!("source {} is not loaded", self.id)));
        };

        let in_channels = demux.channels;
        let in_rate = demux.sample_rate;
        let out_channels = self.dsp.output_channels();
        let out_rate = self.dsp.output_sample_rate();
        let chunk = chunk_frames(buffer_time, in_rate);

        if let Some(lease) = resampler.as_mut() {
            if lease.chunk_frames() != chunk {
                lease.prepare(chunk)?;
            }
        }
        let max_out_frames = match resampler.as_ref() {
            Some(lease) => lease.max_output_frames(chunk),
            None => chunk,
        };

        let decode_len = chunk * in_channels as usize;
        let resample_len = max_out_frames * in_channels as usize;
        let mix_len = max_out_frames * out_channels as usize;
        let (decode_buf, rest) = scratch.split(decode_len, resample_len + mix_len)?;
        let (resample_buf, mix_buf) = rest.split_at_mut(resample_len);

        let mut frames_read = 0;
        while frames_read < chunk {
            let offset = frames_read * in_channels as usize;
            let frames = catch_decoder_panic("read", || {
                decoder.read_frames(&mut decode_buf[offset..decode_len])
            })?;
            if frames == 0 {
                break;
            }
            frames_read += frames;
        }
        let is_last = frames_read < chunk;
        if is_last {
            self.ended.store(true, Ordering::Release);
            debug!(
                "[Source {}] End of stream at {:.3}s",
                self.id,
                *position + frames_read as f64 / in_rate as f64
            );
        }

        let mut data: &mut [f32] = &mut decode_buf[..frames_read * in_channels as usize];
        let mut frames = frames_read;

        if let Some(lease) = resampler.as_mut() {
            frames = lease.process(data, resample_buf)?;
            data = &mut resample_buf[..frames * in_channels as usize];
        }
        if self.dsp.mixer().needs_mixing(in_channels) {
            frames = self.dsp.mixer().mix(data, in_channels, mix_buf)?;
            data = &mut mix_buf[..frames * out_channels as usize];
        }

        let measured = loudness.process(data, out_channels, out_rate, config.loudness_normalization)?;

        effects.configure(&config.effects);
        effects.process(data, out_channels, out_rate);

        if let Some(active_fade) = fade.as_mut() {
            active_fade.apply(data, out_channels as usize);
            if active_fade.is_finished() {
                *fade = None;
            }
        }

        let start_time = *position;
        let end_time = start_time + frames_read as f64 / in_rate as f64;
        *position = end_time;

        if config.silence_trimming
            && *at_transition_start
            && measured.is_entirely_silent
            && !is_last
            && *trimmed_seconds < MAX_TRIMMED_SILENCE_SECONDS
        {
            *trimmed_seconds += end_time - start_time;
            trace!("[Source {}] Trimmed silent buffer at {:.3}s", self.id, start_time);
            return Ok(None);
        }
        *at_transition_start = false;

        let mut channel_data = allocate_samples(data.len())?;
        channel_data.copy_from_slice(data);

        Ok(Some(ProducedBuffer {
            descriptor: BufferDescriptor {
                sequence: 0,
                is_background_buffer: background,
                base_time: None,
                source_id: self.id,
                length: frames,
                channel_count: out_channels,
                start_time,
                end_time,
                loudness_gain: measured.gain,
                is_entirely_silent: measured.is_entirely_silent,
                is_last_buffer: is_last,
            },
            fill_type: BufferFillType::Regular,
            extra_data: None,
            channel_data,
        }))
    }

    /// Mark destroyed and cancel everything; no waiting
    pub fn retire(&self) {
        self.phase
            .store(SourcePhase::Destroyed as u8, Ordering::Release);
        self.cancel_all_operations();
    }

    /// Free native resources once cancelled operations have unwound
    pub async fn release(&self) {
        self.epoch.acknowledged().await;
        let mut state = self.state.lock().await;
        if let Some(lease) = state.resampler.take() {
            self.dsp.release_resampler(lease);
        }
        state.scratch.release();
        state.decoder = None;
        state.fade = None;
        debug!("[Source {}] Destroyed", self.id);
    }

    /// Cancel, wait for the acknowledgement, then free everything
    pub async fn destroy(&self) {
        self.retire();
        self.release().await;
    }

    /// Let a running fill finish without cancelling it, then destroy
    pub async fn destroy_after_buffers_filled(&self) {
        self.epoch.acknowledged().await;
        self.destroy().await;
    }

    /// Resampler held by this source, if any
    pub async fn resampler_slot(&self) -> Option<usize> {
        let state = self.state.lock().await;
        state.resampler.as_ref().map(|lease| lease.slot().index())
    }

    /// Current scratch capacity in samples
    pub async fn scratch_capacity(&self) -> usize {
        self.state.lock().await.scratch.capacity()
    }
}

/// Input frames decoded per buffer
fn chunk_frames(buffer_time: f64, sample_rate: u32) -> usize {
    ((buffer_time * sample_rate as f64).round() as usize).max(1)
}
