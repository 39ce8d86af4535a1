//! DSP stages and the context that owns their shared state
//!
//! [`DspContext`] is built once per engine from its settings and handed to
//! every source as an `Arc`. It owns the output format, the channel mixer and
//! the resampler pool; nothing in this module is process-global.

pub mod channel_mixer;
pub mod effects;
pub mod loudness;
pub mod resampler;
pub mod resampler_pool;
pub mod scratch;

use crate::config::EngineSettings;
use crate::error::Result;
use channel_mixer::ChannelMixer;
use resampler::{ResamplerKey, ResamplerQuality};
use resampler_pool::{PoolStats, ResamplerLease, ResamplerPool};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Output format plus pooled DSP resources for one engine instance
pub struct DspContext {
    output_sample_rate: u32,
    output_channels: u16,
    resampler_quality: ResamplerQuality,
    mixer: ChannelMixer,
    resamplers: Mutex<ResamplerPool>,
}

impl DspContext {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            output_sample_rate: settings.output_sample_rate,
            output_channels: settings.output_channels,
            resampler_quality: settings.resampler_quality,
            mixer: ChannelMixer::new(settings.output_channels),
            resamplers: Mutex::new(ResamplerPool::new(settings.leak_threshold)),
        }
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    pub fn output_channels(&self) -> u16 {
        self.output_channels
    }

    pub fn mixer(&self) -> &ChannelMixer {
        &self.mixer
    }

    /// Pool key for converting `channels` at `input_rate` to the output rate
    pub fn resampler_key(&self, channels: u16, input_rate: u32) -> ResamplerKey {
        ResamplerKey {
            channels,
            input_rate,
            output_rate: self.output_sample_rate,
            quality: self.resampler_quality,
        }
    }

    /// Check out a reset resampler from the pool
    pub fn acquire_resampler(
        &self,
        channels: u16,
        input_rate: u32,
        chunk_frames: usize,
    ) -> Result<ResamplerLease> {
        let key = self.resampler_key(channels, input_rate);
        self.pool().acquire(key, chunk_frames)
    }

    /// Return a resampler to the pool
    pub fn release_resampler(&self, lease: ResamplerLease) {
        self.pool().release(lease);
    }

    pub fn pool_stats(&self, key: &ResamplerKey) -> PoolStats {
        self.pool().stats(key)
    }

    pub fn leak_warnings(&self) -> usize {
        self.pool().leak_warnings()
    }

    // Pool operations never leave it half-updated, so a poisoned lock is still usable
    fn pool(&self) -> MutexGuard<'_, ResamplerPool> {
        self.resamplers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
