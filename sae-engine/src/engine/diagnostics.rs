//! Read-only engine accessors for hosts and tests

use super::core::AudioEngine;
use crate::config::EngineSettings;
use crate::dsp::resampler_pool::PoolStats;
use crate::dsp::DspContext;
use crate::source::AudioSource;
use sae_common::events::SourceId;
use sae_common::Configuration;
use std::sync::Arc;
use std::time::Instant;

impl AudioEngine {
    pub fn active_source_id(&self) -> Option<SourceId> {
        self.inner.lock_state().active.as_ref().map(|s| s.id())
    }

    pub fn passive_source_id(&self) -> Option<SourceId> {
        self.inner.lock_state().passive.as_ref().map(|s| s.id())
    }

    /// Handle of the active source, for observing its lifecycle
    pub fn active_source(&self) -> Option<Arc<AudioSource>> {
        self.inner.lock_state().active.clone()
    }

    pub fn passive_source(&self) -> Option<Arc<AudioSource>> {
        self.inner.lock_state().passive.clone()
    }

    /// Outgoing sources not yet reaped by `ping`
    pub fn draining_source_ids(&self) -> Vec<SourceId> {
        self.inner
            .lock_state()
            .draining
            .iter()
            .map(|s| s.id())
            .collect()
    }

    /// Snapshot of the current audio configuration
    pub fn configuration(&self) -> Configuration {
        self.inner.lock_state().config.clone()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn ping_count(&self) -> u64 {
        self.inner.lock_state().ping_count
    }

    pub fn last_ping(&self) -> Option<Instant> {
        self.inner.lock_state().last_ping
    }

    /// Resampler pool statistics for sources with this input format
    pub fn pool_stats(&self, channels: u16, input_rate: u32) -> PoolStats {
        let key = self.inner.dsp.resampler_key(channels, input_rate);
        self.inner.dsp.pool_stats(&key)
    }

    /// Leak warnings raised by the resampler pool so far
    pub fn leak_warnings(&self) -> usize {
        self.inner.dsp.leak_warnings()
    }

    pub fn dsp(&self) -> &Arc<DspContext> {
        &self.inner.dsp
    }
}
