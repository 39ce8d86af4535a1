//! Fill loops, delivery, promotion and teardown
//!
//! **Responsibilities:**
//! - Run the load, seek and regular fill loops spawned by dispatch
//! - Deliver produced buffers, promoting the passive source on its first one
//! - Hand off the outgoing source: immediate destruction on a skip, a
//!   background tail followed by deferred destruction on a preload
//! - Turn failures into `error` events without undoing a promotion

use super::core::{EngineInner, EngineState};
use crate::cancel::{CancellationToken, Outcome};
use crate::error::{Error, Result};
use crate::source::{AudioSource, FillClaim, FillOptions, ProducedBuffer};
use sae_common::events::{
    BufferExtraData, BufferFillType, EngineEvent, LoadRequest, SeekRequest,
};
use sae_common::{Configuration, FadeDirection};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// How buffers of one fill loop relate to the active/passive slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Continuation of whatever source produced it
    Continue,
    /// Load loop; the first delivered buffer promotes the source
    Load { preload: bool },
}

impl EngineInner {
    pub(super) async fn run_load(
        self: Arc<Self>,
        source: Arc<AudioSource>,
        token: CancellationToken,
        request: LoadRequest,
        config: Configuration,
    ) {
        let result = self.load_and_fill(&source, token, &request, config).await;
        self.finish(&source, token, "load", result).await;
    }

    async fn load_and_fill(
        self: &Arc<Self>,
        source: &Arc<AudioSource>,
        token: CancellationToken,
        request: &LoadRequest,
        config: Configuration,
    ) -> Result<Outcome<usize>> {
        let loaded = match source.load(request, token, &config).await? {
            Outcome::Completed(loaded) => loaded,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };

        let crossfade = config.crossfade_duration_seconds;
        if request.is_preload_for_next_track && crossfade > 0.0 {
            source.start_fade(FadeDirection::In, crossfade).await;
        }

        let claim = match source.claim_fill(token)? {
            Outcome::Completed(claim) => claim,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        let count = request.buffer_fill_count.max(1);
        let options = FillOptions {
            token,
            first_fill_type: BufferFillType::FirstLoad,
            extra_data: Some(BufferExtraData {
                base_time: loaded.base_time,
                demux_data: Some(loaded.demux_data),
                is_preload_for_next_track: request.is_preload_for_next_track,
                resume_after_load: request.resume_after_load,
            }),
            background: false,
            config,
            total_buffers_hint: Some(count),
        };
        let delivery = Delivery::Load {
            preload: request.is_preload_for_next_track,
        };
        self.fill(source, claim, count, options, delivery).await
    }

    pub(super) async fn run_seek(
        self: Arc<Self>,
        source: Arc<AudioSource>,
        token: CancellationToken,
        request: SeekRequest,
        config: Configuration,
    ) {
        let result = self.seek_and_fill(&source, token, &request, config).await;
        self.clear_pending_seek(&source, token);
        self.finish(&source, token, "seek", result).await;
    }

    async fn seek_and_fill(
        self: &Arc<Self>,
        source: &Arc<AudioSource>,
        token: CancellationToken,
        request: &SeekRequest,
        config: Configuration,
    ) -> Result<Outcome<usize>> {
        let base_time = match source.seek(request.time, token).await? {
            Outcome::Completed(base_time) => base_time,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };

        // Claim first: fillBuffers must not see the seek as finished while
        // the fill loop is still unclaimed
        let claimed = source.claim_fill(token);
        self.clear_pending_seek(source, token);
        let claim = match claimed? {
            Outcome::Completed(claim) => claim,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };

        let count = request.buffer_fill_count.max(1);
        let options = FillOptions {
            token,
            first_fill_type: BufferFillType::FirstSeek,
            extra_data: Some(BufferExtraData {
                base_time,
                demux_data: None,
                is_preload_for_next_track: false,
                resume_after_load: false,
            }),
            background: false,
            config,
            total_buffers_hint: Some(count),
        };
        self.fill(source, claim, count, options, Delivery::Continue).await
    }

    fn clear_pending_seek(&self, source: &AudioSource, token: CancellationToken) {
        let mut state = self.lock_state();
        if state.pending_seek == Some((source.id(), token)) {
            state.pending_seek = None;
        }
    }

    pub(super) async fn run_fill(
        self: Arc<Self>,
        source: Arc<AudioSource>,
        claim: FillClaim,
        count: usize,
        config: Configuration,
    ) {
        let token = claim.token();
        let options = FillOptions {
            token,
            first_fill_type: BufferFillType::Regular,
            extra_data: None,
            background: false,
            config,
            total_buffers_hint: Some(count),
        };
        let result = self
            .fill(&source, claim, count, options, Delivery::Continue)
            .await;
        self.finish(&source, token, "fillBuffers", result).await;
    }

    /// Run one fill loop and return how many buffers reached the transport
    async fn fill(
        self: &Arc<Self>,
        source: &Arc<AudioSource>,
        claim: FillClaim,
        count: usize,
        options: FillOptions,
        delivery: Delivery,
    ) -> Result<Outcome<usize>> {
        let token = claim.token();
        let mut delivered = 0;
        let produced = source
            .fill_buffers(claim, count, options, |buffer| {
                if self.deliver(source, &token, buffer, delivery) {
                    delivered += 1;
                }
            })
            .await?;
        Ok(produced.map(|_| delivered))
    }

    /// Send one buffer if its source may still be heard
    ///
    /// Runs under the state lock, so the token check, promotion and send are
    /// atomic with respect to seek and load dispatch.
    fn deliver(
        self: &Arc<Self>,
        source: &Arc<AudioSource>,
        token: &CancellationToken,
        buffer: ProducedBuffer,
        delivery: Delivery,
    ) -> bool {
        let mut state = self.lock_state();
        if source.is_cancelled(token) {
            trace!("[Source {}] Dropping buffer from superseded generation", source.id());
            return false;
        }

        if let Delivery::Load { preload } = delivery {
            let is_passive = state
                .passive
                .as_ref()
                .is_some_and(|passive| Arc::ptr_eq(passive, source));
            if is_passive {
                state.passive = None;
                if let Some(previous) = state.active.replace(Arc::clone(source)) {
                    self.hand_off(&mut state, previous, preload);
                }
                info!("[Source {}] Promoted to active", source.id());
            }
        }

        let is_active = state
            .active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, source));
        if !is_active && !buffer.descriptor.is_background_buffer {
            trace!("[Source {}] Dropping buffer from inactive source", source.id());
            return false;
        }

        let mut descriptor = buffer.descriptor;
        descriptor.sequence = state.next_sequence;
        state.next_sequence += 1;
        trace!(
            "[Source {}] Delivering #{} ({}) {:.3}s..{:.3}s",
            source.id(),
            descriptor.sequence,
            buffer.fill_type,
            descriptor.start_time,
            descriptor.end_time
        );
        self.events.send(EngineEvent::BufferFilled {
            descriptor,
            buffer_fill_type: buffer.fill_type,
            extra_data: buffer.extra_data,
            channel_data: buffer.channel_data,
        })
    }

    /// Dispose of the source that just lost the active slot
    fn hand_off(self: &Arc<Self>, state: &mut EngineState, previous: Arc<AudioSource>, preload: bool) {
        if preload {
            debug!("[Source {}] Draining after handoff", previous.id());
            previous.mark_background();
            state.draining.push(Arc::clone(&previous));
            let inner = Arc::clone(self);
            let config = state.config.clone();
            tokio::spawn(async move { inner.drain(previous, config).await });
        } else {
            debug!("[Source {}] Destroyed by skip", previous.id());
            previous.retire();
            tokio::spawn(async move { previous.release().await });
        }
    }

    /// Produce the fade-out tail of an outgoing source, then destroy it
    async fn drain(self: Arc<Self>, source: Arc<AudioSource>, config: Configuration) {
        let crossfade = config.crossfade_duration_seconds;
        let tail = config
            .crossfade_buffer_count()
            .unwrap_or(0)
            .min(self.settings.max_background_buffers);

        if tail > 0 && !source.is_ended() {
            source.start_fade(FadeDirection::Out, crossfade).await;
            source.buffer_operation_cancellation_acknowledged().await;

            // A retire bumps the epoch, so the current token would still claim
            if source.is_destroyed() {
                trace!("[Source {}] Retired before its tail was filled", source.id());
            } else {
                self.fill_tail(&source, tail, config).await;
            }
        }

        source.destroy_after_buffers_filled().await;
    }

    async fn fill_tail(self: &Arc<Self>, source: &Arc<AudioSource>, tail: usize, config: Configuration) {
        match source.claim_fill(source.token()) {
            Ok(Outcome::Completed(claim)) => {
                let options = FillOptions {
                    token: claim.token(),
                    first_fill_type: BufferFillType::Regular,
                    extra_data: None,
                    background: true,
                    config,
                    total_buffers_hint: Some(tail),
                };
                match self
                    .fill(source, claim, tail, options, Delivery::Continue)
                    .await
                {
                    Ok(Outcome::Completed(delivered)) => {
                        debug!("[Source {}] Tail of {} buffer(s) delivered", source.id(), delivered)
                    }
                    Ok(Outcome::Cancelled) => {}
                    Err(e) => warn!("[Source {}] Tail fill failed: {}", source.id(), e),
                }
            }
            Ok(Outcome::Cancelled) => {}
            Err(e) => debug!("[Source {}] Tail fill skipped: {}", source.id(), e),
        }
    }

    /// Report the end of an action's task
    async fn finish(
        &self,
        source: &Arc<AudioSource>,
        token: CancellationToken,
        operation: &'static str,
        result: Result<Outcome<usize>>,
    ) {
        match result {
            Ok(Outcome::Completed(delivered)) if delivered > 0 => {
                self.events.idle();
            }
            Ok(Outcome::Completed(_)) => {
                trace!("[Source {}] {} delivered nothing", source.id(), operation)
            }
            Ok(Outcome::Cancelled) => {
                trace!("[Source {}] {} superseded", source.id(), operation)
            }
            Err(e) if source.is_cancelled(&token) => {
                trace!("[Source {}] {} superseded before failing: {}", source.id(), operation, e)
            }
            Err(e) => self.fail(source, operation, e).await,
        }
    }

    /// Report a failure and discard the source if it was never promoted
    async fn fail(&self, source: &Arc<AudioSource>, operation: &'static str, error: Error) {
        warn!("[Source {}] {} failed: {}", source.id(), operation, error);

        let fatal = error.is_fatal_to_source();
        let discard = {
            let mut state = self.lock_state();
            let still_passive = state
                .passive
                .as_ref()
                .is_some_and(|passive| Arc::ptr_eq(passive, source));
            if still_passive {
                state.passive = None;
            }
            if fatal {
                if state
                    .active
                    .as_ref()
                    .is_some_and(|active| Arc::ptr_eq(active, source))
                {
                    state.active = None;
                }
                state.draining.retain(|draining| !Arc::ptr_eq(draining, source));
            }
            if still_passive || fatal {
                source.retire();
            }
            still_passive || fatal
        };

        self.events.error(error.to_string());
        if discard {
            source.release().await;
        }
    }
}
