//! Engine state and action dispatch

use crate::cancel::{CancellationToken, Outcome};
use crate::config::EngineSettings;
use crate::dsp::DspContext;
use crate::source::{AudioSource, DecoderFactory, SourcePhase};
use crate::transport::{self, EventReceiver, EventSender};
use sae_common::events::{EngineAction, LoadRequest, SeekRequest, SourceId};
use sae_common::{Configuration, ConfigurationUpdate};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Mutable engine state, guarded by [`EngineInner::lock_state`]
pub(super) struct EngineState {
    pub(super) config: Configuration,
    /// Source whose buffers are audible
    pub(super) active: Option<Arc<AudioSource>>,
    /// Source loading, not yet promoted
    pub(super) passive: Option<Arc<AudioSource>>,
    /// Former active sources finishing their tail before destruction
    pub(super) draining: Vec<Arc<AudioSource>>,
    /// Seek on the active source that has not claimed its fill loop yet
    pub(super) pending_seek: Option<(SourceId, CancellationToken)>,
    pub(super) last_ping: Option<Instant>,
    pub(super) ping_count: u64,
    pub(super) next_sequence: u64,
}

pub(super) struct EngineInner {
    pub(super) settings: EngineSettings,
    pub(super) dsp: Arc<DspContext>,
    pub(super) factory: Arc<dyn DecoderFactory>,
    pub(super) events: EventSender,
    state: Mutex<EngineState>,
    next_source_id: AtomicU64,
}

impl EngineInner {
    // Never held across an await; a panic elsewhere leaves the state consistent
    pub(super) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_source_id(&self) -> SourceId {
        SourceId(self.next_source_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Streaming audio engine
///
/// Cheap to clone; clones share one engine. Actions go in through
/// [`dispatch`](Self::dispatch), events come out of the [`EventSender`] the
/// engine was built with.
#[derive(Clone)]
pub struct AudioEngine {
    pub(super) inner: Arc<EngineInner>,
}

impl AudioEngine {
    pub fn new(
        settings: EngineSettings,
        factory: Arc<dyn DecoderFactory>,
        events: EventSender,
    ) -> Self {
        let dsp = Arc::new(DspContext::new(&settings));
        info!(
            "Audio engine created: {} Hz, {} channels, {:?} resampling",
            settings.output_sample_rate, settings.output_channels, settings.resampler_quality
        );
        Self {
            inner: Arc::new(EngineInner {
                settings,
                dsp,
                factory,
                events,
                state: Mutex::new(EngineState {
                    config: Configuration::default(),
                    active: None,
                    passive: None,
                    draining: Vec::new(),
                    pending_seek: None,
                    last_ping: None,
                    ping_count: 0,
                    next_sequence: 0,
                }),
                next_source_id: AtomicU64::new(0),
            }),
        }
    }

    /// Engine plus the receiving end of its event channel
    pub fn with_channel(
        settings: EngineSettings,
        factory: Arc<dyn DecoderFactory>,
    ) -> (Self, EventReceiver) {
        let (sender, receiver) = transport::channel();
        (Self::new(settings, factory, sender), receiver)
    }

    /// Handle one action
    ///
    /// The synchronous part (validation, epoch bumps, fill claims) runs before
    /// this returns, so actions take effect in the order they are dispatched.
    /// Decode work continues on a spawned task whose handle is returned;
    /// dropping it does not cancel anything.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, action: EngineAction) -> Option<JoinHandle<()>> {
        debug!("Dispatching {}", action.kind());
        match action {
            EngineAction::Configure { config } => {
                self.configure(config);
                None
            }
            EngineAction::Ping => {
                self.ping();
                None
            }
            EngineAction::Seek(request) => self.seek(request),
            EngineAction::Load(request) => self.load(request),
            EngineAction::FillBuffers { buffer_fill_count } => self.request_fill(buffer_fill_count),
        }
    }

    /// Dispatch actions until the sender side closes
    pub async fn run(&self, mut actions: mpsc::UnboundedReceiver<EngineAction>) {
        while let Some(action) = actions.recv().await {
            self.dispatch(action);
        }
        info!("Action channel closed");
        self.shutdown().await;
    }

    fn configure(&self, config: Map<String, Value>) {
        let result = ConfigurationUpdate::from_json(config).and_then(|update| {
            let mut state = self.inner.lock_state();
            state.config.apply(update)
        });
        match result {
            Ok(()) => info!("Configuration updated"),
            Err(e) => {
                warn!("configure rejected: {}", e);
                self.inner.events.error(e.to_string());
            }
        }
    }

    fn ping(&self) {
        let mut state = self.inner.lock_state();
        state.last_ping = Some(Instant::now());
        state.ping_count += 1;

        let before = state.draining.len();
        state.draining.retain(|source| !source.is_destroyed());
        let reaped = before - state.draining.len();
        if reaped > 0 {
            debug!("Reaped {} drained source(s)", reaped);
        }
    }

    fn seek(&self, request: SeekRequest) -> Option<JoinHandle<()>> {
        let mut state = self.inner.lock_state();
        let Some(source) = state.active.clone() else {
            drop(state);
            warn!("seek to {:.3}s without an active source", request.time);
            self.inner.events.error("seek requires an active source");
            return None;
        };

        let token = source.cancel_all_operations();
        state.pending_seek = Some((source.id(), token));
        let config = state.config.clone();
        drop(state);

        debug!("[Source {}] Seek to {:.3}s", source.id(), request.time);
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            inner.run_seek(source, token, request, config).await
        }))
    }

    fn load(&self, request: LoadRequest) -> Option<JoinHandle<()>> {
        let mut state = self.inner.lock_state();
        let config = state.config.clone();
        if let Err(e) = config.buffer_time_seconds() {
            drop(state);
            warn!("load of {} rejected: {}", request.file_reference, e);
            self.inner.events.error(e.to_string());
            return None;
        }

        let source = AudioSource::new(
            self.inner.next_source_id(),
            Arc::clone(&self.inner.dsp),
            Arc::clone(&self.inner.factory),
        );
        let token = source.cancel_all_operations();
        if let Some(superseded) = state.passive.replace(Arc::clone(&source)) {
            debug!(
                "[Source {}] Superseded by [Source {}] before promotion",
                superseded.id(),
                source.id()
            );
            superseded.retire();
            tokio::spawn(async move { superseded.release().await });
        }
        drop(state);

        info!(
            "[Source {}] Load {} (preload={}, progress={:.3})",
            source.id(),
            request.file_reference,
            request.is_preload_for_next_track,
            request.progress
        );
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            inner.run_load(source, token, request, config).await
        }))
    }

    /// Backpressure request; dropped while the active source is busy
    fn request_fill(&self, count: usize) -> Option<JoinHandle<()>> {
        let state = self.inner.lock_state();
        let Some(source) = state.active.clone() else {
            debug!("fillBuffers without an active source; ignored");
            return None;
        };
        if count == 0 {
            return None;
        }

        let seek_pending = state
            .pending_seek
            .is_some_and(|(id, _)| id == source.id());
        if seek_pending
            || source.is_buffer_filling_in_progress()
            || source.phase() != SourcePhase::Ready
            || source.is_ended()
        {
            trace!(
                "[Source {}] fillBuffers coalesced (phase={}, ended={})",
                source.id(),
                source.phase(),
                source.is_ended()
            );
            return None;
        }

        let claim = match source.claim_fill(source.token()) {
            Ok(Outcome::Completed(claim)) => claim,
            Ok(Outcome::Cancelled) => return None,
            Err(e) => {
                debug!("[Source {}] fillBuffers dropped: {}", source.id(), e);
                return None;
            }
        };
        let config = state.config.clone();
        drop(state);

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            inner.run_fill(source, claim, count, config).await
        }))
    }

    /// Destroy every source; the engine stays usable afterwards
    pub async fn shutdown(&self) {
        let sources: Vec<Arc<AudioSource>> = {
            let mut state = self.inner.lock_state();
            state.pending_seek = None;
            let mut sources: Vec<_> = state.draining.drain(..).collect();
            sources.extend(state.passive.take());
            sources.extend(state.active.take());
            sources
        };
        for source in &sources {
            source.retire();
        }
        for source in sources {
            source.release().await;
        }
        debug!("Engine sources released");
    }
}
