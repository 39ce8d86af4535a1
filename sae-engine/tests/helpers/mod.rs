//! Test helper modules for sae-engine integration tests
//!
//! Provides reusable test infrastructure components:
//! - SineFactory: synthetic tracks with injectable failures and gated opens
//! - EventCollector: timeout-guarded access to emitted events
//! - audio_generator: WAV fixtures for the symphonia decoder

#![allow(dead_code)]

pub mod audio_generator;
pub mod event_collector;
pub mod sine_source;

pub use event_collector::{EventCollector, FilledBuffer};
pub use sine_source::{FailureMode, SineFactory, TrackSpec};

use sae_common::events::{EngineAction, FileReference, LoadRequest, SeekRequest};
use sae_engine::{AudioEngine, EngineSettings};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait in a test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine with default settings over `factory`
pub fn engine_with(factory: Arc<SineFactory>) -> (AudioEngine, EventCollector) {
    let (engine, receiver) = AudioEngine::with_channel(EngineSettings::default(), factory);
    (engine, EventCollector::new(receiver))
}

pub fn configure(value: Value) -> EngineAction {
    match value {
        Value::Object(config) => EngineAction::Configure { config },
        other => panic!("Expected object, got {}", other),
    }
}

/// Buffer time only, loudness normalization off so sample values stay predictable
pub fn configure_plain(buffer_time_seconds: f64) -> EngineAction {
    configure(json!({
        "bufferTimeSeconds": buffer_time_seconds,
        "loudnessNormalization": false
    }))
}

pub fn load(reference: &str, buffer_fill_count: usize) -> EngineAction {
    EngineAction::Load(LoadRequest::new(FileReference::new(reference), buffer_fill_count))
}

pub fn preload(reference: &str, buffer_fill_count: usize) -> EngineAction {
    EngineAction::Load(LoadRequest {
        is_preload_for_next_track: true,
        ..LoadRequest::new(FileReference::new(reference), buffer_fill_count)
    })
}

pub fn seek(time: f64, buffer_fill_count: usize) -> EngineAction {
    EngineAction::Seek(SeekRequest {
        time,
        buffer_fill_count,
    })
}

pub fn fill(buffer_fill_count: usize) -> EngineAction {
    EngineAction::FillBuffers { buffer_fill_count }
}

/// Dispatch and wait for the spawned work, if any
pub async fn dispatch_and_wait(engine: &AudioEngine, action: EngineAction) {
    if let Some(handle) = engine.dispatch(action) {
        tokio::time::timeout(TEST_TIMEOUT, handle)
            .await
            .expect("action should finish in time")
            .expect("action task panicked");
    }
}

/// Poll `condition` until it holds or the test timeout expires
pub async fn wait_for(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {}", description);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn ping() -> EngineAction {
    EngineAction::Ping
}
