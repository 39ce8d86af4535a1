//! Synthetic decoder collaborator
//!
//! Tracks are registered by name with a [`TrackSpec`]. Every track is a
//! 440 Hz sine at half scale. A track may fail once decoding reaches a given
//! time (with a decode error, an allocation error, or a panic), or block in
//! `open` until the factory's gate is opened.

use sae_common::events::{DemuxData, FileReference};
use sae_engine::source::{Decoder, DecoderFactory};
use sae_engine::{Error, Result};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const FREQUENCY: f64 = 440.0;
const AMPLITUDE: f64 = 0.5;
const GATE_TIMEOUT: Duration = Duration::from_secs(5);

/// How an injected failure surfaces from `read_frames`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureMode {
    Decode,
    Allocation,
    Panic,
}

#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub seconds: f64,
    /// Decoding at or past this time fails
    pub fail_at_seconds: Option<f64>,
    pub failure_mode: FailureMode,
    /// `open` blocks until the gate opens
    pub gated: bool,
}

impl TrackSpec {
    pub fn new(sample_rate: u32, channels: u16, seconds: f64) -> Self {
        Self {
            sample_rate,
            channels,
            seconds,
            fail_at_seconds: None,
            failure_mode: FailureMode::Decode,
            gated: false,
        }
    }

    pub fn failing_at(mut self, seconds: f64) -> Self {
        self.fail_at_seconds = Some(seconds);
        self.failure_mode = FailureMode::Decode;
        self
    }

    pub fn allocation_failure_at(mut self, seconds: f64) -> Self {
        self.fail_at_seconds = Some(seconds);
        self.failure_mode = FailureMode::Allocation;
        self
    }

    pub fn panicking_at(mut self, seconds: f64) -> Self {
        self.fail_at_seconds = Some(seconds);
        self.failure_mode = FailureMode::Panic;
        self
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }
}

#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    fn wait(&self) {
        let guard = self.open.lock().unwrap();
        let (guard, timeout) = self
            .changed
            .wait_timeout_while(guard, GATE_TIMEOUT, |open| !*open)
            .unwrap();
        assert!(*guard || !timeout.timed_out(), "gate never opened");
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.changed.notify_all();
    }
}

/// Factory serving registered synthetic tracks
#[derive(Default)]
pub struct SineFactory {
    tracks: Mutex<HashMap<String, TrackSpec>>,
    gate: Gate,
    opens: AtomicUsize,
}

impl SineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_track(self: Arc<Self>, name: &str, spec: TrackSpec) -> Arc<Self> {
        self.tracks.lock().unwrap().insert(name.to_string(), spec);
        self
    }

    /// Release every open blocked on the gate
    pub fn open_gate(&self) {
        self.gate.open();
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DecoderFactory for SineFactory {
    fn open(&self, file_reference: &FileReference) -> Result<Box<dyn Decoder>> {
        let spec = self
            .tracks
            .lock()
            .unwrap()
            .get(file_reference.as_str())
            .cloned()
            .ok_or_else(|| Error::Decode(format!("unknown track {}", file_reference)))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        if spec.gated {
            self.gate.wait();
        }
        Ok(Box::new(SineDecoder::new(spec)))
    }
}

struct SineDecoder {
    demux: DemuxData,
    total_frames: usize,
    fail_frame: Option<usize>,
    failure_mode: FailureMode,
    position: usize,
}

impl SineDecoder {
    fn new(spec: TrackSpec) -> Self {
        let rate = spec.sample_rate as f64;
        Self {
            demux: DemuxData {
                sample_rate: spec.sample_rate,
                channels: spec.channels,
                duration_seconds: Some(spec.seconds),
                codec: "sine".to_string(),
            },
            total_frames: (spec.seconds * rate).round() as usize,
            fail_frame: spec.fail_at_seconds.map(|s| (s * rate).round() as usize),
            failure_mode: spec.failure_mode,
            position: 0,
        }
    }
}

impl Decoder for SineDecoder {
    fn demux_data(&self) -> &DemuxData {
        &self.demux
    }

    fn seek(&mut self, seconds: f64) -> Result<f64> {
        let rate = self.demux.sample_rate as f64;
        self.position = ((seconds.max(0.0) * rate).round() as usize).min(self.total_frames);
        Ok(self.position as f64 / rate)
    }

    fn read_frames(&mut self, output: &mut [f32]) -> Result<usize> {
        if self.fail_frame.is_some_and(|frame| self.position >= frame) {
            return match self.failure_mode {
                FailureMode::Decode => Err(Error::Decode("injected decode failure".to_string())),
                FailureMode::Allocation => {
                    Err(Error::NativeAllocation("injected allocation failure".to_string()))
                }
                FailureMode::Panic => panic!("injected decoder panic"),
            };
        }
        let channels = self.demux.channels as usize;
        let limit = self.fail_frame.unwrap_or(self.total_frames).min(self.total_frames);
        let frames = (output.len() / channels).min(limit - self.position);
        let rate = self.demux.sample_rate as f64;

        for (i, frame) in output[..frames * channels].chunks_exact_mut(channels).enumerate() {
            let t = (self.position + i) as f64 / rate;
            let value = (AMPLITUDE * (2.0 * PI * FREQUENCY * t).sin()) as f32;
            frame.fill(value);
        }
        self.position += frames;
        Ok(frames)
    }
}
