//! # Streaming Audio Engine Library (sae-engine)
//!
//! Decodes, resamples, channel-mixes, filters and buffers audio for gapless
//! playback, with mid-stream seeking and look-ahead preloading of the next
//! track.
//!
//! **Architecture:** actions arrive through [`AudioEngine::dispatch`]; the
//! engine drives at most two [`source::AudioSource`]s (active and passive),
//! each running symphonia decode → rubato resample → channel mix → effect
//! chain, and emits `bufferFilled` / `idle` / `error` events through a
//! [`transport::EventSender`]. Every source operation is cooperatively
//! cancellable through its [`cancel::CancellationEpoch`].

pub mod cancel;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod source;
pub mod transport;

pub use config::EngineSettings;
pub use engine::AudioEngine;
pub use error::{Error, Result};
