//! # Streaming Audio Engine Common Library
//!
//! Shared code for the engine and its consumers including:
//! - Transport message types (EngineAction / EngineEvent)
//! - Audio configuration and validation
//! - Effect specifications and the equalizer band layout
//! - Fade curve definitions for crossfades

pub mod config;
pub mod effects;
pub mod error;
pub mod events;
pub mod fade_curves;

pub use config::{Configuration, ConfigurationUpdate};
pub use effects::EffectSpec;
pub use error::{Error, Result};
pub use fade_curves::{FadeCurve, FadeDirection};
