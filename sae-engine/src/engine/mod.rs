//! Engine orchestration
//!
//! **Responsibilities:**
//! - `core`: engine state, action dispatch, configure/ping, and the entry
//!   points for seek, load and fill requests
//! - `lifecycle`: fill loops, buffer delivery, promotion of the passive
//!   source, draining of the outgoing source, and failure handling
//! - `diagnostics`: read-only accessors used by hosts and tests
//!
//! The engine holds at most one active and one passive [`AudioSource`]. Every
//! change to which source is active, and every epoch bump, happens under the
//! engine's state lock; buffers are checked against their token and sent
//! under the same lock, so no buffer from a superseded generation reaches the
//! transport once the newer generation exists.
//!
//! [`AudioSource`]: crate::source::AudioSource

mod core;
mod diagnostics;
mod lifecycle;

pub use self::core::AudioEngine;
