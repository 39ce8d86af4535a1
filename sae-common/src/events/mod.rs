//! Transport messages exchanged between a consumer and the engine
//!
//! Actions flow from the consumer to the engine, events flow back. Both are
//! tagged on `"type"` so every message kind is matched exhaustively at the
//! dispatch site instead of being looked up by name.

mod buffer_types;

pub use buffer_types::{
    BufferDescriptor, BufferExtraData, BufferFillType, DemuxData, FileReference, LoadRequest,
    SeekRequest, SourceId,
};

use crate::config::ConfigurationUpdate;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action received from the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineAction {
    /// Apply a configuration update
    ///
    /// The payload stays raw until dispatch so that unknown keys surface as
    /// configuration errors rather than transport errors.
    Configure { config: Map<String, Value> },

    /// Liveness tick
    Ping,

    /// Reposition the active source
    Seek(SeekRequest),

    /// Open a track in a new source handle
    Load(LoadRequest),

    /// Backpressure request for more buffers from the active source
    FillBuffers {
        #[serde(rename = "bufferFillCount")]
        buffer_fill_count: usize,
    },
}

impl EngineAction {
    /// Build a configure action from a typed update
    pub fn configure(update: &ConfigurationUpdate) -> Result<Self> {
        match serde_json::to_value(update)? {
            Value::Object(config) => Ok(EngineAction::Configure { config }),
            _ => Ok(EngineAction::Configure { config: Map::new() }),
        }
    }

    /// Wire name of the action, used in log messages
    pub fn kind(&self) -> &'static str {
        match self {
            EngineAction::Configure { .. } => "configure",
            EngineAction::Ping => "ping",
            EngineAction::Seek(_) => "seek",
            EngineAction::Load(_) => "load",
            EngineAction::FillBuffers { .. } => "fillBuffers",
        }
    }

    /// Parse one newline-delimited JSON action
    pub fn from_json_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Message emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A buffer of interleaved samples is ready
    ///
    /// `channel_data` is moved to the consumer, never copied.
    #[serde(rename_all = "camelCase")]
    BufferFilled {
        descriptor: BufferDescriptor,
        buffer_fill_type: BufferFillType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra_data: Option<BufferExtraData>,
        channel_data: Vec<f32>,
    },

    /// At least one buffer was delivered; the engine is ready for more
    Idle,

    /// An action failed
    Error { message: String },
}

impl EngineEvent {
    /// Wire name of the event, used in log messages
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::BufferFilled { .. } => "bufferFilled",
            EngineEvent::Idle => "idle",
            EngineEvent::Error { .. } => "error",
        }
    }

    /// Serialize as one newline-free JSON line
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
