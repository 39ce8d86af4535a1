//! Buffer-related type definitions
//!
//! Supporting types for the `bufferFilled` message and the load request.

use serde::{Deserialize, Serialize};

/// Engine-assigned identity of one audio source handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a track, resolved by the decoder factory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileReference(pub String);

impl FileReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a buffer was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferFillType {
    /// First buffer after a seek, carries a fresh base time
    FirstSeek,
    /// First buffer of a newly loaded track, carries demux data
    FirstLoad,
    /// Continuation buffer
    Regular,
}

impl std::fmt::Display for BufferFillType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferFillType::FirstSeek => write!(f, "first-seek"),
            BufferFillType::FirstLoad => write!(f, "first-load"),
            BufferFillType::Regular => write!(f, "regular"),
        }
    }
}

/// Stream parameters reported by the decoder after opening a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemuxData {
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub codec: String,
}

/// Ordering and identity metadata for one produced chunk of samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferDescriptor {
    /// Engine-wide delivery order
    pub sequence: u64,
    /// Produced by a handle that is not (or no longer) the active one
    pub is_background_buffer: bool,
    /// Track time of the first frame, only on the first buffer of a load or seek
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_time: Option<f64>,
    pub source_id: SourceId,
    /// Frames in this buffer
    pub length: usize,
    pub channel_count: u16,
    /// Track time covered by this buffer, in seconds
    pub start_time: f64,
    pub end_time: f64,
    /// Normalization gain applied to this buffer (1.0 when disabled)
    pub loudness_gain: f32,
    pub is_entirely_silent: bool,
    /// The decoder reached end of stream while producing this buffer
    pub is_last_buffer: bool,
}

/// Extra data carried by the first buffer of a load or seek
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferExtraData {
    pub base_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demux_data: Option<DemuxData>,
    pub is_preload_for_next_track: bool,
    pub resume_after_load: bool,
}

/// Parameters of a `load` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    pub file_reference: FileReference,
    #[serde(default)]
    pub is_preload_for_next_track: bool,
    pub buffer_fill_count: usize,
    /// Initial position as a fraction of the track duration
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub resume_after_load: bool,
}

impl LoadRequest {
    /// Load from the start of a track without preloading
    pub fn new(file_reference: FileReference, buffer_fill_count: usize) -> Self {
        Self {
            file_reference,
            is_preload_for_next_track: false,
            buffer_fill_count,
            progress: 0.0,
            resume_after_load: false,
        }
    }
}

/// Parameters of a `seek` action
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekRequest {
    /// Target position in seconds
    pub time: f64,
    pub buffer_fill_count: usize,
}
