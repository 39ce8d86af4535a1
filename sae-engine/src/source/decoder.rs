//! Decoder collaborator and its symphonia implementation
//!
//! Sources only talk to a [`Decoder`]: demux data, seek, and pulling
//! interleaved `f32` frames. [`DecoderFactory::open`] does file I/O and is
//! called from the blocking thread pool.

use crate::error::{Error, Result};
use sae_common::events::{DemuxData, FileReference};
use std::fs::File;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

/// Consecutive packet decode failures tolerated before giving up
const MAX_DECODE_RETRIES: usize = 3;

/// One opened track
pub trait Decoder: Send {
    /// Format of the decoded stream
    fn demux_data(&self) -> &DemuxData;

    /// Move to `seconds` and return the position actually reached
    fn seek(&mut self, seconds: f64) -> Result<f64>;

    /// Fill `output` with interleaved frames at the stream's own rate and
    /// channel count
    ///
    /// # Returns
    /// Frames written; 0 once the stream is exhausted
    fn read_frames(&mut self, output: &mut [f32]) -> Result<usize>;
}

/// Run a decoder call, turning a panic inside it into a decode error
pub(crate) fn catch_decoder_panic<T>(operation: &str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            warn!("Decoder panicked during {}: {}", operation, panic_msg);
            Err(Error::Decode(format!("decoder panicked during {}: {}", operation, panic_msg)))
        }
    }
}

/// Opens decoders for file references
pub trait DecoderFactory: Send + Sync {
    fn open(&self, file_reference: &FileReference) -> Result<Box<dyn Decoder>>;
}

/// Opens files below a root folder with symphonia
#[derive(Debug, Clone)]
pub struct SymphoniaDecoderFactory {
    root_folder: PathBuf,
}

impl SymphoniaDecoderFactory {
    pub fn new(root_folder: impl Into<PathBuf>) -> Self {
        Self {
            root_folder: root_folder.into(),
        }
    }

    /// Resolve a reference below the root folder
    ///
    /// # Errors
    /// References that are absolute or climb out with `..` are rejected
    pub fn resolve(&self, file_reference: &FileReference) -> Result<PathBuf> {
        let relative = Path::new(file_reference.as_str());
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || file_reference.as_str().is_empty() {
            return Err(Error::BadRequest(format!(
                "file reference must be relative to the root folder: {}",
                file_reference
            )));
        }
        Ok(self.root_folder.join(relative))
    }
}

impl DecoderFactory for SymphoniaDecoderFactory {
    fn open(&self, file_reference: &FileReference) -> Result<Box<dyn Decoder>> {
        let path = self.resolve(file_reference)?;
        Ok(Box::new(SymphoniaDecoder::open(&path)?))
    }
}

/// Streaming symphonia decoder with accurate seeking
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    demux: DemuxData,
    buffer: Option<SampleBuffer<f32>>,
    /// Samples of `buffer` holding decoded data
    buffered: usize,
    /// Next unread sample in `buffer`
    offset: usize,
    /// Frames still to discard after an accurate seek
    skip_frames: u64,
    exhausted: bool,
}

impl SymphoniaDecoder {
    /// Probe and open `path`
    ///
    /// # Errors
    /// - File cannot be opened
    /// - Format unrecognized or no decodable track
    /// - Sample rate or channel layout missing
    pub fn open(path: &Path) -> Result<Self> {
        debug!("Opening {}", path.display());

        let file = File::open(path)
            .map_err(|e| Error::Decode(format!("Failed to open file {}: {}", path.display(), e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::Decode(format!("Failed to probe format: {}", e)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("No audio track found".to_string()))?;
        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| Error::Decode("Sample rate not found".to_string()))?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode("Channel count not found".to_string()))?;
        let duration_seconds = params
            .n_frames
            .map(|frames| frames as f64 / sample_rate as f64);
        let codec = symphonia::default::get_codecs()
            .get_codec(params.codec)
            .map(|d| d.short_name.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {}", e)))?;

        debug!(
            "Opened {}: codec={}, sample_rate={}, channels={}, duration={:?}",
            path.display(),
            codec,
            sample_rate,
            channels,
            duration_seconds
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            demux: DemuxData {
                sample_rate,
                channels,
                duration_seconds,
                codec,
            },
            buffer: None,
            buffered: 0,
            offset: 0,
            skip_frames: 0,
            exhausted: false,
        })
    }

    /// Decode the next packet of our track into `buffer`
    ///
    /// Returns `false` at end of stream.
    fn decode_next_packet(&mut self) -> Result<bool> {
        let mut failures = 0;
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!("Reached end of stream");
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!("Stream requires decoder reset; treating as end of stream");
                    return Ok(false);
                }
                Err(e) => return Err(Error::Decode(format!("Failed to read packet: {}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    if spec.channels.count() != self.demux.channels as usize {
                        return Err(Error::Decode(format!(
                            "Channel count changed mid-stream: {} -> {}",
                            self.demux.channels,
                            spec.channels.count()
                        )));
                    }
                    let needed = decoded.capacity() * spec.channels.count();
                    let reusable = self
                        .buffer
                        .as_ref()
                        .is_some_and(|b| b.capacity() >= needed);
                    if !reusable {
                        self.buffer = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
                    }
                    let Some(buffer) = self.buffer.as_mut() else {
                        return Err(Error::Internal("sample buffer missing".to_string()));
                    };
                    buffer.copy_interleaved_ref(decoded);
                    self.buffered = buffer.len();
                    self.offset = 0;
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    failures += 1;
                    warn!("Decode error ({}/{}): {}", failures, MAX_DECODE_RETRIES, e);
                    if failures >= MAX_DECODE_RETRIES {
                        return Err(Error::Decode(format!(
                            "Decoding failed on {} consecutive packets: {}",
                            failures, e
                        )));
                    }
                }
                Err(e) => return Err(Error::Decode(format!("Decode failed: {}", e))),
            }
        }
    }

    fn ts_to_seconds(&self, ts: u64) -> f64 {
        let time_base = self
            .format
            .tracks()
            .iter()
            .find(|t| t.id == self.track_id)
            .and_then(|t| t.codec_params.time_base);
        match time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                time.seconds as f64 + time.frac
            }
            None => ts as f64 / self.demux.sample_rate as f64,
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn demux_data(&self) -> &DemuxData {
        &self.demux
    }

    fn seek(&mut self, seconds: f64) -> Result<f64> {
        let seconds = seconds.max(0.0);
        if let Some(duration) = self.demux.duration_seconds {
            if seconds >= duration {
                self.exhausted = true;
                self.buffered = 0;
                self.offset = 0;
                return Ok(duration);
            }
        }

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(seconds),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Decode(format!("Seek to {:.3}s failed: {}", seconds, e)))?;

        self.decoder.reset();
        self.buffered = 0;
        self.offset = 0;
        self.exhausted = false;
        // Decode-and-skip from the packet boundary to the exact frame
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);

        let reached = self.ts_to_seconds(seeked.required_ts);
        debug!("Seeked to {:.3}s (requested {:.3}s)", reached, seconds);
        Ok(reached)
    }

    fn read_frames(&mut self, output: &mut [f32]) -> Result<usize> {
        let channels = self.demux.channels as usize;
        let capacity = output.len() / channels;
        let mut written = 0;

        while written < capacity && !self.exhausted {
            if self.offset >= self.buffered {
                if !self.decode_next_packet()? {
                    self.exhausted = true;
                    break;
                }
            }
            if self.skip_frames > 0 {
                let available = ((self.buffered - self.offset) / channels) as u64;
                let skip = self.skip_frames.min(available) as usize;
                self.offset += skip * channels;
                self.skip_frames -= skip as u64;
                continue;
            }

            let Some(buffer) = self.buffer.as_ref() else {
                break;
            };
            let samples = &buffer.samples()[..self.buffered];
            let available = (self.buffered - self.offset) / channels;
            let frames = available.min(capacity - written);
            let count = frames * channels;
            output[written * channels..written * channels + count]
                .copy_from_slice(&samples[self.offset..self.offset + count]);
            self.offset += count;
            written += frames;
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_below_root() {
        let factory = SymphoniaDecoderFactory::new("/music");
        let path = factory.resolve(&FileReference::new("albums/a.flac")).unwrap();
        assert_eq!(path, PathBuf::from("/music/albums/a.flac"));
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let factory = SymphoniaDecoderFactory::new("/music");
        assert!(factory.resolve(&FileReference::new("../etc/passwd")).is_err());
        assert!(factory.resolve(&FileReference::new("/etc/passwd")).is_err());
        assert!(factory.resolve(&FileReference::new("")).is_err());
    }

    #[test]
    fn test_missing_file_is_decode_error() {
        let factory = SymphoniaDecoderFactory::new("/nonexistent");
        let result = factory.open(&FileReference::new("missing.wav"));
        assert!(matches!(result, Err(Error::Decode(_))));
    }
}
