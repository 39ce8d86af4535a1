//! Track sources
//!
//! - `decoder`: the decoder collaborator traits and the symphonia implementation
//! - `audio_source`: per-track decode, seek and fill state driven by the engine

pub mod audio_source;
pub mod decoder;

pub use audio_source::{
    AudioSource, FillClaim, FillOptions, LoadResult, ProducedBuffer, SourcePhase,
};
pub use decoder::{Decoder, DecoderFactory, SymphoniaDecoder, SymphoniaDecoderFactory};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Outcome;
    use crate::config::EngineSettings;
    use crate::dsp::DspContext;
    use crate::error::{Error, Result};
    use sae_common::events::{BufferFillType, DemuxData, FileReference, LoadRequest, SourceId};
    use sae_common::{Configuration, ConfigurationUpdate};
    use std::sync::Arc;

    /// Constant-valued track of a fixed length
    struct ConstantDecoder {
        demux: DemuxData,
        remaining: usize,
        position: usize,
        total: usize,
    }

    impl Decoder for ConstantDecoder {
        fn demux_data(&self) -> &DemuxData {
            &self.demux
        }

        fn seek(&mut self, seconds: f64) -> Result<f64> {
            let frame = ((seconds * self.demux.sample_rate as f64) as usize).min(self.total);
            self.position = frame;
            self.remaining = self.total - frame;
            Ok(frame as f64 / self.demux.sample_rate as f64)
        }

        fn read_frames(&mut self, output: &mut [f32]) -> Result<usize> {
            let channels = self.demux.channels as usize;
            let frames = (output.len() / channels).min(self.remaining);
            output[..frames * channels].fill(0.25);
            self.remaining -= frames;
            self.position += frames;
            Ok(frames)
        }
    }

    struct ConstantFactory {
        sample_rate: u32,
        channels: u16,
        seconds: f64,
    }

    impl DecoderFactory for ConstantFactory {
        fn open(&self, file_reference: &FileReference) -> Result<Box<dyn Decoder>> {
            if file_reference.as_str() == "missing" {
                return Err(Error::Decode("no such track".to_string()));
            }
            let total = (self.seconds * self.sample_rate as f64) as usize;
            Ok(Box::new(ConstantDecoder {
                demux: DemuxData {
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    duration_seconds: Some(self.seconds),
                    codec: "constant".to_string(),
                },
                remaining: total,
                position: 0,
                total,
            }))
        }
    }

    fn source(sample_rate: u32, channels: u16, seconds: f64) -> (Arc<AudioSource>, Arc<DspContext>) {
        let dsp = Arc::new(DspContext::new(&EngineSettings::default()));
        let factory = Arc::new(ConstantFactory {
            sample_rate,
            channels,
            seconds,
        });
        (AudioSource::new(SourceId(1), Arc::clone(&dsp), factory), dsp)
    }

    fn config() -> Configuration {
        let mut config = Configuration::default();
        config.apply(ConfigurationUpdate::with_buffer_time(0.5)).unwrap();
        config.loudness_normalization = false;
        config
    }

    fn options(source: &AudioSource, config: &Configuration) -> FillOptions {
        FillOptions {
            token: source.token(),
            first_fill_type: BufferFillType::FirstLoad,
            extra_data: None,
            background: false,
            config: config.clone(),
            total_buffers_hint: None,
        }
    }

    async fn load(source: &AudioSource, config: &Configuration) -> LoadResult {
        let token = source.cancel_all_operations();
        let request = LoadRequest::new(FileReference::new("track"), 1);
        source.load(&request, token, config).await.unwrap().completed().unwrap()
    }

    #[tokio::test]
    async fn test_load_then_fill() {
        let (source, _) = source(48000, 2, 2.0);
        let config = config();
        let loaded = load(&source, &config).await;
        assert_eq!(loaded.base_time, 0.0);
        assert_eq!(source.phase(), SourcePhase::Ready);

        let claim = source.claim_fill(source.token()).unwrap().completed().unwrap();
        let mut buffers = Vec::new();
        let produced = source
            .fill_buffers(claim, 2, options(&source, &config), |b| buffers.push(b))
            .await
            .unwrap();

        assert_eq!(produced, Outcome::Completed(2));
        assert_eq!(buffers[0].fill_type, BufferFillType::FirstLoad);
        assert_eq!(buffers[1].fill_type, BufferFillType::Regular);
        assert_eq!(buffers[0].descriptor.length, 24000);
        assert_eq!(buffers[0].channel_data.len(), 48000);
        assert_eq!(buffers[1].descriptor.start_time, 0.5);
        assert!(!source.is_buffer_filling_in_progress());
    }

    #[tokio::test]
    async fn test_end_of_stream_marks_last_buffer() {
        let (source, _) = source(48000, 1, 0.75);
        let config = config();
        load(&source, &config).await;

        let claim = source.claim_fill(source.token()).unwrap().completed().unwrap();
        let mut buffers = Vec::new();
        source
            .fill_buffers(claim, 5, options(&source, &config), |b| buffers.push(b))
            .await
            .unwrap();

        assert_eq!(buffers.len(), 2);
        assert!(buffers[1].descriptor.is_last_buffer);
        assert_eq!(buffers[1].descriptor.length, 12000);
        assert_eq!(buffers[1].descriptor.channel_count, 2);
        assert!(source.is_ended());

        let token = source.cancel_all_operations();
        source.seek(0.25, token).await.unwrap();
        assert!(!source.is_ended());
    }

    #[tokio::test]
    async fn test_parallel_fill_is_rejected() {
        let (source, _) = source(48000, 2, 2.0);
        load(&source, &config()).await;

        let _claim = source.claim_fill(source.token()).unwrap().completed().unwrap();
        assert!(source.is_buffer_filling_in_progress());
        let second = source.claim_fill(source.token());
        assert!(matches!(second, Err(Error::InvalidState(ref m)) if m == "invalid parallel buffer fill loop"));
    }

    #[tokio::test]
    async fn test_stale_claim_is_cancelled() {
        let (source, _) = source(48000, 2, 2.0);
        load(&source, &config()).await;
        let stale = source.token();
        source.cancel_all_operations();
        assert!(source.claim_fill(stale).unwrap().is_cancelled());
        assert!(!source.is_buffer_filling_in_progress());
    }

    #[tokio::test]
    async fn test_fill_under_superseded_token_delivers_nothing() {
        let (source, _) = source(48000, 2, 2.0);
        let config = config();
        load(&source, &config).await;

        let claim = source.claim_fill(source.token()).unwrap().completed().unwrap();
        let opts = options(&source, &config);
        source.cancel_all_operations();

        let mut delivered = 0;
        let outcome = source
            .fill_buffers(claim, 3, opts, |_| delivered += 1)
            .await
            .unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_load_with_progress_seeks() {
        let (source, _) = source(48000, 2, 4.0);
        let token = source.cancel_all_operations();
        let request = LoadRequest {
            progress: 0.5,
            ..LoadRequest::new(FileReference::new("track"), 1)
        };
        let loaded = source.load(&request, token, &config()).await.unwrap();
        assert_eq!(loaded.completed().unwrap().base_time, 2.0);
    }

    #[tokio::test]
    async fn test_resampling_source_leases_and_returns_resampler() {
        let (source, dsp) = source(44100, 2, 2.0);
        let config = config();
        load(&source, &config).await;
        assert!(source.resampler_slot().await.is_some());

        let claim = source.claim_fill(source.token()).unwrap().completed().unwrap();
        let mut buffers = Vec::new();
        source
            .fill_buffers(claim, 1, options(&source, &config), |b| buffers.push(b))
            .await
            .unwrap();
        // 0.5 s at 44.1 kHz resampled to 48 kHz
        assert!((buffers[0].descriptor.length as i64 - 24000).abs() <= 1);

        source.destroy().await;
        assert_eq!(source.phase(), SourcePhase::Destroyed);
        let key = dsp.resampler_key(2, 44100);
        assert_eq!(dsp.pool_stats(&key).free, 1);
        assert_eq!(source.scratch_capacity().await, 0);
    }

    #[tokio::test]
    async fn test_missing_track_is_decode_error() {
        let (source, _) = source(48000, 2, 1.0);
        let token = source.cancel_all_operations();
        let request = LoadRequest::new(FileReference::new("missing"), 1);
        let result = source.load(&request, token, &config()).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_silence_trimming_skips_leading_silence() {
        struct SilentThenTone {
            demux: DemuxData,
            frame: usize,
        }
        impl Decoder for SilentThenTone {
            fn demux_data(&self) -> &DemuxData {
                &self.demux
            }
            fn seek(&mut self, _seconds: f64) -> Result<f64> {
                Ok(0.0)
            }
            fn read_frames(&mut self, output: &mut [f32]) -> Result<usize> {
                for sample in output.iter_mut() {
                    *sample = if self.frame < 48000 {
                        0.0
                    } else {
                        0.3 * (2.0 * std::f32::consts::PI * 440.0 * self.frame as f32 / 48000.0).sin()
                    };
                    self.frame += 1;
                }
                Ok(output.len())
            }
        }
        struct Factory;
        impl DecoderFactory for Factory {
            fn open(&self, _: &FileReference) -> Result<Box<dyn Decoder>> {
                Ok(Box::new(SilentThenTone {
                    demux: DemuxData {
                        sample_rate: 48000,
                        channels: 1,
                        duration_seconds: None,
                        codec: "test".to_string(),
                    },
                    frame: 0,
                }))
            }
        }

        let dsp = Arc::new(DspContext::new(&EngineSettings::default()));
        let source = AudioSource::new(SourceId(7), dsp, Arc::new(Factory));
        let mut config = config();
        config.silence_trimming = true;
        load(&source, &config).await;

        let claim = source.claim_fill(source.token()).unwrap().completed().unwrap();
        let mut buffers = Vec::new();
        source
            .fill_buffers(claim, 1, options(&source, &config), |b| buffers.push(b))
            .await
            .unwrap();

        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].descriptor.start_time, 1.0);
        assert!(!buffers[0].descriptor.is_entirely_silent);
    }
}
