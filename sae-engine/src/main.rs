//! Streaming Audio Engine (sae-engine) - stdio host
//!
//! Reads newline-delimited JSON actions on stdin and writes engine events as
//! newline-delimited JSON on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sae_common::events::EngineAction;
use sae_engine::dsp::resampler::ResamplerQuality;
use sae_engine::source::SymphoniaDecoderFactory;
use sae_engine::transport::{self, EventReceiver, EventSender};
use sae_engine::{AudioEngine, EngineSettings};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long pending events may take to flush after stdin closes
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Command-line arguments for sae-engine
#[derive(Parser, Debug)]
#[command(name = "sae-engine")]
#[command(about = "Streaming audio engine speaking JSON lines over stdio")]
#[command(version)]
struct Args {
    /// TOML settings file
    #[arg(short, long, env = "SAE_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder that file references are resolved against
    #[arg(short, long, env = "SAE_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Output sample rate in Hz
    #[arg(long, env = "SAE_OUTPUT_SAMPLE_RATE")]
    output_sample_rate: Option<u32>,

    /// Output channel count
    #[arg(long, env = "SAE_OUTPUT_CHANNELS")]
    output_channels: Option<u16>,

    /// Resampler quality: low, medium, high or best
    #[arg(long, env = "SAE_RESAMPLER_QUALITY")]
    resampler_quality: Option<String>,

    /// Cap on background buffers per drain
    #[arg(long, env = "SAE_MAX_BACKGROUND_BUFFERS")]
    max_background_buffers: Option<usize>,

    /// Resampler allocations per key before a leak warning
    #[arg(long, env = "SAE_LEAK_THRESHOLD")]
    leak_threshold: Option<usize>,
}

impl Args {
    /// Load the settings file (if any) and apply command-line overrides
    fn settings(&self) -> Result<EngineSettings> {
        let mut settings = match &self.config {
            Some(path) => EngineSettings::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => EngineSettings::default(),
        };

        if let Some(root_folder) = &self.root_folder {
            settings.root_folder = Some(root_folder.clone());
        }
        if let Some(rate) = self.output_sample_rate {
            settings.output_sample_rate = rate;
        }
        if let Some(channels) = self.output_channels {
            settings.output_channels = channels;
        }
        if let Some(quality) = &self.resampler_quality {
            settings.resampler_quality = parse_quality(quality)?;
        }
        if let Some(cap) = self.max_background_buffers {
            settings.max_background_buffers = cap;
        }
        if let Some(threshold) = self.leak_threshold {
            settings.leak_threshold = threshold;
        }

        settings.validate().context("Invalid engine settings")?;
        Ok(settings)
    }
}

fn parse_quality(value: &str) -> Result<ResamplerQuality> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .with_context(|| format!("Unknown resampler quality: {}", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = args.settings()?;

    // RUST_LOG wins over the settings file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.filter))
        .context("Invalid log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let root_folder = match &settings.root_folder {
        Some(folder) => folder.clone(),
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    info!("Starting sae-engine, root folder {}", root_folder.display());

    let factory = Arc::new(SymphoniaDecoderFactory::new(root_folder));
    let (sender, receiver) = transport::channel();
    let engine = AudioEngine::new(settings, factory, sender.clone());
    let writer = tokio::spawn(write_events(receiver));

    tokio::select! {
        result = read_actions(&engine, &sender) => {
            result?;
            info!("stdin closed, shutting down");
        }
        _ = shutdown_signal() => {}
    }

    engine.shutdown().await;
    drop(engine);
    drop(sender);

    match tokio::time::timeout(EVENT_FLUSH_TIMEOUT, writer).await {
        Ok(joined) => joined.context("Event writer panicked")??,
        Err(_) => warn!("Event writer did not finish within {:?}", EVENT_FLUSH_TIMEOUT),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Dispatch every action line read from stdin
async fn read_actions(engine: &AudioEngine, sender: &EventSender) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match EngineAction::from_json_line(&line) {
            Ok(action) => {
                engine.dispatch(action);
            }
            Err(e) => {
                debug!("Unparseable action: {}", line);
                sender.error(format!("Invalid action: {}", e));
            }
        }
    }
    Ok(())
}

/// Write events to stdout until every sender is gone
async fn write_events(mut events: EventReceiver) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let mut line = event.to_json_line().context("Failed to serialize event")?;
        line.push('\n');
        stdout
            .write_all(line.as_bytes())
            .await
            .context("Failed to write event")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
