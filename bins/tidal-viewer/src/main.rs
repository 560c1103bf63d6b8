#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tidal_client::{Session, ViewerConfig, WebRtcPeerFactory, WebSocketConnector};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tidal-viewer", about = "Receive-only WebRTC viewer for a Tidal host")]
struct Args {
    /// Signaling server URL (ws:// or wss://).
    #[arg(long, env = "TIDAL_SIGNALING_URL")]
    url: Option<String>,
    /// Capture source id; defaults to the host's primary source.
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    audio: bool,
    #[arg(long)]
    audio_source: Option<String>,
    #[arg(long)]
    microphone: bool,
    /// Audio bitrate in bits per second.
    #[arg(long)]
    audio_bitrate: Option<u32>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    #[arg(long)]
    no_hw_encoding: bool,
    /// Reconnect with new capture parameters when the quality profile changes.
    #[arg(long)]
    renegotiate: bool,
    /// Minimum time a quality profile stays active before switching again.
    #[arg(long, default_value_t = 0)]
    min_dwell_secs: u64,
    #[arg(long)]
    answer_timeout_secs: Option<u64>,
    /// Wait for the host's source list instead of connecting right away.
    #[arg(long)]
    wait_for_sources: bool,
    /// Print every evaluation as one JSON line on stdout.
    #[arg(long)]
    metrics_json: bool,
}

fn build_config(args: &Args) -> Result<ViewerConfig> {
    let mut config = ViewerConfig::from_env().context("reading TIDAL_* environment")?;

    if let Some(url) = &args.url {
        config.signaling_url = url.clone();
    }
    if let Some(source) = &args.source {
        config.stream.source_type = source.clone();
        config.source_explicit = true;
    }
    let stream = &mut config.stream;
    stream.enable_audio |= args.audio;
    stream.enable_microphone_input |= args.microphone;
    if args.audio_source.is_some() {
        stream.audio_source = args.audio_source.clone();
    }
    if let Some(bitrate) = args.audio_bitrate {
        stream.audio_bitrate = bitrate;
    }
    if let Some(width) = args.width {
        stream.resolution.0 = width;
    }
    if let Some(height) = args.height {
        stream.resolution.1 = height;
    }
    if let Some(fps) = args.fps {
        stream.framerate = fps;
    }
    if args.no_hw_encoding {
        stream.use_hardware_encoding = false;
    }

    config.renegotiate_on_profile_change = args.renegotiate;
    config.policy.min_dwell = Duration::from_secs(args.min_dwell_secs);
    config.answer_timeout = args.answer_timeout_secs.map(Duration::from_secs);
    config.auto_connect_on_sources = args.wait_for_sources;

    config.validate().context("invalid viewer configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tidal_common::init_tracing();

    let args = Args::parse();
    let config = build_config(&args)?;
    info!("signaling server: {}", config.signaling_url);

    let handle = Session::new(
        config,
        Arc::new(WebRtcPeerFactory),
        Arc::new(WebSocketConnector),
    )
    .spawn();

    if !args.wait_for_sources {
        if let Err(e) = handle.connect().await {
            warn!("initial connect failed: {}", e);
        }
    }

    let mut metrics = handle.metrics();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            changed = metrics.changed() => {
                if changed.is_err() {
                    break;
                }
                if !args.metrics_json {
                    continue;
                }
                let export = metrics.borrow_and_update().clone();
                if let Some(export) = export {
                    println!("{}", serde_json::to_string(&export)?);
                }
            }
        }
    }

    handle.disconnect().await?;
    handle.shutdown().await?;
    Ok(())
}
