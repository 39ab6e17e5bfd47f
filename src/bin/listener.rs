//! Listener Application
//!
//! Joins a room's music stream and plays it on a local output device.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aux_listener::{
    audio::{
        device::list_devices,
        playback::{ClockedOutput, CpalOutput, RenderHost},
    },
    config::AppConfig,
    protocol::SessionEvent,
    session::{Session, SessionRegistry},
    status::WebServer,
};

#[derive(Parser, Debug)]
#[command(name = "listener", about = "Listen to a room's music stream", version)]
struct Args {
    /// Room to join
    #[arg(long)]
    room: String,

    /// User id to listen as
    #[arg(long)]
    user: String,

    /// Config file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drive the render clock without an audio device
    #[arg(long)]
    null_output: bool,

    /// Output device id, see --list-devices
    #[arg(long)]
    device: Option<String>,

    /// Print output devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        println!("\n=== Available Output Devices ===");
        for device in list_devices() {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}:", device.name, default_marker);
            println!("    ID: {}", device.id);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
        return Ok(());
    }

    let config = AppConfig::load(args.config.as_deref()).context("loading config")?;
    tracing::info!("Starting listener for room {} as {}", args.room, args.user);

    let registry = Arc::new(SessionRegistry::new());
    let _status_handle = if config.status.enabled {
        let server = WebServer::new(&config.status, registry.clone())?;
        tracing::info!("Status API at http://{}/api/status", server.addr());
        Some(server.start_background())
    } else {
        None
    };

    let host: Box<dyn RenderHost> = if args.null_output {
        tracing::info!("Using clocked null output");
        Box::new(ClockedOutput::realtime(
            config.session.sample_rate,
            config.session.channels,
            config.session.render_quantum,
        ))
    } else {
        Box::new(CpalOutput::new(
            args.device.as_deref(),
            config.session.sample_rate,
            config.session.channels,
            Some(config.session.render_quantum as u32),
        )?)
    };

    let mut session = Session::from_config(&config).with_registry(registry);
    let mut events = session.subscribe();
    let init = session.init_request(&args.room, &args.user);

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::WsWorkerReady => tracing::info!("Stream ready, playing"),
                SessionEvent::SongStarting { seconds_remaining } => {
                    tracing::info!("Next song starts in {:.1}s", seconds_remaining)
                }
                SessionEvent::SongFinished => tracing::info!("Song finished"),
                SessionEvent::ConnectionLost { reason } => {
                    tracing::error!("Connection lost: {}", reason)
                }
                SessionEvent::Reconnected => tracing::info!("Reconnected"),
            }
        }
    });

    tokio::select! {
        result = session.start(init, host) => result.context("starting session")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted while connecting");
            return Ok(());
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    session.stop().await?;

    Ok(())
}
