//! Tone Server
//!
//! Development music source. Streams a stereo sine to every listener in
//! song-length chunks, framed the way the listener expects.

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use futures_util::SinkExt;
use std::f32::consts::TAU;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aux_listener::{constants::*, protocol::{encode_pcm, ControlSignal}};

/// Audio per PCM frame
const FRAME_MS: u64 = 20;

#[derive(Parser, Debug, Clone)]
#[command(name = "tone-server", about = "Stream test tones to listeners", version)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,

    #[arg(long, default_value_t = DEFAULT_CHANNELS)]
    channels: u16,

    /// Length of each song
    #[arg(long, default_value_t = 20.0)]
    song_seconds: f32,

    /// Audio sent at once when a song starts, so listeners prime quickly
    #[arg(long, default_value_t = 2.5)]
    burst_seconds: f32,
}

/// Sine generator that alternates pitch per song
struct Tone {
    sample_rate: f32,
    channels: usize,
    frequency: f32,
    phase: f32,
}

impl Tone {
    fn next_frame(&mut self, frames: usize) -> Vec<f32> {
        let mut samples = Vec::with_capacity(frames * self.channels);
        let step = TAU * self.frequency / self.sample_rate;
        for _ in 0..frames {
            let value = self.phase.sin() * 0.2;
            samples.extend(std::iter::repeat(value).take(self.channels));
            self.phase = (self.phase + step) % TAU;
        }
        samples
    }

    fn next_song(&mut self) {
        self.frequency = if self.frequency == 440.0 { 660.0 } else { 440.0 };
        self.phase = 0.0;
    }
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
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Tone server on ws://{}/<room>/users/<user>/music/listen", addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        let args = args.clone();
        tokio::spawn(async move {
            match serve(socket, &args).await {
                Ok(()) => tracing::info!("Listener {} finished", peer),
                Err(e) => tracing::warn!("Listener {} dropped: {}", peer, e),
            }
        });
    }
}

async fn serve(socket: TcpStream, args: &Args) -> Result<()> {
    let mut ws = tokio_tungstenite::accept_async(socket).await?;

    let mut tone = Tone {
        sample_rate: args.sample_rate as f32,
        channels: args.channels.max(1) as usize,
        frequency: 440.0,
        phase: 0.0,
    };
    let frames_per_packet = (args.sample_rate as u64 * FRAME_MS / 1000) as usize;
    let packets_per_song = ((args.song_seconds * 1000.0) as u64 / FRAME_MS).max(1);
    let burst_packets = (args.burst_seconds * 1000.0) as u64 / FRAME_MS;

    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tracing::info!("Song starting at {} Hz", tone.frequency);
        ws.send(control(ControlSignal::SongStarting)).await?;

        for packet in 0..packets_per_song {
            if packet >= burst_packets {
                ticker.tick().await;
            }
            let pcm = encode_pcm(&tone.next_frame(frames_per_packet));
            ws.send(Message::Binary(Bytes::from(pcm))).await?;
        }

        ws.send(control(ControlSignal::SongFinished)).await?;
        tone.next_song();
    }
}

fn control(signal: ControlSignal) -> Message {
    Message::Binary(Bytes::from(vec![signal.as_byte()]))
}
