//! # Aux Listener
//!
//! Low-latency listener for a shared music room: receives PCM over a
//! WebSocket and plays it through a lock-free ring buffer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             MUSIC SERVER                                 │
//! │   /{room}/users/{user}/music/listen                                      │
//! │   Binary frames: [1 byte control] | [f32 LE interleaved PCM]             │
//! └────────────────────────────────────┬─────────────────────────────────────┘
//!                                      │ WebSocket
//!                                      ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              LISTENER                                    │
//! │                                                                          │
//! │  ┌────────────────────────────┐        ┌──────────────────────────────┐  │
//! │  │ Ingest Task                │ events │ Session Controller           │  │
//! │  │ (network::ingest, tokio)   │───────▶│ (session::controller)        │  │
//! │  │  classify frame            │ mpsc   │  Idle → Initializing →       │  │
//! │  │  write PCM / reset ring    │        │  Listening → Stopped         │  │
//! │  └─────────────┬──────────────┘        └──────┬──────────────▲────────┘  │
//! │                │ RingWriter                   │ commands     │ acks      │
//! │                ▼                              ▼ crossbeam    │           │
//! │  ┌────────────────────────────┐        ┌──────────────────────────────┐  │
//! │  │ Shared Ring (audio::buffer)│        │ Render Task                  │  │
//! │  │  atomic f32 slots          │◀───────│ (audio::render)              │  │
//! │  │  written/read totals       │ Ring-  │  one quantum per callback    │  │
//! │  │  ready flag, generation    │ Reader │  silence until primed        │  │
//! │  └────────────────────────────┘        └──────────────┬───────────────┘  │
//! │                                                       │ RenderHost       │
//! │                                                       ▼                  │
//! │                                        ┌──────────────────────────────┐  │
//! │                                        │ cpal output / clocked thread │  │
//! │                                        │ (audio::playback)            │  │
//! │                                        └──────────────────────────────┘  │
//! │                                                                          │
//! │  Sampled stats → SessionRegistry → Status API (status, axum)             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod status;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default seconds of audio held by a session's ring
    pub const DEFAULT_BUFFERED_SECONDS: f32 = 5.0;

    /// Default frames per render callback
    pub const DEFAULT_RENDER_QUANTUM: usize = 128;

    pub const MIN_SAMPLE_RATE: u32 = 8000;
    pub const MAX_SAMPLE_RATE: u32 = 192_000;
    pub const MAX_CHANNELS: u16 = 8;

    /// Largest render quantum a host may request, in frames
    pub const MAX_RENDER_QUANTUM: usize = 8192;

    /// Default port of the music server
    pub const DEFAULT_SERVER_PORT: u16 = 8080;

    /// Default port for the status API
    pub const DEFAULT_STATUS_PORT: u16 = 8090;
}
