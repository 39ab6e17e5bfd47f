//! Wire framing and typed session messages
//!
//! Binary frames from the stream server are classified purely by length:
//!
//! ```text
//! len == 1   [signal]            0 = song finished, 1 = song starting
//! len  > 1   [f32 LE][f32 LE]... interleaved PCM, channel count fixed per session
//! ```
//!
//! Everything that crosses a task boundary inside a session is one of the
//! tagged enums below; no callbacks are shared between tasks.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::{NetworkError, SessionError};

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// One-byte control signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlSignal {
    SongFinished,
    SongStarting,
}

impl ControlSignal {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::SongFinished),
            1 => Some(Self::SongStarting),
            _ => None,
        }
    }

    pub const fn as_byte(self) -> u8 {
        match self {
            Self::SongFinished => 0,
            Self::SongStarting => 1,
        }
    }
}

/// A classified binary frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame<'a> {
    Control(ControlSignal),
    /// Raw little-endian f32 bytes, validated to hold whole frames
    Pcm(&'a [u8]),
}

/// Classify a binary frame for a stream with `channels` interleaved channels
pub fn classify_frame(bytes: &[u8], channels: u16) -> Result<Frame<'_>, NetworkError> {
    match bytes.len() {
        0 => Err(NetworkError::MalformedFrame("empty frame".into())),
        1 => ControlSignal::from_byte(bytes[0])
            .map(Frame::Control)
            .ok_or_else(|| {
                NetworkError::MalformedFrame(format!("unknown control signal {}", bytes[0]))
            }),
        len if len % SAMPLE_BYTES != 0 => Err(NetworkError::MalformedFrame(format!(
            "{} bytes is not a whole number of f32 samples",
            len
        ))),
        len if (len / SAMPLE_BYTES) % channels.max(1) as usize != 0 => {
            Err(NetworkError::MalformedFrame(format!(
                "{} samples is not a whole number of {}-channel frames",
                len / SAMPLE_BYTES,
                channels
            )))
        }
        _ => Ok(Frame::Pcm(bytes)),
    }
}

/// Decode little-endian f32 PCM into `out`, reusing its allocation
pub fn decode_pcm_into(payload: &[u8], out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        payload
            .chunks_exact(SAMPLE_BYTES)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
    );
}

/// Encode samples as little-endian f32 PCM
pub fn encode_pcm(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// INIT: everything needed to allocate and wire a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub room_id: String,
    pub user_id: String,
    /// Ring size in bytes
    pub buffer_capacity: usize,
    pub channel_count: u16,
    pub sample_rate: u32,
}

impl InitRequest {
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            buffer_capacity: config.buffer_capacity_bytes(),
            channel_count: config.channels,
            sample_rate: config.sample_rate,
        }
    }

    /// Ring size in samples
    pub fn capacity_samples(&self) -> usize {
        self.buffer_capacity / SAMPLE_BYTES
    }

    /// Seconds of audio needed to reach the priming threshold
    pub fn priming_seconds(&self) -> f64 {
        let per_second = self.sample_rate as f64 * self.channel_count as f64;
        (self.capacity_samples() / 2) as f64 / per_second
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.room_id.is_empty() || self.user_id.is_empty() {
            return Err(SessionError::InvalidConfig("room and user ids are required".into()));
        }
        if self.channel_count == 0 || self.sample_rate == 0 {
            return Err(SessionError::InvalidConfig(
                "channel count and sample rate must be non-zero".into(),
            ));
        }
        if self.buffer_capacity % SAMPLE_BYTES != 0 {
            return Err(SessionError::InvalidConfig(format!(
                "buffer capacity {} bytes is not a whole number of samples",
                self.buffer_capacity
            )));
        }
        if self.capacity_samples() % self.channel_count as usize != 0 {
            return Err(SessionError::InvalidConfig(format!(
                "buffer capacity {} samples is not a whole number of frames",
                self.capacity_samples()
            )));
        }
        Ok(())
    }
}

/// Ingest task → session controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestEvent {
    /// The ring reached its priming threshold
    Ready,
    /// `generation` is the ring generation the producer reset moved to
    SongStarting { generation: u64 },
    /// `offset` is the sample total written for the finished song
    SongFinished { offset: u64, generation: u64 },
    /// The connection ended; the task has returned
    Closed { reason: String },
}

/// Session controller → render task, delivered on the render command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderCommand {
    /// Reset the read side and adopt `generation`
    SongStarting { generation: u64 },
    SongFinished { offset: u64, generation: u64 },
}

/// Render task → session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderEvent {
    /// The finished song has been drained and the read side reset
    ReadSongFinished,
}

/// Session controller → collaborators (UI layer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    /// Stream connected and primed; audio output may be unmuted
    WsWorkerReady,
    /// A song is starting; playback begins once the buffer primes
    SongStarting {
        #[serde(rename = "secondsRemaining")]
        seconds_remaining: f64,
    },
    /// The render side has drained the finished song
    SongFinished,
    /// The stream dropped and could not be re-established
    ConnectionLost { reason: String },
    /// The stream dropped and a single reconnect attempt succeeded
    Reconnected,
}
