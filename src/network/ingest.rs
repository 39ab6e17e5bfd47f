//! Network ingest task
//!
//! Owns the ring writer. Reads binary frames from the stream connection,
//! writes PCM into the ring and turns control frames into song-boundary
//! resets plus events for the session controller.

use futures_util::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::audio::buffer::RingWriter;
use crate::error::NetworkError;
use crate::protocol::{classify_frame, decode_pcm_into, ControlSignal, Frame, IngestEvent};

/// Overrun warnings are logged for the first event and then every Nth
const OVERRUN_LOG_EVERY: u64 = 100;

/// Client WebSocket stream produced by [`IngestTask::connect`]
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ingest lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Idle,
    Connecting,
    Streaming,
    Closed,
}

/// Why [`IngestTask::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The controller asked the task to stop
    Shutdown,
    /// The server closed the connection or the stream ended
    Remote(String),
    /// A transport error ended the stream
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::Remote(reason) if reason.is_empty() => write!(f, "closed by server"),
            Self::Remote(reason) => write!(f, "closed by server: {}", reason),
            Self::Error(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Cumulative ingest counters
#[derive(Debug, Default)]
pub struct IngestStats {
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    samples_written: AtomicU64,
    control_frames: AtomicU64,
    malformed_frames: AtomicU64,
    overrun_writes: AtomicU64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            control_frames: self.control_frames.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            overrun_writes: self.overrun_writes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub samples_written: u64,
    pub control_frames: u64,
    pub malformed_frames: u64,
    pub overrun_writes: u64,
}

/// Returned by [`IngestTask::run`] so the writer can be reused or released
pub struct IngestExit {
    pub task: IngestTask,
    pub reason: CloseReason,
}

/// Producer side of a session
pub struct IngestTask {
    writer: RingWriter,
    channels: u16,
    state: Arc<RwLock<IngestState>>,
    stats: Arc<IngestStats>,
    events: mpsc::UnboundedSender<IngestEvent>,
    /// Decoded PCM, reused across frames
    decode_buffer: Vec<f32>,
}

impl IngestTask {
    pub fn new(writer: RingWriter, channels: u16, events: mpsc::UnboundedSender<IngestEvent>) -> Self {
        Self {
            writer,
            channels,
            state: Arc::new(RwLock::new(IngestState::Idle)),
            stats: Arc::new(IngestStats::default()),
            events,
            decode_buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> IngestState {
        *self.state.read()
    }

    /// Shared view of the state for observers outside the task
    pub fn state_handle(&self) -> Arc<RwLock<IngestState>> {
        Arc::clone(&self.state)
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn writer(&self) -> &RingWriter {
        &self.writer
    }

    /// Record that a pending `connect` was dropped before it finished
    pub fn abandon_connect(&self) {
        self.set_state(IngestState::Closed);
    }

    fn set_state(&self, state: IngestState) {
        *self.state.write() = state;
    }

    /// Open the stream connection. Moves to `Connecting`, and to `Closed`
    /// if the attempt fails.
    pub async fn connect(&self, url: &Url, timeout: Duration) -> Result<WsStream, NetworkError> {
        self.set_state(IngestState::Connecting);
        tracing::info!("Connecting to {}", url);

        match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => {
                self.set_state(IngestState::Closed);
                Err(NetworkError::ConnectionFailed(e.to_string()))
            }
            Err(_) => {
                self.set_state(IngestState::Closed);
                Err(NetworkError::Timeout)
            }
        }
    }

    /// Stream frames into the ring until the connection ends or `shutdown`
    /// fires (or its sender is dropped).
    ///
    /// A `Closed` event is emitted unless the stop was requested.
    pub async fn run<S>(mut self, mut stream: S, mut shutdown: oneshot::Receiver<()>) -> IngestExit
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        self.set_state(IngestState::Streaming);

        let reason = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break CloseReason::Shutdown,

                message = stream.next() => match message {
                    Some(Ok(Message::Binary(data))) => self.handle_frame(&data),
                    Some(Ok(Message::Text(text))) => {
                        self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Dropping {} byte text frame on audio stream", text.as_str().len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                        break CloseReason::Remote(reason);
                    }
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseReason::Error(e.to_string()),
                    None => break CloseReason::Remote(String::new()),
                },
            }
        };

        self.set_state(IngestState::Closed);
        if reason != CloseReason::Shutdown {
            tracing::warn!("Audio stream ended: {}", reason);
            let _ = self.events.send(IngestEvent::Closed {
                reason: reason.to_string(),
            });
        } else {
            tracing::debug!("Ingest stopped");
        }

        IngestExit { task: self, reason }
    }

    /// Classify and apply one binary frame. Malformed frames are dropped.
    pub fn handle_frame(&mut self, data: &[u8]) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        match classify_frame(data, self.channels) {
            Ok(Frame::Pcm(payload)) => self.write_pcm(payload),
            Ok(Frame::Control(signal)) => self.apply_control(signal),
            Err(e) => {
                self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping frame: {}", e);
            }
        }
    }

    fn write_pcm(&mut self, payload: &[u8]) {
        decode_pcm_into(payload, &mut self.decode_buffer);
        let report = self.writer.write(&self.decode_buffer);
        self.stats
            .samples_written
            .fetch_add(report.written as u64, Ordering::Relaxed);

        if report.overrun {
            let count = self.stats.overrun_writes.fetch_add(1, Ordering::Relaxed) + 1;
            if count == 1 || count % OVERRUN_LOG_EVERY == 0 {
                tracing::warn!(
                    "Buffer overrun: producer is {} samples ahead of a {} sample ring ({} overrun writes)",
                    self.writer.shared().lead(),
                    self.writer.capacity(),
                    count
                );
            }
        }

        if self.writer.mark_ready_if_primed() {
            tracing::info!(
                "Buffer primed at {} samples",
                self.writer.written_total()
            );
            let _ = self.events.send(IngestEvent::Ready);
        }
    }

    fn apply_control(&mut self, signal: ControlSignal) {
        self.stats.control_frames.fetch_add(1, Ordering::Relaxed);
        let boundary = self.writer.reset();

        let event = match signal {
            ControlSignal::SongFinished => {
                tracing::info!("Song finished after {} samples", boundary.offset);
                IngestEvent::SongFinished {
                    offset: boundary.offset,
                    generation: boundary.generation,
                }
            }
            ControlSignal::SongStarting => {
                tracing::info!("Song starting");
                IngestEvent::SongStarting {
                    generation: boundary.generation,
                }
            }
        };
        let _ = self.events.send(event);
    }
}
