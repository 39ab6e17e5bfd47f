//! Per-session relay loop
//!
//! Sits between the two tasks: receives ingest events, relays song
//! boundaries to the render command channel, polls render acknowledgements,
//! publishes collaborator events and samples stats on a throttled interval.
//! Errors raised by the output host are drained and logged on the same tick.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use super::registry::SessionRegistry;
use super::StatsSources;
use crate::audio::render::RenderStatsSnapshot;
use crate::error::{AudioError, SessionError};
use crate::network::ingest::{IngestExit, IngestTask};
use crate::protocol::{IngestEvent, RenderCommand, RenderEvent, SessionEvent};

/// How often render acknowledgements are polled
const RENDER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A spawned ingest run and the handle that stops it
pub(super) struct RunningIngest {
    pub handle: JoinHandle<IngestExit>,
    pub shutdown: oneshot::Sender<()>,
}

pub(super) struct Supervisor {
    pub url: Url,
    pub connect_timeout: Duration,
    pub reconnect_on_loss: bool,
    pub priming_seconds: f64,
    pub stats_interval: Duration,

    pub ingest: Option<RunningIngest>,
    pub ingest_events: mpsc::UnboundedReceiver<IngestEvent>,
    pub render_commands: Sender<RenderCommand>,
    pub render_events: Receiver<RenderEvent>,
    pub host_errors: Option<Receiver<AudioError>>,
    pub events: broadcast::Sender<SessionEvent>,
    pub ready_tx: Option<oneshot::Sender<Result<(), SessionError>>>,

    pub stats: Arc<StatsSources>,
    pub registry: Option<Arc<SessionRegistry>>,
}

/// Loop-local bookkeeping
#[derive(Default)]
struct Progress {
    primed: bool,
    reconnect_attempted: bool,
    /// Ingest task parked after its connection was lost for good
    parked: Option<IngestTask>,
    last_render: RenderStatsSnapshot,
}

/// Whether the loop should keep running after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

impl Supervisor {
    /// Run until `shutdown` fires. Stops the ingest task before returning it.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Option<IngestTask> {
        let mut progress = Progress::default();
        let mut poll = tokio::time::interval(RENDER_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_stats = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                Some(event) = self.ingest_events.recv() => {
                    let flow = self.on_ingest_event(event, &mut progress, &mut shutdown).await;
                    if flow == Flow::Shutdown {
                        break;
                    }
                }

                _ = poll.tick() => {
                    self.poll_render_events();
                    if let Some(errors) = &self.host_errors {
                        drain_host_errors(errors);
                    }
                    if last_stats.elapsed() >= self.stats_interval {
                        last_stats = Instant::now();
                        self.publish_stats(&mut progress);
                    }
                }
            }
        }

        self.stop_ingest(progress.parked.take()).await
    }

    async fn on_ingest_event(
        &mut self,
        event: IngestEvent,
        progress: &mut Progress,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Flow {
        tracing::debug!(?event, "Ingest event");

        match event {
            IngestEvent::Ready => {
                if let Some(ready_tx) = self.ready_tx.take() {
                    let _ = ready_tx.send(Ok(()));
                }
                if !progress.primed {
                    progress.primed = true;
                    self.publish(SessionEvent::WsWorkerReady);
                }
            }
            IngestEvent::SongStarting { generation } => {
                self.relay(RenderCommand::SongStarting { generation });
                self.publish(SessionEvent::SongStarting {
                    seconds_remaining: self.priming_seconds,
                });
            }
            IngestEvent::SongFinished { offset, generation } => {
                self.relay(RenderCommand::SongFinished { offset, generation });
            }
            IngestEvent::Closed { reason } => {
                let task = match self.ingest.take() {
                    Some(running) => match running.handle.await {
                        Ok(exit) => Some(exit.task),
                        Err(e) => {
                            tracing::error!("Ingest task failed: {}", e);
                            None
                        }
                    },
                    None => None,
                };
                return self.on_connection_lost(task, reason, progress, shutdown).await;
            }
        }
        Flow::Continue
    }

    async fn on_connection_lost(
        &mut self,
        task: Option<IngestTask>,
        reason: String,
        progress: &mut Progress,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Flow {
        // Before READY the caller is still waiting in `start`; no retry
        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(Err(SessionError::ConnectionClosedBeforeReady(reason)));
            progress.parked = task;
            return Flow::Continue;
        }

        let Some(task) = task else {
            self.publish(SessionEvent::ConnectionLost { reason });
            return Flow::Continue;
        };

        if !self.reconnect_on_loss || progress.reconnect_attempted {
            self.publish(SessionEvent::ConnectionLost { reason });
            progress.parked = Some(task);
            return Flow::Continue;
        }

        progress.reconnect_attempted = true;
        tracing::info!("Stream lost ({}), attempting one reconnect", reason);

        // A stop must not wait out the connect timeout
        let connected = tokio::select! {
            biased;
            _ = &mut *shutdown => None,
            result = task.connect(&self.url, self.connect_timeout) => Some(result),
        };
        let Some(connected) = connected else {
            tracing::info!("Stopped while reconnecting to {}", self.url);
            task.abandon_connect();
            progress.parked = Some(task);
            return Flow::Shutdown;
        };

        match connected {
            Ok(stream) => {
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                self.ingest = Some(RunningIngest {
                    handle: tokio::spawn(task.run(stream, shutdown_rx)),
                    shutdown: shutdown_tx,
                });
                tracing::info!("Reconnected to {}", self.url);
                self.publish(SessionEvent::Reconnected);
            }
            Err(e) => {
                tracing::warn!("Reconnect failed: {}", e);
                self.publish(SessionEvent::ConnectionLost {
                    reason: format!("{}; reconnect failed: {}", reason, e),
                });
                progress.parked = Some(task);
            }
        }
        Flow::Continue
    }

    fn relay(&self, command: RenderCommand) {
        match self.render_commands.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                tracing::warn!(?command, "Render command queue full, dropping");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("Render task detached, dropping command");
            }
        }
    }

    fn poll_render_events(&self) {
        while let Ok(event) = self.render_events.try_recv() {
            match event {
                RenderEvent::ReadSongFinished => {
                    tracing::info!("Render side drained the finished song");
                    self.publish(SessionEvent::SongFinished);
                }
            }
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_stats(&self, progress: &mut Progress) {
        let stats = self.stats.sample();

        tracing::info!(
            "Session {} stats: fill {:.0}% ({:.2}s), {} written, {} read, {} frames in, {} malformed",
            stats.id,
            stats.fill_level * 100.0,
            stats.buffered_seconds(),
            stats.ring.written_total,
            stats.ring.read_total,
            stats.ingest.frames_received,
            stats.ingest.malformed_frames,
        );

        let underruns = stats.render.underrun_quanta - progress.last_render.underrun_quanta;
        if underruns > 0 {
            tracing::warn!("{} render quanta underran since last sample", underruns);
        }
        let overruns = stats.render.overrun_quanta - progress.last_render.overrun_quanta;
        if overruns > 0 {
            tracing::warn!("{} render quanta found the producer a full buffer ahead", overruns);
        }
        let rejected = stats.render.rejected_quanta - progress.last_render.rejected_quanta;
        if rejected > 0 {
            tracing::warn!("{} render quanta had an unexpected output layout", rejected);
        }
        progress.last_render = stats.render;

        if let Some(registry) = &self.registry {
            registry.update(stats);
        }
    }

    async fn stop_ingest(&mut self, parked: Option<IngestTask>) -> Option<IngestTask> {
        let Some(running) = self.ingest.take() else {
            return parked;
        };

        let _ = running.shutdown.send(());
        match running.handle.await {
            Ok(exit) => Some(exit.task),
            Err(e) => {
                tracing::error!("Ingest task failed: {}", e);
                None
            }
        }
    }
}

/// Log every error the output host has reported since the last call
fn drain_host_errors(errors: &Receiver<AudioError>) -> usize {
    let mut drained = 0;
    while let Ok(error) = errors.try_recv() {
        tracing::error!("Output device error: {}", error);
        drained += 1;
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_host_errors_are_drained() {
        let (tx, rx) = bounded(16);
        assert_eq!(drain_host_errors(&rx), 0);

        tx.send(AudioError::StreamError("device unplugged".into())).unwrap();
        tx.send(AudioError::StreamError("buffer underflow".into())).unwrap();
        assert_eq!(drain_host_errors(&rx), 2);
        assert!(rx.is_empty());

        // A detached host leaves nothing behind
        drop(tx);
        assert_eq!(drain_host_errors(&rx), 0);
    }
}
