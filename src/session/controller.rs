//! Session controller
//!
//! Allocates the ring, wires the ingest and render tasks around it, waits for
//! the buffer to prime and tears everything down in a fixed order on stop.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::registry::SessionRegistry;
use super::supervisor::{RunningIngest, Supervisor};
use super::{SessionState, SessionStats, StatsSources};
use crate::audio::buffer::create_shared_ring;
use crate::audio::playback::RenderHost;
use crate::audio::render::RenderTask;
use crate::config::{AppConfig, ServerConfig, SessionConfig};
use crate::constants::MAX_RENDER_QUANTUM;
use crate::error::{Result, SessionError};
use crate::network::ingest::IngestTask;
use crate::protocol::{InitRequest, SessionEvent};

/// Capacity of each render channel. Song boundaries are rare.
const RENDER_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the collaborator event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Resources held while a session is initializing or listening
struct Running {
    host: Box<dyn RenderHost>,
    supervisor: JoinHandle<Option<IngestTask>>,
    supervisor_shutdown: oneshot::Sender<()>,
    stats: Arc<StatsSources>,
}

/// One listening session: a ring plus the two tasks that share it
pub struct Session {
    id: Uuid,
    session_config: SessionConfig,
    server_config: ServerConfig,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    registry: Option<Arc<SessionRegistry>>,
    running: Option<Running>,
}

impl Session {
    pub fn new(session_config: SessionConfig, server_config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            session_config,
            server_config,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            events,
            registry: None,
            running: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.session.clone(), config.server.clone())
    }

    /// Publish sampled stats into `registry` while the session runs
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Collaborator events. Safe to call before `start`.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// INIT for `room_id`/`user_id` sized from this session's configuration
    pub fn init_request(&self, room_id: &str, user_id: &str) -> InitRequest {
        InitRequest::new(room_id, user_id, &self.session_config)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Start listening.
    ///
    /// Returns once the ring has primed. Any failure on the way leaves the
    /// session `Stopped` with everything it allocated released. A connection
    /// failure is reported as is; there is no retry before READY.
    pub async fn start(&mut self, init: InitRequest, host: Box<dyn RenderHost>) -> Result<()> {
        match self.state() {
            SessionState::Idle => {}
            SessionState::Stopped => return Err(SessionError::AlreadyStopped.into()),
            SessionState::Initializing | SessionState::Listening => {
                return Err(SessionError::AlreadyStarted.into())
            }
        }

        self.set_state(SessionState::Initializing);
        let result = self.initialize(init, host).await;

        match result {
            Ok(()) => {
                self.set_state(SessionState::Listening);
                if let (Some(registry), Some(running)) = (&self.registry, &self.running) {
                    registry.update(running.stats.sample());
                }
                tracing::info!("Session {} listening", self.id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Session {} failed to start: {}", self.id, e);
                self.teardown().await;
                self.set_state(SessionState::Stopped);
                Err(e)
            }
        }
    }

    async fn initialize(&mut self, init: InitRequest, mut host: Box<dyn RenderHost>) -> Result<()> {
        init.validate()?;
        let url = self.server_config.listen_url(&init.room_id, &init.user_id)?;

        let (writer, reader) = create_shared_ring(init.capacity_samples())?;
        let ring = Arc::clone(writer.shared());
        tracing::info!(
            "Session {} allocated {} sample ring ({} ch @ {} Hz, primes after {:.2}s)",
            self.id,
            ring.capacity(),
            init.channel_count,
            init.sample_rate,
            init.priming_seconds()
        );

        let (command_tx, command_rx) = crossbeam_channel::bounded(RENDER_CHANNEL_CAPACITY);
        let (render_event_tx, render_event_rx) = crossbeam_channel::bounded(RENDER_CHANNEL_CAPACITY);
        let render = RenderTask::new(
            reader,
            init.channel_count,
            MAX_RENDER_QUANTUM,
            command_rx,
            render_event_tx,
        );

        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let ingest = IngestTask::new(writer, init.channel_count, ingest_tx);

        let stats = Arc::new(StatsSources {
            id: self.id,
            init: init.clone(),
            started_at: Utc::now(),
            state: Arc::clone(&self.state),
            ingest_state: ingest.state_handle(),
            ring,
            ingest: ingest.stats(),
            render: render.stats(),
        });

        host.attach(render)?;

        let stream = match ingest
            .connect(&url, self.server_config.connect_timeout())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                host.detach();
                return Err(SessionError::ConnectionFailed(e.to_string()).into());
            }
        };
        tracing::info!("Session {} connected to {}", self.id, url);

        let (ingest_shutdown_tx, ingest_shutdown_rx) = oneshot::channel();
        let ingest_handle = tokio::spawn(ingest.run(stream, ingest_shutdown_rx));

        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = Supervisor {
            url,
            connect_timeout: self.server_config.connect_timeout(),
            reconnect_on_loss: self.session_config.reconnect_on_loss,
            priming_seconds: init.priming_seconds(),
            stats_interval: self.session_config.stats_interval(),
            ingest: Some(RunningIngest {
                handle: ingest_handle,
                shutdown: ingest_shutdown_tx,
            }),
            ingest_events: ingest_rx,
            render_commands: command_tx,
            render_events: render_event_rx,
            host_errors: host.error_receiver(),
            events: self.events.clone(),
            ready_tx: Some(ready_tx),
            stats: Arc::clone(&stats),
            registry: self.registry.clone(),
        };

        let (supervisor_shutdown, supervisor_shutdown_rx) = oneshot::channel();
        self.running = Some(Running {
            host,
            supervisor: tokio::spawn(supervisor.run(supervisor_shutdown_rx)),
            supervisor_shutdown,
            stats,
        });

        let timeout = self.session_config.ready_timeout();
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(SessionError::ConnectionClosedBeforeReady(
                "supervisor exited".to_string(),
            )
            .into()),
            Err(_) => Err(SessionError::ReadyTimeout(timeout.as_secs()).into()),
        }
    }

    /// Stop listening. Succeeds once; later calls fail with `AlreadyStopped`.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Listening => {}
            SessionState::Stopped => return Err(SessionError::AlreadyStopped.into()),
            SessionState::Idle | SessionState::Initializing => {
                return Err(SessionError::NotInitialized.into())
            }
        }

        self.teardown().await;
        self.set_state(SessionState::Stopped);
        tracing::info!("Session {} stopped", self.id);
        Ok(())
    }

    /// Render detach, then ingest shutdown, then ring release
    async fn teardown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let Running {
            mut host,
            supervisor,
            supervisor_shutdown,
            stats,
        } = running;

        // No callback may touch the reader past this point
        host.detach();
        tracing::debug!("Session {} render task detached", self.id);

        let _ = supervisor_shutdown.send(());
        let ingest = match supervisor.await {
            Ok(ingest) => ingest,
            Err(e) => {
                tracing::error!("Session {} supervisor failed: {}", self.id, e);
                None
            }
        };
        tracing::debug!("Session {} ingest task stopped", self.id);

        if let Some(registry) = &self.registry {
            registry.remove(&self.id);
        }

        let capacity = stats.ring.capacity();
        drop(ingest);
        drop(stats);
        drop(host);
        tracing::debug!("Session {} released {} sample ring", self.id, capacity);
    }

    /// Current sampled stats. Only available while listening.
    pub fn stats(&self) -> Result<SessionStats> {
        match (self.state(), &self.running) {
            (SessionState::Listening, Some(running)) => Ok(running.stats.sample()),
            (SessionState::Stopped, _) => Err(SessionError::AlreadyStopped.into()),
            _ => Err(SessionError::NotInitialized.into()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.host.detach();
            // The supervisor stops the ingest task on its way out
            let _ = running.supervisor_shutdown.send(());
            if let Some(registry) = &self.registry {
                registry.remove(&self.id);
            }
        }
    }
}
