//! Listening sessions
//!
//! A [`Session`] owns one ring and the two tasks around it. Sessions are
//! independent; a [`SessionRegistry`] only collects their sampled stats.

pub mod controller;
pub mod registry;
mod supervisor;

pub use controller::Session;
pub use registry::SessionRegistry;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::audio::buffer::{RingSnapshot, SharedRing};
use crate::audio::render::{RenderStats, RenderStatsSnapshot};
use crate::network::ingest::{IngestState, IngestStats, IngestStatsSnapshot};
use crate::protocol::InitRequest;

/// Session lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Listening,
    Stopped,
}

/// Sampled view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: Uuid,
    pub room_id: String,
    pub user_id: String,
    pub state: SessionState,
    pub ingest_state: IngestState,
    pub started_at: DateTime<Utc>,
    pub sampled_at: DateTime<Utc>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Buffered fraction of the ring
    pub fill_level: f32,
    pub ring: RingSnapshot,
    pub ingest: IngestStatsSnapshot,
    pub render: RenderStatsSnapshot,
}

impl SessionStats {
    /// Seconds of audio currently buffered
    pub fn buffered_seconds(&self) -> f64 {
        let per_second = self.sample_rate as f64 * self.channels.max(1) as f64;
        if per_second == 0.0 {
            return 0.0;
        }
        self.ring.written_total.saturating_sub(self.ring.read_total) as f64 / per_second
    }
}

/// Everything needed to sample a running session's stats
pub(crate) struct StatsSources {
    pub id: Uuid,
    pub init: InitRequest,
    pub started_at: DateTime<Utc>,
    pub state: Arc<RwLock<SessionState>>,
    pub ingest_state: Arc<RwLock<IngestState>>,
    pub ring: Arc<SharedRing>,
    pub ingest: Arc<IngestStats>,
    pub render: Arc<RenderStats>,
}

impl StatsSources {
    pub fn sample(&self) -> SessionStats {
        SessionStats {
            id: self.id,
            room_id: self.init.room_id.clone(),
            user_id: self.init.user_id.clone(),
            state: *self.state.read(),
            ingest_state: *self.ingest_state.read(),
            started_at: self.started_at,
            sampled_at: Utc::now(),
            channels: self.init.channel_count,
            sample_rate: self.init.sample_rate,
            fill_level: self.ring.fill_level(),
            ring: self.ring.snapshot(),
            ingest: self.ingest.snapshot(),
            render: self.render.snapshot(),
        }
    }
}
