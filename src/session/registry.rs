//! Registry of live sessions' sampled stats

use dashmap::DashMap;
use uuid::Uuid;

use super::SessionStats;

/// Concurrent map of session id to the latest stats sample.
///
/// Holds plain snapshots only, never a session's ring, so an entry can
/// outlive nothing it should not.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionStats>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the sample for `stats.id`
    pub fn update(&self, stats: SessionStats) {
        self.sessions.insert(stats.id, stats);
    }

    pub fn remove(&self, id: &Uuid) -> Option<SessionStats> {
        self.sessions.remove(id).map(|(_, stats)| stats)
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionStats> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// All samples, oldest session first
    pub fn list(&self) -> Vec<SessionStats> {
        let mut all: Vec<SessionStats> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|stats| stats.started_at);
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::buffer::RingSnapshot;
    use crate::network::ingest::IngestState;
    use crate::session::SessionState;
    use chrono::{Duration, Utc};

    pub(crate) fn sample_stats(room: &str, age_secs: i64) -> SessionStats {
        let started_at = Utc::now() - Duration::seconds(age_secs);
        SessionStats {
            id: Uuid::new_v4(),
            room_id: room.to_string(),
            user_id: "user".to_string(),
            state: SessionState::Listening,
            ingest_state: IngestState::Streaming,
            started_at,
            sampled_at: Utc::now(),
            channels: 2,
            sample_rate: 48_000,
            fill_level: 0.5,
            ring: RingSnapshot {
                capacity: 480_000,
                write_index: 240_000,
                read_index: 0,
                written_total: 240_000,
                read_total: 0,
                ready: true,
                generation: 0,
                overruns: 0,
                underruns: 0,
            },
            ingest: Default::default(),
            render: Default::default(),
        }
    }

    #[test]
    fn test_update_get_remove() {
        let registry = SessionRegistry::new();
        let stats = sample_stats("a", 0);
        let id = stats.id;

        registry.update(stats);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().room_id, "a");

        let mut newer = registry.get(&id).unwrap();
        newer.fill_level = 0.9;
        registry.update(newer);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().fill_level, 0.9);

        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_list_is_ordered_by_start() {
        let registry = SessionRegistry::new();
        registry.update(sample_stats("young", 1));
        registry.update(sample_stats("old", 60));
        registry.update(sample_stats("middle", 30));

        let rooms: Vec<String> = registry.list().into_iter().map(|s| s.room_id).collect();
        assert_eq!(rooms, vec!["old", "middle", "young"]);
    }

    #[test]
    fn test_buffered_seconds() {
        let stats = sample_stats("a", 0);
        assert!((stats.buffered_seconds() - 2.5).abs() < 1e-9);
    }
}
