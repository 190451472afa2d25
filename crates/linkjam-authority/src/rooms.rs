//! In-memory registry of room tempo state.
//!
//! Rooms are created lazily with the configured defaults the first time
//! they are read or written. The registry performs no business validation;
//! callers hand it an already-validated [`TempoPatch`].

use std::collections::BTreeMap;
use std::sync::Arc;

use linkjam_core::config::RoomDefaults;
use linkjam_core::time::TimeSource;
use linkjam_types::{TempoPatch, TempoState};
use tokio::sync::RwLock;
use tracing::debug;

/// Canonical tempo state for every known room.
pub struct RoomRegistry {
    rooms: RwLock<BTreeMap<String, TempoState>>,
    defaults: RoomDefaults,
    clock: Arc<dyn TimeSource>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new(defaults: RoomDefaults, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            defaults,
            clock,
        }
    }

    fn fresh(&self, room_id: &str, now_ms: i64) -> TempoState {
        debug!(room_id, bpm = self.defaults.bpm, bpi = self.defaults.bpi, "Room created");
        TempoState::new(room_id, self.defaults.bpm, self.defaults.bpi, now_ms)
    }

    /// Read a room without creating it.
    pub async fn get(&self, room_id: &str) -> Option<TempoState> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Read a room, creating it with defaults if absent.
    pub async fn get_or_create(&self, room_id: &str) -> TempoState {
        if let Some(state) = self.get(room_id).await {
            return state;
        }
        let now = self.clock.now_ms();
        let mut rooms = self.rooms.write().await;
        // Another task may have created it between the two locks.
        rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| self.fresh(room_id, now))
            .clone()
    }

    /// Merge `patch` over the room's state and return the result.
    ///
    /// Absent fields keep their stored value. `updated_at` is always
    /// refreshed and never moves backwards.
    pub async fn update(&self, room_id: &str, patch: TempoPatch) -> TempoState {
        let now = self.clock.now_ms();
        let mut rooms = self.rooms.write().await;
        let state = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| self.fresh(room_id, now));

        if let Some(bpm) = patch.bpm {
            state.bpm = bpm;
        }
        if let Some(bpi) = patch.bpi {
            state.bpi = bpi;
        }
        if let Some(epoch_ms) = patch.epoch_ms {
            state.epoch_ms = epoch_ms;
        }
        if patch.updated_by.is_some() {
            state.updated_by = patch.updated_by;
        }
        room_id.clone_into(&mut state.room_id);
        state.updated_at = now.max(state.updated_at);

        state.clone()
    }

    /// Every room, ordered by id.
    pub async fn list_all(&self) -> Vec<TempoState> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Remove a room. Returns `false` if it did not exist.
    pub async fn delete(&self, room_id: &str) -> bool {
        self.rooms.write().await.remove(room_id).is_some()
    }

    /// Number of rooms.
    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// True if no room exists.
    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use linkjam_core::time::ManualClock;

    use super::*;

    fn registry(clock: &ManualClock) -> RoomRegistry {
        RoomRegistry::new(RoomDefaults::default(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn get_does_not_create() {
        let clock = ManualClock::new(1_000);
        let rooms = registry(&clock);
        assert!(rooms.get("main").await.is_none());
        assert!(rooms.is_empty().await);
    }

    #[tokio::test]
    async fn first_access_uses_defaults() {
        let clock = ManualClock::new(1_000);
        let rooms = registry(&clock);
        let state = rooms.get_or_create("main").await;
        assert_eq!(state.room_id, "main");
        assert_eq!(state.bpi, 4);
        assert!((state.bpm - 174.0).abs() < f64::EPSILON);
        assert_eq!(state.epoch_ms, 1_000);
        assert_eq!(state.updated_at, 1_000);

        clock.advance(500);
        assert_eq!(rooms.get_or_create("main").await, state);
    }

    #[tokio::test]
    async fn empty_patch_only_refreshes_updated_at() {
        let clock = ManualClock::new(1_000);
        let rooms = registry(&clock);
        let before = rooms.get_or_create("main").await;
        clock.advance(250);
        let after = rooms.update("main", TempoPatch::default()).await;
        assert_eq!(after.epoch_ms, before.epoch_ms);
        assert_eq!(after.bpi, before.bpi);
        assert!((after.bpm - before.bpm).abs() < f64::EPSILON);
        assert_eq!(after.updated_at, 1_250);
    }

    #[tokio::test]
    async fn patch_replaces_present_fields() {
        let clock = ManualClock::new(1_000);
        let rooms = registry(&clock);
        let patch = TempoPatch {
            bpm: Some(128.0),
            updated_by: Some("dj".to_owned()),
            ..TempoPatch::default()
        };
        let state = rooms.update("new-room", patch).await;
        assert!((state.bpm - 128.0).abs() < f64::EPSILON);
        assert_eq!(state.bpi, 4);
        assert_eq!(state.updated_by.as_deref(), Some("dj"));
        assert_eq!(rooms.get("new-room").await.unwrap(), state);
    }

    #[tokio::test]
    async fn updated_at_never_goes_backwards() {
        let clock = ManualClock::new(5_000);
        let rooms = registry(&clock);
        rooms.get_or_create("main").await;
        clock.set(4_000);
        let state = rooms.update("main", TempoPatch::default()).await;
        assert_eq!(state.updated_at, 5_000);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let clock = ManualClock::new(0);
        let rooms = Arc::new(registry(&clock));
        let mut handles = Vec::new();
        for i in 0..32_u32 {
            let rooms = Arc::clone(&rooms);
            handles.push(tokio::spawn(async move {
                let patch = TempoPatch {
                    bpi: Some(i % 8 + 1),
                    ..TempoPatch::default()
                };
                rooms.update("main", patch).await
            }));
        }
        for handle in handles {
            let state = handle.await.unwrap();
            assert!((1..=8).contains(&state.bpi));
        }
        assert_eq!(rooms.len().await, 1);
    }

    #[tokio::test]
    async fn list_is_ordered_and_delete_removes() {
        let clock = ManualClock::new(0);
        let rooms = registry(&clock);
        rooms.get_or_create("zulu").await;
        rooms.get_or_create("alpha").await;
        let ids: Vec<_> = rooms.list_all().await.into_iter().map(|s| s.room_id).collect();
        assert_eq!(ids, ["alpha", "zulu"]);
        assert!(rooms.delete("alpha").await);
        assert!(!rooms.delete("alpha").await);
        assert_eq!(rooms.len().await, 1);
    }
}
