//! Shared application state for the authority server.
//!
//! [`AppState`] ties the room registry to the fan-out hub. Writers go
//! through [`AppState::apply_update`] and new connections through
//! [`AppState::attach`]; both hold the publish lock, so a subscriber that
//! attaches while an update is in flight either sees the update in its
//! initial frame or receives it as a broadcast, never an older state after
//! a newer one.

use std::sync::Arc;
use std::time::Instant;

use linkjam_core::config::RoomDefaults;
use linkjam_core::time::{SystemClock, TimeSource};
use linkjam_types::{TempoPatch, TempoState};
use tokio::sync::Mutex;

use crate::fanout::{FanoutHub, Subscription};
use crate::rooms::RoomRegistry;

/// Shared state for the Axum application.
///
/// Wrapped in [`Arc`] and injected via Axum's `State` extractor.
pub struct AppState {
    /// Canonical tempo state per room.
    pub rooms: RoomRegistry,
    /// Live channel connections per room.
    pub hub: Arc<FanoutHub>,
    /// Wall clock used for stamping and boundary math.
    pub clock: Arc<dyn TimeSource>,
    publish_lock: Mutex<()>,
    started_at: Instant,
}

impl AppState {
    /// Create state backed by the system clock.
    pub fn new(defaults: RoomDefaults) -> Self {
        Self::with_clock(defaults, Arc::new(SystemClock))
    }

    /// Create state backed by an arbitrary clock.
    pub fn with_clock(defaults: RoomDefaults, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            rooms: RoomRegistry::new(defaults, Arc::clone(&clock)),
            hub: Arc::new(FanoutHub::new()),
            clock,
            publish_lock: Mutex::new(()),
            started_at: Instant::now(),
        }
    }

    /// Current authority time in Unix milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Merge a validated patch into a room and push the result to its
    /// subscribers. Returns the stored state.
    pub async fn apply_update(&self, room_id: &str, patch: TempoPatch) -> TempoState {
        let _publish = self.publish_lock.lock().await;
        let state = self.rooms.update(room_id, patch).await;
        self.hub.broadcast(room_id, &state);
        state
    }

    /// Register a new channel connection, queuing the room's current state
    /// (created with defaults if needed) as its first frame.
    pub async fn attach(&self, room_id: &str) -> Subscription {
        let _publish = self.publish_lock.lock().await;
        let current = self.rooms.get_or_create(room_id).await;
        self.hub.attach(room_id, &current)
    }

    /// Seconds since this state was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(RoomDefaults::default())
    }
}
