//! REST endpoint handlers for the authority server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/room/{room_id}/state` | Room state plus next-boundary figures |
//! | `POST` | `/room/{room_id}/state` | Partial update, broadcast to the room |
//! | `DELETE` | `/room/{room_id}` | Forget a room |
//! | `GET` | `/rooms` | Every room's state |
//! | `GET` | `/time` | Authority wall clock |
//! | `GET` | `/health` | Liveness and counts |

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use linkjam_core::boundary;
use linkjam_core::validation::validate_update;
use linkjam_types::{RoomStateView, TempoState, TempoUpdate};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::AuthorityError;
use crate::state::AppState;

/// Response body of `GET /time`.
#[derive(Debug, Serialize)]
pub struct ServerTime {
    /// Authority wall clock in Unix milliseconds.
    pub server_time_ms: i64,
}

/// Response body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct Health {
    /// Always `"healthy"` when the server answers.
    pub status: &'static str,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Rooms known to the registry.
    pub rooms: usize,
    /// Open channel connections.
    pub connections: usize,
}

/// Response body of `DELETE /room/{room_id}`.
#[derive(Debug, Serialize)]
pub struct Deleted {
    /// The removed room.
    #[serde(rename = "roomId")]
    pub room_id: String,
    /// Always `true`.
    pub deleted: bool,
}

/// Get a room's state, creating it with defaults on first access.
pub async fn get_room_state(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Json<RoomStateView> {
    let room = state.rooms.get_or_create(&room_id).await;
    let info = boundary::compute(&room, state.now_ms());
    Json(RoomStateView {
        state: room,
        next_boundary_ms: info.next_boundary_ms,
        ms_until_boundary: info.ms_until_boundary,
        current_bar_beat: info.position,
    })
}

/// Apply a partial update and broadcast the result to the room.
///
/// A bounds violation is rejected with 400 and leaves the room untouched.
pub async fn update_room_state(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<TempoUpdate>, JsonRejection>,
) -> Result<Json<TempoState>, AuthorityError> {
    let Json(update) = body?;
    let patch = validate_update(update).inspect_err(|e| {
        debug!(room_id = %room_id, "Update rejected: {e}");
    })?;
    let stored = state.apply_update(&room_id, patch).await;
    info!(
        room_id = %room_id,
        bpm = stored.bpm,
        bpi = stored.bpi,
        epoch_ms = stored.epoch_ms,
        "Room state updated"
    );
    Ok(Json(stored))
}

/// Remove a room from the registry.
pub async fn delete_room(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Deleted>, AuthorityError> {
    if !state.rooms.delete(&room_id).await {
        return Err(AuthorityError::NotFound(room_id));
    }
    info!(room_id = %room_id, "Room deleted");
    Ok(Json(Deleted {
        room_id,
        deleted: true,
    }))
}

/// List every room's stored state.
pub async fn list_rooms(State(state): State<Arc<AppState>>) -> Json<Vec<TempoState>> {
    Json(state.rooms.list_all().await)
}

/// Report the authority wall clock.
pub async fn server_time(State(state): State<Arc<AppState>>) -> Json<ServerTime> {
    Json(ServerTime {
        server_time_ms: state.now_ms(),
    })
}

/// Liveness check.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        uptime_secs: state.uptime_secs(),
        rooms: state.rooms.len().await,
        connections: state.hub.total_connections(),
    })
}
