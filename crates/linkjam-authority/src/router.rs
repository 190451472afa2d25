//! Axum router construction for the authority.
//!
//! Assembles the REST routes and the room channel into a single [`Router`]
//! with permissive CORS so browser-based clients on any origin can connect.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete Axum router for the authority.
///
/// The router includes:
/// - `GET /ws/{room_id}` -- room channel (`WebSocket`)
/// - `GET|POST /room/{room_id}/state` -- read or update a room
/// - `DELETE /room/{room_id}` -- forget a room
/// - `GET /rooms` -- list rooms
/// - `GET /time` -- authority clock
/// - `GET /health` -- liveness
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/{room_id}", get(ws::ws_room))
        .route(
            "/room/{room_id}/state",
            get(handlers::get_room_state).post(handlers::update_room_state),
        )
        .route("/room/{room_id}", delete(handlers::delete_room))
        .route("/rooms", get(handlers::list_rooms))
        .route("/time", get(handlers::server_time))
        .route("/health", get(handlers::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
