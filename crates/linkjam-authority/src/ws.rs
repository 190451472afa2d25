//! `WebSocket` connection task for a room channel.
//!
//! Clients connect to `GET /ws/{room_id}` and immediately receive the
//! room's current `tempo_state`. After that the task multiplexes two
//! directions in one `select!` loop: frames queued for this connection by
//! the [`FanoutHub`](crate::fanout::FanoutHub) go out to the socket, and
//! inbound frames are decoded and handled. Bad inbound frames get an
//! `error` reply; they never close the connection.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use linkjam_core::validation::validate_bpm;
use linkjam_types::{ChannelMessage, ConnectionId, TempoPatch, TempoProposal, TimeSyncPong};
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Upgrade an HTTP request to a room channel.
///
/// # Route
///
/// `GET /ws/{room_id}`
pub async fn ws_room(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, room_id, state))
}

async fn handle_ws(mut socket: WebSocket, room_id: String, state: Arc<AppState>) {
    let mut sub = state.attach(&room_id).await;
    let connection_id = sub.connection_id;

    loop {
        tokio::select! {
            outbound = sub.rx.recv() => {
                let Some(frame) = outbound else {
                    debug!(room_id = %room_id, %connection_id, "Subscriber dropped by hub, closing");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if socket.send(frame).await.is_err() {
                    debug!(room_id = %room_id, %connection_id, "WebSocket client disconnected (send failed)");
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&state, &room_id, connection_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.hub.record_pong(&room_id, connection_id);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        state.hub.send_to(
                            &room_id,
                            connection_id,
                            &ChannelMessage::error("binary frames are not supported"),
                        );
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(room_id = %room_id, %connection_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(room_id = %room_id, %connection_id, "WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.hub.detach(&room_id, connection_id);
}

/// Decode and act on one inbound text frame.
async fn handle_text(state: &AppState, room_id: &str, connection_id: ConnectionId, text: &str) {
    let reply = match ChannelMessage::from_json(text) {
        Ok(ChannelMessage::TempoProposal(proposal)) => {
            handle_proposal(state, room_id, proposal).await
        }
        Ok(ChannelMessage::TimeSyncPing(ping)) => {
            let t1_server = state.now_ms();
            Some(ChannelMessage::TimeSyncPong(TimeSyncPong {
                t0_client: ping.t0_client,
                t1_server,
                t2_server: state.now_ms(),
            }))
        }
        Ok(ChannelMessage::Subscribe) => None,
        Ok(other) => Some(ChannelMessage::error(format!(
            "unexpected message type: {}",
            other.kind()
        ))),
        Err(e) => {
            debug!(room_id, %connection_id, "Rejected inbound frame: {e}");
            Some(ChannelMessage::error(e.to_string()))
        }
    };

    if let Some(reply) = reply {
        state.hub.send_to(room_id, connection_id, &reply);
    }
}

/// Apply a channel tempo proposal. Returns an error reply on rejection.
async fn handle_proposal(
    state: &AppState,
    room_id: &str,
    proposal: TempoProposal,
) -> Option<ChannelMessage> {
    if proposal.room_id != room_id {
        warn!(
            room_id,
            proposal_room = %proposal.room_id,
            "Proposal targets a different room"
        );
        return Some(ChannelMessage::error(format!(
            "proposal for room {} sent on room {room_id}",
            proposal.room_id
        )));
    }
    let bpm = match validate_bpm(proposal.bpm) {
        Ok(bpm) => bpm,
        Err(e) => {
            debug!(room_id, bpm = proposal.bpm, "Proposal rejected: {e}");
            return Some(ChannelMessage::error(e.to_string()));
        }
    };

    let patch = TempoPatch {
        bpm: Some(bpm),
        updated_by: Some(proposal.proposed_by),
        ..TempoPatch::default()
    };
    let stored = state.apply_update(room_id, patch).await;
    info!(
        room_id,
        bpm,
        updated_by = stored.updated_by.as_deref().unwrap_or_default(),
        "Tempo proposal applied"
    );
    None
}
