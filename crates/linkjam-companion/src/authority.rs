//! Client side of the authority's room channel.
//!
//! One `WebSocket` per room, split into a locked sink for outgoing frames
//! and a reader task that turns incoming frames into [`AuthorityEvent`]s.
//! Time sync pongs are routed straight to the waiting round instead of the
//! event stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use linkjam_core::config::CompanionConfig;
use linkjam_core::time::TimeSource;
use linkjam_types::{
    ChannelMessage, RoomStateView, TempoProposal, TempoState, TimeSyncPing, TimeSyncPong,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::clock_sync::TimeSyncTransport;
use crate::error::CompanionError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PongWaiters = Arc<Mutex<HashMap<i64, oneshot::Sender<TimeSyncPong>>>>;

/// Something the authority pushed.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorityEvent {
    /// The room's tempo state, on attach and after every change.
    TempoState(TempoState),
    /// The authority rejected something we sent.
    Error(String),
    /// The channel is gone.
    Closed,
}

/// An open channel to one room on the authority.
pub struct AuthorityClient {
    room_id: String,
    dj_name: String,
    http_base: String,
    http: reqwest::Client,
    clock: Arc<dyn TimeSource>,
    sink: tokio::sync::Mutex<SplitSink<Socket, Message>>,
    waiters: PongWaiters,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl AuthorityClient {
    /// Open the channel for `config.room_id`.
    ///
    /// Returns the client and the stream of pushed events. The first event
    /// is normally the room's current state.
    pub async fn connect(
        config: &CompanionConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AuthorityEvent>), CompanionError> {
        let http_base = config.authority_url.trim_end_matches('/').to_owned();
        let url = channel_url(&http_base, &config.room_id)?;
        info!(url = %url, "Connecting to authority");

        let (socket, _) =
            tokio::time::timeout(config.connect_timeout(), connect_async(url.as_str()))
                .await
                .map_err(|_| CompanionError::Timeout("connecting to authority"))?
                .map_err(|e| CompanionError::Connect(e.to_string()))?;
        let (sink, stream) = socket.split();

        let http = reqwest::Client::builder()
            .timeout(config.connect_timeout())
            .build()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let waiters = PongWaiters::default();
        let reader = tokio::spawn(read_loop(stream, events_tx, Arc::clone(&waiters)));

        Ok((
            Self {
                room_id: config.room_id.clone(),
                dj_name: config.dj_name.clone(),
                http_base,
                http,
                clock,
                sink: tokio::sync::Mutex::new(sink),
                waiters,
                reader: Mutex::new(Some(reader)),
            },
            events_rx,
        ))
    }

    /// Room this channel is attached to.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Propose a tempo change on behalf of this DJ.
    pub async fn send_tempo_proposal(&self, bpm: f64) -> Result<(), CompanionError> {
        let proposal = ChannelMessage::TempoProposal(TempoProposal {
            room_id: self.room_id.clone(),
            bpm,
            proposed_by: self.dj_name.clone(),
            client_ms: self.clock.now_ms(),
        });
        debug!(bpm, "Proposing tempo");
        self.send(&proposal).await
    }

    /// Fetch the room state over REST, for when the channel has not
    /// delivered one.
    pub async fn fetch_state(&self) -> Result<TempoState, CompanionError> {
        let url = format!("{}/room/{}/state", self.http_base, self.room_id);
        let view: RoomStateView = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(view.state)
    }

    /// Close the channel. Pending time sync rounds fail.
    pub async fn close(&self) {
        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!("Close frame not sent: {e}");
            }
        }
        self.stop_reader();
        self.lock_waiters().clear();
    }

    async fn send(&self, message: &ChannelMessage) -> Result<(), CompanionError> {
        let text = message.to_json()?;
        self.sink
            .lock()
            .await
            .send(Message::text(text))
            .await
            .map_err(|e| CompanionError::Channel(e.to_string()))
    }

    fn lock_waiters(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<i64, oneshot::Sender<TimeSyncPong>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_reader(&self) {
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

impl Drop for AuthorityClient {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

impl TimeSyncTransport for AuthorityClient {
    async fn round_trip(&self, t0_client: i64) -> Result<TimeSyncPong, CompanionError> {
        let (tx, rx) = oneshot::channel();
        self.lock_waiters().insert(t0_client, tx);
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            key: t0_client,
        };

        self.send(&ChannelMessage::TimeSyncPing(TimeSyncPing { t0_client }))
            .await?;
        rx.await
            .map_err(|_| CompanionError::Channel("channel closed during time sync".to_owned()))
    }
}

/// Removes an abandoned pong waiter (timeout or send failure).
struct WaiterGuard<'a> {
    waiters: &'a PongWaiters,
    key: i64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Map the authority's HTTP base URL to its channel URL for `room_id`.
pub fn channel_url(http_base: &str, room_id: &str) -> Result<String, CompanionError> {
    let base = http_base.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_owned()
    } else {
        return Err(CompanionError::Connect(format!(
            "unsupported authority URL: {http_base}"
        )));
    };
    Ok(format!("{ws_base}/ws/{room_id}"))
}

async fn read_loop(
    mut stream: SplitStream<Socket>,
    events: mpsc::UnboundedSender<AuthorityEvent>,
    waiters: PongWaiters,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Authority closed the channel");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("Authority channel error: {e}");
                break;
            }
        };

        match ChannelMessage::from_json(text.as_str()) {
            Ok(ChannelMessage::TempoState(state)) => {
                if events.send(AuthorityEvent::TempoState(state)).is_err() {
                    break;
                }
            }
            Ok(ChannelMessage::TimeSyncPong(pong)) => {
                let waiter = waiters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&pong.t0_client);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(pong);
                    }
                    None => debug!(t0 = pong.t0_client, "Pong for an abandoned round"),
                }
            }
            Ok(ChannelMessage::Error(payload)) => {
                let _ = events.send(AuthorityEvent::Error(payload.message));
            }
            Ok(other) => debug!(kind = other.kind(), "Ignoring unexpected frame"),
            Err(e) => warn!("Undecodable frame from authority: {e}"),
        }
    }

    waiters
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
    let _ = events.send(AuthorityEvent::Closed);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn channel_url_maps_schemes() {
        assert_eq!(
            channel_url("http://localhost:3000", "main").unwrap(),
            "ws://localhost:3000/ws/main"
        );
        assert_eq!(
            channel_url("https://jam.example.com/", "room-2").unwrap(),
            "wss://jam.example.com/ws/room-2"
        );
        assert_eq!(
            channel_url("ws://10.0.0.5:3000", "main").unwrap(),
            "ws://10.0.0.5:3000/ws/main"
        );
        assert!(channel_url("ftp://nope", "main").is_err());
    }
}
