//! Per-room fan-out of channel messages to connected subscribers.
//!
//! [`FanoutHub`] owns every live connection, grouped by room. Each
//! connection is represented by the sending half of an unbounded queue; the
//! connection task in [`crate::ws`] drains the receiving half into its
//! socket. Removing a subscriber drops its sender, which closes the queue
//! and makes the connection task close the socket.
//!
//! Liveness follows a two-strike rule: [`FanoutHub::sweep`] terminates any
//! connection that did not answer the previous sweep's ping, then pings the
//! rest. An unresponsive connection is therefore gone within two periods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes};
use linkjam_types::{ChannelMessage, ConnectionId, TempoState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle used to push frames to one connected socket.
struct Subscriber {
    tx: mpsc::UnboundedSender<Message>,
    awaiting_pong: bool,
}

/// The receiving side of a registered connection.
#[derive(Debug)]
pub struct Subscription {
    /// Room the connection belongs to.
    pub room_id: String,
    /// Identifier assigned at attach time.
    pub connection_id: ConnectionId,
    /// Outbound frames, in delivery order. Yields `None` once the hub has
    /// dropped the connection.
    pub rx: mpsc::UnboundedReceiver<Message>,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections that were sent a fresh ping.
    pub pinged: usize,
    /// Connections removed for missing the previous ping.
    pub terminated: usize,
}

/// Registry of live connections keyed by room, then connection.
#[derive(Default)]
pub struct FanoutHub {
    rooms: Mutex<HashMap<String, HashMap<ConnectionId, Subscriber>>>,
}

impl FanoutHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<ConnectionId, Subscriber>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection and queue `initial` as its first frame.
    pub fn attach(&self, room_id: &str, initial: &TempoState) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = ConnectionId::new();

        if let Some(frame) = encode(&ChannelMessage::TempoState(initial.clone())) {
            // The receiver is alive: we are still holding it.
            let _ = tx.send(Message::Text(frame));
        }

        let mut rooms = self.lock();
        rooms.entry(room_id.to_owned()).or_default().insert(
            connection_id,
            Subscriber {
                tx,
                awaiting_pong: false,
            },
        );
        let room_size = rooms.get(room_id).map_or(0, HashMap::len);
        drop(rooms);

        info!(room_id, %connection_id, room_size, "Subscriber attached");
        Subscription {
            room_id: room_id.to_owned(),
            connection_id,
            rx,
        }
    }

    /// Remove a connection. The room entry goes away with its last member.
    pub fn detach(&self, room_id: &str, connection_id: ConnectionId) {
        let mut rooms = self.lock();
        let Some(members) = rooms.get_mut(room_id) else {
            return;
        };
        if members.remove(&connection_id).is_some() {
            debug!(room_id, %connection_id, "Subscriber detached");
        }
        if members.is_empty() {
            rooms.remove(room_id);
        }
    }

    /// Push a room's new state to every subscriber of that room.
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub fn broadcast(&self, room_id: &str, state: &TempoState) -> usize {
        let Some(frame) = encode(&ChannelMessage::TempoState(state.clone())) else {
            return 0;
        };
        let rooms = self.lock();
        let Some(members) = rooms.get(room_id) else {
            return 0;
        };
        let delivered = members
            .values()
            .filter(|sub| sub.tx.send(Message::Text(frame.clone())).is_ok())
            .count();
        drop(rooms);
        debug!(room_id, delivered, bpm = state.bpm, "Tempo state broadcast");
        delivered
    }

    /// Queue a message for a single connection.
    ///
    /// Returns `false` if the connection is unknown or already closing.
    pub fn send_to(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        message: &ChannelMessage,
    ) -> bool {
        let Some(frame) = encode(message) else {
            return false;
        };
        self.lock()
            .get(room_id)
            .and_then(|members| members.get(&connection_id))
            .is_some_and(|sub| sub.tx.send(Message::Text(frame)).is_ok())
    }

    /// Mark a connection as alive after it answered a ping.
    pub fn record_pong(&self, room_id: &str, connection_id: ConnectionId) {
        if let Some(sub) = self
            .lock()
            .get_mut(room_id)
            .and_then(|members| members.get_mut(&connection_id))
        {
            sub.awaiting_pong = false;
        }
    }

    /// Terminate connections that missed the last ping and ping the rest.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut rooms = self.lock();
        for (room_id, members) in rooms.iter_mut() {
            members.retain(|connection_id, sub| {
                if sub.awaiting_pong {
                    warn!(room_id = %room_id, %connection_id, "Subscriber missed ping, terminating");
                    report.terminated = report.terminated.saturating_add(1);
                    return false;
                }
                if sub.tx.send(Message::Ping(Bytes::new())).is_err() {
                    report.terminated = report.terminated.saturating_add(1);
                    return false;
                }
                sub.awaiting_pong = true;
                report.pinged = report.pinged.saturating_add(1);
                true
            });
        }
        rooms.retain(|_, members| !members.is_empty());
        report
    }

    /// Run [`Self::sweep`] every `period` until the task is aborted.
    pub fn spawn_liveness_sweep(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let report = hub.sweep();
                if report.terminated > 0 {
                    info!(
                        pinged = report.pinged,
                        terminated = report.terminated,
                        "Liveness sweep"
                    );
                }
            }
        })
    }

    /// Number of connections in one room.
    pub fn connection_count(&self, room_id: &str) -> usize {
        self.lock().get(room_id).map_or(0, HashMap::len)
    }

    /// Number of connections across all rooms.
    pub fn total_connections(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Number of rooms with at least one connection.
    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    /// Ids of rooms with at least one connection, sorted.
    pub fn rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

fn encode(message: &ChannelMessage) -> Option<Utf8Bytes> {
    match message.to_json() {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            warn!(kind = message.kind(), "Failed to serialize channel message: {e}");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn state(bpm: f64) -> TempoState {
        TempoState::new("main", bpm, 4, 0)
    }

    fn text(msg: Message) -> ChannelMessage {
        let Message::Text(t) = msg else {
            panic!("expected text frame, got {msg:?}");
        };
        ChannelMessage::from_json(t.as_str()).unwrap()
    }

    #[test]
    fn attach_queues_current_state_first() {
        let hub = FanoutHub::new();
        let mut sub = hub.attach("main", &state(120.0));
        let first = text(sub.rx.try_recv().unwrap());
        assert_eq!(first, ChannelMessage::TempoState(state(120.0)));
        assert_eq!(hub.connection_count("main"), 1);
    }

    #[test]
    fn broadcast_reaches_only_the_room() {
        let hub = FanoutHub::new();
        let mut a = hub.attach("main", &state(120.0));
        let mut b = hub.attach("main", &state(120.0));
        let mut other = hub.attach("other", &state(120.0));
        for sub in [&mut a, &mut b, &mut other] {
            sub.rx.try_recv().unwrap();
        }

        assert_eq!(hub.broadcast("main", &state(128.0)), 2);
        assert_eq!(
            text(a.rx.try_recv().unwrap()),
            ChannelMessage::TempoState(state(128.0))
        );
        assert!(b.rx.try_recv().is_ok());
        assert!(other.rx.try_recv().is_err());
        assert_eq!(hub.broadcast("empty", &state(128.0)), 0);
    }

    #[test]
    fn detach_removes_empty_room() {
        let hub = FanoutHub::new();
        let a = hub.attach("main", &state(120.0));
        let b = hub.attach("main", &state(120.0));
        hub.detach("main", a.connection_id);
        assert_eq!(hub.rooms(), ["main"]);
        hub.detach("main", b.connection_id);
        assert_eq!(hub.room_count(), 0);
        hub.detach("main", b.connection_id);
    }

    #[test]
    fn send_to_targets_one_connection() {
        let hub = FanoutHub::new();
        let mut a = hub.attach("main", &state(120.0));
        let mut b = hub.attach("main", &state(120.0));
        a.rx.try_recv().unwrap();
        b.rx.try_recv().unwrap();

        assert!(hub.send_to("main", a.connection_id, &ChannelMessage::error("nope")));
        assert_eq!(text(a.rx.try_recv().unwrap()), ChannelMessage::error("nope"));
        assert!(b.rx.try_recv().is_err());
        assert!(!hub.send_to("main", ConnectionId::new(), &ChannelMessage::error("x")));
    }

    #[test]
    fn unresponsive_connection_is_removed_on_second_sweep() {
        let hub = FanoutHub::new();
        let mut quiet = hub.attach("main", &state(120.0));
        let mut alive = hub.attach("main", &state(120.0));
        quiet.rx.try_recv().unwrap();
        alive.rx.try_recv().unwrap();

        let first = hub.sweep();
        assert_eq!(first, SweepReport { pinged: 2, terminated: 0 });
        assert!(matches!(quiet.rx.try_recv().unwrap(), Message::Ping(_)));
        assert!(matches!(alive.rx.try_recv().unwrap(), Message::Ping(_)));

        hub.record_pong("main", alive.connection_id);
        let second = hub.sweep();
        assert_eq!(second, SweepReport { pinged: 1, terminated: 1 });
        assert_eq!(hub.connection_count("main"), 1);

        // The quiet connection's queue is closed and receives no broadcasts.
        assert!(matches!(
            quiet.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(hub.broadcast("main", &state(130.0)), 1);
    }

    #[test]
    fn sweep_drops_connections_whose_task_is_gone() {
        let hub = FanoutHub::new();
        let sub = hub.attach("main", &state(120.0));
        drop(sub);
        assert_eq!(hub.sweep(), SweepReport { pinged: 0, terminated: 1 });
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_terminates_within_two_periods() {
        let hub = Arc::new(FanoutHub::new());
        let mut sub = hub.attach("main", &state(120.0));
        sub.rx.recv().await.unwrap();

        let period = Duration::from_secs(30);
        let task = hub.spawn_liveness_sweep(period);

        tokio::time::sleep(period + Duration::from_millis(1)).await;
        assert!(matches!(sub.rx.recv().await.unwrap(), Message::Ping(_)));
        assert_eq!(hub.connection_count("main"), 1);

        tokio::time::sleep(period).await;
        assert!(sub.rx.recv().await.is_none());
        assert_eq!(hub.connection_count("main"), 0);
        task.abort();
    }
}
