//! Wires the authority channel, clock sync and boundary scheduler together.
//!
//! The coordinator owns one authority session at a time. Reconnection is
//! the caller's business; see the binary.

use std::sync::Arc;

use linkjam_core::config::{CompanionConfig, LinkJamConfig, SyncConfig};
use linkjam_core::time::TimeSource;
use linkjam_types::SchedulerStatus;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authority::{AuthorityClient, AuthorityEvent};
use crate::clock_sync::{self, ClockOffset, SyncOutcome};
use crate::engine::{EngineEvent, TempoEngine};
use crate::error::CompanionError;
use crate::scheduler::BoundaryScheduler;

struct Session {
    client: Arc<AuthorityClient>,
    pump: JoinHandle<()>,
}

/// One DJ's connection to one room.
pub struct Coordinator<E> {
    companion: CompanionConfig,
    sync: SyncConfig,
    clock: Arc<dyn TimeSource>,
    offset: ClockOffset,
    scheduler: BoundaryScheduler<E>,
    session: Mutex<Option<Session>>,
}

impl<E: TempoEngine> Coordinator<E> {
    /// Build a coordinator driving `engine`, reading local time from `clock`.
    pub fn new(config: &LinkJamConfig, engine: Arc<E>, clock: Arc<dyn TimeSource>) -> Self {
        let offset = ClockOffset::new();
        let scheduler = BoundaryScheduler::new(
            engine,
            Arc::clone(&clock),
            offset.clone(),
            config.scheduler.clone(),
        );
        Self {
            companion: config.companion.clone(),
            sync: config.sync.clone(),
            clock,
            offset,
            scheduler,
            session: Mutex::new(None),
        }
    }

    /// The boundary scheduler, for status and event subscriptions.
    pub const fn scheduler(&self) -> &BoundaryScheduler<E> {
        &self.scheduler
    }

    /// The shared clock offset.
    pub const fn offset(&self) -> &ClockOffset {
        &self.offset
    }

    /// Current scheduler status.
    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Open the room channel, synchronize clocks and start following the
    /// room's tempo.
    ///
    /// Any previous session is closed first. On failure the scheduler is
    /// left `Disconnected`.
    pub async fn connect(&self) -> Result<SyncOutcome, CompanionError> {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            close_session(old).await;
        }

        self.scheduler.mark_connecting();
        let (client, events) =
            match AuthorityClient::connect(&self.companion, Arc::clone(&self.clock)).await {
                Ok(opened) => opened,
                Err(e) => {
                    self.scheduler.mark_disconnected();
                    return Err(e);
                }
            };
        let client = Arc::new(client);
        let pump = tokio::spawn(pump_authority(events, self.scheduler.clone()));
        *session = Some(Session {
            client: Arc::clone(&client),
            pump,
        });

        let outcome = clock_sync::synchronize(&*client, &*self.clock, &self.sync).await;
        self.offset.apply(&outcome);

        if !self.scheduler.has_state() {
            match client.fetch_state().await {
                Ok(state) => {
                    debug!(bpm = state.bpm, "Fetched room state over REST");
                    self.scheduler.on_tempo_state(state);
                }
                Err(e) => warn!("No state pushed and REST fetch failed: {e}"),
            }
        }

        if !self.scheduler.mark_connected() {
            if let Some(dead) = session.take() {
                close_session(dead).await;
            }
            return Err(CompanionError::Channel(
                "channel closed while connecting".to_owned(),
            ));
        }

        info!(
            room_id = %self.companion.room_id,
            offset_ms = outcome.offset_ms,
            degraded = outcome.degraded,
            "Connected to authority"
        );
        Ok(outcome)
    }

    /// Close the session, cancel any armed boundary and go `Disconnected`.
    pub async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            close_session(session).await;
            info!(room_id = %self.companion.room_id, "Disconnected from authority");
        }
        self.scheduler.mark_disconnected();
    }

    /// Propose `bpm` upstream if it passes the echo and debounce gate.
    ///
    /// Returns whether a proposal was sent.
    pub async fn propose_tempo(&self, bpm: f64) -> Result<bool, CompanionError> {
        if !self.status().is_online() || !self.scheduler.observe_local_tempo(bpm) {
            return Ok(false);
        }
        let client = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.client));
        match client {
            Some(client) => client.send_tempo_proposal(bpm).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Forward engine events: local tempo changes become proposals, peer
    /// counts become scheduler events.
    pub fn spawn_engine_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::TempoChanged(bpm) => match this.propose_tempo(bpm).await {
                        Ok(true) => info!(bpm, "Proposed local tempo change"),
                        Ok(false) => {}
                        Err(e) => warn!(bpm, "Tempo proposal failed: {e}"),
                    },
                    EngineEvent::PeersChanged(peers) => {
                        debug!(peers, "Engine peers");
                        this.scheduler.report_peers(peers);
                    }
                }
            }
            debug!("Engine event stream ended");
        })
    }
}

async fn close_session(session: Session) {
    session.pump.abort();
    session.client.close().await;
}

async fn pump_authority<E: TempoEngine>(
    mut events: mpsc::UnboundedReceiver<AuthorityEvent>,
    scheduler: BoundaryScheduler<E>,
) {
    while let Some(event) = events.recv().await {
        match event {
            AuthorityEvent::TempoState(state) => {
                debug!(
                    bpm = state.bpm,
                    bpi = state.bpi,
                    epoch_ms = state.epoch_ms,
                    "Tempo state"
                );
                scheduler.on_tempo_state(state);
            }
            AuthorityEvent::Error(message) => {
                warn!(message = %message, "Authority reported an error");
            }
            AuthorityEvent::Closed => {
                warn!("Authority channel closed");
                scheduler.mark_disconnected();
                break;
            }
        }
    }
}
