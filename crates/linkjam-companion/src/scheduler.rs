//! Bar-boundary scheduler.
//!
//! Turns authority tempo states into engine commands applied exactly at the
//! next bar line, never mid-bar.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected --state, far from boundary--> Armed --timer--> Locked
//! Connected --state, close to boundary--> (apply now) ---> Locked
//! Armed --newer state--> Armed            (old pending discarded)
//! Locked --next state--> Armed | Locked
//! apply failure / timeout -> Connected
//! any --disconnect--> Disconnected        (timer cancelled, pending dropped)
//! ```
//!
//! A state that arrives before the connection is fully up (the authority
//! pushes one on attach, before clock sync completes) is kept as deferred
//! pending and armed by [`BoundaryScheduler::mark_connected`].
//!
//! # Concurrency
//!
//! Pending state, current state, the timer handle and a generation counter
//! live behind one mutex. Every arm bumps the generation; a timer or apply
//! task carries the generation it was started under and is ignored if it
//! no longer matches. The timer task only sleeps and then claims the
//! pending state under the lock; engine I/O runs in a separate task, so
//! cancelling a timer can never interrupt a half-written command pair.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use linkjam_core::boundary;
use linkjam_core::config::SchedulerConfig;
use linkjam_core::time::TimeSource;
use linkjam_core::validation::{self, BoundsError};
use linkjam_types::{BoundaryInfo, SchedulerStatus, TempoState};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock_sync::ClockOffset;
use crate::engine::TempoEngine;
use crate::error::CompanionError;

/// Capacity of the scheduler event channel.
const EVENT_CAPACITY: usize = 256;

/// Something observers may want to display or log.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// The status moved.
    StatusChanged(SchedulerStatus),
    /// Boundary figures for a newly received state (authority clock).
    BoundaryUpdated(BoundaryInfo),
    /// A state was applied to the engine.
    Locked {
        /// Applied tempo.
        bpm: f64,
        /// Applied beats per bar.
        bpi: u32,
        /// Local instant (Unix ms) the engine's downbeat was pinned to.
        boundary_local_ms: f64,
    },
    /// Applying a state failed; the scheduler fell back to `Connected`.
    ApplyFailed {
        /// What went wrong.
        message: String,
    },
    /// The tempo engine reported a new peer count.
    PeersChanged(u32),
}

#[derive(Default)]
struct Slot {
    pending: Option<TempoState>,
    current: Option<TempoState>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl Slot {
    /// Invalidate every outstanding timer and apply task.
    fn bump(&mut self) -> u64 {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }
}

/// Debounce state for proposing local tempo changes upstream.
#[derive(Default)]
struct ProposalGate {
    last_sent_bpm: Option<f64>,
    last_report_ms: Option<i64>,
}

struct Inner<E> {
    engine: Arc<E>,
    clock: Arc<dyn TimeSource>,
    offset: ClockOffset,
    config: SchedulerConfig,
    slot: Mutex<Slot>,
    gate: Mutex<ProposalGate>,
    status: watch::Sender<SchedulerStatus>,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Arms, fires and applies tempo changes at bar boundaries.
///
/// Cheap to clone; clones share the same state.
pub struct BoundaryScheduler<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for BoundaryScheduler<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: TempoEngine> BoundaryScheduler<E> {
    /// Create a scheduler in the `Disconnected` state.
    ///
    /// `clock` is the local wall clock; `offset` converts it to authority
    /// time.
    pub fn new(
        engine: Arc<E>,
        clock: Arc<dyn TimeSource>,
        offset: ClockOffset,
        config: SchedulerConfig,
    ) -> Self {
        let (status, _) = watch::channel(SchedulerStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                engine,
                clock,
                offset,
                config,
                slot: Mutex::new(Slot::default()),
                gate: Mutex::new(ProposalGate::default()),
                status,
                events,
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> SchedulerStatus {
        *self.inner.status.borrow()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SchedulerStatus> {
        self.inner.status.subscribe()
    }

    /// Receive scheduler events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// The state most recently applied (or being applied).
    pub fn current_state(&self) -> Option<TempoState> {
        self.inner.lock_slot().current.clone()
    }

    /// The state waiting for its boundary, if any.
    pub fn pending_state(&self) -> Option<TempoState> {
        self.inner.lock_slot().pending.clone()
    }

    /// True once any state has been received since the last disconnect.
    pub fn has_state(&self) -> bool {
        let slot = self.inner.lock_slot();
        slot.pending.is_some() || slot.current.is_some()
    }

    /// Live boundary figures for the current state, in authority time.
    pub fn boundary_info(&self) -> Option<BoundaryInfo> {
        let current = self.current_state()?;
        Some(boundary::compute(&current, self.inner.authority_now()))
    }

    /// The authority channel is being opened.
    pub fn mark_connecting(&self) {
        let mut slot = self.inner.lock_slot();
        slot.bump();
        self.inner.set_status(SchedulerStatus::Connecting);
    }

    /// The channel is open and the clock is synchronized.
    ///
    /// Arms any state deferred while connecting. Returns `false` (and does
    /// nothing) unless the scheduler is `Connecting`, e.g. because the
    /// channel dropped during sync.
    pub fn mark_connected(&self) -> bool {
        let mut slot = self.inner.lock_slot();
        if self.status() != SchedulerStatus::Connecting {
            return false;
        }
        self.inner.set_status(SchedulerStatus::Connected);
        if let Some(deferred) = slot.pending.take() {
            debug!(bpm = deferred.bpm, "Arming state deferred during connect");
            Inner::schedule(&self.inner, &mut slot, deferred);
        }
        true
    }

    /// The channel is gone: cancel the timer and drop pending state.
    pub fn mark_disconnected(&self) {
        let mut slot = self.inner.lock_slot();
        slot.bump();
        slot.pending = None;
        slot.current = None;
        self.inner.set_status(SchedulerStatus::Disconnected);
    }

    /// Handle a `tempo_state` pushed by the authority.
    ///
    /// A state outside the tempo bounds is logged and dropped; status,
    /// pending and current state are left as they were.
    pub fn on_tempo_state(&self, state: TempoState) {
        if let Err(e) = check_bounds(&state) {
            warn!(bpm = state.bpm, bpi = state.bpi, "Ignoring tempo state: {e}");
            return;
        }
        let mut slot = self.inner.lock_slot();
        if !self.status().is_online() {
            debug!(bpm = state.bpm, bpi = state.bpi, "Deferring state until connected");
            slot.pending = Some(state);
            return;
        }
        Inner::schedule(&self.inner, &mut slot, state);
    }

    /// Decide whether a locally observed tempo should be proposed upstream.
    ///
    /// Returns `true` (and records the report) if the tempo differs from
    /// the last sent or applied tempo by more than the epsilon and the
    /// cooldown since the last report has elapsed.
    pub fn observe_local_tempo(&self, bpm: f64) -> bool {
        let now = self.inner.clock.now_ms();
        let mut gate = self.inner.lock_gate();
        let changed = gate
            .last_sent_bpm
            .is_none_or(|last| (bpm - last).abs() > self.inner.config.tempo_epsilon);
        let cooled = gate.last_report_ms.is_none_or(|last| {
            now.saturating_sub(last) >= self.inner.config.proposal_cooldown_ms
        });
        if !(changed && cooled) {
            return false;
        }
        gate.last_sent_bpm = Some(bpm);
        gate.last_report_ms = Some(now);
        true
    }

    /// Forward an engine peer count to observers.
    pub fn report_peers(&self, peers: u32) {
        let _ = self.inner.events.send(SchedulerEvent::PeersChanged(peers));
    }
}

impl<E> Drop for BoundaryScheduler<E> {
    fn drop(&mut self) {
        // Last handle gone: stop a sleeping timer from outliving us.
        if Arc::strong_count(&self.inner) == 1 {
            let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
        }
    }
}

impl<E> Inner<E> {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_gate(&self) -> MutexGuard<'_, ProposalGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authority_now(&self) -> i64 {
        self.offset.authority_now(&*self.clock)
    }

    fn set_status(&self, status: SchedulerStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!(from = %previous, to = %status, "Scheduler status");
            let _ = self.events.send(SchedulerEvent::StatusChanged(status));
        }
    }
}

impl<E: TempoEngine> Inner<E> {
    /// Arm or immediately apply `state`. Caller holds the slot lock.
    fn schedule(this: &Arc<Self>, slot: &mut Slot, state: TempoState) {
        let generation = slot.bump();
        let info = boundary::compute(&state, this.authority_now());
        let _ = this.events.send(SchedulerEvent::BoundaryUpdated(info));

        if info.ms_until_boundary > this.config.guard_ms {
            let delay_ms = (info.ms_until_boundary - this.config.lead_ms).max(0.0);
            let delay = match Duration::try_from_secs_f64(delay_ms / 1000.0) {
                Ok(delay) => delay,
                Err(e) => {
                    warn!(delay_ms, "Cannot arm boundary timer: {e}");
                    slot.pending = None;
                    this.set_status(SchedulerStatus::Connected);
                    let _ = this.events.send(SchedulerEvent::ApplyFailed {
                        message: format!("invalid boundary delay {delay_ms}ms: {e}"),
                    });
                    return;
                }
            };
            info!(
                bpm = state.bpm,
                bpi = state.bpi,
                ms_until_boundary = info.ms_until_boundary,
                "Armed for next bar"
            );
            slot.pending = Some(state);
            let weak = Arc::downgrade(this);
            slot.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                Self::fire(&weak, generation);
            }));
            this.set_status(SchedulerStatus::Armed);
        } else {
            debug!(
                ms_until_boundary = info.ms_until_boundary,
                "Boundary inside guard window, applying now"
            );
            slot.pending = None;
            slot.current = Some(state.clone());
            // Nothing is armed any more; `apply` moves on to `Locked`.
            this.set_status(SchedulerStatus::Connected);
            tokio::spawn(Self::apply(Arc::clone(this), generation, state));
        }
    }

    /// Timer expiry: claim the pending state if this timer is still current.
    fn fire(weak: &Weak<Self>, generation: u64) {
        let Some(this) = weak.upgrade() else {
            return;
        };
        let mut slot = this.lock_slot();
        if slot.generation != generation {
            return;
        }
        slot.timer = None;
        let Some(state) = slot.pending.take() else {
            return;
        };
        slot.current = Some(state.clone());
        drop(slot);
        tokio::spawn(Self::apply(Arc::clone(&this), generation, state));
    }

    /// Push `state` to the engine, pinning beat 0 to the bar line.
    async fn apply(this: Arc<Self>, generation: u64, state: TempoState) {
        let local_now = this.clock.now_ms();
        let info = boundary::compute(&state, this.offset.to_authority(local_now));
        let boundary_local_ms = boundary_local_ms(local_now, &info);
        #[allow(clippy::cast_possible_truncation)]
        let when_micros = (boundary_local_ms * 1000.0).round() as i64;

        // Record before sending so the engine's echo of this tempo is not
        // proposed back upstream.
        this.lock_gate().last_sent_bpm = Some(state.bpm);

        let engine = Arc::clone(&this.engine);
        let result = tokio::time::timeout(this.config.apply_timeout(), async {
            engine.set_tempo(state.bpm).await?;
            engine.force_beat_at_time(0.0, when_micros, state.bpi).await
        })
        .await
        .unwrap_or(Err(CompanionError::Timeout("applying tempo state")));

        let slot = this.lock_slot();
        if slot.generation != generation {
            debug!(bpm = state.bpm, "Apply finished after being superseded");
            return;
        }
        match result {
            Ok(()) => {
                info!(bpm = state.bpm, bpi = state.bpi, when_micros, "Locked");
                this.set_status(SchedulerStatus::Locked);
                let _ = this.events.send(SchedulerEvent::Locked {
                    bpm: state.bpm,
                    bpi: state.bpi,
                    boundary_local_ms,
                });
            }
            Err(e) => {
                warn!(bpm = state.bpm, "Failed to apply tempo state: {e}");
                this.set_status(SchedulerStatus::Connected);
                let _ = this.events.send(SchedulerEvent::ApplyFailed {
                    message: e.to_string(),
                });
            }
        }
        drop(slot);
    }
}

fn check_bounds(state: &TempoState) -> Result<(), BoundsError> {
    validation::validate_bpm(state.bpm)?;
    validation::validate_bpi(i64::from(state.bpi))?;
    Ok(())
}

/// Local instant of the bar line nearest to `local_now`.
///
/// Early in a bar (phase at most half the interval) the bar line just
/// passed is the target; later in the bar the upcoming one is.
#[allow(clippy::cast_precision_loss)]
fn boundary_local_ms(local_now: i64, info: &BoundaryInfo) -> f64 {
    let now = local_now as f64;
    if info.phase_ms <= info.interval_ms / 2.0 {
        now - info.phase_ms
    } else {
        now + info.ms_until_boundary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::engine::EngineCommand;

    use super::*;

    /// Local clock that follows tokio's (possibly paused) clock.
    struct TokioClock {
        base_ms: i64,
        start: tokio::time::Instant,
    }

    impl TokioClock {
        fn new(base_ms: i64) -> Self {
            Self {
                base_ms,
                start: tokio::time::Instant::now(),
            }
        }
    }

    impl TimeSource for TokioClock {
        fn now_ms(&self) -> i64 {
            let elapsed = i64::try_from(self.start.elapsed().as_millis()).unwrap();
            self.base_ms + elapsed
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        commands: Mutex<Vec<EngineCommand>>,
        fail: AtomicBool,
        hang: AtomicBool,
    }

    impl RecordingEngine {
        fn commands(&self) -> Vec<EngineCommand> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl TempoEngine for RecordingEngine {
        async fn send_command(&self, command: EngineCommand) -> Result<(), CompanionError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(CompanionError::Engine("engine offline".to_owned()));
            }
            self.commands.lock().unwrap().push(command);
            Ok(())
        }
    }

    const BASE: i64 = 1_000_000;

    fn setup() -> (BoundaryScheduler<RecordingEngine>, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::default());
        let scheduler = BoundaryScheduler::new(
            Arc::clone(&engine),
            Arc::new(TokioClock::new(BASE)),
            ClockOffset::new(),
            SchedulerConfig::default(),
        );
        (scheduler, engine)
    }

    fn connected() -> (BoundaryScheduler<RecordingEngine>, Arc<RecordingEngine>) {
        let (scheduler, engine) = setup();
        scheduler.mark_connecting();
        assert!(scheduler.mark_connected());
        (scheduler, engine)
    }

    /// 120 bpm in 4/4 (2000ms bars) with the next bar line `until_ms` away.
    fn state_with_boundary_in(bpm: f64, until_ms: i64) -> TempoState {
        #[allow(clippy::cast_possible_truncation)]
        let interval = (4.0 * 60_000.0 / bpm) as i64;
        TempoState::new("main", bpm, 4, BASE - (interval - until_ms))
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn far_boundary_arms_then_locks() {
        let (scheduler, engine) = connected();
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 1_000));
        assert_eq!(scheduler.status(), SchedulerStatus::Armed);
        assert!(engine.commands().is_empty());

        settle(900).await;
        assert!(engine.commands().is_empty(), "applied before the boundary");

        settle(200).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Locked);
        let commands = engine.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], EngineCommand::Tempo { bpm: 120.0 });
        assert_eq!(
            commands[1],
            EngineCommand::ForceBeatAtTime {
                beat: 0.0,
                when_micros: (BASE + 1_000) * 1_000,
                quantum: 4,
            }
        );
        assert!(scheduler.pending_state().is_none());
        assert!((scheduler.current_state().unwrap().bpm - 120.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn near_boundary_applies_immediately() {
        let (scheduler, engine) = connected();
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 30));
        assert_ne!(scheduler.status(), SchedulerStatus::Armed);

        settle(1).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Locked);
        let commands = engine.commands();
        assert_eq!(commands[0], EngineCommand::Tempo { bpm: 120.0 });
        // Late in the bar: pinned to the upcoming bar line.
        assert_eq!(
            commands[1],
            EngineCommand::ForceBeatAtTime {
                beat: 0.0,
                when_micros: (BASE + 30) * 1_000,
                quantum: 4,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn newer_state_supersedes_armed_one() {
        let (scheduler, engine) = connected();
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 1_000));
        settle(10).await;
        let second = TempoState::new("main", 130.0, 4, BASE - 1_000);
        scheduler.on_tempo_state(second);
        assert_eq!(scheduler.status(), SchedulerStatus::Armed);

        settle(3_000).await;
        let commands = engine.commands();
        assert_eq!(commands.len(), 2, "only the newer state is applied: {commands:?}");
        assert_eq!(commands[0], EngineCommand::Tempo { bpm: 130.0 });
        let EngineCommand::ForceBeatAtTime { when_micros, .. } = commands[1] else {
            panic!("expected force-beat-at-time, got {:?}", commands[1]);
        };
        // Bar line of the second state: epoch + one 130 bpm bar.
        let expected = (BASE - 1_000) * 1_000 + 1_846_154;
        assert!((when_micros - expected).abs() <= 1, "{when_micros} vs {expected}");
        assert_eq!(scheduler.status(), SchedulerStatus::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_bounds_state_is_ignored() {
        let (scheduler, engine) = connected();
        for state in [
            TempoState::new("main", 0.0, 4, BASE - 100),
            TempoState::new("main", f64::NAN, 4, BASE - 100),
            TempoState::new("main", 1_000.0, 4, BASE - 100),
            TempoState::new("main", 120.0, 0, BASE - 100),
            TempoState::new("main", 120.0, 65, BASE - 100),
        ] {
            scheduler.on_tempo_state(state);
            assert_eq!(scheduler.status(), SchedulerStatus::Connected);
            assert!(!scheduler.has_state());
        }
        settle(5_000).await;
        assert!(engine.commands().is_empty());
        assert_eq!(scheduler.status(), SchedulerStatus::Connected);

        // An armed state survives a bad one arriving after it.
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 1_000));
        scheduler.on_tempo_state(TempoState::new("main", 0.0, 4, BASE));
        assert_eq!(scheduler.status(), SchedulerStatus::Armed);
        assert!((scheduler.pending_state().unwrap().bpm - 120.0).abs() < f64::EPSILON);
        settle(1_100).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Locked);
        assert_eq!(engine.commands()[0], EngineCommand::Tempo { bpm: 120.0 });
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_bounds_state_is_not_deferred() {
        let (scheduler, _engine) = setup();
        scheduler.mark_connecting();
        scheduler.on_tempo_state(TempoState::new("main", 120.0, 0, BASE));
        assert!(!scheduler.has_state());
        assert!(scheduler.mark_connected());
        assert_eq!(scheduler.status(), SchedulerStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_apply_clears_armed_status() {
        let (scheduler, engine) = connected();
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 1_000));
        assert_eq!(scheduler.status(), SchedulerStatus::Armed);

        engine.hang.store(true, Ordering::SeqCst);
        scheduler.on_tempo_state(state_with_boundary_in(130.0, 30));
        assert_eq!(scheduler.status(), SchedulerStatus::Connected);
        assert!(scheduler.pending_state().is_none());

        settle(100).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Connected);
        assert!(scheduler.pending_state().is_none());
        assert!((scheduler.current_state().unwrap().bpm - 130.0).abs() < f64::EPSILON);
        assert!(engine.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn apply_failure_returns_to_connected() {
        let (scheduler, engine) = connected();
        let mut events = scheduler.subscribe_events();
        engine.fail.store(true, Ordering::SeqCst);
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 500));

        settle(600).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Connected);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::ApplyFailed { message } = event {
                assert!(message.contains("engine offline"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);

        // The connection survives: the next state is handled normally.
        engine.fail.store(false, Ordering::SeqCst);
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 1_200));
        assert_eq!(scheduler.status(), SchedulerStatus::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_timeout_returns_to_connected() {
        let (scheduler, engine) = connected();
        let mut events = scheduler.subscribe_events();
        engine.hang.store(true, Ordering::SeqCst);
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 10));

        settle(1_000).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Connected);
        settle(1_500).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Connected);

        let failure = std::iter::from_fn(|| events.try_recv().ok()).find_map(|event| match event {
            SchedulerEvent::ApplyFailed { message } => Some(message),
            _ => None,
        });
        assert_eq!(failure.as_deref(), Some("timed out: applying tempo state"));
        assert!(engine.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_armed_timer() {
        let (scheduler, engine) = connected();
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 1_000));
        assert_eq!(scheduler.status(), SchedulerStatus::Armed);

        scheduler.mark_disconnected();
        assert_eq!(scheduler.status(), SchedulerStatus::Disconnected);
        assert!(scheduler.pending_state().is_none());

        settle(3_000).await;
        assert!(engine.commands().is_empty());
        assert_eq!(scheduler.status(), SchedulerStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn state_received_while_connecting_is_armed_on_connect() {
        let (scheduler, engine) = setup();
        scheduler.mark_connecting();
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 1_500));
        assert_eq!(scheduler.status(), SchedulerStatus::Connecting);
        assert!(scheduler.has_state());

        settle(200).await;
        assert!(scheduler.mark_connected());
        assert_eq!(scheduler.status(), SchedulerStatus::Armed);

        settle(2_000).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Locked);
        assert_eq!(engine.commands().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_connected_requires_connecting() {
        let (scheduler, _engine) = setup();
        assert!(!scheduler.mark_connected());
        scheduler.mark_connecting();
        scheduler.mark_disconnected();
        assert!(!scheduler.mark_connected());
        assert_eq!(scheduler.status(), SchedulerStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn status_changes_are_published() {
        let (scheduler, _engine) = setup();
        let mut status = scheduler.subscribe_status();
        scheduler.mark_connecting();
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), SchedulerStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn local_tempo_proposals_are_debounced() {
        let (scheduler, _engine) = connected();
        assert!(scheduler.observe_local_tempo(128.0));
        // Cooldown not elapsed.
        assert!(!scheduler.observe_local_tempo(129.0));
        settle(1_000).await;
        // Within epsilon of the last proposal.
        assert!(!scheduler.observe_local_tempo(128.05));
        assert!(scheduler.observe_local_tempo(129.0));
    }

    #[tokio::test(start_paused = true)]
    async fn applied_tempo_is_not_echoed_upstream() {
        let (scheduler, _engine) = connected();
        scheduler.on_tempo_state(state_with_boundary_in(140.0, 20));
        settle(5).await;
        assert_eq!(scheduler.status(), SchedulerStatus::Locked);
        // The engine reports back the tempo we just set.
        assert!(!scheduler.observe_local_tempo(140.0));
        assert!(scheduler.observe_local_tempo(141.0));
    }

    #[tokio::test(start_paused = true)]
    async fn boundary_info_tracks_current_state() {
        let (scheduler, _engine) = connected();
        assert!(scheduler.boundary_info().is_none());
        scheduler.on_tempo_state(state_with_boundary_in(120.0, 10));
        settle(1).await;
        let info = scheduler.boundary_info().unwrap();
        assert!((info.interval_ms - 2_000.0).abs() < 1e-9);
        assert!(info.phase_ms >= 0.0 && info.phase_ms < info.interval_ms);
    }

    #[test]
    fn boundary_target_depends_on_phase() {
        let early = BoundaryInfo {
            beat_duration_ms: 500.0,
            interval_ms: 2_000.0,
            phase_ms: 100.0,
            ms_until_boundary: 1_900.0,
            next_boundary_ms: 0.0,
            position: linkjam_types::BarBeat { bar: 0, beat: 0 },
        };
        assert!((boundary_local_ms(10_000, &early) - 9_900.0).abs() < 1e-9);
        let late = BoundaryInfo {
            phase_ms: 1_980.0,
            ms_until_boundary: 20.0,
            ..early
        };
        assert!((boundary_local_ms(10_000, &late) - 10_020.0).abs() < 1e-9);
    }
}
