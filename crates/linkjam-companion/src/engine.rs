//! Bridge to the local tempo engine.
//!
//! The engine is an external process listening on a loopback TCP port. It
//! takes newline-terminated text commands and emits one status line per
//! change. Status lines are either JSON objects (`{"bpm":120.0,"peers":2}`)
//! or the engine's native keyword form
//! (`status { :peers 2 :bpm 120.000000 :start 73743731220 :beat 597.4 }`);
//! both are accepted.
//!
//! [`TempoEngine`] is the seam the scheduler drives; [`LineEngineBridge`]
//! is the production implementation.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use linkjam_core::config::EngineConfig;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CompanionError;

// ---------------------------------------------------------------------------
// Commands and events
// ---------------------------------------------------------------------------

/// A command line understood by the tempo engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// `bpm <tempo>`
    Tempo {
        /// New tempo.
        bpm: f64,
    },
    /// `force-beat-at-time <beat> <when_micros> <quantum>`: move the
    /// timeline so `beat` lands exactly at `when_micros`.
    ForceBeatAtTime {
        /// Beat number to place.
        beat: f64,
        /// Local time in Unix microseconds.
        when_micros: i64,
        /// Beats per bar.
        quantum: u32,
    },
    /// `beat-at-time <beat> <when_micros> <quantum>`: like
    /// [`Self::ForceBeatAtTime`] but lets the engine nudge gradually.
    BeatAtTime {
        /// Beat number to place.
        beat: f64,
        /// Local time in Unix microseconds.
        when_micros: i64,
        /// Beats per bar.
        quantum: u32,
    },
    /// `enable-start-stop-sync`
    EnableStartStopSync,
    /// `disable-start-stop-sync`
    DisableStartStopSync,
    /// `status`: ask the engine to report its current state.
    Status,
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tempo { bpm } => write!(f, "bpm {bpm}"),
            Self::ForceBeatAtTime {
                beat,
                when_micros,
                quantum,
            } => write!(f, "force-beat-at-time {beat} {when_micros} {quantum}"),
            Self::BeatAtTime {
                beat,
                when_micros,
                quantum,
            } => write!(f, "beat-at-time {beat} {when_micros} {quantum}"),
            Self::EnableStartStopSync => f.write_str("enable-start-stop-sync"),
            Self::DisableStartStopSync => f.write_str("disable-start-stop-sync"),
            Self::Status => f.write_str("status"),
        }
    }
}

/// A change reported by the tempo engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// The local tempo changed (possibly by another app on the machine).
    TempoChanged(f64),
    /// The number of peers on the local session changed.
    PeersChanged(u32),
}

/// A status line that could not be interpreted.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized engine line: {line}")]
pub struct EngineLineError {
    /// The offending line.
    pub line: String,
}

#[derive(Deserialize)]
struct JsonStatus {
    bpm: Option<f64>,
    peers: Option<u32>,
}

impl EngineEvent {
    /// Decode one status line into zero or more events.
    ///
    /// `bpm` and `peers` are independent; a line may carry either, both or
    /// neither.
    pub fn parse_line(line: &str) -> Result<Vec<Self>, EngineLineError> {
        let line = line.trim();
        if let Ok(status) = serde_json::from_str::<JsonStatus>(line) {
            let mut events = Vec::with_capacity(2);
            if let Some(bpm) = status.bpm.filter(|bpm| bpm.is_finite()) {
                events.push(Self::TempoChanged(bpm));
            }
            if let Some(peers) = status.peers {
                events.push(Self::PeersChanged(peers));
            }
            return Ok(events);
        }
        parse_keyword_line(line).ok_or_else(|| EngineLineError {
            line: line.to_owned(),
        })
    }
}

/// `name { :key value :key value }`
fn parse_keyword_line(line: &str) -> Option<Vec<EngineEvent>> {
    let (name, rest) = line.split_once('{')?;
    if name.trim().is_empty() {
        return None;
    }
    let body = rest.trim_end().strip_suffix('}')?;
    let mut tokens = body.split_whitespace();
    let mut events = Vec::with_capacity(2);
    while let Some(token) = tokens.next() {
        let Some(key) = token.strip_prefix(':') else {
            continue;
        };
        let Some(value) = tokens.next() else {
            break;
        };
        match key {
            "bpm" => {
                // `nan` and `inf` parse as f64 but are not tempos.
                if let Some(bpm) = value.parse::<f64>().ok().filter(|bpm| bpm.is_finite()) {
                    events.push(EngineEvent::TempoChanged(bpm));
                }
            }
            "peers" => {
                if let Ok(peers) = value.parse() {
                    events.push(EngineEvent::PeersChanged(peers));
                }
            }
            _ => {}
        }
    }
    Some(events)
}

// ---------------------------------------------------------------------------
// TempoEngine
// ---------------------------------------------------------------------------

/// The operations the scheduler needs from a tempo engine.
pub trait TempoEngine: Send + Sync + 'static {
    /// Deliver one command.
    fn send_command(
        &self,
        command: EngineCommand,
    ) -> impl Future<Output = Result<(), CompanionError>> + Send;

    /// Set the local tempo.
    fn set_tempo(&self, bpm: f64) -> impl Future<Output = Result<(), CompanionError>> + Send {
        self.send_command(EngineCommand::Tempo { bpm })
    }

    /// Hard-align `beat` to the local instant `when_micros`.
    fn force_beat_at_time(
        &self,
        beat: f64,
        when_micros: i64,
        quantum: u32,
    ) -> impl Future<Output = Result<(), CompanionError>> + Send {
        self.send_command(EngineCommand::ForceBeatAtTime {
            beat,
            when_micros,
            quantum,
        })
    }

    /// Softly align `beat` to the local instant `when_micros`.
    fn beat_at_time(
        &self,
        beat: f64,
        when_micros: i64,
        quantum: u32,
    ) -> impl Future<Output = Result<(), CompanionError>> + Send {
        self.send_command(EngineCommand::BeatAtTime {
            beat,
            when_micros,
            quantum,
        })
    }

    /// Toggle start/stop sync with other engine peers.
    fn set_start_stop_sync(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), CompanionError>> + Send {
        self.send_command(if enabled {
            EngineCommand::EnableStartStopSync
        } else {
            EngineCommand::DisableStartStopSync
        })
    }
}

// ---------------------------------------------------------------------------
// LineEngineBridge
// ---------------------------------------------------------------------------

/// TCP client for the tempo engine's line protocol.
///
/// Commands are written under a single writer lock so lines never
/// interleave. A background task reads status lines and forwards decoded
/// [`EngineEvent`]s on the channel returned by [`Self::new`].
pub struct LineEngineBridge {
    config: EngineConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl LineEngineBridge {
    /// Create a disconnected bridge and the receiver for its events.
    pub fn new(config: EngineConfig) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            config,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            events,
        };
        (bridge, rx)
    }

    /// Connect to the engine, retrying a bounded number of times.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Engine`] once every attempt has failed.
    pub async fn start(&self) -> Result<(), CompanionError> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match TcpStream::connect(&self.config.addr).await {
                Ok(stream) => {
                    self.install(stream).await;
                    info!(addr = %self.config.addr, attempt, "Tempo engine connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(addr = %self.config.addr, attempt, attempts, "Tempo engine connect failed: {e}");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }
        Err(CompanionError::Engine(format!(
            "could not reach tempo engine at {} after {attempts} attempts: {last_error}",
            self.config.addr
        )))
    }

    async fn install(&self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let task = tokio::spawn(read_loop(read_half, self.events.clone()));
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        *self.writer.lock().await = Some(write_half);
    }

    /// Disconnect from the engine.
    pub async fn stop(&self) {
        if let Some(task) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        info!("Tempo engine disconnected");
    }

    /// True if a connection is open.
    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Query the engine with a `status` request.
    pub async fn health_check(&self) -> bool {
        self.send_command(EngineCommand::Status).await.is_ok()
    }
}

impl TempoEngine for LineEngineBridge {
    async fn send_command(&self, command: EngineCommand) -> Result<(), CompanionError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(CompanionError::Engine("not connected".to_owned()));
        };
        let line = format!("{command}\n");
        debug!(command = %command, "Engine command");
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            *guard = None;
            return Err(CompanionError::Engine(format!("write failed: {e}")));
        }
        Ok(())
    }
}

async fn read_loop(read_half: OwnedReadHalf, events: mpsc::UnboundedSender<EngineEvent>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match EngineEvent::parse_line(&line) {
                    Ok(decoded) => {
                        for event in decoded {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => debug!("Skipping engine line: {e}"),
                }
            }
            Ok(None) => {
                info!("Tempo engine closed the connection");
                return;
            }
            Err(e) => {
                warn!("Tempo engine read error: {e}");
                return;
            }
        }
    }
}
