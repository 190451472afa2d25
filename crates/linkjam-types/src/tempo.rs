//! Tempo state records and the partial updates that mutate them.
//!
//! Field names on the wire follow the protocol spoken by existing clients
//! (`roomId`, `epoch_ms`, `updated_by`, `updated_at`), so the serde
//! attributes here are load-bearing.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Canonical tempo state of a single room.
///
/// `epoch_ms` defines phase zero: bar boundaries fall at
/// `epoch_ms + k * interval` for every integer `k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TempoState {
    /// Room key.
    #[serde(rename = "roomId")]
    pub room_id: String,
    /// Beats per minute, within `[20, 999]`.
    pub bpm: f64,
    /// Beats per bar (interval), within `[1, 64]`.
    pub bpi: u32,
    /// Unix milliseconds of phase zero.
    #[ts(type = "number")]
    pub epoch_ms: i64,
    /// Who last changed the state, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    /// Unix milliseconds of the last mutation.
    #[ts(type = "number")]
    pub updated_at: i64,
}

impl TempoState {
    /// Create a state whose epoch and `updated_at` are both `now_ms`.
    pub fn new(room_id: impl Into<String>, bpm: f64, bpi: u32, now_ms: i64) -> Self {
        Self {
            room_id: room_id.into(),
            bpm,
            bpi,
            epoch_ms: now_ms,
            updated_by: None,
            updated_at: now_ms,
        }
    }
}

/// Partial update as received from a client (REST body).
///
/// `bpi` is signed so that a negative value surfaces as a bounds error
/// rather than a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TempoUpdate {
    /// New tempo.
    #[serde(default)]
    pub bpm: Option<f64>,
    /// New beats per bar.
    #[serde(default)]
    #[ts(type = "number | null")]
    pub bpi: Option<i64>,
    /// New phase-zero instant.
    #[serde(default)]
    #[ts(type = "number | null")]
    pub epoch_ms: Option<i64>,
    /// Who is making the change.
    #[serde(default)]
    pub updated_by: Option<String>,
}

/// A validated partial update. Present fields replace, absent fields persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TempoPatch {
    /// New tempo.
    pub bpm: Option<f64>,
    /// New beats per bar.
    pub bpi: Option<u32>,
    /// New phase-zero instant.
    pub epoch_ms: Option<i64>,
    /// Who is making the change.
    pub updated_by: Option<String>,
}

impl TempoPatch {
    /// True if the patch would only refresh `updated_at`.
    pub const fn is_empty(&self) -> bool {
        self.bpm.is_none()
            && self.bpi.is_none()
            && self.epoch_ms.is_none()
            && self.updated_by.is_none()
    }
}

/// Current bar and beat (both zero-based) relative to the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct BarBeat {
    /// Completed bars since the epoch (negative before a future epoch).
    #[ts(type = "number")]
    pub bar: i64,
    /// Beat within the bar, `0..bpi`.
    #[ts(type = "number")]
    pub beat: i64,
}

/// Phase and boundary figures derived from a [`TempoState`] at one instant.
///
/// Never stored; recomputed for every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct BoundaryInfo {
    /// Length of one beat in milliseconds.
    pub beat_duration_ms: f64,
    /// Length of one bar in milliseconds.
    pub interval_ms: f64,
    /// Position inside the current bar, `[0, interval_ms)`.
    pub phase_ms: f64,
    /// Time left until the next bar line.
    pub ms_until_boundary: f64,
    /// Absolute instant of the next bar line, in the same clock as `now`.
    pub next_boundary_ms: f64,
    /// Bar/beat position.
    pub position: BarBeat,
}

/// Response body of the room state endpoint: the stored state plus
/// boundary figures computed at request time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RoomStateView {
    /// The stored state.
    #[serde(flatten)]
    pub state: TempoState,
    /// Authority instant of the next bar line.
    pub next_boundary_ms: f64,
    /// Milliseconds until that bar line.
    pub ms_until_boundary: f64,
    /// Current position.
    pub current_bar_beat: BarBeat,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tempo_state_uses_protocol_field_names() {
        let state = TempoState::new("main", 174.0, 4, 1_000);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["roomId"], "main");
        assert_eq!(json["epoch_ms"], 1_000);
        assert_eq!(json["updated_at"], 1_000);
        assert!(json.get("updated_by").is_none());
    }

    #[test]
    fn tempo_state_accepts_missing_updated_by() {
        let json = r#"{"roomId":"a","bpm":120.5,"bpi":3,"epoch_ms":5,"updated_at":6}"#;
        let state: TempoState = serde_json::from_str(json).unwrap();
        assert_eq!(state.room_id, "a");
        assert_eq!(state.bpi, 3);
        assert!(state.updated_by.is_none());
    }

    #[test]
    fn update_fields_are_all_optional() {
        let update: TempoUpdate = serde_json::from_str("{}").unwrap();
        assert_eq!(update, TempoUpdate::default());

        let update: TempoUpdate = serde_json::from_str(r#"{"bpi":-3}"#).unwrap();
        assert_eq!(update.bpi, Some(-3));
    }

    #[test]
    fn empty_patch() {
        assert!(TempoPatch::default().is_empty());
        let patch = TempoPatch {
            bpi: Some(3),
            ..TempoPatch::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn room_view_flattens_state() {
        let view = RoomStateView {
            state: TempoState::new("r", 120.0, 4, 0),
            next_boundary_ms: 2_000.0,
            ms_until_boundary: 2_000.0,
            current_bar_beat: BarBeat { bar: 0, beat: 0 },
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["roomId"], "r");
        assert_eq!(json["current_bar_beat"]["bar"], 0);
    }
}
