//! Bar boundary and phase arithmetic.
//!
//! Pure functions over a [`TempoState`] and an instant expressed in the
//! authority's clock. Both the authority (REST enrichment) and the companion
//! (scheduling) evaluate boundaries through this module so the two sides can
//! never disagree on where a bar line falls.
//!
//! # Conventions
//!
//! - Instants are Unix milliseconds as `i64`; durations are `f64` ms.
//! - `bpm` and `bpi` are assumed validated (see [`crate::validation`]).
//! - Epochs later than `now` are legal. Phase is normalized with a Euclidean
//!   modulo, so it stays in `[0, interval)` and bar numbers go negative
//!   instead of the phase.

use linkjam_types::{BarBeat, BoundaryInfo, TempoState};

/// Milliseconds per minute.
const MS_PER_MINUTE: f64 = 60_000.0;

/// Remainder of `value / modulus` mapped into `[0, modulus)`.
///
/// Unlike `%`, the result is never negative for a negative `value`.
/// `modulus` must be positive.
pub fn normalize_mod(value: f64, modulus: f64) -> f64 {
    let r = value.rem_euclid(modulus);
    // rem_euclid can round up to exactly `modulus` for tiny negative inputs.
    if r >= modulus { 0.0 } else { r }
}

/// Length of one beat in milliseconds.
pub fn beat_duration_ms(bpm: f64) -> f64 {
    MS_PER_MINUTE / bpm
}

/// Length of one bar (`bpi` beats) in milliseconds.
pub fn interval_ms(bpm: f64, bpi: u32) -> f64 {
    f64::from(bpi) * beat_duration_ms(bpm)
}

/// Milliseconds elapsed since the epoch (negative before a future epoch).
#[allow(clippy::cast_precision_loss)]
fn elapsed_ms(state: &TempoState, now_ms: i64) -> f64 {
    now_ms.saturating_sub(state.epoch_ms) as f64
}

/// Position inside the current bar, in `[0, interval)`.
pub fn phase_ms(state: &TempoState, now_ms: i64) -> f64 {
    normalize_mod(elapsed_ms(state, now_ms), interval_ms(state.bpm, state.bpi))
}

/// Time remaining until the next bar line, in `(0, interval]`.
pub fn ms_until_boundary(state: &TempoState, now_ms: i64) -> f64 {
    interval_ms(state.bpm, state.bpi) - phase_ms(state, now_ms)
}

/// Absolute instant of the next bar line.
#[allow(clippy::cast_precision_loss)]
pub fn next_boundary_ms(state: &TempoState, now_ms: i64) -> f64 {
    now_ms as f64 + ms_until_boundary(state, now_ms)
}

/// Zero-based bar and beat at `now_ms`.
///
/// `total_beats = floor(elapsed / beat)`; bar and beat are its Euclidean
/// quotient and remainder by `bpi`.
#[allow(clippy::cast_possible_truncation)]
pub fn bar_beat(state: &TempoState, now_ms: i64) -> BarBeat {
    let total_beats = (elapsed_ms(state, now_ms) / beat_duration_ms(state.bpm)).floor() as i64;
    let bpi = i64::from(state.bpi.max(1));
    BarBeat {
        bar: total_beats.div_euclid(bpi),
        beat: total_beats.rem_euclid(bpi),
    }
}

/// Evaluate every boundary figure for `state` at `now_ms` in one pass.
#[allow(clippy::cast_precision_loss)]
pub fn compute(state: &TempoState, now_ms: i64) -> BoundaryInfo {
    let beat = beat_duration_ms(state.bpm);
    let interval = interval_ms(state.bpm, state.bpi);
    let phase = normalize_mod(elapsed_ms(state, now_ms), interval);
    let until = interval - phase;
    BoundaryInfo {
        beat_duration_ms: beat,
        interval_ms: interval,
        phase_ms: phase,
        ms_until_boundary: until,
        next_boundary_ms: now_ms as f64 + until,
        position: bar_beat(state, now_ms),
    }
}
