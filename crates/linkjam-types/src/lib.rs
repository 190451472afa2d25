//! Shared type definitions for LinkJam.
//!
//! This crate is the single source of truth for every type that crosses a
//! process boundary: the authority's room state, the real-time channel
//! envelope, and the companion status reported to displays. Types flow to
//! `TypeScript` via `ts-rs` for browser clients.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers (subscriber connections)
//! - [`tempo`] -- Tempo state, partial updates, derived boundary figures
//! - [`messages`] -- `{type, payload}` channel envelope and its payloads
//! - [`status`] -- Companion scheduler status

pub mod ids;
pub mod messages;
pub mod status;
pub mod tempo;

// Re-export all public types at crate root for convenience.
pub use ids::ConnectionId;
pub use messages::{
    ChannelMessage, DecodeError, ErrorPayload, TempoProposal, TimeSyncPing, TimeSyncPong,
};
pub use status::SchedulerStatus;
pub use tempo::{BarBeat, BoundaryInfo, RoomStateView, TempoPatch, TempoState, TempoUpdate};
