//! DJ-side companion for LinkJam.
//!
//! The companion keeps a local tempo engine aligned with a room on the
//! tempo authority. It estimates the offset between the local clock and
//! the authority's, and applies every tempo change exactly at the next bar
//! line. Local tempo changes made on the engine are proposed back to the
//! room.
//!
//! # Architecture
//!
//! ```text
//! authority --tempo_state--> AuthorityClient --> BoundaryScheduler --> TempoEngine
//!     ^                            |                                        |
//!     +------tempo_proposal--------+<--------- Coordinator <---TempoChanged-+
//! ```
//!
//! - [`authority`] -- Room channel client and REST state fetch
//! - [`clock_sync`] -- Round-trip offset estimation
//! - [`scheduler`] -- Bar-boundary state machine
//! - [`engine`] -- Line protocol bridge to the local tempo engine
//! - [`coordinator`] -- Connect/disconnect and event plumbing

pub mod authority;
pub mod clock_sync;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod scheduler;

pub use coordinator::Coordinator;
pub use error::CompanionError;
pub use scheduler::{BoundaryScheduler, SchedulerEvent};
