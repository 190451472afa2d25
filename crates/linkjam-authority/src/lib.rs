//! Tempo authority for LinkJam rooms.
//!
//! This crate provides an Axum HTTP server that exposes:
//!
//! - **Room channel** (`/ws/{room_id}`): pushes the room's `tempo_state`
//!   on connect and after every change, accepts tempo proposals, and
//!   answers clock sync pings.
//! - **REST endpoints** for reading and updating room state, listing
//!   rooms, reading the authority clock, and health checks.
//!
//! # Architecture
//!
//! [`rooms::RoomRegistry`] is the single source of truth for tempo state
//! and [`fanout::FanoutHub`] owns every live connection. [`AppState`]
//! couples the two so that each update is stored and broadcast as one
//! step. A background sweep pings every connection on a fixed period and
//! drops those that stop answering.

pub mod error;
pub mod fanout;
pub mod handlers;
pub mod rooms;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

pub use router::build_router;
pub use server::{ServerError, serve, start_server};
pub use state::AppState;
