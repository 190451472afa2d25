//! Shared tempo logic for the LinkJam authority and companion.
//!
//! # Modules
//!
//! - [`boundary`] -- Pure phase, bar-boundary and bar/beat arithmetic.
//! - [`validation`] -- Bounds checks applied before any state mutation.
//! - [`time`] -- Wall-clock sources ([`time::SystemClock`],
//!   [`time::ManualClock`]).
//! - [`config`] -- Configuration loading from `linkjam-config.yaml` into
//!   strongly-typed structs.

pub mod boundary;
pub mod config;
pub mod time;
pub mod validation;
