//! Multi-level memoization cache for expensive derivation work.
//!
//! See [`cache`] for the subsystem itself; [`config`] and [`telemetry`]
//! carry the settings and observability wiring used by the `tiercache`
//! binary.

pub mod cache;
pub mod config;
pub mod telemetry;
