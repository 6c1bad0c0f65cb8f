//! Data layer for the lifecycle engine.
//!
//! Reads and validates the event log, loads the entity directory, indexes
//! per-subject activity, and computes lifecycle states, windowed metrics and
//! funnels over one as-of snapshot.

pub mod acceptance;
pub mod aggregator;
pub mod analysis;
pub mod classifier;
pub mod directory;
pub mod enrich;
pub mod funnel;
pub mod reader;

pub use lifecycle_core as core;
