//! Alert engine for MachineMon.
//!
//! Evaluates each client check-in against the stored history (metric
//! thresholds with hysteresis, process and check transitions), sweeps for
//! clients that stopped checking in, and prunes old rows. Every transition
//! becomes an [`machinemon_common::types::Alert`] that is persisted and then
//! handed to the [`machinemon_notify::Dispatcher`].

pub mod engine;
pub mod error;
pub mod evaluate;
pub mod thresholds;

#[cfg(test)]
mod tests;

pub use engine::{start, AlertEngine, EngineConfig, EngineHandle};
pub use error::{AlertError, Result};
