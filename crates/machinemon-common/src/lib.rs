//! Domain types shared by the MachineMon server crates.
//!
//! Everything the store persists and the alert engine evaluates is defined
//! here: clients and their overrides, append-only metric and snapshot rows,
//! fired alerts, provider rows and scoped mute rules.

pub mod id;
pub mod types;
