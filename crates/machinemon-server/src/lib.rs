//! MachineMon server core: configuration, logging setup, check-in ingestion
//! and provider administration around the alert engine.

pub mod config;
pub mod ingest;
pub mod logging;
pub mod providers;

#[cfg(test)]
mod tests;
