//! Snapshot store for the MachineMon alert engine.
//!
//! Metrics, process snapshots and check snapshots are append-only series keyed
//! by client. The store answers "what is the latest row" and "what was the row
//! before that" per key, and holds the mutable client, mute, provider and
//! settings state. The default implementation ([`SqliteStore`]) keeps
//! everything in a single WAL-mode SQLite database.

pub mod error;
pub mod sqlite;


pub use error::{Result, StorageError};
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use machinemon_common::types::{
    Alert, AlertProvider, AlertType, CheckInRequest, CheckPayload, CheckSnapshot, Client,
    ClientAlertMute, ClientThresholdOverrides, ClientWithMetrics, Metric, MetricsPayload,
    MuteScope, ProcessPayload, ProcessSnapshot, Severity, WatchedProcess,
};
use std::collections::HashMap;

/// Outcome of recording a check-in against the clients table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUpsert {
    pub client_id: String,
    /// The client was marked offline before this check-in.
    pub was_offline: bool,
    /// The client reported a non-empty session id that differs from the stored one.
    pub session_changed: bool,
}

/// Optional filters for [`SnapshotStore::list_alerts`].
///
/// # Examples
///
/// ```
/// use machinemon_storage::AlertFilter;
/// use machinemon_common::types::Severity;
///
/// let filter = AlertFilter {
///     client_id: Some("1234".into()),
///     severity: Some(Severity::Critical),
/// };
/// assert!(filter.client_id.is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub client_id: Option<String>,
    pub severity: Option<Severity>,
}

/// Row counts removed by a retention prune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub metrics: u64,
    pub process_snapshots: u64,
    pub check_snapshots: u64,
    pub alerts: u64,
}

impl PruneStats {
    pub fn total(&self) -> u64 {
        self.metrics + self.process_snapshots + self.check_snapshots + self.alerts
    }
}

/// Persistence backend for clients, time series, alerts, providers and settings.
///
/// Implementations must be safe to share across threads (`Send + Sync`)
/// because check-in handlers and the alert engine loop call it concurrently.
/// Any read-then-write (snapshot insert plus previous-state lookup) runs in a
/// single transaction.
pub trait SnapshotStore: Send + Sync {
    // ---- Clients ----

    /// Creates or updates the client named by a check-in. A missing, empty or
    /// unknown `client_id` creates a new client with a fresh id.
    fn upsert_client(&self, req: &CheckInRequest) -> Result<ClientUpsert>;

    fn get_client(&self, id: &str) -> Result<Option<Client>>;

    /// Non-deleted clients ordered by display name, each with its latest metric.
    fn list_clients(&self) -> Result<Vec<ClientWithMetrics>>;

    /// Logically deletes a client. Returns false if no such client exists.
    fn delete_client(&self, id: &str) -> Result<bool>;

    fn set_client_online(&self, id: &str, online: bool) -> Result<()>;

    /// Replaces every threshold override. `None` clears all of them.
    fn set_client_thresholds(
        &self,
        id: &str,
        overrides: Option<&ClientThresholdOverrides>,
    ) -> Result<()>;

    fn set_client_custom_name(&self, id: &str, name: &str) -> Result<()>;

    /// Sets the global mute for a client. `until = None` mutes indefinitely.
    fn set_client_mute(
        &self,
        id: &str,
        muted: bool,
        until: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> Result<()>;

    /// Online, non-deleted clients whose last check-in is at least their
    /// effective offline threshold in the past. The comparison is made against
    /// the database clock; `default_threshold_secs` applies to clients without
    /// an override.
    fn get_stale_online_clients(&self, default_threshold_secs: i64) -> Result<Vec<Client>>;

    // ---- Scoped mutes ----

    fn list_client_alert_mutes(&self, client_id: &str) -> Result<Vec<ClientAlertMute>>;

    /// Idempotently adds (`muted = true`) or removes a scoped mute rule.
    /// Metric scopes require an empty target; process and check scopes require
    /// a non-empty one. Invalid rules are rejected before any write.
    fn set_client_alert_mute(
        &self,
        client_id: &str,
        scope: MuteScope,
        target: &str,
        muted: bool,
    ) -> Result<()>;

    // ---- Metrics ----

    fn insert_metrics(&self, client_id: &str, payload: &MetricsPayload) -> Result<()>;

    fn get_latest_metrics(&self, client_id: &str) -> Result<Option<Metric>>;

    /// Samples in `[from, to]`, oldest first.
    fn get_metrics(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Metric>>;

    /// The `n` most recent samples, newest first.
    fn get_recent_metrics(&self, client_id: &str, n: usize) -> Result<Vec<Metric>>;

    // ---- Watched processes and snapshots ----

    /// Replaces the client's watched set. Processes no longer declared are
    /// deleted together with their snapshot history.
    fn upsert_watched_processes(&self, client_id: &str, defs: &[ProcessPayload]) -> Result<()>;

    fn get_watched_processes(&self, client_id: &str) -> Result<Vec<WatchedProcess>>;

    /// Removes one watched process and its snapshot history.
    fn delete_watched_process(&self, client_id: &str, friendly_name: &str) -> Result<bool>;

    fn insert_process_snapshots(&self, client_id: &str, procs: &[ProcessPayload]) -> Result<()>;

    /// Newest snapshot per currently-watched process.
    fn get_latest_process_snapshots(&self, client_id: &str) -> Result<Vec<ProcessSnapshot>>;

    /// Newest snapshot per watched process among rows older than the client's
    /// most recent report.
    fn get_previous_process_snapshots(&self, client_id: &str) -> Result<Vec<ProcessSnapshot>>;

    fn insert_check_snapshots(&self, client_id: &str, checks: &[CheckPayload]) -> Result<()>;

    fn get_latest_check_snapshots(&self, client_id: &str) -> Result<Vec<CheckSnapshot>>;

    fn get_previous_check_snapshots(&self, client_id: &str) -> Result<Vec<CheckSnapshot>>;

    /// Deletes a check's history. `check_type = None` removes every type
    /// sharing the friendly name. Returns the number of rows removed.
    fn delete_check_snapshots(
        &self,
        client_id: &str,
        friendly_name: &str,
        check_type: Option<&str>,
    ) -> Result<usize>;

    // ---- Alerts ----

    /// Persists an alert and returns its assigned id.
    fn insert_alert(&self, alert: &Alert) -> Result<i64>;

    fn mark_alert_notified(&self, id: i64) -> Result<()>;

    fn get_unnotified_alerts(&self, limit: usize) -> Result<Vec<Alert>>;

    /// Newest-first page of alerts plus the total matching count.
    fn list_alerts(
        &self,
        filter: &AlertFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Alert>, u64)>;

    /// Most recently fired alert for the client whose type is one of `types`.
    fn get_last_alert_by_types(
        &self,
        client_id: &str,
        types: &[AlertType],
    ) -> Result<Option<Alert>>;

    /// Highest snapshot id any alert of `types` was evaluated from.
    fn get_last_alerted_snapshot(
        &self,
        client_id: &str,
        types: &[AlertType],
    ) -> Result<Option<i64>>;

    // ---- Providers ----

    fn list_providers(&self) -> Result<Vec<AlertProvider>>;

    fn get_provider(&self, id: i64) -> Result<Option<AlertProvider>>;

    fn create_provider(
        &self,
        provider_type: &str,
        name: &str,
        enabled: bool,
        config: &str,
    ) -> Result<AlertProvider>;

    /// Updates name, enabled flag and config. Returns false if the id is unknown.
    fn update_provider(&self, id: i64, name: &str, enabled: bool, config: &str) -> Result<bool>;

    fn delete_provider(&self, id: i64) -> Result<bool>;

    fn get_enabled_providers(&self) -> Result<Vec<AlertProvider>>;

    // ---- Settings ----

    fn get_setting(&self, key: &str) -> Result<Option<String>>;

    fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    fn get_all_settings(&self) -> Result<HashMap<String, String>>;

    // ---- Maintenance ----

    /// Deletes metric, process and check rows older than `metrics_retention_days`
    /// and alerts older than `alerts_retention_days`.
    fn prune_old_data(
        &self,
        metrics_retention_days: u32,
        alerts_retention_days: u32,
    ) -> Result<PruneStats>;
}
