use chrono::Utc;
use machinemon_alert::EngineHandle;
use machinemon_common::types::{CheckInRequest, CheckInResponse};
use machinemon_storage::{SnapshotStore, StorageError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The request is unusable; nothing was stored.
    #[error("Ingest: hostname is required")]
    MissingHostname,

    #[error("Ingest: {0}")]
    Storage(#[from] StorageError),
}

/// Persists check-ins and signals the alert engine. This is the seam the
/// HTTP check-in handler calls once per request.
#[derive(Clone)]
pub struct CheckInService {
    store: Arc<dyn SnapshotStore>,
    engine: EngineHandle,
    checkin_interval_secs: u64,
}

impl CheckInService {
    pub fn new(store: Arc<dyn SnapshotStore>, engine: EngineHandle, checkin_interval_secs: u64) -> Self {
        Self {
            store,
            engine,
            checkin_interval_secs,
        }
    }

    /// Stores one check-in and queues its evaluation.
    ///
    /// Only the client upsert is fatal. Metric and snapshot writes that fail
    /// afterwards are logged; the engine then evaluates whatever was stored.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn record_check_in(&self, req: &CheckInRequest) -> Result<CheckInResponse, IngestError> {
        if req.hostname.trim().is_empty() {
            return Err(IngestError::MissingHostname);
        }
        let upsert = self.store.upsert_client(req)?;
        let client_id = upsert.client_id.as_str();

        if let Err(e) = self.store.insert_metrics(client_id, &req.metrics) {
            tracing::error!(client_id, error = %e, "Failed to store metrics");
        }
        if let Err(e) = self.store.upsert_watched_processes(client_id, &req.processes) {
            tracing::error!(client_id, error = %e, "Failed to update watched processes");
        }
        if !req.processes.is_empty() {
            if let Err(e) = self.store.insert_process_snapshots(client_id, &req.processes) {
                tracing::error!(client_id, error = %e, "Failed to store process snapshots");
            }
        }
        if !req.checks.is_empty() {
            if let Err(e) = self.store.insert_check_snapshots(client_id, &req.checks) {
                tracing::error!(client_id, error = %e, "Failed to store check snapshots");
            }
        }

        if upsert.was_offline {
            tracing::info!(client_id, hostname = %req.hostname, "Client back online");
        }
        self.engine.notify_check_in(client_id);
        if upsert.session_changed {
            tracing::info!(client_id, hostname = %req.hostname, "Client session changed");
            let label = self
                .store
                .get_client(client_id)
                .ok()
                .flatten()
                .map(|c| c.display_name().to_string())
                .unwrap_or_else(|| req.hostname.clone());
            self.engine.notify_restart(client_id, &label);
        }

        Ok(CheckInResponse {
            client_id: upsert.client_id,
            next_checkin_seconds: self.checkin_interval_secs,
            server_time: Utc::now(),
        })
    }
}
