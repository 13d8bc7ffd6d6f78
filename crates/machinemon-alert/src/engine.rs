use crate::error::{AlertError, Result};
use crate::evaluate::{self, Transition};
use crate::thresholds;
use chrono::Utc;
use machinemon_common::types::{Alert, AlertType, MetricKind, MuteScope, TestAlertResult};
use machinemon_notify::Dispatcher;
use machinemon_storage::{PruneStats, SnapshotStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Scheduling parameters of the background loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub offline_sweep_interval: Duration,
    pub retention_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            offline_sweep_interval: Duration::from_secs(30),
            retention_sweep_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Turns stored check-in history into alerts.
///
/// The engine keeps no per-client state: every evaluation re-reads the two
/// most recent reports and the last alert of each family from the store, so
/// restarting it never loses or repeats a transition.
pub struct AlertEngine {
    store: Arc<dyn SnapshotStore>,
    dispatcher: Dispatcher,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn SnapshotStore>, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    fn settings(&self) -> HashMap<String, String> {
        self.store.get_all_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load settings, using defaults");
            HashMap::new()
        })
    }

    /// Evaluates the client's latest check-in and fires whatever changed.
    /// Returns the alerts fired, in order.
    pub async fn evaluate_check_in(&self, client_id: &str) -> Result<Vec<Alert>> {
        let client = self
            .store
            .get_client(client_id)?
            .ok_or_else(|| AlertError::ClientNotFound(client_id.to_string()))?;

        if client.alerts_muted {
            match client.muted_until {
                Some(until) if until <= Utc::now() => {
                    tracing::info!(client_id, "Client mute expired, unmuting");
                    if let Err(e) = self.store.set_client_mute(client_id, false, None, None) {
                        tracing::warn!(client_id, error = %e, "Failed to clear expired mute");
                    }
                }
                _ => {
                    tracing::debug!(client_id, "Alerts muted, skipping evaluation");
                    return Ok(Vec::new());
                }
            }
        }

        let label = client.display_name().to_string();
        let mut fired = Vec::new();

        let last_presence = self
            .store
            .get_last_alert_by_types(client_id, &[AlertType::Offline, AlertType::Online])?;
        if last_presence.is_some_and(|a| a.alert_type == AlertType::Offline) {
            fired.push(self.fire(client_id, evaluate::online(&label), None).await?);
        }

        let mutes = Mutes::load(self.store.as_ref(), client_id);

        let settings = self.settings();
        let t = thresholds::resolve(&client, &settings);
        let recent = self
            .store
            .get_recent_metrics(client_id, t.consecutive_checkins as usize)?;
        if !recent.is_empty() {
            for kind in MetricKind::ALL {
                if mutes.scope(kind.mute_scope()) {
                    continue;
                }
                let samples: Vec<f64> = recent.iter().map(|m| m.percent(kind)).collect();
                let last = self
                    .store
                    .get_last_alert_by_types(client_id, &AlertType::metric_family(kind))?
                    .map(|a| a.alert_type);
                if let Some(tr) = evaluate::evaluate_metric(
                    kind,
                    &samples,
                    t.pair(kind),
                    t.consecutive_checkins,
                    last,
                    &label,
                ) {
                    fired.push(self.fire(client_id, tr, None).await?);
                }
            }
        }

        let current = self.store.get_latest_process_snapshots(client_id)?;
        let newest = current.iter().map(|p| p.id).max();
        if !self.already_evaluated(
            client_id,
            &[AlertType::ProcessDied, AlertType::PidChange],
            newest,
        )? {
            let previous = self.store.get_previous_process_snapshots(client_id)?;
            let muted = mutes.targets(MuteScope::Process);
            for tr in evaluate::process_transitions(&current, &previous, &muted, &label) {
                fired.push(self.fire(client_id, tr, newest).await?);
            }
        }

        let current = self.store.get_latest_check_snapshots(client_id)?;
        let newest = current.iter().map(|c| c.id).max();
        if !self.already_evaluated(
            client_id,
            &[AlertType::CheckFailed, AlertType::CheckRecovered],
            newest,
        )? {
            let previous = self.store.get_previous_check_snapshots(client_id)?;
            let muted = mutes.targets(MuteScope::Check);
            for tr in evaluate::check_transitions(&current, &previous, &muted, &label) {
                fired.push(self.fire(client_id, tr, newest).await?);
            }
        }

        Ok(fired)
    }

    /// True when the latest report has already been alerted on: some alert of
    /// `types` was evaluated from a snapshot at least as new as `newest`, or
    /// there is no report at all. Snapshot ids only grow, so a report stored
    /// while an earlier one is still dispatching is never mistaken for it.
    fn already_evaluated(
        &self,
        client_id: &str,
        types: &[AlertType],
        newest: Option<i64>,
    ) -> Result<bool> {
        let Some(newest) = newest else {
            return Ok(true);
        };
        Ok(self
            .store
            .get_last_alerted_snapshot(client_id, types)?
            .is_some_and(|seen| seen >= newest))
    }

    /// Fires `client_restarted`. Every call fires; there is no comparison
    /// with earlier alerts.
    pub async fn fire_restart(&self, client_id: &str, label: &str) -> Result<Alert> {
        self.fire(client_id, evaluate::restarted(label), None).await
    }

    /// Marks silent clients offline and fires `offline` for each.
    pub async fn sweep_offline(&self) -> Result<Vec<Alert>> {
        let default_secs = thresholds::offline_threshold_secs(&self.settings());
        let stale = self.store.get_stale_online_clients(default_secs)?;

        let mut fired = Vec::new();
        for client in stale {
            let secs = thresholds::client_offline_threshold_secs(&client, default_secs);
            tracing::warn!(
                client_id = %client.id,
                hostname = %client.hostname,
                last_seen = %client.last_seen_at,
                threshold_secs = secs,
                "Client went offline"
            );
            if let Err(e) = self.store.set_client_online(&client.id, false) {
                tracing::error!(client_id = %client.id, error = %e, "Failed to mark client offline");
                continue;
            }
            match self
                .fire(&client.id, evaluate::offline(client.display_name(), secs), None)
                .await
            {
                Ok(alert) => fired.push(alert),
                Err(e) => tracing::error!(client_id = %client.id, error = %e, "Offline alert failed"),
            }
        }
        Ok(fired)
    }

    /// Deletes rows older than the configured retention windows.
    pub fn sweep_retention(&self) -> Result<PruneStats> {
        let (metrics_days, alerts_days) = thresholds::retention_days(&self.settings());
        let stats = self.store.prune_old_data(metrics_days, alerts_days)?;
        if stats.total() > 0 {
            tracing::info!(
                metrics = stats.metrics,
                process_snapshots = stats.process_snapshots,
                check_snapshots = stats.check_snapshots,
                alerts = stats.alerts,
                metrics_retention_days = metrics_days,
                alerts_retention_days = alerts_days,
                "Pruned old data"
            );
        }
        Ok(stats)
    }

    /// Persists, logs and dispatches one alert. A persist failure is returned
    /// and nothing is sent; a dispatch failure is logged and leaves the alert
    /// un-notified.
    async fn fire(
        &self,
        client_id: &str,
        tr: Transition,
        snapshot_id: Option<i64>,
    ) -> Result<Alert> {
        let mut alert = Alert::new(client_id, tr.alert_type, tr.severity, tr.message);
        alert.snapshot_id = snapshot_id;
        alert.id = match self.store.insert_alert(&alert) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(client_id, alert_type = %alert.alert_type, error = %e, "Failed to insert alert");
                return Err(e.into());
            }
        };

        tracing::info!(
            client_id,
            alert_id = alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            message = %alert.message,
            "Alert fired"
        );

        if let Err(e) = self.dispatcher.dispatch(&alert).await {
            tracing::error!(alert_id = alert.id, error = %e, "Failed to dispatch alert");
        }
        Ok(alert)
    }

    async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<String>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) {
        tracing::info!(
            queue_capacity = config.queue_capacity,
            offline_sweep_secs = config.offline_sweep_interval.as_secs(),
            retention_sweep_secs = config.retention_sweep_interval.as_secs(),
            "Alert engine started"
        );

        let mut offline_tick = interval_at(
            Instant::now() + config.offline_sweep_interval,
            config.offline_sweep_interval,
        );
        offline_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately: prune once at startup.
        let mut retention_tick = interval(config.retention_sweep_interval);
        retention_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Alert engine stopped");
                    break;
                }
                Some(client_id) = queue.recv() => {
                    if let Err(e) = self.evaluate_check_in(&client_id).await {
                        tracing::error!(client_id = %client_id, error = %e, "Check-in evaluation failed");
                    }
                }
                _ = offline_tick.tick() => {
                    if let Err(e) = self.sweep_offline().await {
                        tracing::error!(error = %e, "Offline sweep failed");
                    }
                }
                _ = retention_tick.tick() => {
                    if let Err(e) = self.sweep_retention() {
                        tracing::error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
    }
}

/// Scoped mute rules of one client, loaded once per evaluation.
struct Mutes(Vec<(MuteScope, String)>);

impl Mutes {
    /// A load failure yields no mutes: alerting errs toward firing.
    fn load(store: &dyn SnapshotStore, client_id: &str) -> Self {
        match store.list_client_alert_mutes(client_id) {
            Ok(rows) => Self(rows.into_iter().map(|m| (m.scope, m.target)).collect()),
            Err(e) => {
                tracing::warn!(client_id, error = %e, "Failed to load alert mutes, evaluating unmuted");
                Self(Vec::new())
            }
        }
    }

    fn scope(&self, scope: MuteScope) -> bool {
        self.0.iter().any(|(s, _)| *s == scope)
    }

    fn targets(&self, scope: MuteScope) -> HashSet<String> {
        self.0
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, target)| target.clone())
            .collect()
    }
}

/// Cheap, cloneable entry point used by check-in handlers.
#[derive(Clone)]
pub struct EngineHandle {
    queue: mpsc::Sender<String>,
    engine: Arc<AlertEngine>,
}

impl EngineHandle {
    /// Queues an evaluation without waiting. When the queue is full the
    /// trigger is dropped; the data is already stored and the next check-in
    /// or offline sweep picks it up.
    pub fn notify_check_in(&self, client_id: &str) {
        match self.queue.try_send(client_id.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client_id, "Check-in queue full, dropping evaluation trigger");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(client_id, "Alert engine stopped, dropping evaluation trigger");
            }
        }
    }

    /// Fires `client_restarted` on a background task. Must be called from
    /// within a Tokio runtime.
    pub fn notify_restart(&self, client_id: &str, label: &str) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let client_id = client_id.to_string();
        let label = label.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.fire_restart(&client_id, &label).await {
                tracing::error!(client_id = %client_id, error = %e, "Restart alert failed");
            }
        })
    }

    pub async fn send_test_alert(&self, provider_id: i64) -> Result<TestAlertResult> {
        Ok(self.engine.dispatcher.send_test_alert(provider_id).await?)
    }
}

/// Spawns the engine loop and returns the handle producers use to reach it.
/// The loop exits when `cancel` fires.
pub fn start(
    engine: Arc<AlertEngine>,
    config: EngineConfig,
    cancel: CancellationToken,
) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let handle = EngineHandle {
        queue: tx,
        engine: engine.clone(),
    };
    let task = tokio::spawn(engine.run(rx, config, cancel));
    (handle, task)
}
