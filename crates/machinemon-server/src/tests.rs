use crate::config::{ProviderSeedFile, ServerConfig};
use crate::ingest::{CheckInService, IngestError};
use crate::providers::{list_redacted, seed_providers, SeedSummary};
use machinemon_alert::{AlertEngine, EngineConfig};
use machinemon_common::types::{
    AlertType, CheckInRequest, CheckPayload, MetricsPayload, ProcessPayload,
};
use machinemon_notify::Dispatcher;
use machinemon_storage::{AlertFilter, SnapshotStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn open_store() -> (TempDir, Arc<SqliteStore>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path(), "machinemon.db").unwrap());
    (dir, store)
}

#[test]
fn config_defaults_fill_missing_fields() {
    let config: ServerConfig = toml::from_str("data_dir = \"/var/lib/machinemon\"").unwrap();
    assert_eq!(config.data_dir, "/var/lib/machinemon");
    assert_eq!(config.database_file, "machinemon.db");
    assert_eq!(config.checkin_queue_capacity, 100);
    assert_eq!(config.offline_sweep_secs, 30);
    assert_eq!(config.retention_sweep_secs, 86400);
    assert_eq!(config.provider_timeout_secs, 30);
    assert_eq!(config.checkin_interval_secs, 120);
    assert_eq!(
        config.database_path(),
        std::path::Path::new("/var/lib/machinemon/machinemon.db")
    );

    let engine = config.engine_config();
    assert_eq!(engine.queue_capacity, 100);
    assert_eq!(engine.offline_sweep_interval, Duration::from_secs(30));
}

#[test]
fn config_load_reports_missing_file() {
    let err = ServerConfig::load("/nonexistent/machinemon.toml").unwrap_err();
    assert!(err.to_string().contains("/nonexistent/machinemon.toml"));
}

#[test]
fn config_load_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(&path, "offline_sweep_secs = 10\nprovider_timeout_secs = 5\n").unwrap();
    let config = ServerConfig::load(path.to_str().unwrap()).unwrap();
    assert_eq!(config.offline_sweep_secs, 10);
    assert_eq!(config.provider_timeout(), Duration::from_secs(5));
}

fn seed() -> ProviderSeedFile {
    serde_json::from_value(serde_json::json!({
        "providers": [
            {
                "name": "on-call phone",
                "type": "pushover",
                "config": {"app_token": "app-secret", "user_key": "user-secret"}
            },
            {
                "name": "ops mail",
                "type": "smtp",
                "enabled": false,
                "config": {"host": "smtp.example.com", "port": 587, "password": "hunter2"}
            },
            {"name": "pager", "type": "fax", "config": {}}
        ]
    }))
    .unwrap()
}

#[test]
fn seed_creates_skips_and_rejects() {
    let (_dir, store) = open_store();
    let summary = seed_providers(&*store, &seed()).unwrap();
    assert_eq!(
        summary,
        SeedSummary {
            created: 2,
            skipped: 0,
            invalid: 1,
        }
    );

    let again = seed_providers(&*store, &seed()).unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.skipped, 2);

    let rows = store.list_providers().unwrap();
    assert_eq!(rows.len(), 2);
    let mail = rows.iter().find(|p| p.name == "ops mail").unwrap();
    assert!(!mail.enabled);
    assert_eq!(mail.provider_type, "smtp");
}

#[test]
fn listed_configs_are_redacted() {
    let (_dir, store) = open_store();
    seed_providers(&*store, &seed()).unwrap();
    let rows = list_redacted(&*store).unwrap();
    let joined: String = rows.iter().map(|p| p.config.as_str()).collect();
    assert!(!joined.contains("app-secret"));
    assert!(!joined.contains("user-secret"));
    assert!(!joined.contains("hunter2"));
    assert!(joined.contains("smtp.example.com"));
    // Stored rows keep the real secrets.
    assert!(store.list_providers().unwrap()[0].config.contains("secret"));
}

struct Harness {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    service: CheckInService,
    cancel: CancellationToken,
}

fn harness() -> Harness {
    let (dir, store) = open_store();
    let dispatcher = Dispatcher::new(store.clone(), Duration::from_secs(2));
    let engine = Arc::new(AlertEngine::new(store.clone(), dispatcher));
    let cancel = CancellationToken::new();
    let config = EngineConfig {
        queue_capacity: 8,
        offline_sweep_interval: Duration::from_secs(3600),
        retention_sweep_interval: Duration::from_secs(3600),
    };
    let (handle, _task) = machinemon_alert::start(engine, config, cancel.clone());
    let service = CheckInService::new(store.clone(), handle, 120);
    Harness {
        _dir: dir,
        store,
        service,
        cancel,
    }
}

fn request(client_id: Option<&str>, session: &str, cpu: f64) -> CheckInRequest {
    CheckInRequest {
        hostname: "web-01".into(),
        os: "linux".into(),
        arch: "arm64".into(),
        client_version: "1.4.0".into(),
        client_id: client_id.map(str::to_string),
        session_id: Some(session.to_string()),
        interface_ips: vec!["10.0.0.2".into()],
        metrics: MetricsPayload {
            cpu_pct: cpu,
            mem_pct: 40.0,
            disk_pct: 50.0,
            ..Default::default()
        },
        processes: vec![ProcessPayload {
            friendly_name: "worker".into(),
            match_pattern: "worker".into(),
            is_running: true,
            pid: Some(100),
            ..Default::default()
        }],
        checks: vec![CheckPayload {
            friendly_name: "api".into(),
            check_type: "http".into(),
            healthy: true,
            ..Default::default()
        }],
    }
}

async fn wait_for_alert(store: &SqliteStore, client_id: &str, alert_type: AlertType) {
    let filter = AlertFilter {
        client_id: Some(client_id.to_string()),
        ..Default::default()
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (alerts, _) = store.list_alerts(&filter, 100, 0).unwrap();
        if alerts.iter().any(|a| a.alert_type == alert_type) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no {alert_type} alert for {client_id}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn check_in_persists_everything() {
    let h = harness();
    let resp = h.service.record_check_in(&request(None, "boot-1", 12.0)).unwrap();
    assert!(!resp.client_id.is_empty());
    assert_eq!(resp.next_checkin_seconds, 120);

    let client = h.store.get_client(&resp.client_id).unwrap().unwrap();
    assert_eq!(client.hostname, "web-01");
    assert_eq!(client.session_id.as_deref(), Some("boot-1"));
    assert_eq!(
        h.store.get_latest_metrics(&resp.client_id).unwrap().unwrap().cpu_pct,
        12.0
    );
    assert_eq!(h.store.get_watched_processes(&resp.client_id).unwrap().len(), 1);
    assert_eq!(
        h.store.get_latest_process_snapshots(&resp.client_id).unwrap()[0].pid,
        Some(100)
    );
    assert!(h.store.get_latest_check_snapshots(&resp.client_id).unwrap()[0].healthy);
    h.cancel.cancel();
}

#[tokio::test]
async fn check_in_without_hostname_stores_nothing() {
    let h = harness();
    let mut req = request(None, "boot-1", 12.0);
    req.hostname = "  ".into();
    let err = h.service.record_check_in(&req).unwrap_err();
    assert!(matches!(err, IngestError::MissingHostname));
    assert!(h.store.list_clients().unwrap().is_empty());
    h.cancel.cancel();
}

#[tokio::test]
async fn check_in_triggers_evaluation() {
    let h = harness();
    let resp = h.service.record_check_in(&request(None, "boot-1", 99.0)).unwrap();
    wait_for_alert(
        &h.store,
        &resp.client_id,
        "cpu_crit".parse().unwrap(),
    )
    .await;
    h.cancel.cancel();
}

#[tokio::test]
async fn new_session_fires_restart() {
    let h = harness();
    let first = h.service.record_check_in(&request(None, "boot-1", 10.0)).unwrap();
    let id = first.client_id;
    let same = h
        .service
        .record_check_in(&request(Some(&id), "boot-1", 10.0))
        .unwrap();
    assert_eq!(same.client_id, id);

    h.service
        .record_check_in(&request(Some(&id), "boot-2", 10.0))
        .unwrap();
    wait_for_alert(&h.store, &id, AlertType::ClientRestarted).await;

    let filter = AlertFilter {
        client_id: Some(id.clone()),
        ..Default::default()
    };
    let (alerts, _) = h.store.list_alerts(&filter, 100, 0).unwrap();
    let restarts = alerts
        .iter()
        .filter(|a| a.alert_type == AlertType::ClientRestarted)
        .count();
    assert_eq!(restarts, 1);
    h.cancel.cancel();
}
