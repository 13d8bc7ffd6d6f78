use crate::engine::{start, AlertEngine, EngineConfig};
use crate::thresholds::keys;
use chrono::{Duration as ChronoDuration, Utc};
use machinemon_common::types::{
    Alert, AlertType, CheckInRequest, CheckPayload, MetricKind, MetricLevel, MetricsPayload,
    MuteScope, ProcessPayload, Severity,
};
use machinemon_notify::Dispatcher;
use machinemon_storage::{AlertFilter, SnapshotStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CPU_WARN: AlertType = AlertType::Metric(MetricKind::Cpu, MetricLevel::Warn);
const CPU_CRIT: AlertType = AlertType::Metric(MetricKind::Cpu, MetricLevel::Crit);
const CPU_RECOVER: AlertType = AlertType::Metric(MetricKind::Cpu, MetricLevel::Recover);
const MEM_CRIT: AlertType = AlertType::Metric(MetricKind::Memory, MetricLevel::Crit);

struct Fixture {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    engine: Arc<AlertEngine>,
}

fn setup() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path(), "machinemon.db").unwrap());
    let dispatcher = Dispatcher::new(store.clone(), Duration::from_secs(2));
    let engine = Arc::new(AlertEngine::new(store.clone(), dispatcher));
    Fixture {
        _dir: dir,
        store,
        engine,
    }
}

#[derive(Default)]
struct Report {
    cpu: f64,
    mem: f64,
    processes: Vec<ProcessPayload>,
    checks: Vec<CheckPayload>,
}

fn cpu(pct: f64) -> Report {
    Report {
        cpu: pct,
        mem: 30.0,
        ..Default::default()
    }
}

fn process(name: &str, running: bool, pid: Option<i32>) -> ProcessPayload {
    ProcessPayload {
        friendly_name: name.into(),
        match_pattern: name.into(),
        is_running: running,
        pid,
        ..Default::default()
    }
}

fn check(name: &str, healthy: bool, message: &str) -> CheckPayload {
    CheckPayload {
        friendly_name: name.into(),
        check_type: "http".into(),
        healthy,
        message: message.into(),
        state: "{}".into(),
    }
}

impl Fixture {
    /// Stores one check-in the way the ingestion path does and returns the
    /// client id.
    async fn report(&self, client_id: Option<&str>, report: Report) -> String {
        let metrics = MetricsPayload {
            cpu_pct: report.cpu,
            mem_pct: report.mem,
            disk_pct: 20.0,
            ..Default::default()
        };
        let req = CheckInRequest {
            hostname: "web-01".into(),
            os: "linux".into(),
            client_id: client_id.map(str::to_string),
            metrics,
            processes: report.processes.clone(),
            checks: report.checks.clone(),
            ..Default::default()
        };
        let id = self.store.upsert_client(&req).unwrap().client_id;
        self.store.insert_metrics(&id, &metrics).unwrap();
        if !report.processes.is_empty() {
            self.store
                .upsert_watched_processes(&id, &report.processes)
                .unwrap();
            self.store
                .insert_process_snapshots(&id, &report.processes)
                .unwrap();
        }
        self.store.insert_check_snapshots(&id, &report.checks).unwrap();
        id
    }

    async fn evaluate(&self, client_id: &str) -> Vec<AlertType> {
        self.engine
            .evaluate_check_in(client_id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.alert_type)
            .collect()
    }

    fn alerts(&self, client_id: &str) -> Vec<Alert> {
        let filter = AlertFilter {
            client_id: Some(client_id.to_string()),
            ..Default::default()
        };
        self.store.list_alerts(&filter, 100, 0).unwrap().0
    }
}

#[tokio::test]
async fn cpu_crit_then_recover() {
    let f = setup();
    let id = f.report(None, cpu(60.0)).await;
    assert!(f.evaluate(&id).await.is_empty());

    f.report(Some(&id), cpu(82.0)).await;
    assert_eq!(f.evaluate(&id).await, vec![CPU_WARN]);

    f.report(Some(&id), cpu(96.0)).await;
    assert_eq!(f.evaluate(&id).await, vec![CPU_CRIT]);

    f.report(Some(&id), cpu(70.0)).await;
    assert_eq!(f.evaluate(&id).await, vec![CPU_RECOVER]);

    let alerts = f.alerts(&id);
    let crit = alerts.iter().find(|a| a.alert_type == CPU_CRIT).unwrap();
    assert_eq!(crit.severity, Severity::Critical);
    assert_eq!(
        crit.message,
        "CPU at 96.0% on 'web-01' (critical threshold: 95.0%)"
    );
}

#[tokio::test]
async fn sustained_crit_fires_once() {
    let f = setup();
    let id = f.report(None, cpu(97.0)).await;
    assert_eq!(f.evaluate(&id).await, vec![CPU_CRIT]);
    for _ in 0..3 {
        f.report(Some(&id), cpu(98.0)).await;
        assert!(f.evaluate(&id).await.is_empty());
    }
}

#[tokio::test]
async fn consecutive_checkins_gate_onset_not_recovery() {
    let f = setup();
    f.store.set_setting(keys::CONSECUTIVE_CHECKINS, "3").unwrap();

    let id = f.report(None, cpu(96.0)).await;
    assert!(f.evaluate(&id).await.is_empty());
    f.report(Some(&id), cpu(96.0)).await;
    assert!(f.evaluate(&id).await.is_empty());
    f.report(Some(&id), cpu(96.0)).await;
    assert_eq!(f.evaluate(&id).await, vec![CPU_CRIT]);

    f.report(Some(&id), cpu(40.0)).await;
    assert_eq!(f.evaluate(&id).await, vec![CPU_RECOVER]);
}

#[tokio::test]
async fn client_overrides_apply() {
    let f = setup();
    let id = f.report(None, cpu(50.0)).await;
    let overrides = machinemon_common::types::ClientThresholdOverrides {
        cpu_warn_pct: Some(40.0),
        cpu_crit_pct: Some(45.0),
        ..Default::default()
    };
    f.store.set_client_thresholds(&id, Some(&overrides)).unwrap();
    assert_eq!(f.evaluate(&id).await, vec![CPU_CRIT]);
}

#[tokio::test]
async fn re_evaluation_does_not_double_fire() {
    let f = setup();
    let id = f
        .report(
            None,
            Report {
                cpu: 96.0,
                mem: 30.0,
                processes: vec![process("worker", true, Some(100))],
                checks: vec![check("api", true, "")],
            },
        )
        .await;
    assert_eq!(f.evaluate(&id).await, vec![CPU_CRIT]);

    f.report(
        Some(&id),
        Report {
            cpu: 96.0,
            mem: 30.0,
            processes: vec![process("worker", true, Some(205))],
            checks: vec![check("api", false, "HTTP 503")],
        },
    )
    .await;
    assert_eq!(
        f.evaluate(&id).await,
        vec![AlertType::PidChange, AlertType::CheckFailed]
    );

    assert!(f.evaluate(&id).await.is_empty());
    assert!(f.evaluate(&id).await.is_empty());
    assert_eq!(f.alerts(&id).len(), 3);
}

#[tokio::test]
async fn pid_change_not_process_died() {
    let f = setup();
    let id = f
        .report(
            None,
            Report {
                processes: vec![process("worker", true, Some(100))],
                ..cpu(10.0)
            },
        )
        .await;
    assert!(f.evaluate(&id).await.is_empty());

    f.report(
        Some(&id),
        Report {
            processes: vec![process("worker", true, Some(205))],
            ..cpu(10.0)
        },
    )
    .await;
    assert_eq!(f.evaluate(&id).await, vec![AlertType::PidChange]);
    let alert = &f.alerts(&id)[0];
    assert_eq!(alert.severity, Severity::Warning);
    assert_eq!(
        alert.message,
        "Process 'worker' PID changed: 100 -> 205 on 'web-01'"
    );

    f.report(
        Some(&id),
        Report {
            processes: vec![process("worker", false, None)],
            ..cpu(10.0)
        },
    )
    .await;
    assert_eq!(f.evaluate(&id).await, vec![AlertType::ProcessDied]);
}

/// Accepts connections and never answers, so every send runs into the
/// provider timeout.
async fn silent_upstream() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn report_stored_during_dispatch_is_still_evaluated() {
    let f = setup();
    let url = silent_upstream().await;
    f.store
        .create_provider(
            "pushover",
            "silent",
            true,
            &format!(r#"{{"app_token":"a","user_key":"u","api_url":"{url}"}}"#),
        )
        .unwrap();

    let all = |api: bool, worker: bool, cron: bool| Report {
        processes: vec![
            process("api", api, api.then_some(10)),
            process("worker", worker, worker.then_some(11)),
            process("cron", cron, cron.then_some(12)),
        ],
        ..cpu(10.0)
    };
    let id = f.report(None, all(true, true, true)).await;
    assert!(f.evaluate(&id).await.is_empty());

    f.report(Some(&id), all(false, false, true)).await;
    let engine = f.engine.clone();
    let client_id = id.clone();
    let first = tokio::spawn(async move { engine.evaluate_check_in(&client_id).await });

    // Wait until the first death is stored and its dispatch is hanging.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while f.alerts(&id).is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "first alert never fired");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    f.report(Some(&id), all(false, false, false)).await;
    let second = f.engine.evaluate_check_in(&id).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].alert_type, AlertType::ProcessDied);
    assert!(second[0].message.contains("'cron'"));

    let first: Vec<AlertType> = first
        .await
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|a| a.alert_type)
        .collect();
    assert_eq!(first, vec![AlertType::ProcessDied, AlertType::ProcessDied]);

    // Nothing new to report: re-evaluation stays quiet.
    assert!(f.evaluate(&id).await.is_empty());
    assert_eq!(f.alerts(&id).len(), 3);
}

#[tokio::test]
async fn check_fail_and_recover() {
    let f = setup();
    let id = f
        .report(
            None,
            Report {
                checks: vec![check("api", false, "connection refused")],
                ..cpu(10.0)
            },
        )
        .await;
    assert_eq!(f.evaluate(&id).await, vec![AlertType::CheckFailed]);
    assert_eq!(
        f.alerts(&id)[0].message,
        "Check 'api' (http) failed on 'web-01': connection refused"
    );

    f.report(
        Some(&id),
        Report {
            checks: vec![check("api", false, "connection refused")],
            ..cpu(10.0)
        },
    )
    .await;
    assert!(f.evaluate(&id).await.is_empty());

    f.report(
        Some(&id),
        Report {
            checks: vec![check("api", true, "")],
            ..cpu(10.0)
        },
    )
    .await;
    assert_eq!(f.evaluate(&id).await, vec![AlertType::CheckRecovered]);
}

#[tokio::test]
async fn global_mute_skips_until_expiry() {
    let f = setup();
    let id = f.report(None, cpu(96.0)).await;
    f.store
        .set_client_mute(&id, true, None, Some("maintenance"))
        .unwrap();
    assert!(f.evaluate(&id).await.is_empty());

    f.store
        .set_client_mute(&id, true, Some(Utc::now() - ChronoDuration::minutes(1)), None)
        .unwrap();
    assert_eq!(f.evaluate(&id).await, vec![CPU_CRIT]);
    let client = f.store.get_client(&id).unwrap().unwrap();
    assert!(!client.alerts_muted);
    assert!(client.muted_until.is_none());
}

#[tokio::test]
async fn scoped_mutes_suppress_only_their_target() {
    let f = setup();
    let id = f
        .report(
            None,
            Report {
                cpu: 10.0,
                mem: 10.0,
                processes: vec![
                    process("worker", true, Some(1)),
                    process("cron", true, Some(2)),
                ],
                checks: vec![check("api", true, ""), check("db", true, "")],
            },
        )
        .await;
    assert!(f.evaluate(&id).await.is_empty());

    f.store
        .set_client_alert_mute(&id, MuteScope::Cpu, "", true)
        .unwrap();
    f.store
        .set_client_alert_mute(&id, MuteScope::Process, "worker", true)
        .unwrap();
    f.store
        .set_client_alert_mute(&id, MuteScope::Check, "api::http", true)
        .unwrap();

    f.report(
        Some(&id),
        Report {
            cpu: 99.0,
            mem: 99.0,
            processes: vec![process("worker", false, None), process("cron", false, None)],
            checks: vec![check("api", false, ""), check("db", false, "")],
        },
    )
    .await;
    let fired = f.evaluate(&id).await;
    assert_eq!(
        fired,
        vec![MEM_CRIT, AlertType::ProcessDied, AlertType::CheckFailed]
    );
    let alerts = f.alerts(&id);
    assert!(alerts.iter().any(|a| a.message.contains("'cron'")));
    assert!(alerts.iter().any(|a| a.message.contains("'db'")));
}

#[tokio::test]
async fn offline_fires_at_threshold_only() {
    let f = setup();
    let stale = f.report(None, cpu(10.0)).await;
    let fresh = f.report(None, cpu(10.0)).await;
    f.store
        .backdate_client_last_seen(&stale, ChronoDuration::seconds(240))
        .unwrap();
    f.store
        .backdate_client_last_seen(&fresh, ChronoDuration::seconds(239))
        .unwrap();

    let fired = f.engine.sweep_offline().await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].client_id, stale);
    assert_eq!(fired[0].alert_type, AlertType::Offline);
    assert_eq!(
        fired[0].message,
        "Client 'web-01' has gone offline (no check-in for 240+ seconds)"
    );
    assert!(!f.store.get_client(&stale).unwrap().unwrap().is_online);
    assert!(f.store.get_client(&fresh).unwrap().unwrap().is_online);

    // Already offline: no second alert.
    assert!(f.engine.sweep_offline().await.unwrap().is_empty());

    // Checking back in fires `online` once.
    f.report(Some(&stale), cpu(10.0)).await;
    assert_eq!(f.evaluate(&stale).await, vec![AlertType::Online]);
    assert!(f.evaluate(&stale).await.is_empty());
}

#[tokio::test]
async fn offline_threshold_overrides() {
    let f = setup();
    f.store
        .set_setting(keys::OFFLINE_THRESHOLD_SECONDS, "60")
        .unwrap();
    let global = f.report(None, cpu(10.0)).await;
    let patient = f.report(None, cpu(10.0)).await;
    let overrides = machinemon_common::types::ClientThresholdOverrides {
        offline_threshold_seconds: Some(600),
        ..Default::default()
    };
    f.store
        .set_client_thresholds(&patient, Some(&overrides))
        .unwrap();
    for id in [&global, &patient] {
        f.store
            .backdate_client_last_seen(id, ChronoDuration::seconds(120))
            .unwrap();
    }

    let fired = f.engine.sweep_offline().await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].client_id, global);
    assert!(fired[0].message.contains("60+ seconds"));
}

#[tokio::test]
async fn restart_fires_every_time() {
    let f = setup();
    let id = f.report(None, cpu(10.0)).await;
    f.engine.fire_restart(&id, "web-01").await.unwrap();
    f.engine.fire_restart(&id, "web-01").await.unwrap();

    let restarts: Vec<_> = f
        .alerts(&id)
        .into_iter()
        .filter(|a| a.alert_type == AlertType::ClientRestarted)
        .collect();
    assert_eq!(restarts.len(), 2);
    assert_eq!(
        restarts[0].message,
        "Client 'web-01' has restarted (new session detected)"
    );
}

#[tokio::test]
async fn dispatch_failure_keeps_alert() {
    let f = setup();
    f.store
        .create_provider(
            "pushover",
            "unreachable",
            true,
            r#"{"app_token":"a","user_key":"u","api_url":"http://127.0.0.1:9"}"#,
        )
        .unwrap();
    let id = f.report(None, cpu(99.0)).await;
    assert_eq!(f.evaluate(&id).await, vec![CPU_CRIT]);

    let alerts = f.alerts(&id);
    assert_eq!(alerts.len(), 1);
    assert!(!alerts[0].notified);
}

#[tokio::test]
async fn retention_sweep_uses_settings() {
    let f = setup();
    f.store
        .set_setting(keys::ALERTS_RETENTION_DAYS, "90")
        .unwrap();
    let id = f.report(None, cpu(99.0)).await;
    f.evaluate(&id).await;
    f.store
        .backdate_samples(&id, ChronoDuration::days(20))
        .unwrap();
    f.store
        .backdate_alerts(&id, ChronoDuration::days(40))
        .unwrap();

    let stats = f.engine.sweep_retention().unwrap();
    assert_eq!(stats.metrics, 1);
    assert_eq!(stats.alerts, 0);
    assert_eq!(f.alerts(&id).len(), 1);

    assert_eq!(f.engine.sweep_retention().unwrap().total(), 0);
}

#[tokio::test]
async fn unknown_client_is_an_error() {
    let f = setup();
    let err = f.engine.evaluate_check_in("missing").await.unwrap_err();
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
async fn background_loop_evaluates_queued_check_ins() {
    let f = setup();
    let id = f.report(None, cpu(99.0)).await;

    let cancel = CancellationToken::new();
    let config = EngineConfig {
        queue_capacity: 4,
        offline_sweep_interval: Duration::from_secs(3600),
        retention_sweep_interval: Duration::from_secs(3600),
    };
    let (handle, task) = start(f.engine.clone(), config, cancel.clone());

    handle.notify_check_in(&id);
    handle.notify_restart(&id, "web-01").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let types: Vec<_> = f.alerts(&id).into_iter().map(|a| a.alert_type).collect();
        if types.contains(&CPU_CRIT) {
            assert!(types.contains(&AlertType::ClientRestarted));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "check-in was never evaluated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    // Triggers after shutdown are dropped without panicking.
    handle.notify_check_in(&id);
}
