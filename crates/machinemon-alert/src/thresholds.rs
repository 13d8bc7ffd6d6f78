//! Effective alerting parameters: compiled defaults, overridden by global
//! settings, overridden by per-client values.

use machinemon_common::types::{Client, Thresholds};
use std::collections::HashMap;
use std::str::FromStr;

/// Keys of the `global_settings` table read by the engine.
pub mod keys {
    pub const CPU_WARN_PCT: &str = "cpu_warn_pct_default";
    pub const CPU_CRIT_PCT: &str = "cpu_crit_pct_default";
    pub const MEM_WARN_PCT: &str = "mem_warn_pct_default";
    pub const MEM_CRIT_PCT: &str = "mem_crit_pct_default";
    pub const DISK_WARN_PCT: &str = "disk_warn_pct_default";
    pub const DISK_CRIT_PCT: &str = "disk_crit_pct_default";
    pub const CONSECUTIVE_CHECKINS: &str = "metric_consecutive_checkins_default";
    pub const OFFLINE_THRESHOLD_SECONDS: &str = "offline_threshold_seconds";
    pub const METRICS_RETENTION_DAYS: &str = "metrics_retention_days";
    pub const ALERTS_RETENTION_DAYS: &str = "alerts_retention_days";
}

pub const DEFAULT_OFFLINE_THRESHOLD_SECS: i64 = 240;
pub const DEFAULT_METRICS_RETENTION_DAYS: u32 = 14;

/// Parses a setting, treating a missing, blank or malformed value as absent.
fn setting<T: FromStr>(settings: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = settings.get(key)?.trim();
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            if !raw.is_empty() {
                tracing::warn!(key, value = raw, "Ignoring malformed setting");
            }
            None
        }
    }
}

fn percent(settings: &HashMap<String, String>, key: &str) -> Option<f64> {
    setting::<f64>(settings, key).filter(|v| v.is_finite())
}

/// Resolves the thresholds that apply to `client`.
///
/// # Examples
///
/// ```
/// use machinemon_alert::thresholds::{keys, resolve};
/// # use machinemon_common::types::Client;
/// # fn client() -> Client {
/// #     let now = chrono::Utc::now();
/// #     Client {
/// #         id: "1".into(), hostname: "web-01".into(), custom_name: String::new(),
/// #         interface_ips: vec![], os: String::new(), arch: String::new(),
/// #         client_version: String::new(), first_seen_at: now, last_seen_at: now,
/// #         session_id: None, session_started_at: now, is_online: true, is_deleted: false,
/// #         cpu_warn_pct: None, cpu_crit_pct: Some(99.0), mem_warn_pct: None,
/// #         mem_crit_pct: None, disk_warn_pct: None, disk_crit_pct: None,
/// #         offline_threshold_seconds: None, metric_consecutive_checkins: None,
/// #         alerts_muted: false, muted_until: None, mute_reason: None,
/// #     }
/// # }
/// let settings: std::collections::HashMap<_, _> =
///     [(keys::CPU_WARN_PCT.to_string(), "70".to_string())].into();
/// let t = resolve(&client(), &settings);
/// assert_eq!(t.cpu_warn_pct, 70.0);
/// assert_eq!(t.cpu_crit_pct, 99.0);
/// assert_eq!(t.mem_warn_pct, 85.0);
/// ```
pub fn resolve(client: &Client, settings: &HashMap<String, String>) -> Thresholds {
    let mut t = Thresholds::DEFAULT;

    let global = [
        (keys::CPU_WARN_PCT, &mut t.cpu_warn_pct),
        (keys::CPU_CRIT_PCT, &mut t.cpu_crit_pct),
        (keys::MEM_WARN_PCT, &mut t.mem_warn_pct),
        (keys::MEM_CRIT_PCT, &mut t.mem_crit_pct),
        (keys::DISK_WARN_PCT, &mut t.disk_warn_pct),
        (keys::DISK_CRIT_PCT, &mut t.disk_crit_pct),
    ];
    for (key, field) in global {
        if let Some(v) = percent(settings, key) {
            *field = v;
        }
    }
    if let Some(n) = setting::<u32>(settings, keys::CONSECUTIVE_CHECKINS).filter(|n| *n >= 1) {
        t.consecutive_checkins = n;
    }

    let per_client = [
        (client.cpu_warn_pct, &mut t.cpu_warn_pct),
        (client.cpu_crit_pct, &mut t.cpu_crit_pct),
        (client.mem_warn_pct, &mut t.mem_warn_pct),
        (client.mem_crit_pct, &mut t.mem_crit_pct),
        (client.disk_warn_pct, &mut t.disk_warn_pct),
        (client.disk_crit_pct, &mut t.disk_crit_pct),
    ];
    for (value, field) in per_client {
        if let Some(v) = value {
            *field = v;
        }
    }
    if let Some(n) = client.metric_consecutive_checkins {
        t.consecutive_checkins = n.max(1);
    }

    t
}

/// Global offline threshold used for clients without an override.
pub fn offline_threshold_secs(settings: &HashMap<String, String>) -> i64 {
    setting::<i64>(settings, keys::OFFLINE_THRESHOLD_SECONDS)
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_OFFLINE_THRESHOLD_SECS)
}

/// Effective offline threshold for one client.
pub fn client_offline_threshold_secs(client: &Client, default_secs: i64) -> i64 {
    client
        .offline_threshold_seconds
        .filter(|secs| *secs > 0)
        .unwrap_or(default_secs)
}

/// `(metrics_days, alerts_days)`. Alert retention follows metric retention
/// unless set on its own.
pub fn retention_days(settings: &HashMap<String, String>) -> (u32, u32) {
    let metrics = setting::<u32>(settings, keys::METRICS_RETENTION_DAYS)
        .filter(|d| *d > 0)
        .unwrap_or(DEFAULT_METRICS_RETENTION_DAYS);
    let alerts = setting::<u32>(settings, keys::ALERTS_RETENTION_DAYS)
        .filter(|d| *d > 0)
        .unwrap_or(metrics);
    (metrics, alerts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn client() -> Client {
        let now = Utc::now();
        Client {
            id: "c1".into(),
            hostname: "web-01".into(),
            custom_name: String::new(),
            interface_ips: vec![],
            os: "linux".into(),
            arch: "amd64".into(),
            client_version: "1.0.0".into(),
            first_seen_at: now,
            last_seen_at: now,
            session_id: None,
            session_started_at: now,
            is_online: true,
            is_deleted: false,
            cpu_warn_pct: None,
            cpu_crit_pct: None,
            mem_warn_pct: None,
            mem_crit_pct: None,
            disk_warn_pct: None,
            disk_crit_pct: None,
            offline_threshold_seconds: None,
            metric_consecutive_checkins: None,
            alerts_muted: false,
            muted_until: None,
            mute_reason: None,
        }
    }

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_overrides() {
        assert_eq!(resolve(&client(), &HashMap::new()), Thresholds::DEFAULT);
        assert_eq!(offline_threshold_secs(&HashMap::new()), 240);
        assert_eq!(retention_days(&HashMap::new()), (14, 14));
    }

    #[test]
    fn client_override_beats_global_setting() {
        let mut c = client();
        c.disk_crit_pct = Some(97.5);
        c.metric_consecutive_checkins = Some(3);
        let s = settings(&[
            (keys::DISK_CRIT_PCT, "92"),
            (keys::DISK_WARN_PCT, "75"),
            (keys::CONSECUTIVE_CHECKINS, "2"),
        ]);
        let t = resolve(&c, &s);
        assert_eq!(t.disk_crit_pct, 97.5);
        assert_eq!(t.disk_warn_pct, 75.0);
        assert_eq!(t.consecutive_checkins, 3);
    }

    #[test]
    fn malformed_settings_are_ignored() {
        let s = settings(&[
            (keys::CPU_WARN_PCT, "eighty"),
            (keys::MEM_CRIT_PCT, "NaN"),
            (keys::CONSECUTIVE_CHECKINS, "0"),
            (keys::OFFLINE_THRESHOLD_SECONDS, "-5"),
            (keys::METRICS_RETENTION_DAYS, "soon"),
        ]);
        let t = resolve(&client(), &s);
        assert_eq!(t.cpu_warn_pct, 80.0);
        assert_eq!(t.mem_crit_pct, 95.0);
        assert_eq!(t.consecutive_checkins, 1);
        assert_eq!(offline_threshold_secs(&s), 240);
        assert_eq!(retention_days(&s).0, 14);
    }

    #[test]
    fn alert_retention_defaults_to_metric_retention() {
        let s = settings(&[(keys::METRICS_RETENTION_DAYS, " 30 ")]);
        assert_eq!(retention_days(&s), (30, 30));
        let s = settings(&[
            (keys::METRICS_RETENTION_DAYS, "30"),
            (keys::ALERTS_RETENTION_DAYS, "90"),
        ]);
        assert_eq!(retention_days(&s), (30, 90));
    }

    #[test]
    fn client_offline_override() {
        let mut c = client();
        assert_eq!(client_offline_threshold_secs(&c, 240), 240);
        c.offline_threshold_seconds = Some(600);
        assert_eq!(client_offline_threshold_secs(&c, 240), 600);
    }
}
