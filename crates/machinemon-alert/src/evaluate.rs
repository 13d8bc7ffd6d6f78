//! Pure transition rules. Each function compares the newest observations
//! with the previous ones (or with the last alert fired) and returns the
//! alerts that should fire. Nothing here touches the store.

use machinemon_common::types::{
    check_key, AlertType, CheckSnapshot, MetricKind, ProcessSnapshot, Severity,
};
use std::collections::{HashMap, HashSet};

/// An alert the engine should fire.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
}

impl Transition {
    fn new(alert_type: AlertType, severity: Severity, message: String) -> Self {
        Self {
            alert_type,
            severity,
            message,
        }
    }
}

/// Number of leading samples (newest first) at or above `threshold`.
pub fn streak(samples: &[f64], threshold: f64) -> usize {
    samples.iter().take_while(|v| **v >= threshold).count()
}

/// Threshold hysteresis for one metric.
///
/// `samples` are newest first; the first one is the current value. `last` is
/// the type of the most recent alert of this metric's warn/crit/recover
/// family. Onset needs `required` consecutive samples over the threshold;
/// recovery fires on the first sample below the warning threshold.
///
/// A value at or above critical whose critical streak is still short is
/// judged against the warning threshold, so with `required = 2` the samples
/// `[96.0, 85.0]` give a warning and the next critical sample escalates.
pub fn evaluate_metric(
    kind: MetricKind,
    samples: &[f64],
    (warn_pct, crit_pct): (f64, f64),
    required: u32,
    last: Option<AlertType>,
    client_label: &str,
) -> Option<Transition> {
    let value = *samples.first()?;
    let required = required.max(1) as usize;
    let [warn, crit, recover] = AlertType::metric_family(kind);

    if value >= crit_pct && streak(samples, crit_pct) >= required {
        return (last != Some(crit)).then(|| {
            Transition::new(
                crit,
                Severity::Critical,
                format!(
                    "{} at {:.1}% on '{}' (critical threshold: {:.1}%)",
                    kind.label(),
                    value,
                    client_label,
                    crit_pct
                ),
            )
        });
    }

    if value >= warn_pct {
        if streak(samples, warn_pct) >= required && last != Some(warn) {
            return Some(Transition::new(
                warn,
                Severity::Warning,
                format!(
                    "{} at {:.1}% on '{}' (warning threshold: {:.1}%)",
                    kind.label(),
                    value,
                    client_label,
                    warn_pct
                ),
            ));
        }
        return None;
    }

    if last == Some(crit) || last == Some(warn) {
        return Some(Transition::new(
            recover,
            Severity::Info,
            format!("{} recovered to {:.1}% on '{}'", kind.label(), value, client_label),
        ));
    }
    None
}

/// Compares the two most recent snapshots of each watched process.
///
/// Processes present in only one of the two reports are ignored, as are
/// names listed in `muted`.
pub fn process_transitions(
    current: &[ProcessSnapshot],
    previous: &[ProcessSnapshot],
    muted: &HashSet<String>,
    client_label: &str,
) -> Vec<Transition> {
    let previous: HashMap<&str, &ProcessSnapshot> = previous
        .iter()
        .map(|p| (p.friendly_name.as_str(), p))
        .collect();

    let mut out = Vec::new();
    for curr in current {
        if muted.contains(&curr.friendly_name) {
            continue;
        }
        let Some(prev) = previous.get(curr.friendly_name.as_str()) else {
            continue;
        };
        if !prev.is_running {
            continue;
        }
        if !curr.is_running {
            out.push(Transition::new(
                AlertType::ProcessDied,
                Severity::Critical,
                format!(
                    "Process '{}' has stopped on '{}'",
                    curr.friendly_name, client_label
                ),
            ));
        } else if let (Some(old), Some(new)) = (prev.pid, curr.pid) {
            if old != new {
                out.push(Transition::new(
                    AlertType::PidChange,
                    Severity::Warning,
                    format!(
                        "Process '{}' PID changed: {} -> {} on '{}'",
                        curr.friendly_name, old, new, client_label
                    ),
                ));
            }
        }
    }
    out
}

/// Compares each check's newest result with the one before it, keyed by
/// name and type. A first-ever unhealthy result counts as a failure.
pub fn check_transitions(
    current: &[CheckSnapshot],
    previous: &[CheckSnapshot],
    muted: &HashSet<String>,
    client_label: &str,
) -> Vec<Transition> {
    let previous: HashMap<String, &CheckSnapshot> =
        previous.iter().map(|c| (c.key(), c)).collect();

    let mut out = Vec::new();
    for curr in current {
        let key = check_key(&curr.friendly_name, &curr.check_type);
        if muted.contains(&key) {
            continue;
        }
        let prev = previous.get(&key);
        if !curr.healthy {
            if prev.map_or(true, |p| p.healthy) {
                let mut message = format!(
                    "Check '{}' ({}) failed on '{}'",
                    curr.friendly_name, curr.check_type, client_label
                );
                if !curr.message.is_empty() {
                    message.push_str(": ");
                    message.push_str(&curr.message);
                }
                out.push(Transition::new(
                    AlertType::CheckFailed,
                    Severity::Critical,
                    message,
                ));
            }
        } else if prev.is_some_and(|p| !p.healthy) {
            out.push(Transition::new(
                AlertType::CheckRecovered,
                Severity::Info,
                format!(
                    "Check '{}' ({}) recovered on '{}'",
                    curr.friendly_name, curr.check_type, client_label
                ),
            ));
        }
    }
    out
}

pub fn offline(client_label: &str, threshold_secs: i64) -> Transition {
    Transition::new(
        AlertType::Offline,
        Severity::Critical,
        format!(
            "Client '{client_label}' has gone offline (no check-in for {threshold_secs}+ seconds)"
        ),
    )
}

pub fn online(client_label: &str) -> Transition {
    Transition::new(
        AlertType::Online,
        Severity::Info,
        format!("Client '{client_label}' is back online"),
    )
}

pub fn restarted(client_label: &str) -> Transition {
    Transition::new(
        AlertType::ClientRestarted,
        Severity::Warning,
        format!("Client '{client_label}' has restarted (new session detected)"),
    )
}
