use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity level, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use machinemon_common::types::Severity;
///
/// let sev: Severity = "warning".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.to_string(), "warning");
/// assert!(Severity::Critical > Severity::Info);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Host resource tracked with warn/crit thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::Cpu, MetricKind::Memory, MetricKind::Disk];

    /// Prefix used in alert type names (`cpu_warn`, `mem_crit`, ...).
    pub fn prefix(self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "mem",
            MetricKind::Disk => "disk",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MetricKind::Cpu => "CPU",
            MetricKind::Memory => "MEM",
            MetricKind::Disk => "DISK",
        }
    }

    pub fn mute_scope(self) -> MuteScope {
        match self {
            MetricKind::Cpu => MuteScope::Cpu,
            MetricKind::Memory => MuteScope::Memory,
            MetricKind::Disk => MuteScope::Disk,
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(MetricKind::Cpu),
            "mem" => Some(MetricKind::Memory),
            "disk" => Some(MetricKind::Disk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricLevel {
    Warn,
    Crit,
    Recover,
}

impl MetricLevel {
    fn suffix(self) -> &'static str {
        match self {
            MetricLevel::Warn => "warn",
            MetricLevel::Crit => "crit",
            MetricLevel::Recover => "recover",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "warn" => Some(MetricLevel::Warn),
            "crit" => Some(MetricLevel::Crit),
            "recover" => Some(MetricLevel::Recover),
            _ => None,
        }
    }
}

/// Kind of a fired alert. Persisted as its string name (`offline`, `cpu_warn`, ...).
///
/// # Examples
///
/// ```
/// use machinemon_common::types::{AlertType, MetricKind, MetricLevel};
///
/// let t: AlertType = "mem_crit".parse().unwrap();
/// assert_eq!(t, AlertType::Metric(MetricKind::Memory, MetricLevel::Crit));
/// assert_eq!(AlertType::PidChange.to_string(), "pid_change");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AlertType {
    Offline,
    Online,
    PidChange,
    ProcessDied,
    CheckFailed,
    CheckRecovered,
    ClientRestarted,
    Metric(MetricKind, MetricLevel),
    Test,
}

impl AlertType {
    /// The warn/crit/recover triple for one metric, in that order.
    pub fn metric_family(kind: MetricKind) -> [AlertType; 3] {
        [
            AlertType::Metric(kind, MetricLevel::Warn),
            AlertType::Metric(kind, MetricLevel::Crit),
            AlertType::Metric(kind, MetricLevel::Recover),
        ]
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::Offline => write!(f, "offline"),
            AlertType::Online => write!(f, "online"),
            AlertType::PidChange => write!(f, "pid_change"),
            AlertType::ProcessDied => write!(f, "process_died"),
            AlertType::CheckFailed => write!(f, "check_failed"),
            AlertType::CheckRecovered => write!(f, "check_recovered"),
            AlertType::ClientRestarted => write!(f, "client_restarted"),
            AlertType::Metric(kind, level) => write!(f, "{}_{}", kind.prefix(), level.suffix()),
            AlertType::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(AlertType::Offline),
            "online" => Ok(AlertType::Online),
            "pid_change" => Ok(AlertType::PidChange),
            "process_died" => Ok(AlertType::ProcessDied),
            "check_failed" => Ok(AlertType::CheckFailed),
            "check_recovered" => Ok(AlertType::CheckRecovered),
            "client_restarted" => Ok(AlertType::ClientRestarted),
            "test" => Ok(AlertType::Test),
            other => other
                .split_once('_')
                .and_then(|(prefix, suffix)| {
                    Some(AlertType::Metric(
                        MetricKind::from_prefix(prefix)?,
                        MetricLevel::from_suffix(suffix)?,
                    ))
                })
                .ok_or_else(|| format!("unknown alert type: {s}")),
        }
    }
}

impl From<AlertType> for String {
    fn from(t: AlertType) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for AlertType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Category a scoped mute rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuteScope {
    Cpu,
    Memory,
    Disk,
    Process,
    Check,
}

impl MuteScope {
    pub fn as_str(self) -> &'static str {
        match self {
            MuteScope::Cpu => "cpu",
            MuteScope::Memory => "memory",
            MuteScope::Disk => "disk",
            MuteScope::Process => "process",
            MuteScope::Check => "check",
        }
    }

    /// Process and check rules name a target; metric rules never do.
    pub fn requires_target(self) -> bool {
        matches!(self, MuteScope::Process | MuteScope::Check)
    }
}

impl std::fmt::Display for MuteScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MuteScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(MuteScope::Cpu),
            "memory" => Ok(MuteScope::Memory),
            "disk" => Ok(MuteScope::Disk),
            "process" => Ok(MuteScope::Process),
            "check" => Ok(MuteScope::Check),
            _ => Err(format!("unknown mute scope: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    Substring,
    Regex,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Substring => "substring",
            MatchType::Regex => "regex",
        }
    }
}

impl std::str::FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "substring" => Ok(MatchType::Substring),
            "regex" => Ok(MatchType::Regex),
            _ => Err(format!("unknown match type: {s}")),
        }
    }
}

/// Key identifying a check across snapshots and mute rules.
///
/// # Examples
///
/// ```
/// use machinemon_common::types::check_key;
///
/// assert_eq!(check_key(" backup ", "script"), "backup::script");
/// ```
pub fn check_key(friendly_name: &str, check_type: &str) -> String {
    format!("{}::{}", friendly_name.trim(), check_type.trim())
}

// ---- Check-in payloads ----

/// Periodic report sent by a monitored host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub client_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub interface_ips: Vec<String>,
    pub metrics: MetricsPayload,
    #[serde(default)]
    pub processes: Vec<ProcessPayload>,
    #[serde(default)]
    pub checks: Vec<CheckPayload>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    #[serde(default)]
    pub mem_total_bytes: u64,
    #[serde(default)]
    pub mem_used_bytes: u64,
    pub disk_pct: f64,
    #[serde(default)]
    pub disk_total_bytes: u64,
    #[serde(default)]
    pub disk_used_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessPayload {
    pub friendly_name: String,
    pub match_pattern: String,
    #[serde(default)]
    pub match_type: MatchType,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default)]
    pub cpu_pct: f64,
    #[serde(default)]
    pub mem_pct: f64,
    #[serde(default)]
    pub cmdline: String,
}

impl ProcessPayload {
    /// Reported PID, with non-positive values treated as absent.
    pub fn pid(&self) -> Option<i32> {
        self.pid.filter(|pid| *pid > 0)
    }
}

/// Result of a client-side check. The server alerts purely on `healthy`
/// transitions; `state` is an opaque, type-specific JSON blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckPayload {
    pub friendly_name: String,
    pub check_type: String,
    pub healthy: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInResponse {
    pub client_id: String,
    pub next_checkin_seconds: u64,
    pub server_time: DateTime<Utc>,
}

// ---- Persisted entities ----

/// A monitored host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub hostname: String,
    pub custom_name: String,
    pub interface_ips: Vec<String>,
    pub os: String,
    pub arch: String,
    pub client_version: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub session_started_at: DateTime<Utc>,
    pub is_online: bool,
    pub is_deleted: bool,

    pub cpu_warn_pct: Option<f64>,
    pub cpu_crit_pct: Option<f64>,
    pub mem_warn_pct: Option<f64>,
    pub mem_crit_pct: Option<f64>,
    pub disk_warn_pct: Option<f64>,
    pub disk_crit_pct: Option<f64>,
    /// Offline alert delay override. `None` uses the global setting.
    pub offline_threshold_seconds: Option<i64>,
    /// Metric streak length override. `None` uses the global setting.
    pub metric_consecutive_checkins: Option<u32>,

    pub alerts_muted: bool,
    pub muted_until: Option<DateTime<Utc>>,
    pub mute_reason: Option<String>,
}

impl Client {
    /// Custom label when set, hostname otherwise.
    pub fn display_name(&self) -> &str {
        if self.custom_name.trim().is_empty() {
            &self.hostname
        } else {
            &self.custom_name
        }
    }
}

/// Per-client threshold overrides. `None` fields fall back to global settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientThresholdOverrides {
    pub cpu_warn_pct: Option<f64>,
    pub cpu_crit_pct: Option<f64>,
    pub mem_warn_pct: Option<f64>,
    pub mem_crit_pct: Option<f64>,
    pub disk_warn_pct: Option<f64>,
    pub disk_crit_pct: Option<f64>,
    pub offline_threshold_seconds: Option<i64>,
    pub metric_consecutive_checkins: Option<u32>,
}

/// Client row joined with its most recent metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientWithMetrics {
    #[serde(flatten)]
    pub client: Client,
    pub latest_metrics: Option<Metric>,
    pub process_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: i64,
    pub client_id: String,
    pub recorded_at: DateTime<Utc>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub mem_total_bytes: u64,
    pub mem_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_used_bytes: u64,
}

impl Metric {
    pub fn percent(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Cpu => self.cpu_pct,
            MetricKind::Memory => self.mem_pct,
            MetricKind::Disk => self.disk_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedProcess {
    pub id: i64,
    pub client_id: String,
    pub friendly_name: String,
    pub match_pattern: String,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub id: i64,
    pub client_id: String,
    pub friendly_name: String,
    pub recorded_at: DateTime<Utc>,
    /// Start of the current contiguous (is_running, pid) run.
    pub uptime_since_at: DateTime<Utc>,
    pub is_running: bool,
    pub pid: Option<i32>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub cmdline: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSnapshot {
    pub id: i64,
    pub client_id: String,
    pub friendly_name: String,
    pub check_type: String,
    pub recorded_at: DateTime<Utc>,
    /// Start of the current contiguous healthy/unhealthy run.
    pub uptime_since_at: DateTime<Utc>,
    pub healthy: bool,
    pub message: String,
    pub state: String,
}

impl CheckSnapshot {
    pub fn key(&self) -> String {
        check_key(&self.friendly_name, &self.check_type)
    }
}

/// A fired alert. Immutable except for the notified flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub client_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub fired_at: DateTime<Utc>,
    pub notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
    /// Id of the newest snapshot row in the report a process or check alert
    /// was evaluated from. `None` for metric and lifecycle alerts.
    #[serde(default)]
    pub snapshot_id: Option<i64>,
}

impl Alert {
    /// Builds an unsaved alert fired now. The id is assigned on insert.
    pub fn new(
        client_id: impl Into<String>,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            client_id: client_id.into(),
            alert_type,
            severity,
            message: message.into(),
            fired_at: Utc::now(),
            notified: false,
            notified_at: None,
            snapshot_id: None,
        }
    }
}

/// A configured notification provider. `config` is an opaque JSON blob
/// decoded according to `provider_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertProvider {
    pub id: i64,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub name: String,
    pub enabled: bool,
    pub config: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAlertMute {
    pub id: i64,
    pub client_id: String,
    pub scope: MuteScope,
    /// Process friendly name or check key; empty for metric scopes.
    pub target: String,
    pub created_at: DateTime<Utc>,
}

/// Effective warn/crit percentages and streak length for one client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu_warn_pct: f64,
    pub cpu_crit_pct: f64,
    pub mem_warn_pct: f64,
    pub mem_crit_pct: f64,
    pub disk_warn_pct: f64,
    pub disk_crit_pct: f64,
    pub consecutive_checkins: u32,
}

impl Thresholds {
    pub const DEFAULT: Thresholds = Thresholds {
        cpu_warn_pct: 80.0,
        cpu_crit_pct: 95.0,
        mem_warn_pct: 85.0,
        mem_crit_pct: 95.0,
        disk_warn_pct: 80.0,
        disk_crit_pct: 90.0,
        consecutive_checkins: 1,
    };

    /// `(warn, crit)` for one metric.
    pub fn pair(&self, kind: MetricKind) -> (f64, f64) {
        match kind {
            MetricKind::Cpu => (self.cpu_warn_pct, self.cpu_crit_pct),
            MetricKind::Memory => (self.mem_warn_pct, self.mem_crit_pct),
            MetricKind::Disk => (self.disk_warn_pct, self.disk_crit_pct),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Delivery diagnostics for a provider test-send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAlertResult {
    pub provider: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_response: Option<String>,
}
