use crate::error::{Result, StorageError};
use crate::{AlertFilter, ClientUpsert, PruneStats, SnapshotStore};
use chrono::{DateTime, Duration, Utc};
use machinemon_common::types::{
    check_key, Alert, AlertProvider, AlertType, CheckInRequest, CheckPayload, CheckSnapshot,
    Client, ClientAlertMute, ClientThresholdOverrides, ClientWithMetrics, Metric, MetricsPayload,
    MuteScope, ProcessPayload, ProcessSnapshot, WatchedProcess,
};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS clients (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    custom_name TEXT NOT NULL DEFAULT '',
    interface_ips TEXT NOT NULL DEFAULT '[]',
    os TEXT NOT NULL DEFAULT '',
    arch TEXT NOT NULL DEFAULT '',
    client_version TEXT NOT NULL DEFAULT '',
    first_seen_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    session_id TEXT,
    session_started_at INTEGER NOT NULL,
    is_online INTEGER NOT NULL DEFAULT 1,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    cpu_warn_pct REAL,
    cpu_crit_pct REAL,
    mem_warn_pct REAL,
    mem_crit_pct REAL,
    disk_warn_pct REAL,
    disk_crit_pct REAL,
    offline_threshold_seconds INTEGER,
    metric_consecutive_checkins INTEGER,
    alerts_muted INTEGER NOT NULL DEFAULT 0,
    muted_until INTEGER,
    mute_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_clients_online ON clients(is_online, is_deleted);

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    cpu_pct REAL NOT NULL,
    mem_pct REAL NOT NULL,
    disk_pct REAL NOT NULL,
    mem_total_bytes INTEGER NOT NULL DEFAULT 0,
    mem_used_bytes INTEGER NOT NULL DEFAULT 0,
    disk_total_bytes INTEGER NOT NULL DEFAULT 0,
    disk_used_bytes INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_metrics_client ON metrics(client_id, id);
CREATE INDEX IF NOT EXISTS idx_metrics_time ON metrics(recorded_at);

CREATE TABLE IF NOT EXISTS watched_processes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    friendly_name TEXT NOT NULL,
    match_pattern TEXT NOT NULL,
    match_type TEXT NOT NULL DEFAULT 'substring',
    UNIQUE(client_id, friendly_name)
);

CREATE TABLE IF NOT EXISTS process_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    friendly_name TEXT NOT NULL,
    report_seq INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL,
    uptime_since_at INTEGER NOT NULL,
    is_running INTEGER NOT NULL,
    pid INTEGER,
    cpu_pct REAL NOT NULL DEFAULT 0,
    mem_pct REAL NOT NULL DEFAULT 0,
    cmdline TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_process_snapshots_key ON process_snapshots(client_id, friendly_name, id);
CREATE INDEX IF NOT EXISTS idx_process_snapshots_seq ON process_snapshots(client_id, report_seq);
CREATE INDEX IF NOT EXISTS idx_process_snapshots_time ON process_snapshots(recorded_at);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    alert_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    fired_at INTEGER NOT NULL,
    notified INTEGER NOT NULL DEFAULT 0,
    notified_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_alerts_client_type ON alerts(client_id, alert_type, id);
CREATE INDEX IF NOT EXISTS idx_alerts_fired ON alerts(fired_at);
CREATE INDEX IF NOT EXISTS idx_alerts_unnotified ON alerts(notified);

CREATE TABLE IF NOT EXISTS alert_providers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    name TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1,
    config TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS global_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const SCHEMA_V2: &str = "
CREATE TABLE IF NOT EXISTS check_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    friendly_name TEXT NOT NULL,
    check_type TEXT NOT NULL,
    report_seq INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL,
    uptime_since_at INTEGER NOT NULL,
    healthy INTEGER NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_check_snapshots_key ON check_snapshots(client_id, friendly_name, check_type, id);
CREATE INDEX IF NOT EXISTS idx_check_snapshots_seq ON check_snapshots(client_id, report_seq);
CREATE INDEX IF NOT EXISTS idx_check_snapshots_time ON check_snapshots(recorded_at);

CREATE TABLE IF NOT EXISTS client_alert_mutes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    target TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    UNIQUE(client_id, scope, target)
);
";

const SCHEMA_V3: &str = "
ALTER TABLE alerts ADD COLUMN snapshot_id INTEGER;
";

/// Schema migrations, applied in order. `PRAGMA user_version` records how many ran.
const MIGRATIONS: &[&str] = &[SCHEMA_V1, SCHEMA_V2, SCHEMA_V3];

const CLIENT_COLUMNS: &str = "c.id, c.hostname, c.custom_name, c.interface_ips, c.os, c.arch,
    c.client_version, c.first_seen_at, c.last_seen_at, c.session_id, c.session_started_at,
    c.is_online, c.is_deleted, c.cpu_warn_pct, c.cpu_crit_pct, c.mem_warn_pct, c.mem_crit_pct,
    c.disk_warn_pct, c.disk_crit_pct, c.offline_threshold_seconds, c.metric_consecutive_checkins,
    c.alerts_muted, c.muted_until, c.mute_reason";
const CLIENT_COLUMN_COUNT: usize = 24;

const METRIC_COLUMNS: &str = "m.id, m.client_id, m.recorded_at, m.cpu_pct, m.mem_pct, m.disk_pct,
    m.mem_total_bytes, m.mem_used_bytes, m.disk_total_bytes, m.disk_used_bytes";

const PROCESS_SNAPSHOT_COLUMNS: &str = "ps.id, ps.client_id, ps.friendly_name, ps.recorded_at,
    ps.uptime_since_at, ps.is_running, ps.pid, ps.cpu_pct, ps.mem_pct, ps.cmdline";

const CHECK_SNAPSHOT_COLUMNS: &str = "cs.id, cs.client_id, cs.friendly_name, cs.check_type,
    cs.recorded_at, cs.uptime_since_at, cs.healthy, cs.message, cs.state";

const ALERT_COLUMNS: &str =
    "id, client_id, alert_type, severity, message, fired_at, notified, notified_at, snapshot_id";

const PROVIDER_COLUMNS: &str = "id, type, name, enabled, config, created_at";

/// Milliseconds since the epoch according to SQLite's own clock.
const SQL_NOW_MS: &str = "CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER)";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (creating if needed) `data_dir/file_name` and applies pending migrations.
    pub fn open(data_dir: &Path, file_name: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(file_name);
        let mut conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let applied = migrate(&mut conn)?;
        tracing::info!(
            path = %db_path.display(),
            migrations_applied = applied,
            "Initialized snapshot store"
        );
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn migrate(conn: &mut Connection) -> Result<usize> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let mut applied = 0;
    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(version.max(0) as usize) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", (idx + 1) as i64)?;
        tx.commit()?;
        tracing::debug!(version = idx + 1, "Applied schema migration");
        applied += 1;
    }
    Ok(applied)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn ensure_updated(changed: usize, entity: &'static str, id: &str) -> Result<()> {
    if changed == 0 {
        return Err(StorageError::NotFound {
            entity,
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Trimmed, de-duplicated and sorted, stored as a JSON array.
fn encode_interface_ips(ips: &[String]) -> Result<String> {
    let mut cleaned: Vec<&str> = ips
        .iter()
        .map(|ip| ip.trim())
        .filter(|ip| !ip.is_empty())
        .collect();
    cleaned.sort_unstable();
    cleaned.dedup();
    Ok(serde_json::to_string(&cleaned)?)
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<Client> {
    let interface_ips: String = row.get(3)?;
    Ok(Client {
        id: row.get(0)?,
        hostname: row.get(1)?,
        custom_name: row.get(2)?,
        interface_ips: serde_json::from_str(&interface_ips).unwrap_or_default(),
        os: row.get(4)?,
        arch: row.get(5)?,
        client_version: row.get(6)?,
        first_seen_at: to_datetime(row.get(7)?),
        last_seen_at: to_datetime(row.get(8)?),
        session_id: row.get(9)?,
        session_started_at: to_datetime(row.get(10)?),
        is_online: row.get(11)?,
        is_deleted: row.get(12)?,
        cpu_warn_pct: row.get(13)?,
        cpu_crit_pct: row.get(14)?,
        mem_warn_pct: row.get(15)?,
        mem_crit_pct: row.get(16)?,
        disk_warn_pct: row.get(17)?,
        disk_crit_pct: row.get(18)?,
        offline_threshold_seconds: row.get(19)?,
        metric_consecutive_checkins: row
            .get::<_, Option<i64>>(20)?
            .and_then(|n| u32::try_from(n).ok()),
        alerts_muted: row.get(21)?,
        muted_until: row.get::<_, Option<i64>>(22)?.map(to_datetime),
        mute_reason: row.get(23)?,
    })
}

/// Reads [`METRIC_COLUMNS`] starting at column `base`.
fn metric_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Metric> {
    Ok(Metric {
        id: row.get(base)?,
        client_id: row.get(base + 1)?,
        recorded_at: to_datetime(row.get(base + 2)?),
        cpu_pct: row.get(base + 3)?,
        mem_pct: row.get(base + 4)?,
        disk_pct: row.get(base + 5)?,
        mem_total_bytes: row.get::<_, i64>(base + 6)? as u64,
        mem_used_bytes: row.get::<_, i64>(base + 7)? as u64,
        disk_total_bytes: row.get::<_, i64>(base + 8)? as u64,
        disk_used_bytes: row.get::<_, i64>(base + 9)? as u64,
    })
}

fn process_snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessSnapshot> {
    Ok(ProcessSnapshot {
        id: row.get(0)?,
        client_id: row.get(1)?,
        friendly_name: row.get(2)?,
        recorded_at: to_datetime(row.get(3)?),
        uptime_since_at: to_datetime(row.get(4)?),
        is_running: row.get(5)?,
        pid: row.get(6)?,
        cpu_pct: row.get(7)?,
        mem_pct: row.get(8)?,
        cmdline: row.get(9)?,
    })
}

fn check_snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<CheckSnapshot> {
    Ok(CheckSnapshot {
        id: row.get(0)?,
        client_id: row.get(1)?,
        friendly_name: row.get(2)?,
        check_type: row.get(3)?,
        recorded_at: to_datetime(row.get(4)?),
        uptime_since_at: to_datetime(row.get(5)?),
        healthy: row.get(6)?,
        message: row.get(7)?,
        state: row.get(8)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get(0)?,
        client_id: row.get(1)?,
        alert_type: parse_column(row, 2)?,
        severity: parse_column(row, 3)?,
        message: row.get(4)?,
        fired_at: to_datetime(row.get(5)?),
        notified: row.get(6)?,
        notified_at: row.get::<_, Option<i64>>(7)?.map(to_datetime),
        snapshot_id: row.get(8)?,
    })
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<AlertProvider> {
    Ok(AlertProvider {
        id: row.get(0)?,
        provider_type: row.get(1)?,
        name: row.get(2)?,
        enabled: row.get(3)?,
        config: row.get(4)?,
        created_at: to_datetime(row.get(5)?),
    })
}

/// Validates a mute rule and returns its canonical target.
fn normalize_mute_target(scope: MuteScope, target: &str) -> Result<String> {
    let target = target.trim();
    match (scope.requires_target(), target.is_empty()) {
        (true, true) => Err(StorageError::InvalidMute(format!(
            "scope '{scope}' requires a target"
        ))),
        (false, false) => Err(StorageError::InvalidMute(format!(
            "scope '{scope}' does not take a target (got '{target}')"
        ))),
        _ if scope == MuteScope::Check => Ok(match target.split_once("::") {
            Some((name, check_type)) => check_key(name, check_type),
            None => target.to_string(),
        }),
        _ => Ok(target.to_string()),
    }
}

/// Next batch number for a client's snapshot table. Every row written by one
/// insert call shares the same sequence value.
fn next_report_seq(tx: &Transaction<'_>, table: &str, client_id: &str) -> Result<i64> {
    let sql = format!("SELECT COALESCE(MAX(report_seq), 0) + 1 FROM {table} WHERE client_id = ?1");
    Ok(tx.query_row(&sql, params![client_id], |row| row.get(0))?)
}

impl SqliteStore {
    fn query_process_snapshots(&self, sql: &str, client_id: &str) -> Result<Vec<ProcessSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![client_id], process_snapshot_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_check_snapshots(&self, sql: &str, client_id: &str) -> Result<Vec<CheckSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![client_id], check_snapshot_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl SnapshotStore for SqliteStore {
    fn upsert_client(&self, req: &CheckInRequest) -> Result<ClientUpsert> {
        let now = now_ms();
        let interface_ips = encode_interface_ips(&req.interface_ips)?;
        let session_id = req
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let conn = self.conn();

        if let Some(id) = req.client_id.as_deref().filter(|id| !id.trim().is_empty()) {
            let existing = conn
                .query_row(
                    "SELECT is_online, session_id FROM clients WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, bool>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()?;

            if let Some((is_online, old_session)) = existing {
                let session_changed = match (session_id, old_session.as_deref()) {
                    (Some(new), Some(old)) => !old.is_empty() && old != new,
                    _ => false,
                };
                conn.execute(
                    "UPDATE clients SET hostname = ?1, os = ?2, arch = ?3, client_version = ?4,
                        interface_ips = ?5, last_seen_at = ?6, is_online = 1, is_deleted = 0,
                        session_id = ?7,
                        session_started_at = CASE WHEN ?8 THEN ?6 ELSE session_started_at END
                     WHERE id = ?9",
                    params![
                        &req.hostname,
                        &req.os,
                        &req.arch,
                        &req.client_version,
                        interface_ips,
                        now,
                        session_id,
                        session_changed,
                        id,
                    ],
                )?;
                return Ok(ClientUpsert {
                    client_id: id.to_string(),
                    was_offline: !is_online,
                    session_changed,
                });
            }
        }

        let id = machinemon_common::id::new_client_id();
        conn.execute(
            "INSERT INTO clients (id, hostname, os, arch, client_version, interface_ips,
                first_seen_at, last_seen_at, session_id, session_started_at, is_online)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?7, 1)",
            params![
                id,
                &req.hostname,
                &req.os,
                &req.arch,
                &req.client_version,
                interface_ips,
                now,
                session_id,
            ],
        )?;
        tracing::info!(client_id = %id, hostname = %req.hostname, "Registered new client");
        Ok(ClientUpsert {
            client_id: id,
            was_offline: false,
            session_changed: false,
        })
    }

    fn get_client(&self, id: &str) -> Result<Option<Client>> {
        let conn = self.conn();
        let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients c WHERE c.id = ?1");
        Ok(conn
            .query_row(&sql, params![id], client_from_row)
            .optional()?)
    }

    fn list_clients(&self) -> Result<Vec<ClientWithMetrics>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {CLIENT_COLUMNS}, {METRIC_COLUMNS},
                (SELECT COUNT(*) FROM watched_processes wp WHERE wp.client_id = c.id)
             FROM clients c
             LEFT JOIN metrics m ON m.id = (SELECT MAX(id) FROM metrics WHERE client_id = c.id)
             WHERE c.is_deleted = 0
             ORDER BY COALESCE(NULLIF(TRIM(c.custom_name), ''), c.hostname), c.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let client = client_from_row(row)?;
            let latest_metrics = match row.get::<_, Option<i64>>(CLIENT_COLUMN_COUNT)? {
                Some(_) => Some(metric_from_row(row, CLIENT_COLUMN_COUNT)?),
                None => None,
            };
            let process_count: i64 = row.get(CLIENT_COLUMN_COUNT + 10)?;
            Ok(ClientWithMetrics {
                client,
                latest_metrics,
                process_count: process_count as u32,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_client(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute("UPDATE clients SET is_deleted = 1 WHERE id = ?1", params![id])?;
        if changed > 0 {
            tracing::info!(client_id = %id, "Client deleted");
        }
        Ok(changed > 0)
    }

    fn set_client_online(&self, id: &str, online: bool) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE clients SET is_online = ?1 WHERE id = ?2",
            params![online, id],
        )?;
        ensure_updated(changed, "client", id)
    }

    fn set_client_thresholds(
        &self,
        id: &str,
        overrides: Option<&ClientThresholdOverrides>,
    ) -> Result<()> {
        let o = overrides.cloned().unwrap_or_default();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE clients SET cpu_warn_pct = ?1, cpu_crit_pct = ?2, mem_warn_pct = ?3,
                mem_crit_pct = ?4, disk_warn_pct = ?5, disk_crit_pct = ?6,
                offline_threshold_seconds = ?7, metric_consecutive_checkins = ?8
             WHERE id = ?9",
            params![
                o.cpu_warn_pct,
                o.cpu_crit_pct,
                o.mem_warn_pct,
                o.mem_crit_pct,
                o.disk_warn_pct,
                o.disk_crit_pct,
                o.offline_threshold_seconds.filter(|s| *s > 0),
                o.metric_consecutive_checkins.filter(|n| *n > 0),
                id,
            ],
        )?;
        ensure_updated(changed, "client", id)
    }

    fn set_client_custom_name(&self, id: &str, name: &str) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE clients SET custom_name = ?1 WHERE id = ?2",
            params![name.trim(), id],
        )?;
        ensure_updated(changed, "client", id)
    }

    fn set_client_mute(
        &self,
        id: &str,
        muted: bool,
        until: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        let (until, reason) = if muted {
            (until.map(|t| t.timestamp_millis()), reason)
        } else {
            (None, None)
        };
        let changed = conn.execute(
            "UPDATE clients SET alerts_muted = ?1, muted_until = ?2, mute_reason = ?3 WHERE id = ?4",
            params![muted, until, reason, id],
        )?;
        ensure_updated(changed, "client", id)
    }

    fn get_stale_online_clients(&self, default_threshold_secs: i64) -> Result<Vec<Client>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM clients c
             WHERE c.is_online = 1 AND c.is_deleted = 0
               AND c.last_seen_at <= {SQL_NOW_MS}
                   - COALESCE(c.offline_threshold_seconds, ?1) * 1000"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![default_threshold_secs], client_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_client_alert_mutes(&self, client_id: &str) -> Result<Vec<ClientAlertMute>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, client_id, scope, target, created_at FROM client_alert_mutes
             WHERE client_id = ?1 ORDER BY scope, target",
        )?;
        let rows = stmt.query_map(params![client_id], |row| {
            Ok(ClientAlertMute {
                id: row.get(0)?,
                client_id: row.get(1)?,
                scope: parse_column(row, 2)?,
                target: row.get(3)?,
                created_at: to_datetime(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn set_client_alert_mute(
        &self,
        client_id: &str,
        scope: MuteScope,
        target: &str,
        muted: bool,
    ) -> Result<()> {
        let target = normalize_mute_target(scope, target)?;
        let conn = self.conn();
        if muted {
            conn.execute(
                "INSERT INTO client_alert_mutes (client_id, scope, target, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(client_id, scope, target) DO NOTHING",
                params![client_id, scope.as_str(), target, now_ms()],
            )?;
        } else {
            conn.execute(
                "DELETE FROM client_alert_mutes WHERE client_id = ?1 AND scope = ?2 AND target = ?3",
                params![client_id, scope.as_str(), target],
            )?;
        }
        Ok(())
    }

    fn insert_metrics(&self, client_id: &str, payload: &MetricsPayload) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO metrics (client_id, recorded_at, cpu_pct, mem_pct, disk_pct,
                mem_total_bytes, mem_used_bytes, disk_total_bytes, disk_used_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                client_id,
                now_ms(),
                payload.cpu_pct,
                payload.mem_pct,
                payload.disk_pct,
                payload.mem_total_bytes as i64,
                payload.mem_used_bytes as i64,
                payload.disk_total_bytes as i64,
                payload.disk_used_bytes as i64,
            ],
        )?;
        Ok(())
    }

    fn get_latest_metrics(&self, client_id: &str) -> Result<Option<Metric>> {
        Ok(self.get_recent_metrics(client_id, 1)?.into_iter().next())
    }

    fn get_metrics(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Metric>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {METRIC_COLUMNS} FROM metrics m
             WHERE m.client_id = ?1 AND m.recorded_at >= ?2 AND m.recorded_at <= ?3
             ORDER BY m.recorded_at ASC, m.id ASC LIMIT ?4"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                client_id,
                from.timestamp_millis(),
                to.timestamp_millis(),
                limit as i64
            ],
            |row| metric_from_row(row, 0),
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_recent_metrics(&self, client_id: &str, n: usize) -> Result<Vec<Metric>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {METRIC_COLUMNS} FROM metrics m
             WHERE m.client_id = ?1 ORDER BY m.id DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![client_id, n as i64], |row| metric_from_row(row, 0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn upsert_watched_processes(&self, client_id: &str, defs: &[ProcessPayload]) -> Result<()> {
        let declared: HashSet<&str> = defs.iter().map(|p| p.friendly_name.trim()).collect();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Vec<String> = {
            let mut stmt =
                tx.prepare_cached("SELECT friendly_name FROM watched_processes WHERE client_id = ?1")?;
            let rows = stmt.query_map(params![client_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for name in existing.iter().filter(|n| !declared.contains(n.as_str())) {
            tx.execute(
                "DELETE FROM watched_processes WHERE client_id = ?1 AND friendly_name = ?2",
                params![client_id, name],
            )?;
            tracing::debug!(client_id = %client_id, process = %name, "Watched process removed");
        }

        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO watched_processes (client_id, friendly_name, match_pattern, match_type)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(client_id, friendly_name) DO UPDATE SET
                    match_pattern = excluded.match_pattern,
                    match_type = excluded.match_type",
            )?;
            for p in defs {
                upsert.execute(params![
                    client_id,
                    p.friendly_name.trim(),
                    &p.match_pattern,
                    p.match_type.as_str(),
                ])?;
            }
        }

        // Snapshot history only exists for processes that are still watched.
        tx.execute(
            "DELETE FROM process_snapshots WHERE client_id = ?1 AND friendly_name NOT IN
                (SELECT friendly_name FROM watched_processes WHERE client_id = ?1)",
            params![client_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_watched_processes(&self, client_id: &str) -> Result<Vec<WatchedProcess>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, client_id, friendly_name, match_pattern, match_type
             FROM watched_processes WHERE client_id = ?1 ORDER BY friendly_name",
        )?;
        let rows = stmt.query_map(params![client_id], |row| {
            Ok(WatchedProcess {
                id: row.get(0)?,
                client_id: row.get(1)?,
                friendly_name: row.get(2)?,
                match_pattern: row.get(3)?,
                match_type: parse_column(row, 4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_watched_process(&self, client_id: &str, friendly_name: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM watched_processes WHERE client_id = ?1 AND friendly_name = ?2",
            params![client_id, friendly_name.trim()],
        )?;
        tx.execute(
            "DELETE FROM process_snapshots WHERE client_id = ?1 AND friendly_name = ?2",
            params![client_id, friendly_name.trim()],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn insert_process_snapshots(&self, client_id: &str, procs: &[ProcessPayload]) -> Result<()> {
        if procs.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let seq = next_report_seq(&tx, "process_snapshots", client_id)?;
        {
            let mut previous = tx.prepare_cached(
                "SELECT is_running, pid, uptime_since_at FROM process_snapshots
                 WHERE client_id = ?1 AND friendly_name = ?2 ORDER BY id DESC LIMIT 1",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO process_snapshots (client_id, friendly_name, report_seq, recorded_at,
                    uptime_since_at, is_running, pid, cpu_pct, mem_pct, cmdline)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for p in procs {
                let name = p.friendly_name.trim();
                let pid = p.pid();
                let prev = previous
                    .query_row(params![client_id, name], |row| {
                        Ok((
                            row.get::<_, bool>(0)?,
                            row.get::<_, Option<i32>>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })
                    .optional()?;
                let uptime_since = match prev {
                    Some((was_running, prev_pid, since))
                        if was_running == p.is_running && prev_pid.filter(|v| *v > 0) == pid =>
                    {
                        since
                    }
                    _ => now,
                };
                insert.execute(params![
                    client_id,
                    name,
                    seq,
                    now,
                    uptime_since,
                    p.is_running,
                    pid,
                    p.cpu_pct,
                    p.mem_pct,
                    &p.cmdline,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_latest_process_snapshots(&self, client_id: &str) -> Result<Vec<ProcessSnapshot>> {
        let sql = format!(
            "SELECT {PROCESS_SNAPSHOT_COLUMNS} FROM process_snapshots ps
             JOIN watched_processes wp
               ON wp.client_id = ps.client_id AND wp.friendly_name = ps.friendly_name
             WHERE ps.id IN (
                SELECT MAX(id) FROM process_snapshots WHERE client_id = ?1 GROUP BY friendly_name
             )
             ORDER BY ps.friendly_name"
        );
        self.query_process_snapshots(&sql, client_id)
    }

    fn get_previous_process_snapshots(&self, client_id: &str) -> Result<Vec<ProcessSnapshot>> {
        let sql = format!(
            "SELECT {PROCESS_SNAPSHOT_COLUMNS} FROM process_snapshots ps
             JOIN watched_processes wp
               ON wp.client_id = ps.client_id AND wp.friendly_name = ps.friendly_name
             WHERE ps.id IN (
                SELECT MAX(id) FROM process_snapshots
                WHERE client_id = ?1 AND report_seq < (
                    SELECT MAX(report_seq) FROM process_snapshots WHERE client_id = ?1
                )
                GROUP BY friendly_name
             )
             ORDER BY ps.friendly_name"
        );
        self.query_process_snapshots(&sql, client_id)
    }

    fn insert_check_snapshots(&self, client_id: &str, checks: &[CheckPayload]) -> Result<()> {
        if checks.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let seq = next_report_seq(&tx, "check_snapshots", client_id)?;
        {
            let mut previous = tx.prepare_cached(
                "SELECT healthy, uptime_since_at FROM check_snapshots
                 WHERE client_id = ?1 AND friendly_name = ?2 AND check_type = ?3
                 ORDER BY id DESC LIMIT 1",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO check_snapshots (client_id, friendly_name, check_type, report_seq,
                    recorded_at, uptime_since_at, healthy, message, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for c in checks {
                let name = c.friendly_name.trim();
                let check_type = c.check_type.trim();
                let prev = previous
                    .query_row(params![client_id, name, check_type], |row| {
                        Ok((row.get::<_, bool>(0)?, row.get::<_, i64>(1)?))
                    })
                    .optional()?;
                let uptime_since = match prev {
                    Some((was_healthy, since)) if was_healthy == c.healthy => since,
                    _ => now,
                };
                insert.execute(params![
                    client_id,
                    name,
                    check_type,
                    seq,
                    now,
                    uptime_since,
                    c.healthy,
                    &c.message,
                    &c.state,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_latest_check_snapshots(&self, client_id: &str) -> Result<Vec<CheckSnapshot>> {
        let sql = format!(
            "SELECT {CHECK_SNAPSHOT_COLUMNS} FROM check_snapshots cs
             WHERE cs.id IN (
                SELECT MAX(id) FROM check_snapshots WHERE client_id = ?1
                GROUP BY friendly_name, check_type
             )
             ORDER BY cs.friendly_name, cs.check_type"
        );
        self.query_check_snapshots(&sql, client_id)
    }

    fn get_previous_check_snapshots(&self, client_id: &str) -> Result<Vec<CheckSnapshot>> {
        let sql = format!(
            "SELECT {CHECK_SNAPSHOT_COLUMNS} FROM check_snapshots cs
             WHERE cs.id IN (
                SELECT MAX(id) FROM check_snapshots
                WHERE client_id = ?1 AND report_seq < (
                    SELECT MAX(report_seq) FROM check_snapshots WHERE client_id = ?1
                )
                GROUP BY friendly_name, check_type
             )
             ORDER BY cs.friendly_name, cs.check_type"
        );
        self.query_check_snapshots(&sql, client_id)
    }

    fn delete_check_snapshots(
        &self,
        client_id: &str,
        friendly_name: &str,
        check_type: Option<&str>,
    ) -> Result<usize> {
        let conn = self.conn();
        let removed = match check_type.map(str::trim).filter(|t| !t.is_empty()) {
            Some(check_type) => conn.execute(
                "DELETE FROM check_snapshots
                 WHERE client_id = ?1 AND friendly_name = ?2 AND check_type = ?3",
                params![client_id, friendly_name.trim(), check_type],
            )?,
            None => conn.execute(
                "DELETE FROM check_snapshots WHERE client_id = ?1 AND friendly_name = ?2",
                params![client_id, friendly_name.trim()],
            )?,
        };
        Ok(removed)
    }

    fn insert_alert(&self, alert: &Alert) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO alerts (client_id, alert_type, severity, message, fired_at, notified,
                                 notified_at, snapshot_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &alert.client_id,
                alert.alert_type.to_string(),
                alert.severity.to_string(),
                &alert.message,
                alert.fired_at.timestamp_millis(),
                alert.notified,
                alert.notified_at.map(|t| t.timestamp_millis()),
                alert.snapshot_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn mark_alert_notified(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE alerts SET notified = 1, notified_at = ?1 WHERE id = ?2",
            params![now_ms(), id],
        )?;
        ensure_updated(changed, "alert", &id.to_string())
    }

    fn get_unnotified_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE notified = 0 ORDER BY id ASC LIMIT ?1"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![limit as i64], alert_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_alerts(
        &self,
        filter: &AlertFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Alert>, u64)> {
        let mut where_sql = String::from(" WHERE 1 = 1");
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(client_id) = &filter.client_id {
            params.push(Box::new(client_id.clone()));
            where_sql.push_str(&format!(" AND client_id = ?{}", params.len()));
        }
        if let Some(severity) = filter.severity {
            params.push(Box::new(severity.to_string()));
            where_sql.push_str(&format!(" AND severity = ?{}", params.len()));
        }

        let conn = self.conn();
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM alerts{where_sql}"),
            param_refs.as_slice(),
            |row| row.get(0),
        )?;

        let page_sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts{where_sql} ORDER BY id DESC LIMIT ?{} OFFSET ?{}",
            params.len() + 1,
            params.len() + 2
        );
        let limit = limit as i64;
        let offset = offset as i64;
        let mut page_refs = param_refs;
        page_refs.push(&limit);
        page_refs.push(&offset);
        let mut stmt = conn.prepare(&page_sql)?;
        let rows = stmt.query_map(page_refs.as_slice(), alert_from_row)?;
        let alerts = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((alerts, total as u64))
    }

    fn get_last_alert_by_types(
        &self,
        client_id: &str,
        types: &[AlertType],
    ) -> Result<Option<Alert>> {
        if types.is_empty() {
            return Ok(None);
        }
        let placeholders: Vec<String> = (0..types.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts
             WHERE client_id = ?1 AND alert_type IN ({})
             ORDER BY id DESC LIMIT 1",
            placeholders.join(", ")
        );
        let names: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        let mut params: Vec<&dyn ToSql> = vec![&client_id];
        params.extend(names.iter().map(|n| n as &dyn ToSql));

        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt
            .query_row(params.as_slice(), alert_from_row)
            .optional()?)
    }

    fn get_last_alerted_snapshot(
        &self,
        client_id: &str,
        types: &[AlertType],
    ) -> Result<Option<i64>> {
        if types.is_empty() {
            return Ok(None);
        }
        let placeholders: Vec<String> = (0..types.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT MAX(snapshot_id) FROM alerts
             WHERE client_id = ?1 AND alert_type IN ({})",
            placeholders.join(", ")
        );
        let names: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        let mut params: Vec<&dyn ToSql> = vec![&client_id];
        params.extend(names.iter().map(|n| n as &dyn ToSql));

        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params.as_slice(), |row| row.get(0))?)
    }

    fn list_providers(&self) -> Result<Vec<AlertProvider>> {
        let conn = self.conn();
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM alert_providers ORDER BY id");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], provider_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_provider(&self, id: i64) -> Result<Option<AlertProvider>> {
        let conn = self.conn();
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM alert_providers WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id], provider_from_row)
            .optional()?)
    }

    fn create_provider(
        &self,
        provider_type: &str,
        name: &str,
        enabled: bool,
        config: &str,
    ) -> Result<AlertProvider> {
        let created_at = now_ms();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO alert_providers (type, name, enabled, config, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![provider_type, name, enabled, config, created_at],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(provider_id = id, provider_type = %provider_type, name = %name, "Alert provider created");
        Ok(AlertProvider {
            id,
            provider_type: provider_type.to_string(),
            name: name.to_string(),
            enabled,
            config: config.to_string(),
            created_at: to_datetime(created_at),
        })
    }

    fn update_provider(&self, id: i64, name: &str, enabled: bool, config: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE alert_providers SET name = ?1, enabled = ?2, config = ?3 WHERE id = ?4",
            params![name, enabled, config, id],
        )?;
        Ok(changed > 0)
    }

    fn delete_provider(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM alert_providers WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn get_enabled_providers(&self) -> Result<Vec<AlertProvider>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {PROVIDER_COLUMNS} FROM alert_providers WHERE enabled = 1 ORDER BY id"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], provider_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT value FROM global_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO global_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT key, value FROM global_settings")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    fn prune_old_data(
        &self,
        metrics_retention_days: u32,
        alerts_retention_days: u32,
    ) -> Result<PruneStats> {
        let now = Utc::now();
        let metrics_cutoff =
            (now - Duration::days(i64::from(metrics_retention_days))).timestamp_millis();
        let alerts_cutoff =
            (now - Duration::days(i64::from(alerts_retention_days))).timestamp_millis();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let stats = PruneStats {
            metrics: tx.execute(
                "DELETE FROM metrics WHERE recorded_at < ?1",
                params![metrics_cutoff],
            )? as u64,
            process_snapshots: tx.execute(
                "DELETE FROM process_snapshots WHERE recorded_at < ?1",
                params![metrics_cutoff],
            )? as u64,
            check_snapshots: tx.execute(
                "DELETE FROM check_snapshots WHERE recorded_at < ?1",
                params![metrics_cutoff],
            )? as u64,
            alerts: tx.execute(
                "DELETE FROM alerts WHERE fired_at < ?1",
                params![alerts_cutoff],
            )? as u64,
        };
        tx.commit()?;
        Ok(stats)
    }
}

/// Row backdating for tests that exercise time thresholds without sleeping.
#[cfg(any(test, feature = "test-util"))]
impl SqliteStore {
    /// Sets the client's last check-in to `age` before now.
    pub fn backdate_client_last_seen(&self, client_id: &str, age: Duration) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE clients SET last_seen_at = ?1 WHERE id = ?2",
            params![(Utc::now() - age).timestamp_millis(), client_id],
        )?;
        ensure_updated(changed, "client", client_id)
    }

    /// Moves every metric and snapshot row of the client to `age` before now.
    pub fn backdate_samples(&self, client_id: &str, age: Duration) -> Result<()> {
        let ts = (Utc::now() - age).timestamp_millis();
        let conn = self.conn();
        for table in ["metrics", "process_snapshots", "check_snapshots"] {
            conn.execute(
                &format!("UPDATE {table} SET recorded_at = ?1 WHERE client_id = ?2"),
                params![ts, client_id],
            )?;
        }
        Ok(())
    }

    /// Moves every alert of the client to `age` before now.
    pub fn backdate_alerts(&self, client_id: &str, age: Duration) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE alerts SET fired_at = ?1 WHERE client_id = ?2",
            params![(Utc::now() - age).timestamp_millis(), client_id],
        )?;
        Ok(())
    }
}
