//! SQLite-backed store implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::models::*;
use super::store::{is_due, AuditLogger, IncidentsGateway, MonitorStore, StoreError};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const STATE_COLUMNS: &str = "monitor_id, status, last_checked_at, last_up_at, last_down_at, \
     last_latency_ms, last_status_code, last_error, last_error_kind, retry_attempt, retry_at, \
     tls_days_left, maintenance_active";

const SLA_COLUMNS: &str = "monitor_id, period_type, period_start, period_end, uptime_pct, \
     coverage_pct, target_pct, status, observed_checks, expected_checks, incident_created, \
     evaluated_at";

/// Thread-safe SQLite store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Configuration writes (operator side) ---

    /// Add a monitor and return its ID.
    pub fn add_monitor(&self, monitor: &mut Monitor) -> Result<MonitorId, StoreError> {
        let config = serde_json::to_string(&*monitor)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO monitors (name, paused, created_at, config) VALUES (?1, ?2, ?3, ?4)",
            params![
                monitor.name,
                monitor.paused,
                fmt_time(monitor.created_at),
                config
            ],
        )?;
        monitor.id = conn.last_insert_rowid();
        Ok(monitor.id)
    }

    pub fn add_maintenance_window(&self, window: &mut MaintenanceWindow) -> Result<i64, StoreError> {
        let monitor_ids = serde_json::to_string(&window.monitor_ids)?;
        let tags = serde_json::to_string(&window.tags)?;
        let strategy = serde_json::to_string(&window.strategy)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO maintenance_windows (name, monitor_ids, tags, timezone, active_from, active_until, strategy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                window.name,
                monitor_ids,
                tags,
                window.timezone,
                window.active_from.map(fmt_time),
                window.active_until.map(fmt_time),
                strategy,
            ],
        )?;
        window.id = conn.last_insert_rowid();
        Ok(window.id)
    }

    pub fn set_sla_policy(&self, policy: &MonitorSlaPolicy) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sla_policies (monitor_id, auto_incident, incident_period, min_coverage_pct)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(monitor_id) DO UPDATE SET
             auto_incident=excluded.auto_incident, incident_period=excluded.incident_period,
             min_coverage_pct=excluded.min_coverage_pct",
            params![
                policy.monitor_id,
                policy.auto_incident,
                policy.incident_period.as_str(),
                policy.min_coverage_pct,
            ],
        )?;
        Ok(())
    }

    fn load_monitors(conn: &Connection) -> Result<Vec<Monitor>, StoreError> {
        let mut stmt =
            conn.prepare("SELECT id, paused, created_at, config FROM monitors ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, paused, created_at, config)| {
                let mut monitor: Monitor = serde_json::from_str(&config)?;
                monitor.id = id;
                monitor.paused = paused;
                monitor.created_at = parse_db_time(&created_at).unwrap_or(monitor.created_at);
                Ok(monitor)
            })
            .collect()
    }

    fn load_states(conn: &Connection) -> Result<HashMap<MonitorId, MonitorState>, StoreError> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM monitor_state", STATE_COLUMNS))?;
        let states = stmt
            .query_map([], state_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(states.into_iter().map(|s| (s.monitor_id, s)).collect())
    }
}

#[async_trait]
impl MonitorStore for SqliteStore {
    async fn list_monitors(&self) -> Result<Vec<Monitor>, StoreError> {
        let conn = self.conn();
        Self::load_monitors(&conn)
    }

    async fn get_monitor(&self, id: MonitorId) -> Result<Option<Monitor>, StoreError> {
        let conn = self.conn();
        Ok(Self::load_monitors(&conn)?.into_iter().find(|m| m.id == id))
    }

    async fn list_due_monitors(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>, StoreError> {
        let conn = self.conn();
        let states = Self::load_states(&conn)?;
        Ok(Self::load_monitors(&conn)?
            .into_iter()
            .filter(|m| is_due(m, states.get(&m.id), now))
            .collect())
    }

    async fn get_monitor_state(&self, id: MonitorId) -> Result<Option<MonitorState>, StoreError> {
        let conn = self.conn();
        let state = conn
            .query_row(
                &format!("SELECT {} FROM monitor_state WHERE monitor_id = ?1", STATE_COLUMNS),
                params![id],
                state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    async fn upsert_monitor_state(&self, state: &MonitorState) -> Result<(), StoreError> {
        self.conn().execute(
            &format!(
                "INSERT INTO monitor_state ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(monitor_id) DO UPDATE SET
                 status=excluded.status, last_checked_at=excluded.last_checked_at,
                 last_up_at=excluded.last_up_at, last_down_at=excluded.last_down_at,
                 last_latency_ms=excluded.last_latency_ms, last_status_code=excluded.last_status_code,
                 last_error=excluded.last_error, last_error_kind=excluded.last_error_kind,
                 retry_attempt=excluded.retry_attempt, retry_at=excluded.retry_at,
                 tls_days_left=excluded.tls_days_left, maintenance_active=excluded.maintenance_active",
                STATE_COLUMNS
            ),
            params![
                state.monitor_id,
                state.status.as_str(),
                state.last_checked_at.map(fmt_time),
                state.last_up_at.map(fmt_time),
                state.last_down_at.map(fmt_time),
                state.last_latency_ms.map(|v| v as i64),
                state.last_status_code.map(|v| v as i64),
                state.last_error,
                state.last_error_kind.map(|k| k.as_str()),
                state.retry_attempt as i64,
                state.retry_at.map(fmt_time),
                state.tls_days_left,
                state.maintenance_active,
            ],
        )?;
        Ok(())
    }

    async fn get_notification_state(
        &self,
        id: MonitorId,
    ) -> Result<Option<NotificationState>, StoreError> {
        let conn = self.conn();
        let state = conn
            .query_row(
                "SELECT monitor_id, last_status, last_down_notified_at, last_up_notified_at,
                        last_tls_notified_at, last_maintenance_notified_at
                 FROM notification_state WHERE monitor_id = ?1",
                params![id],
                |row| {
                    Ok(NotificationState {
                        monitor_id: row.get(0)?,
                        last_status: row
                            .get::<_, Option<String>>(1)?
                            .map(|s| MonitorStatus::parse(&s)),
                        last_down_notified_at: opt_time(row, 2)?,
                        last_up_notified_at: opt_time(row, 3)?,
                        last_tls_notified_at: opt_time(row, 4)?,
                        last_maintenance_notified_at: opt_time(row, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    async fn upsert_notification_state(&self, state: &NotificationState) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO notification_state (monitor_id, last_status, last_down_notified_at,
                 last_up_notified_at, last_tls_notified_at, last_maintenance_notified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(monitor_id) DO UPDATE SET
             last_status=excluded.last_status, last_down_notified_at=excluded.last_down_notified_at,
             last_up_notified_at=excluded.last_up_notified_at,
             last_tls_notified_at=excluded.last_tls_notified_at,
             last_maintenance_notified_at=excluded.last_maintenance_notified_at",
            params![
                state.monitor_id,
                state.last_status.map(|s| s.as_str()),
                state.last_down_notified_at.map(fmt_time),
                state.last_up_notified_at.map(fmt_time),
                state.last_tls_notified_at.map(fmt_time),
                state.last_maintenance_notified_at.map(fmt_time),
            ],
        )?;
        Ok(())
    }

    async fn list_sla_policies(&self) -> Result<Vec<MonitorSlaPolicy>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT monitor_id, auto_incident, incident_period, min_coverage_pct FROM sla_policies",
        )?;
        let policies = stmt
            .query_map([], |row| {
                let period: String = row.get(2)?;
                Ok(MonitorSlaPolicy {
                    monitor_id: row.get(0)?,
                    auto_incident: row.get(1)?,
                    incident_period: PeriodType::parse(&period).unwrap_or(PeriodType::Month),
                    min_coverage_pct: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(policies)
    }

    async fn upsert_sla_period_result(
        &self,
        result: &MonitorSlaPeriodResult,
    ) -> Result<MonitorSlaPeriodResult, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO sla_period_results ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(monitor_id, period_type, period_start) DO UPDATE SET
                 period_end=excluded.period_end, uptime_pct=excluded.uptime_pct,
                 coverage_pct=excluded.coverage_pct, target_pct=excluded.target_pct,
                 status=excluded.status, observed_checks=excluded.observed_checks,
                 expected_checks=excluded.expected_checks,
                 incident_created=MAX(sla_period_results.incident_created, excluded.incident_created),
                 evaluated_at=excluded.evaluated_at",
                SLA_COLUMNS
            ),
            params![
                result.monitor_id,
                result.period_type.as_str(),
                fmt_time(result.period_start),
                fmt_time(result.period_end),
                result.uptime_pct,
                result.coverage_pct,
                result.target_pct,
                result.status.as_str(),
                result.observed_checks as i64,
                result.expected_checks as i64,
                result.incident_created,
                fmt_time(result.evaluated_at),
            ],
        )?;
        let stored = tx.query_row(
            &format!(
                "SELECT {} FROM sla_period_results
                 WHERE monitor_id = ?1 AND period_type = ?2 AND period_start = ?3",
                SLA_COLUMNS
            ),
            params![
                result.monitor_id,
                result.period_type.as_str(),
                fmt_time(result.period_start)
            ],
            sla_from_row,
        )?;
        tx.commit()?;
        Ok(stored)
    }

    async fn maintenance_windows_for(
        &self,
        monitor_id: MonitorId,
        tags: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceWindow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, monitor_ids, tags, timezone, active_from, active_until, strategy
             FROM maintenance_windows",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    opt_time(row, 5)?,
                    opt_time(row, 6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut windows = Vec::new();
        for (id, name, monitor_ids, window_tags, timezone, active_from, active_until, strategy) in rows
        {
            let window = MaintenanceWindow {
                id,
                name,
                monitor_ids: serde_json::from_str(&monitor_ids)?,
                tags: serde_json::from_str(&window_tags)?,
                timezone,
                active_from,
                active_until,
                strategy: serde_json::from_str(&strategy)?,
            };
            let overlaps = window.active_from.map_or(true, |af| af < to)
                && window.active_until.map_or(true, |au| au > from);
            if overlaps && window.applies_to(monitor_id, tags) {
                windows.push(window);
            }
        }
        Ok(windows)
    }

    async fn insert_metric(&self, sample: &MetricSample) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO metrics (monitor_id, checked_at, ok, latency_ms, status_code, error_kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sample.monitor_id,
                fmt_time(sample.checked_at),
                sample.ok,
                sample.latency_ms.map(|v| v as i64),
                sample.status_code.map(|v| v as i64),
                sample.error_kind.map(|k| k.as_str()),
            ],
        )?;
        Ok(())
    }

    async fn list_metrics(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT monitor_id, checked_at, ok, latency_ms, status_code, error_kind FROM metrics
             WHERE monitor_id = ?1 AND checked_at >= ?2 ORDER BY checked_at ASC",
        )?;
        let rows = stmt
            .query_map(params![monitor_id, fmt_time(since)], |row| {
                let time_str: String = row.get(1)?;
                Ok(MetricSample {
                    monitor_id: row.get(0)?,
                    checked_at: parse_db_time(&time_str).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                    ok: row.get(2)?,
                    latency_ms: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                    status_code: row.get::<_, Option<i64>>(4)?.map(|v| v as u16),
                    error_kind: row
                        .get::<_, Option<String>>(5)?
                        .and_then(|s| ErrorKind::parse(&s)),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let deleted = self.conn().execute(
            "DELETE FROM metrics WHERE checked_at < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

#[async_trait]
impl IncidentsGateway for SqliteStore {
    async fn find_open_incident_by_source(
        &self,
        source: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let conn = self.conn();
        let incident = conn
            .query_row(
                "SELECT id, source, title, severity, description, status, opened_at, closed_at
                 FROM incidents WHERE source = ?1 AND status = 'open' ORDER BY id DESC LIMIT 1",
                params![source],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    async fn create_incident(&self, incident: NewIncident) -> Result<Incident, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO incidents (source, title, severity, description, status, opened_at)
             VALUES (?1, ?2, ?3, ?4, 'open', ?5)",
            params![
                incident.source,
                incident.title,
                incident.severity,
                incident.description,
                fmt_time(incident.opened_at),
            ],
        )?;
        Ok(Incident {
            id: conn.last_insert_rowid(),
            source: incident.source,
            title: incident.title,
            severity: incident.severity,
            description: incident.description,
            status: IncidentStatus::Open,
            opened_at: incident.opened_at,
            closed_at: None,
        })
    }

    async fn close_incident(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE incidents SET status = 'closed', closed_at = ?1 WHERE id = ?2",
            params![fmt_time(at), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn add_incident_timeline(
        &self,
        id: i64,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO incident_timeline (incident_id, at, message) VALUES (?1, ?2, ?3)",
            params![id, fmt_time(at), message],
        )?;
        Ok(())
    }
}

#[async_trait]
impl AuditLogger for SqliteStore {
    async fn log(
        &self,
        actor: &str,
        action: &str,
        details: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO audit_log (at, actor, action, details) VALUES (?1, ?2, ?3, ?4)",
            params![fmt_time(Utc::now()), actor, action, details.to_string()],
        )?;
        Ok(())
    }
}

fn state_from_row(row: &Row<'_>) -> SqlResult<MonitorState> {
    let status: String = row.get(1)?;
    Ok(MonitorState {
        monitor_id: row.get(0)?,
        status: MonitorStatus::parse(&status),
        last_checked_at: opt_time(row, 2)?,
        last_up_at: opt_time(row, 3)?,
        last_down_at: opt_time(row, 4)?,
        last_latency_ms: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        last_status_code: row.get::<_, Option<i64>>(6)?.map(|v| v as u16),
        last_error: row.get(7)?,
        last_error_kind: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| ErrorKind::parse(&s)),
        retry_attempt: row.get::<_, i64>(9)? as u32,
        retry_at: opt_time(row, 10)?,
        tls_days_left: row.get(11)?,
        maintenance_active: row.get(12)?,
    })
}

fn sla_from_row(row: &Row<'_>) -> SqlResult<MonitorSlaPeriodResult> {
    let period: String = row.get(1)?;
    let status: String = row.get(7)?;
    let start: String = row.get(2)?;
    let end: String = row.get(3)?;
    let evaluated: String = row.get(11)?;
    Ok(MonitorSlaPeriodResult {
        monitor_id: row.get(0)?,
        period_type: PeriodType::parse(&period).unwrap_or(PeriodType::Day),
        period_start: parse_db_time(&start).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        period_end: parse_db_time(&end).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        uptime_pct: row.get(4)?,
        coverage_pct: row.get(5)?,
        target_pct: row.get(6)?,
        status: SlaStatus::parse(&status),
        observed_checks: row.get::<_, i64>(8)? as u64,
        expected_checks: row.get::<_, i64>(9)? as u64,
        incident_created: row.get(10)?,
        evaluated_at: parse_db_time(&evaluated).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    })
}

fn incident_from_row(row: &Row<'_>) -> SqlResult<Incident> {
    let status: String = row.get(5)?;
    let opened: String = row.get(6)?;
    Ok(Incident {
        id: row.get(0)?,
        source: row.get(1)?,
        title: row.get(2)?,
        severity: row.get(3)?,
        description: row.get(4)?,
        status: if status == "closed" {
            IncidentStatus::Closed
        } else {
            IncidentStatus::Open
        },
        opened_at: parse_db_time(&opened).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        closed_at: opt_time(row, 7)?,
    })
}

fn opt_time(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| parse_db_time(&s)))
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
