//! Storage interfaces consumed by the engine.
//!
//! The engine never persists anything itself; callers hand it an
//! implementation of these traits (see `memory` and `sqlite`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::*;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Monitors, their runtime state, and the historical rows derived from them.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// All configured monitors, paused ones included.
    async fn list_monitors(&self) -> Result<Vec<Monitor>, StoreError>;

    async fn get_monitor(&self, id: MonitorId) -> Result<Option<Monitor>, StoreError>;

    /// Unpaused monitors whose interval has elapsed, that were never checked,
    /// or whose pending retry is due at `now`.
    async fn list_due_monitors(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>, StoreError>;

    async fn get_monitor_state(&self, id: MonitorId) -> Result<Option<MonitorState>, StoreError>;

    async fn upsert_monitor_state(&self, state: &MonitorState) -> Result<(), StoreError>;

    async fn get_notification_state(
        &self,
        id: MonitorId,
    ) -> Result<Option<NotificationState>, StoreError>;

    async fn upsert_notification_state(&self, state: &NotificationState) -> Result<(), StoreError>;

    async fn list_sla_policies(&self) -> Result<Vec<MonitorSlaPolicy>, StoreError>;

    /// Insert or update keyed by (monitor, period_type, period_start) and
    /// return the stored row. An already-set `incident_created` is never cleared.
    async fn upsert_sla_period_result(
        &self,
        result: &MonitorSlaPeriodResult,
    ) -> Result<MonitorSlaPeriodResult, StoreError>;

    /// Windows covering the monitor (by id or tag) that may overlap `[from, to)`.
    async fn maintenance_windows_for(
        &self,
        monitor_id: MonitorId,
        tags: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceWindow>, StoreError>;

    async fn insert_metric(&self, sample: &MetricSample) -> Result<(), StoreError>;

    /// Metric rows at or after `since`, oldest first.
    async fn list_metrics(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError>;

    /// Drop metric rows older than `cutoff`; returns how many were removed.
    async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Incident persistence used by the auto-incident coordinator.
#[async_trait]
pub trait IncidentsGateway: Send + Sync {
    async fn find_open_incident_by_source(
        &self,
        source: &str,
    ) -> Result<Option<Incident>, StoreError>;

    async fn create_incident(&self, incident: NewIncident) -> Result<Incident, StoreError>;

    async fn close_incident(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn add_incident_timeline(
        &self,
        id: i64,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log(
        &self,
        actor: &str,
        action: &str,
        details: serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Shared due-ness rule used by the bundled store implementations.
pub(crate) fn is_due(monitor: &Monitor, state: Option<&MonitorState>, now: DateTime<Utc>) -> bool {
    if monitor.paused {
        return false;
    }
    let Some(state) = state else {
        return true;
    };
    if let Some(retry_at) = state.retry_at {
        return retry_at <= now;
    }
    match state.last_checked_at {
        None => true,
        Some(last) => match monitor.next_check_after(last) {
            Some(next) => next <= now,
            None => {
                tracing::warn!(
                    monitor_id = monitor.id,
                    interval_seconds = monitor.interval_seconds,
                    "Monitor interval out of range; skipping"
                );
                false
            }
        },
    }
}
