//! In-memory store for tests and demo mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::models::*;
use super::store::{is_due, AuditLogger, IncidentsGateway, MonitorStore, StoreError};

/// A recorded audit entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub details: serde_json::Value,
}

#[derive(Default)]
struct Inner {
    monitors: BTreeMap<MonitorId, Monitor>,
    states: HashMap<MonitorId, MonitorState>,
    notifications: HashMap<MonitorId, NotificationState>,
    policies: BTreeMap<MonitorId, MonitorSlaPolicy>,
    sla_results: HashMap<(MonitorId, PeriodType, DateTime<Utc>), MonitorSlaPeriodResult>,
    windows: Vec<MaintenanceWindow>,
    metrics: Vec<MetricSample>,
    incidents: Vec<Incident>,
    timeline: Vec<(i64, DateTime<Utc>, String)>,
    audit: Vec<AuditEntry>,
}

/// Thread-safe in-memory implementation of every storage interface.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_state_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_monitor(&self, monitor: Monitor) {
        self.lock().monitors.insert(monitor.id, monitor);
    }

    pub fn add_maintenance_window(&self, window: MaintenanceWindow) {
        self.lock().windows.push(window);
    }

    pub fn set_sla_policy(&self, policy: MonitorSlaPolicy) {
        self.lock().policies.insert(policy.monitor_id, policy);
    }

    /// Make every subsequent `upsert_monitor_state` fail.
    pub fn fail_state_writes(&self, fail: bool) {
        self.fail_state_writes.store(fail, Ordering::Relaxed);
    }

    pub fn state(&self, id: MonitorId) -> Option<MonitorState> {
        self.lock().states.get(&id).cloned()
    }

    pub fn metrics(&self) -> Vec<MetricSample> {
        self.lock().metrics.clone()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.lock().incidents.clone()
    }

    pub fn timeline(&self, incident_id: i64) -> Vec<String> {
        self.lock()
            .timeline
            .iter()
            .filter(|(id, _, _)| *id == incident_id)
            .map(|(_, _, msg)| msg.clone())
            .collect()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.clone()
    }

    pub fn sla_results(&self) -> Vec<MonitorSlaPeriodResult> {
        self.lock().sla_results.values().cloned().collect()
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn list_monitors(&self) -> Result<Vec<Monitor>, StoreError> {
        Ok(self.lock().monitors.values().cloned().collect())
    }

    async fn get_monitor(&self, id: MonitorId) -> Result<Option<Monitor>, StoreError> {
        Ok(self.lock().monitors.get(&id).cloned())
    }

    async fn list_due_monitors(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .monitors
            .values()
            .filter(|m| is_due(m, inner.states.get(&m.id), now))
            .cloned()
            .collect())
    }

    async fn get_monitor_state(&self, id: MonitorId) -> Result<Option<MonitorState>, StoreError> {
        Ok(self.lock().states.get(&id).cloned())
    }

    async fn upsert_monitor_state(&self, state: &MonitorState) -> Result<(), StoreError> {
        if self.fail_state_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Backend("state writes disabled".to_string()));
        }
        self.lock().states.insert(state.monitor_id, state.clone());
        Ok(())
    }

    async fn get_notification_state(
        &self,
        id: MonitorId,
    ) -> Result<Option<NotificationState>, StoreError> {
        Ok(self.lock().notifications.get(&id).cloned())
    }

    async fn upsert_notification_state(&self, state: &NotificationState) -> Result<(), StoreError> {
        self.lock().notifications.insert(state.monitor_id, state.clone());
        Ok(())
    }

    async fn list_sla_policies(&self) -> Result<Vec<MonitorSlaPolicy>, StoreError> {
        Ok(self.lock().policies.values().cloned().collect())
    }

    async fn upsert_sla_period_result(
        &self,
        result: &MonitorSlaPeriodResult,
    ) -> Result<MonitorSlaPeriodResult, StoreError> {
        let mut inner = self.lock();
        let key = (result.monitor_id, result.period_type, result.period_start);
        let mut stored = result.clone();
        if let Some(existing) = inner.sla_results.get(&key) {
            stored.incident_created |= existing.incident_created;
        }
        inner.sla_results.insert(key, stored.clone());
        Ok(stored)
    }

    async fn maintenance_windows_for(
        &self,
        monitor_id: MonitorId,
        tags: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceWindow>, StoreError> {
        Ok(self
            .lock()
            .windows
            .iter()
            .filter(|w| w.applies_to(monitor_id, tags))
            .filter(|w| w.active_from.map_or(true, |af| af < to))
            .filter(|w| w.active_until.map_or(true, |au| au > from))
            .cloned()
            .collect())
    }

    async fn insert_metric(&self, sample: &MetricSample) -> Result<(), StoreError> {
        self.lock().metrics.push(sample.clone());
        Ok(())
    }

    async fn list_metrics(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let mut rows: Vec<MetricSample> = self
            .lock()
            .metrics
            .iter()
            .filter(|m| m.monitor_id == monitor_id && m.checked_at >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.checked_at);
        Ok(rows)
    }

    async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let before = inner.metrics.len();
        inner.metrics.retain(|m| m.checked_at >= cutoff);
        Ok(before - inner.metrics.len())
    }
}

#[async_trait]
impl IncidentsGateway for MemoryStore {
    async fn find_open_incident_by_source(
        &self,
        source: &str,
    ) -> Result<Option<Incident>, StoreError> {
        Ok(self
            .lock()
            .incidents
            .iter()
            .find(|i| i.source == source && i.status == IncidentStatus::Open)
            .cloned())
    }

    async fn create_incident(&self, incident: NewIncident) -> Result<Incident, StoreError> {
        let mut inner = self.lock();
        let created = Incident {
            id: inner.incidents.len() as i64 + 1,
            source: incident.source,
            title: incident.title,
            severity: incident.severity,
            description: incident.description,
            status: IncidentStatus::Open,
            opened_at: incident.opened_at,
            closed_at: None,
        };
        inner.incidents.push(created.clone());
        Ok(created)
    }

    async fn close_incident(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let incident = inner
            .incidents
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::NotFound)?;
        incident.status = IncidentStatus::Closed;
        incident.closed_at = Some(at);
        Ok(())
    }

    async fn add_incident_timeline(
        &self,
        id: i64,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), StoreError> {
        self.lock().timeline.push((id, at, message.to_string()));
        Ok(())
    }
}

#[async_trait]
impl AuditLogger for MemoryStore {
    async fn log(
        &self,
        actor: &str,
        action: &str,
        details: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.lock().audit.push(AuditEntry {
            actor: actor.to_string(),
            action: action.to_string(),
            details,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn period_result(incident_created: bool) -> MonitorSlaPeriodResult {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        MonitorSlaPeriodResult {
            monitor_id: 1,
            period_type: PeriodType::Day,
            period_start: start,
            period_end: start + chrono::Duration::days(1),
            uptime_pct: 90.0,
            coverage_pct: 100.0,
            target_pct: 99.0,
            status: SlaStatus::Violated,
            observed_checks: 10,
            expected_checks: 10,
            incident_created,
            evaluated_at: start,
        }
    }

    #[tokio::test]
    async fn test_sla_upsert_keeps_incident_flag() {
        let store = MemoryStore::new();
        store.upsert_sla_period_result(&period_result(true)).await.unwrap();
        let stored = store.upsert_sla_period_result(&period_result(false)).await.unwrap();
        assert!(stored.incident_created);
        assert_eq!(store.sla_results().len(), 1);
    }

    #[tokio::test]
    async fn test_incident_lifecycle() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let created = store
            .create_incident(NewIncident {
                source: "monitor:1".to_string(),
                title: "down".to_string(),
                severity: "major".to_string(),
                description: String::new(),
                opened_at: now,
            })
            .await
            .unwrap();

        let open = store.find_open_incident_by_source("monitor:1").await.unwrap();
        assert_eq!(open.map(|i| i.id), Some(created.id));

        store.close_incident(created.id, now).await.unwrap();
        assert!(store.find_open_incident_by_source("monitor:1").await.unwrap().is_none());
        assert!(matches!(store.close_incident(99, now).await, Err(StoreError::NotFound)));
    }
}
