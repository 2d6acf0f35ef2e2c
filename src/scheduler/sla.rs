//! SLA evaluation over closed day/week/month periods.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::maintenance::{overlap_seconds, resolve_all};
use crate::db::{
    Monitor, MonitorSlaPeriodResult, MonitorSlaPolicy, MonitorStore, PeriodType, SlaStatus,
    StoreError, TimeRange,
};
use crate::notify::Coordinator;

/// Result of evaluating one monitor over `[from, to)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaEvaluation {
    pub monitor_id: i64,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Period length minus maintenance.
    pub window_seconds: i64,
    pub maintenance_seconds: i64,
    pub expected_checks: u64,
    pub observed_checks: u64,
    pub ok_checks: u64,
    pub uptime_pct: f64,
    pub coverage_pct: f64,
    pub target_pct: f64,
    pub status: SlaStatus,
}

impl SlaEvaluation {
    pub fn to_period_result(
        &self,
        period_type: PeriodType,
        evaluated_at: DateTime<Utc>,
    ) -> MonitorSlaPeriodResult {
        MonitorSlaPeriodResult {
            monitor_id: self.monitor_id,
            period_type,
            period_start: self.from,
            period_end: self.to,
            uptime_pct: self.uptime_pct,
            coverage_pct: self.coverage_pct,
            target_pct: self.target_pct,
            status: self.status,
            observed_checks: self.observed_checks,
            expected_checks: self.expected_checks,
            incident_created: false,
            evaluated_at,
        }
    }
}

pub fn effective_interval_seconds(monitor: &Monitor) -> u64 {
    monitor.interval_seconds.max(1)
}

/// Evaluate uptime and coverage for one monitor over `[from, to)`.
///
/// Samples inside a maintenance range are ignored and the maintenance time is
/// removed from the expected-check budget.
pub async fn evaluate_monitor_sla_window(
    store: &dyn MonitorStore,
    monitor: &Monitor,
    policy: &MonitorSlaPolicy,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<SlaEvaluation, StoreError> {
    let period = TimeRange::new(from, to);
    let windows = store
        .maintenance_windows_for(monitor.id, &monitor.tags, from, to)
        .await?;
    let maintenance = resolve_all(&windows, from, to);
    let maintenance_seconds = overlap_seconds(&maintenance, period);
    let window_seconds = (period.seconds() - maintenance_seconds).max(0);

    let interval = effective_interval_seconds(monitor);
    let expected_checks = (window_seconds as u64).div_ceil(interval);

    let mut observed_checks = 0u64;
    let mut ok_checks = 0u64;
    for sample in store.list_metrics(monitor.id, from).await? {
        if !period.contains(sample.checked_at)
            || maintenance.iter().any(|r| r.contains(sample.checked_at))
        {
            continue;
        }
        observed_checks += 1;
        if sample.ok {
            ok_checks += 1;
        }
    }

    let uptime_pct = if observed_checks > 0 {
        ok_checks as f64 / observed_checks as f64 * 100.0
    } else {
        0.0
    };
    let coverage_pct = if expected_checks > 0 {
        (observed_checks as f64 / expected_checks as f64 * 100.0).min(100.0)
    } else {
        0.0
    };

    let target_pct = monitor.sla_target_pct;
    let status = if observed_checks == 0
        || expected_checks == 0
        || coverage_pct < policy.min_coverage_pct
    {
        SlaStatus::Unknown
    } else if uptime_pct >= target_pct {
        SlaStatus::Ok
    } else {
        SlaStatus::Violated
    };

    Ok(SlaEvaluation {
        monitor_id: monitor.id,
        from,
        to,
        window_seconds,
        maintenance_seconds,
        expected_checks,
        observed_checks,
        ok_checks,
        uptime_pct,
        coverage_pct,
        target_pct,
        status,
    })
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// The most recently completed UTC period of the given type.
pub fn last_complete_period(period: PeriodType, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    match period {
        PeriodType::Day => {
            let end = midnight(today);
            (end - Duration::days(1), end)
        }
        PeriodType::Week => {
            let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
            let end = midnight(monday);
            (end - Duration::days(7), end)
        }
        PeriodType::Month => {
            let first = today.with_day(1).unwrap_or(today);
            let prev_first = (first - Duration::days(1)).with_day(1).unwrap_or(first);
            (midnight(prev_first), midnight(first))
        }
    }
}

/// Oldest metric timestamp still needed: one day before the start of the
/// last complete month, so the monthly evaluation always sees its samples.
pub fn metrics_retention_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    let (month_start, _) = last_complete_period(PeriodType::Month, now);
    month_start - Duration::days(1)
}

/// Delete metric rows no SLA period can read any more.
pub async fn prune_metrics(store: &dyn MonitorStore, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let cutoff = metrics_retention_cutoff(now);
    let deleted = store.delete_metrics_before(cutoff).await?;
    if deleted > 0 {
        tracing::info!(deleted, cutoff = %cutoff, "Pruned old metrics");
    }
    Ok(deleted)
}

/// Evaluate every unpaused monitor over each closed period and persist the
/// results. Returns the number of results written.
///
/// A monitor whose evaluation fails is logged and skipped.
pub async fn evaluate_all(
    store: &dyn MonitorStore,
    coordinator: &Coordinator,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let monitors = store.list_monitors().await?;
    let policies: HashMap<i64, MonitorSlaPolicy> = store
        .list_sla_policies()
        .await?
        .into_iter()
        .map(|p| (p.monitor_id, p))
        .collect();

    let mut written = 0;
    for monitor in monitors.iter().filter(|m| !m.paused) {
        let policy = policies
            .get(&monitor.id)
            .cloned()
            .unwrap_or_else(|| MonitorSlaPolicy::default_for(monitor.id));

        for period in PeriodType::ALL {
            match evaluate_period(store, coordinator, monitor, &policy, period, now).await {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(
                        monitor_id = monitor.id,
                        period = period.as_str(),
                        error = %e,
                        "SLA evaluation failed"
                    );
                }
            }
        }
    }
    Ok(written)
}

async fn evaluate_period(
    store: &dyn MonitorStore,
    coordinator: &Coordinator,
    monitor: &Monitor,
    policy: &MonitorSlaPolicy,
    period: PeriodType,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let (from, to) = last_complete_period(period, now);
    let evaluation = evaluate_monitor_sla_window(store, monitor, policy, from, to).await?;
    let mut stored = store
        .upsert_sla_period_result(&evaluation.to_period_result(period, now))
        .await?;

    if stored.status == SlaStatus::Violated
        && policy.auto_incident
        && policy.incident_period == period
        && !stored.incident_created
        && coordinator.open_sla_incident(monitor, &stored, now).await
    {
        stored.incident_created = true;
        store.upsert_sla_period_result(&stored).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MaintenanceStrategy, MaintenanceWindow, MemoryStore, MetricSample};
    use crate::notify::PlaintextDecryptor;
    use std::sync::Arc;

    fn monitor() -> Monitor {
        Monitor {
            id: 3,
            name: "web".to_string(),
            target: "https://web.example.com".to_string(),
            interval_seconds: 3600,
            sla_target_pct: 99.0,
            ..Default::default()
        }
    }

    fn day_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    async fn seed_hourly(store: &MemoryStore, failures: usize) {
        for h in 0..24 {
            store
                .insert_metric(&MetricSample {
                    monitor_id: 3,
                    checked_at: day_start() + Duration::hours(h) + Duration::minutes(1),
                    ok: (h as usize) >= failures,
                    latency_ms: Some(20),
                    status_code: Some(200),
                    error_kind: None,
                })
                .await
                .unwrap();
        }
    }

    fn coordinator(store: &Arc<MemoryStore>) -> Coordinator {
        Coordinator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            None,
            Arc::new(PlaintextDecryptor),
        )
    }

    #[test]
    fn test_last_complete_period() {
        // Wednesday
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 15, 30, 0).unwrap();
        assert_eq!(
            last_complete_period(PeriodType::Day, now),
            (
                Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap()
            )
        );
        assert_eq!(last_complete_period(PeriodType::Week, now).0, day_start() - Duration::days(7));
        assert_eq!(last_complete_period(PeriodType::Week, now).1, day_start());
        assert_eq!(
            last_complete_period(PeriodType::Month, now),
            (
                Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
            )
        );
        let january = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(
            last_complete_period(PeriodType::Month, january).0,
            Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_full_coverage_uptime() {
        let store = MemoryStore::new();
        seed_hourly(&store, 1).await;
        let policy = MonitorSlaPolicy::default_for(3);

        let eval = evaluate_monitor_sla_window(&store, &monitor(), &policy, day_start(), day_start() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(eval.expected_checks, 24);
        assert_eq!(eval.observed_checks, 24);
        assert_eq!(eval.ok_checks, 23);
        assert_eq!(eval.coverage_pct, 100.0);
        assert!((eval.uptime_pct - 23.0 / 24.0 * 100.0).abs() < 1e-9);
        assert_eq!(eval.status, SlaStatus::Violated);
    }

    #[tokio::test]
    async fn test_partial_coverage_is_unknown() {
        let store = MemoryStore::new();
        seed_hourly(&store, 0).await;
        let policy = MonitorSlaPolicy::default_for(3);

        // Two days of budget, one day of samples: 50% coverage
        let eval = evaluate_monitor_sla_window(&store, &monitor(), &policy, day_start(), day_start() + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(eval.expected_checks, 48);
        assert_eq!(eval.coverage_pct, 50.0);
        assert_eq!(eval.uptime_pct, 100.0);
        assert_eq!(eval.status, SlaStatus::Unknown);

        let lenient = MonitorSlaPolicy {
            min_coverage_pct: 40.0,
            ..policy
        };
        let eval = evaluate_monitor_sla_window(&store, &monitor(), &lenient, day_start(), day_start() + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(eval.status, SlaStatus::Ok);
    }

    #[tokio::test]
    async fn test_maintenance_excluded() {
        let store = MemoryStore::new();
        // Failures in the first six hours, all inside maintenance
        seed_hourly(&store, 6).await;
        store.add_maintenance_window(MaintenanceWindow {
            id: 1,
            name: "night".to_string(),
            monitor_ids: vec![3],
            tags: vec![],
            timezone: String::new(),
            active_from: None,
            active_until: None,
            strategy: MaintenanceStrategy::Single {
                starts_at: day_start(),
                ends_at: day_start() + Duration::hours(6),
            },
        });

        let eval = evaluate_monitor_sla_window(
            &store,
            &monitor(),
            &MonitorSlaPolicy::default_for(3),
            day_start(),
            day_start() + Duration::days(1),
        )
        .await
        .unwrap();
        assert_eq!(eval.maintenance_seconds, 6 * 3600);
        assert_eq!(eval.window_seconds, 18 * 3600);
        assert_eq!(eval.expected_checks, 18);
        assert_eq!(eval.observed_checks, 18);
        assert_eq!(eval.uptime_pct, 100.0);
        assert_eq!(eval.status, SlaStatus::Ok);
    }

    #[tokio::test]
    async fn test_fully_in_maintenance_is_unknown() {
        let store = MemoryStore::new();
        seed_hourly(&store, 0).await;
        store.add_maintenance_window(MaintenanceWindow {
            id: 1,
            name: "all day".to_string(),
            monitor_ids: vec![],
            tags: vec!["web".to_string()],
            timezone: String::new(),
            active_from: None,
            active_until: None,
            strategy: MaintenanceStrategy::Single {
                starts_at: day_start() - Duration::hours(1),
                ends_at: day_start() + Duration::days(2),
            },
        });
        let m = Monitor {
            tags: vec!["web".to_string()],
            ..monitor()
        };

        let eval = evaluate_monitor_sla_window(&store, &m, &MonitorSlaPolicy::default_for(3), day_start(), day_start() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(eval.window_seconds, 0);
        assert_eq!(eval.expected_checks, 0);
        assert_eq!(eval.observed_checks, 0);
        assert_eq!(eval.status, SlaStatus::Unknown);
    }

    #[test]
    fn test_retention_cutoff_covers_last_month() {
        let now = Utc.with_ymd_and_hms(2024, 8, 31, 23, 0, 0).unwrap();
        let cutoff = metrics_retention_cutoff(now);
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap());
        let (month_start, _) = last_complete_period(PeriodType::Month, now);
        assert!(cutoff < month_start);
    }

    #[tokio::test]
    async fn test_prune_keeps_samples_of_open_periods() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        for checked_at in [
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 9, 8, 0, 0).unwrap(),
        ] {
            store
                .insert_metric(&MetricSample {
                    monitor_id: 3,
                    checked_at,
                    ok: true,
                    latency_ms: Some(20),
                    status_code: Some(200),
                    error_kind: None,
                })
                .await
                .unwrap();
        }

        assert_eq!(prune_metrics(&store, now).await.unwrap(), 1);
        let left = store.metrics();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|m| m.checked_at >= metrics_retention_cutoff(now)));
        assert_eq!(prune_metrics(&store, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evaluate_all_opens_one_incident_per_period() {
        let store = Arc::new(MemoryStore::new());
        store.add_monitor(monitor());
        store.add_monitor(Monitor {
            id: 4,
            paused: true,
            ..monitor()
        });
        store.set_sla_policy(MonitorSlaPolicy {
            monitor_id: 3,
            auto_incident: true,
            incident_period: PeriodType::Day,
            min_coverage_pct: 80.0,
        });
        seed_hourly(&store, 4).await;
        let coordinator = coordinator(&store);
        let now = day_start() + Duration::days(1) + Duration::minutes(5);

        let written = evaluate_all(&*store, &coordinator, now).await.unwrap();
        assert_eq!(written, 3);

        let incidents = store.incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].source, "sla:3:day:2024-03-04");

        let day = store
            .sla_results()
            .into_iter()
            .find(|r| r.period_type == PeriodType::Day)
            .unwrap();
        assert_eq!(day.status, SlaStatus::Violated);
        assert!(day.incident_created);

        // Re-evaluating the same closed period does not open another
        evaluate_all(&*store, &coordinator, now + Duration::minutes(1)).await.unwrap();
        assert_eq!(store.incidents().len(), 1);
        assert!(store
            .sla_results()
            .iter()
            .filter(|r| r.period_type == PeriodType::Day)
            .all(|r| r.incident_created));
    }
}
