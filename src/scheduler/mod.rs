//! Scheduling and concurrency engine.
//!
//! One driver loop ticks on a fixed interval. Each tick selects the monitors
//! that are due, fresh or retry, and runs their attempts as independent tasks
//! bounded by an engine-wide semaphore. A retry never waits inside a slot:
//! the attempt records `retry_at` and a later tick picks it up.

pub mod classify;
pub mod jitter;
pub mod maintenance;
pub mod retry;
pub mod sla;
pub mod stats;
pub mod tuning;

pub use classify::*;
pub use jitter::*;
pub use maintenance::*;
pub use retry::*;
pub use sla::*;
pub use stats::*;
pub use tuning::*;

use crate::db::{
    MetricSample, Monitor, MonitorId, MonitorSlaPolicy, MonitorState, MonitorStatus, MonitorStore,
    StoreError,
};
use crate::notify::{Coordinator, NotificationSettings};
use crate::probe::{CheckResult, CheckRunner, ProbeError, TargetPolicy};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Minimum spacing between periodic SLA evaluations.
const SLA_EVALUATION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("in-flight checks did not drain within {0:?}")]
    StopTimeout(Duration),
}

/// Per-tick settings, replaceable while running.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub target_policy: TargetPolicy,
    /// Retry base for monitors without their own retry interval.
    pub default_retry_interval: Duration,
    pub notifications: NotificationSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            target_policy: TargetPolicy::default(),
            default_retry_interval: Duration::from_secs(20),
            notifications: NotificationSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    pub settings: EngineSettings,
    pub tuning: Tuning,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            tick_interval: Duration::from_secs(1),
            settings: EngineSettings::default(),
            tuning: Tuning::default(),
        }
    }
}

/// What one tick selected and dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Monitors found due, fresh and retry.
    pub due: usize,
    pub started: usize,
    /// How many of `started` were retries.
    pub retries: usize,
}

struct Driver {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

struct EngineInner {
    store: Arc<dyn MonitorStore>,
    runner: Arc<dyn CheckRunner>,
    coordinator: Arc<Coordinator>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    tick_interval: Duration,
    settings: RwLock<EngineSettings>,
    tuning: Mutex<Tuning>,
    stats: EngineStats,
    claimed: Mutex<HashSet<MonitorId>>,
    cancel: watch::Sender<bool>,
    last_sla_run: Mutex<Option<Instant>>,
    driver: Mutex<Option<Driver>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Releases a monitor's in-flight claim when the attempt task ends.
struct Claim {
    inner: Arc<EngineInner>,
    monitor_id: MonitorId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.inner.claimed).remove(&self.monitor_id);
    }
}

struct Candidate {
    due_at: DateTime<Utc>,
    monitor: Monitor,
    state: Option<MonitorState>,
    is_retry: bool,
}

/// The monitoring engine. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        runner: Arc<dyn CheckRunner>,
        coordinator: Arc<Coordinator>,
        options: EngineOptions,
    ) -> Self {
        let max_concurrent = options.max_concurrent.max(1);
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                store,
                runner,
                coordinator,
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                tick_interval: options.tick_interval.max(Duration::from_millis(1)),
                settings: RwLock::new(options.settings),
                tuning: Mutex::new(options.tuning.normalized()),
                stats: EngineStats::new(),
                claimed: Mutex::new(HashSet::new()),
                cancel,
                last_sla_run: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_settings(&self, settings: EngineSettings) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn tuning(&self) -> Tuning {
        *lock(&self.inner.tuning)
    }

    /// Replace the scheduling knobs. Values are clamped; the next tick uses them.
    pub fn set_tuning(&self, tuning: Tuning) -> Tuning {
        let tuning = tuning.normalized();
        *lock(&self.inner.tuning) = tuning;
        tracing::info!(
            jitter_percent = tuning.jitter_percent,
            jitter_max_seconds = tuning.jitter_max_seconds,
            stats_log_interval_seconds = tuning.stats_log_interval_seconds,
            "Tuning updated"
        );
        tuning
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.driver).is_some()
    }

    pub fn stats_snapshot(&self) -> EngineStatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.max_concurrent, self.is_running(), self.tuning())
    }

    /// On-demand SLA evaluation, independent of the periodic job.
    pub async fn evaluate_monitor_sla_window(
        &self,
        monitor: &Monitor,
        policy: &MonitorSlaPolicy,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SlaEvaluation, StoreError> {
        sla::evaluate_monitor_sla_window(self.inner.store.as_ref(), monitor, policy, from, to).await
    }

    /// Run one scheduling tick at `now` and wait for every attempt it started.
    ///
    /// Monitors whose attempt from an overlapping call is still running are
    /// skipped, so calling this repeatedly is safe.
    pub async fn run_due_checks(
        &self,
        settings: &EngineSettings,
        now: DateTime<Utc>,
    ) -> Result<TickSummary, StoreError> {
        let tuning = self.tuning();
        let monitors = self.inner.store.list_due_monitors(now).await?;

        let mut fresh = Vec::new();
        let mut retries = Vec::new();
        for monitor in monitors {
            if monitor.paused || lock(&self.inner.claimed).contains(&monitor.id) {
                continue;
            }
            let state = match self.inner.store.get_monitor_state(monitor.id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to load monitor state");
                    continue;
                }
            };
            match state.as_ref().and_then(|s| s.retry_at) {
                Some(retry_at) if retry_at <= now => retries.push(Candidate {
                    due_at: retry_at,
                    monitor,
                    state,
                    is_retry: true,
                }),
                Some(_) => {}
                None => match eligible_at(&monitor, state.as_ref(), &tuning) {
                    Some(due_at) if due_at <= now => fresh.push(Candidate {
                        due_at,
                        monitor,
                        state,
                        is_retry: false,
                    }),
                    Some(_) => {}
                    None => {
                        tracing::warn!(monitor_id = monitor.id, "Monitor schedule out of range; skipping");
                    }
                },
            }
        }

        let due = fresh.len() + retries.len();
        let budget = if fresh.is_empty() {
            self.inner.max_concurrent
        } else {
            (self.inner.max_concurrent / 3).max(1)
        };
        retries.sort_by_key(|c| (c.due_at, c.monitor.id));
        retries.truncate(budget);

        let mut selected: Vec<Candidate> = retries.into_iter().chain(fresh).collect();
        selected.sort_by_key(|c| (c.due_at, c.monitor.id));

        let mut attempts = JoinSet::new();
        let mut summary = TickSummary {
            due,
            ..Default::default()
        };
        for candidate in selected {
            if !lock(&self.inner.claimed).insert(candidate.monitor.id) {
                continue;
            }
            let claim = Claim {
                inner: self.inner.clone(),
                monitor_id: candidate.monitor.id,
            };
            summary.started += 1;
            if candidate.is_retry {
                summary.retries += 1;
            }

            let inner = self.inner.clone();
            let settings = settings.clone();
            attempts.spawn(async move {
                let _claim = claim;
                run_attempt(inner, settings, candidate, now).await;
            });
        }

        self.inner
            .stats
            .record_tick(summary.due, summary.started, summary.retries);
        if summary.started > 0 {
            tracing::debug!(
                due = summary.due,
                started = summary.started,
                retries = summary.retries,
                "Tick dispatched"
            );
        }

        while let Some(joined) = attempts.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(error = %e, "Check task panicked");
                }
            }
        }
        Ok(summary)
    }

    /// Start the driver loop on its own task.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut driver = lock(&self.inner.driver);
        if driver.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        self.inner.cancel.send_replace(false);

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.drive(stop_rx).await });
        *driver = Some(Driver { stop_tx, handle });

        tracing::info!(
            max_concurrent = self.inner.max_concurrent,
            tick_ms = self.inner.tick_interval.as_millis() as u64,
            "Engine started"
        );
        Ok(())
    }

    /// Stop ticking and wait up to `timeout` for in-flight attempts to drain.
    ///
    /// On timeout the remaining attempts are cancelled. Stopping an engine
    /// that is not running is a no-op.
    pub async fn stop(&self, timeout: Duration) -> Result<(), EngineError> {
        let Some(mut driver) = lock(&self.inner.driver).take() else {
            return Ok(());
        };
        let _ = driver.stop_tx.send(());

        match tokio::time::timeout(timeout, &mut driver.handle).await {
            Ok(_) => {
                tracing::info!("Engine stopped");
                Ok(())
            }
            Err(_) => {
                self.inner.cancel.send_replace(true);
                driver.handle.abort();
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Engine stop timed out");
                Err(EngineError::StopTimeout(timeout))
            }
        }
    }

    async fn drive(self, mut stop_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.inner.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_stats_log = Instant::now();

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    break;
                }
                _ = ticker.tick() => {
                    while tasks.try_join_next().is_some() {}

                    let now = Utc::now();
                    let settings = self.settings();
                    let engine = self.clone();
                    tasks.spawn(async move {
                        if let Err(e) = engine.run_due_checks(&settings, now).await {
                            tracing::error!(error = %e, "Scheduling tick failed");
                        }
                    });

                    if self.claim_sla_run() {
                        let engine = self.clone();
                        tasks.spawn(async move {
                            match evaluate_all(engine.inner.store.as_ref(), &engine.inner.coordinator, now).await {
                                Ok(written) => tracing::debug!(written, "SLA evaluation finished"),
                                Err(e) => tracing::error!(error = %e, "SLA evaluation failed"),
                            }
                            if let Err(e) = prune_metrics(engine.inner.store.as_ref(), now).await {
                                tracing::error!(error = %e, "Metric pruning failed");
                            }
                        });
                    }

                    let log_every = self.tuning().stats_log_interval_seconds;
                    if log_every > 0 && last_stats_log.elapsed() >= Duration::from_secs(log_every) {
                        last_stats_log = Instant::now();
                        self.log_stats();
                    }
                }
            }
        }

        // Drain what is already running; no new ticks are issued.
        while tasks.join_next().await.is_some() {}
    }

    /// Self-throttle for the periodic SLA job.
    fn claim_sla_run(&self) -> bool {
        let mut last = lock(&self.inner.last_sla_run);
        match *last {
            Some(at) if at.elapsed() < SLA_EVALUATION_INTERVAL => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    fn log_stats(&self) {
        let s = self.stats_snapshot();
        tracing::info!(
            inflight = s.inflight_checks,
            peak_inflight = s.peak_inflight_checks,
            ticks = s.ticks_total,
            checks = s.checks_total,
            failed = s.checks_failed,
            retries_scheduled = s.retries_scheduled,
            retries_exhausted = s.retries_exhausted,
            maintenance_skips = s.maintenance_skips,
            wait_p95_ms = s.wait_ms.p95,
            attempt_p95_ms = s.attempt_ms.p95,
            "Engine stats"
        );
    }
}

/// Resolves once the engine-wide cancel flag is set.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Whether any maintenance window covers the monitor at `now`.
async fn in_maintenance(store: &dyn MonitorStore, monitor: &Monitor, now: DateTime<Utc>) -> bool {
    let until = now + chrono::Duration::seconds(1);
    match store
        .maintenance_windows_for(monitor.id, &monitor.tags, now, until)
        .await
    {
        Ok(windows) => resolve_all(&windows, now, until)
            .iter()
            .any(|r| r.contains(now)),
        Err(e) => {
            tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to load maintenance windows");
            false
        }
    }
}

async fn run_attempt(
    inner: Arc<EngineInner>,
    settings: EngineSettings,
    candidate: Candidate,
    now: DateTime<Utc>,
) {
    let Candidate {
        monitor,
        state: previous,
        is_retry,
        ..
    } = candidate;
    let mut cancel = inner.cancel.subscribe();
    if *cancel.borrow() {
        return;
    }

    let waited = Instant::now();
    let _permit = tokio::select! {
        permit = inner.semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
        _ = cancelled(&mut cancel) => return,
    };
    inner.stats.record_wait(waited.elapsed());
    let _inflight = inner.stats.begin_attempt();

    let retry_attempt = previous.as_ref().map_or(0, |s| s.retry_attempt);
    if is_retry {
        inner.stats.record_retry_dispatch(retry_attempt);
    }

    if in_maintenance(inner.store.as_ref(), &monitor, now).await {
        inner.stats.record_maintenance_skip();
        let mut next = previous.clone().unwrap_or_else(|| MonitorState::new(monitor.id));
        next.status = MonitorStatus::Maintenance;
        next.maintenance_active = true;
        next.last_checked_at = Some(now);
        next.retry_attempt = 0;
        next.retry_at = None;
        tracing::debug!(monitor_id = monitor.id, "Skipping check during maintenance");
        persist_and_notify(&inner, &settings, &monitor, previous.as_ref(), &next, now).await;
        return;
    }

    let started = Instant::now();
    let (result, err) = tokio::select! {
        outcome = inner.runner.run(&monitor, settings.target_policy) => outcome,
        _ = cancelled(&mut cancel) => {
            tracing::debug!(monitor_id = monitor.id, "Check cancelled");
            return;
        }
    };
    let elapsed = started.elapsed();

    let decision = decide_retry(
        now,
        &monitor,
        settings.default_retry_interval,
        retry_attempt,
        &result,
        err.as_ref(),
    );
    inner.stats.record_attempt(elapsed, decision.error_kind);

    if let Some(delay) = decision.delay.filter(|_| decision.scheduled) {
        inner.stats.record_retry_scheduled(delay);
        tracing::info!(
            monitor_id = monitor.id,
            kind = decision.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
            attempt = decision.next_retry_attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
    } else if err.is_some()
        && monitor.retries > 0
        && decision.error_kind.map_or(false, is_retryable)
    {
        inner.stats.record_retry_exhausted();
    }

    let next = next_state(previous.as_ref(), &monitor, &result, err.as_ref(), &decision, now);

    if !decision.scheduled {
        let sample = MetricSample {
            monitor_id: monitor.id,
            checked_at: now,
            ok: decision.error_kind.is_none(),
            latency_ms: Some(result.latency_ms),
            status_code: result.status_code,
            error_kind: decision.error_kind,
        };
        if let Err(e) = inner.store.insert_metric(&sample).await {
            tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to record metric");
        }
    }

    persist_and_notify(&inner, &settings, &monitor, previous.as_ref(), &next, now).await;
}

/// Fold one attempt into the monitor's state.
///
/// While a retry is pending the visible status is left alone, so a single
/// transient failure never flaps the monitor down.
fn next_state(
    previous: Option<&MonitorState>,
    monitor: &Monitor,
    result: &CheckResult,
    err: Option<&ProbeError>,
    decision: &RetryDecision,
    now: DateTime<Utc>,
) -> MonitorState {
    let mut next = previous
        .cloned()
        .unwrap_or_else(|| MonitorState::new(monitor.id));
    next.last_checked_at = Some(now);
    next.last_latency_ms = Some(result.latency_ms);
    next.last_status_code = result.status_code;
    next.maintenance_active = false;
    if let Some(tls) = &result.tls {
        next.tls_days_left = Some(tls.days_left(now));
    }

    let raw_error = err.map(|e| e.to_string()).or_else(|| result.error.clone());
    match decision.error_kind {
        None => {
            next.status = MonitorStatus::Up;
            next.last_up_at = Some(now);
            next.last_error = None;
            next.last_error_kind = None;
            next.retry_attempt = 0;
            next.retry_at = None;
        }
        Some(kind) if decision.scheduled => {
            if matches!(next.status, MonitorStatus::Maintenance | MonitorStatus::Paused) {
                next.status = MonitorStatus::Pending;
            }
            next.last_error = raw_error;
            next.last_error_kind = Some(kind);
            next.retry_attempt = decision.next_retry_attempt;
            next.retry_at = decision.retry_at;
        }
        Some(kind) => {
            next.status = MonitorStatus::Down;
            next.last_down_at = Some(now);
            next.last_error = raw_error;
            next.last_error_kind = Some(kind);
            next.retry_attempt = 0;
            next.retry_at = None;
        }
    }
    next
}

async fn persist_and_notify(
    inner: &EngineInner,
    settings: &EngineSettings,
    monitor: &Monitor,
    previous: Option<&MonitorState>,
    next: &MonitorState,
    now: DateTime<Utc>,
) {
    if let Err(e) = inner.store.upsert_monitor_state(next).await {
        tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to save monitor state");
    }
    if previous.map(|p| p.status) != Some(next.status) {
        tracing::info!(
            monitor_id = monitor.id,
            from = previous.map_or("none", |p| p.status.as_str()),
            to = next.status.as_str(),
            "Monitor status changed"
        );
    }
    inner
        .coordinator
        .on_transition(monitor, previous, next, &settings.notifications, now)
        .await;
}
