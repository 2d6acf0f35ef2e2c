//! Engine observability: gauges, counters and timing quantiles.
//!
//! Timings are kept in fixed-size ring buffers and summarized with a
//! t-digest on demand, so recording stays cheap on the hot path.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tdigests::TDigest;

use super::tuning::Tuning;
use crate::db::ErrorKind;

/// Samples kept per timing series.
pub const RING_CAPACITY: usize = 1024;

/// Upper bounds (seconds) of the retry delay histogram; the last bucket is +Inf.
pub const RETRY_DELAY_BOUNDS: [u64; 5] = [1, 5, 15, 30, 60];

const TDIGEST_COMPRESSION: usize = 100;

struct Ring {
    samples: VecDeque<f64>,
}

impl Ring {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RING_CAPACITY),
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == RING_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn quantiles(&self) -> QuantileSnapshot {
        if self.samples.is_empty() {
            return QuantileSnapshot::default();
        }
        let mut td = TDigest::from_values(self.samples.iter().copied().collect());
        td.compress(TDIGEST_COMPRESSION);
        QuantileSnapshot {
            count: self.samples.len() as u64,
            p50: sanitize_float(td.estimate_quantile(0.50)),
            p95: sanitize_float(td.estimate_quantile(0.95)),
            p99: sanitize_float(td.estimate_quantile(0.99)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QuantileSnapshot {
    pub count: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayBucket {
    /// Upper bound in seconds, or "+Inf".
    pub le: String,
    pub count: u64,
}

/// Point-in-time readout of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub running: bool,
    pub inflight_checks: u64,
    pub peak_inflight_checks: u64,
    pub max_concurrent: usize,
    pub ticks_total: u64,
    pub last_tick_due: u64,
    pub last_tick_started: u64,
    pub last_tick_retries: u64,
    pub checks_total: u64,
    pub checks_failed: u64,
    pub maintenance_skips: u64,
    pub wait_ms: QuantileSnapshot,
    pub attempt_ms: QuantileSnapshot,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub retries_scheduled: u64,
    pub retries_exhausted: u64,
    /// Dispatched retries keyed by their attempt number.
    pub retry_attempts: BTreeMap<u32, u64>,
    pub retry_delay_buckets: Vec<DelayBucket>,
    pub tuning: Tuning,
}

/// Concurrent-safe accumulators shared by every attempt task.
pub struct EngineStats {
    inflight: AtomicU64,
    peak_inflight: AtomicU64,
    ticks_total: AtomicU64,
    last_tick_due: AtomicU64,
    last_tick_started: AtomicU64,
    last_tick_retries: AtomicU64,
    checks_total: AtomicU64,
    checks_failed: AtomicU64,
    maintenance_skips: AtomicU64,
    retries_scheduled: AtomicU64,
    retries_exhausted: AtomicU64,
    retry_delay_buckets: [AtomicU64; RETRY_DELAY_BOUNDS.len() + 1],
    wait_ms: Mutex<Ring>,
    attempt_ms: Mutex<Ring>,
    errors: Mutex<BTreeMap<ErrorKind, u64>>,
    retry_attempts: Mutex<BTreeMap<u32, u64>>,
}

/// Decrements the in-flight gauge on drop.
pub struct InflightGuard<'a> {
    stats: &'a EngineStats,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.stats.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            inflight: AtomicU64::new(0),
            peak_inflight: AtomicU64::new(0),
            ticks_total: AtomicU64::new(0),
            last_tick_due: AtomicU64::new(0),
            last_tick_started: AtomicU64::new(0),
            last_tick_retries: AtomicU64::new(0),
            checks_total: AtomicU64::new(0),
            checks_failed: AtomicU64::new(0),
            maintenance_skips: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            retry_delay_buckets: Default::default(),
            wait_ms: Mutex::new(Ring::new()),
            attempt_ms: Mutex::new(Ring::new()),
            errors: Mutex::new(BTreeMap::new()),
            retry_attempts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Mark an attempt as in flight until the guard drops.
    pub fn begin_attempt(&self) -> InflightGuard<'_> {
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_inflight.fetch_max(now, Ordering::SeqCst);
        InflightGuard { stats: self }
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn record_tick(&self, due: usize, started: usize, retries: usize) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.last_tick_due.store(due as u64, Ordering::Relaxed);
        self.last_tick_started.store(started as u64, Ordering::Relaxed);
        self.last_tick_retries.store(retries as u64, Ordering::Relaxed);
    }

    pub fn record_wait(&self, wait: Duration) {
        lock(&self.wait_ms).push(wait.as_secs_f64() * 1000.0);
    }

    /// Record a finished attempt and its error kind, if it failed.
    pub fn record_attempt(&self, elapsed: Duration, kind: Option<ErrorKind>) {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        lock(&self.attempt_ms).push(elapsed.as_secs_f64() * 1000.0);
        if let Some(kind) = kind {
            self.checks_failed.fetch_add(1, Ordering::Relaxed);
            *lock(&self.errors).entry(kind).or_insert(0) += 1;
        }
    }

    pub fn record_maintenance_skip(&self) {
        self.maintenance_skips.fetch_add(1, Ordering::Relaxed);
    }

    /// A retry was dispatched as its `attempt`-th retry.
    pub fn record_retry_dispatch(&self, attempt: u32) {
        *lock(&self.retry_attempts).entry(attempt).or_insert(0) += 1;
    }

    pub fn record_retry_scheduled(&self, delay: Duration) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        let secs = delay.as_secs_f64();
        let idx = RETRY_DELAY_BOUNDS
            .iter()
            .position(|bound| secs <= *bound as f64)
            .unwrap_or(RETRY_DELAY_BOUNDS.len());
        self.retry_delay_buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, max_concurrent: usize, running: bool, tuning: Tuning) -> EngineStatsSnapshot {
        let mut retry_delay_buckets: Vec<DelayBucket> = RETRY_DELAY_BOUNDS
            .iter()
            .zip(self.retry_delay_buckets.iter())
            .map(|(bound, count)| DelayBucket {
                le: bound.to_string(),
                count: count.load(Ordering::Relaxed),
            })
            .collect();
        retry_delay_buckets.push(DelayBucket {
            le: "+Inf".to_string(),
            count: self.retry_delay_buckets[RETRY_DELAY_BOUNDS.len()].load(Ordering::Relaxed),
        });

        EngineStatsSnapshot {
            running,
            inflight_checks: self.inflight.load(Ordering::SeqCst),
            peak_inflight_checks: self.peak_inflight.load(Ordering::SeqCst),
            max_concurrent,
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            last_tick_due: self.last_tick_due.load(Ordering::Relaxed),
            last_tick_started: self.last_tick_started.load(Ordering::Relaxed),
            last_tick_retries: self.last_tick_retries.load(Ordering::Relaxed),
            checks_total: self.checks_total.load(Ordering::Relaxed),
            checks_failed: self.checks_failed.load(Ordering::Relaxed),
            maintenance_skips: self.maintenance_skips.load(Ordering::Relaxed),
            wait_ms: lock(&self.wait_ms).quantiles(),
            attempt_ms: lock(&self.attempt_ms).quantiles(),
            errors_by_kind: lock(&self.errors)
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            retry_attempts: lock(&self.retry_attempts).clone(),
            retry_delay_buckets,
            tuning,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn sanitize_float(f: f64) -> f64 {
    if f.is_nan() || f.is_infinite() {
        0.0
    } else {
        f
    }
}
