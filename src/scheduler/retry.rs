//! Retry policy.
//!
//! Retrying never holds a concurrency slot: a decision only records
//! `retry_at`, and a later tick picks the monitor up once it is due.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Duration;

use super::classify::{classify_attempt_error, classify_result_error};
use super::jitter::splitmix64;
use crate::db::{ErrorKind, Monitor};
use crate::probe::{CheckResult, ProbeError};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
const MAX_RETRY_JITTER_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryDecision {
    /// The attempt that produced this decision was itself a retry.
    pub was_retry: bool,
    pub scheduled: bool,
    pub error_kind: Option<ErrorKind>,
    pub next_retry_attempt: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub delay: Option<Duration>,
}

pub fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Timeout
            | ErrorKind::Dns
            | ErrorKind::Connect
            | ErrorKind::Tls
            | ErrorKind::ConnectionRefused
            | ErrorKind::NetworkUnreachable
            | ErrorKind::RequestFailed
    )
}

/// Stable error kind for an outcome, or `None` when it succeeded.
pub fn outcome_kind(result: &CheckResult, err: Option<&ProbeError>) -> Option<ErrorKind> {
    if err.is_some() {
        return Some(classify_attempt_error(err));
    }
    if result.ok {
        return None;
    }
    Some(
        result
            .error_kind
            .unwrap_or_else(|| classify_result_error(result.error.as_deref().unwrap_or_default())),
    )
}

/// `base + jitter`, with jitter in `[0, min(base/5, 2s)]` milliseconds.
pub fn retry_delay(monitor_id: i64, attempt: u32, base: Duration) -> Duration {
    let base = base.max(Duration::from_secs(1));
    let base_ms = base.as_millis() as u64;
    let cap_ms = (base_ms / 5).min(MAX_RETRY_JITTER_MS);
    let seed = (monitor_id as u64) ^ (attempt as u64).wrapping_mul(GOLDEN_GAMMA);
    let jitter_ms = splitmix64(seed) % (cap_ms + 1);
    base.saturating_add(Duration::from_millis(jitter_ms))
}

/// Decide whether the attempt just finished should be retried.
///
/// `retry_attempt` is the number of retries already used before this attempt.
/// Only attempt errors are retryable; semantic failures and successes clear
/// the retry bookkeeping.
pub fn decide_retry(
    now: DateTime<Utc>,
    monitor: &Monitor,
    default_retry_interval: Duration,
    retry_attempt: u32,
    result: &CheckResult,
    err: Option<&ProbeError>,
) -> RetryDecision {
    let error_kind = outcome_kind(result, err);
    let mut decision = RetryDecision {
        was_retry: retry_attempt > 0,
        scheduled: false,
        error_kind,
        next_retry_attempt: 0,
        retry_at: None,
        delay: None,
    };

    let Some(kind) = error_kind else {
        return decision;
    };
    if err.is_none() || !is_retryable(kind) || retry_attempt >= monitor.retries {
        return decision;
    }

    let base = monitor
        .retry_interval_seconds
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(default_retry_interval);
    let next = retry_attempt + 1;
    let delay = retry_delay(monitor.id, next, base);
    let Some(retry_at) = i64::try_from(delay.as_millis())
        .ok()
        .and_then(ChronoDuration::try_milliseconds)
        .and_then(|d| now.checked_add_signed(d))
    else {
        return decision;
    };

    decision.scheduled = true;
    decision.next_retry_attempt = next;
    decision.delay = Some(delay);
    decision.retry_at = Some(retry_at);
    decision
}
