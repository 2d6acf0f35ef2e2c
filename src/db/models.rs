//! Database model types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type MonitorId = i64;

/// Normalized check family for a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorType {
    Http,
    HttpKeyword,
    HttpJson,
    Tcp,
    Ping,
    Grpc,
}

impl MonitorType {
    /// Parse a configured type name, accepting the legacy aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Some(Self::Http),
            "keyword" | "http_keyword" => Some(Self::HttpKeyword),
            "json" | "http_json" | "json_query" => Some(Self::HttpJson),
            "tcp" | "port" => Some(Self::Tcp),
            "ping" | "dns" => Some(Self::Ping),
            "grpc" | "grpc_keyword" => Some(Self::Grpc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::HttpKeyword => "http_keyword",
            Self::HttpJson => "http_json",
            Self::Tcp => "tcp",
            Self::Ping => "ping",
            Self::Grpc => "grpc",
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http | Self::HttpKeyword | Self::HttpJson)
    }
}

/// A monitor configuration. The engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Monitor {
    pub id: MonitorId,
    pub name: String,
    pub monitor_type: String,
    /// URL or host:port, depending on the type.
    pub target: String,
    /// Explicit host for TCP and gRPC probes; falls back to `target` when empty.
    pub host: String,
    pub port: Option<u16>,
    pub method: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub keyword: Option<String>,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub retries: u32,
    pub retry_interval_seconds: Option<u64>,
    /// Entries like "200", "200-299" or "2xx".
    pub allowed_status: Vec<String>,
    pub ignore_tls: bool,
    pub tags: Vec<String>,
    pub sla_target_pct: f64,
    pub auto_incident: bool,
    pub incident_severity: String,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            monitor_type: "http".to_string(),
            target: String::new(),
            host: String::new(),
            port: None,
            method: "GET".to_string(),
            body: None,
            headers: BTreeMap::new(),
            keyword: None,
            interval_seconds: 60,
            timeout_seconds: 10,
            retries: 0,
            retry_interval_seconds: None,
            allowed_status: Vec::new(),
            ignore_tls: false,
            tags: Vec::new(),
            sla_target_pct: 99.9,
            auto_incident: false,
            incident_severity: "major".to_string(),
            paused: false,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Monitor {
    pub fn incident_source(&self) -> String {
        format!("monitor:{}", self.id)
    }

    /// When a fresh attempt is due after `last`, or `None` if the interval
    /// does not fit in a timestamp.
    pub fn next_check_after(&self, last: DateTime<Utc>) -> Option<DateTime<Utc>> {
        add_seconds(last, self.interval_seconds.max(1))
    }
}

/// `at + seconds`, or `None` on overflow.
pub fn add_seconds(at: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::try_seconds(i64::try_from(seconds).ok()?)?;
    at.checked_add_signed(delta)
}

/// Last known status of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    /// Never checked.
    #[default]
    Pending,
    Up,
    Down,
    Paused,
    Maintenance,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Up => "up",
            Self::Down => "down",
            Self::Paused => "paused",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "up" => Self::Up,
            "down" => Self::Down,
            "paused" => Self::Paused,
            "maintenance" => Self::Maintenance,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable classification of a failed attempt or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Dns,
    Connect,
    ConnectionRefused,
    NetworkUnreachable,
    Tls,
    InvalidUrl,
    PrivateBlocked,
    RestrictedTarget,
    RequestFailed,
    HttpStatus,
    Keyword,
    Json,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 14] = [
        Self::Timeout,
        Self::Dns,
        Self::Connect,
        Self::ConnectionRefused,
        Self::NetworkUnreachable,
        Self::Tls,
        Self::InvalidUrl,
        Self::PrivateBlocked,
        Self::RestrictedTarget,
        Self::RequestFailed,
        Self::HttpStatus,
        Self::Keyword,
        Self::Json,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::ConnectionRefused => "connection_refused",
            Self::NetworkUnreachable => "network_unreachable",
            Self::Tls => "tls",
            Self::InvalidUrl => "invalid_url",
            Self::PrivateBlocked => "private_blocked",
            Self::RestrictedTarget => "restricted_target",
            Self::RequestFailed => "request_failed",
            Self::HttpStatus => "http_status",
            Self::Keyword => "keyword",
            Self::Json => "json",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == raw)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable runtime state, one row per monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorState {
    pub monitor_id: MonitorId,
    pub status: MonitorStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_up_at: Option<DateTime<Utc>>,
    pub last_down_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub last_status_code: Option<u16>,
    /// Raw error text, for display only.
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub retry_attempt: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub tls_days_left: Option<i64>,
    pub maintenance_active: bool,
}

impl MonitorState {
    pub fn new(monitor_id: MonitorId) -> Self {
        Self {
            monitor_id,
            ..Default::default()
        }
    }
}

/// One concluded check, kept for SLA evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub monitor_id: MonitorId,
    pub checked_at: DateTime<Utc>,
    pub ok: bool,
    pub latency_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub error_kind: Option<ErrorKind>,
}

/// Per-monitor alert bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationState {
    pub monitor_id: MonitorId,
    pub last_status: Option<MonitorStatus>,
    pub last_down_notified_at: Option<DateTime<Utc>>,
    pub last_up_notified_at: Option<DateTime<Utc>>,
    pub last_tls_notified_at: Option<DateTime<Utc>>,
    pub last_maintenance_notified_at: Option<DateTime<Utc>>,
}

impl NotificationState {
    pub fn new(monitor_id: MonitorId) -> Self {
        Self {
            monitor_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Day,
    Week,
    Month,
}

impl PeriodType {
    pub const ALL: [PeriodType; 3] = [Self::Day, Self::Week, Self::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaStatus {
    Ok,
    Violated,
    Unknown,
}

impl SlaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Violated => "violated",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "ok" => Self::Ok,
            "violated" => Self::Violated,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSlaPolicy {
    pub monitor_id: MonitorId,
    pub auto_incident: bool,
    pub incident_period: PeriodType,
    pub min_coverage_pct: f64,
}

impl MonitorSlaPolicy {
    pub fn default_for(monitor_id: MonitorId) -> Self {
        Self {
            monitor_id,
            auto_incident: false,
            incident_period: PeriodType::Month,
            min_coverage_pct: 80.0,
        }
    }
}

/// One closed SLA evaluation, keyed by (monitor, period_type, period_start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSlaPeriodResult {
    pub monitor_id: MonitorId,
    pub period_type: PeriodType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub uptime_pct: f64,
    pub coverage_pct: f64,
    pub target_pct: f64,
    pub status: SlaStatus,
    pub observed_checks: u64,
    pub expected_checks: u64,
    pub incident_created: bool,
    pub evaluated_at: DateTime<Utc>,
}

/// A half-open `[start, end)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn seconds(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// How a maintenance window recurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MaintenanceStrategy {
    /// One fixed range in UTC.
    Single {
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    },
    /// Starts at every cron fire time, local to the window's timezone.
    Cron {
        expression: String,
        duration_minutes: u32,
    },
    /// Every `every_days` days from `start_date`, at `start_time` local.
    Interval {
        every_days: u32,
        start_date: NaiveDate,
        start_time: NaiveTime,
        duration_minutes: u32,
    },
    Weekdays {
        days: Vec<Weekday>,
        start_time: NaiveTime,
        duration_minutes: u32,
    },
    MonthDays {
        days: Vec<u32>,
        start_time: NaiveTime,
        duration_minutes: u32,
    },
    /// Legacy RFC 5545 recurrence rule text.
    Rrule {
        rule: String,
        dtstart: NaiveDateTime,
        duration_minutes: u32,
    },
}

/// A maintenance (alert suppression) window definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: i64,
    pub name: String,
    /// Monitors this window applies to directly.
    #[serde(default)]
    pub monitor_ids: Vec<MonitorId>,
    /// Monitors carrying any of these tags are also covered.
    #[serde(default)]
    pub tags: Vec<String>,
    /// IANA timezone name; empty means UTC.
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub active_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_until: Option<DateTime<Utc>>,
    pub strategy: MaintenanceStrategy,
}

impl MaintenanceWindow {
    /// Whether this window covers the given monitor by id or tag.
    pub fn applies_to(&self, monitor_id: MonitorId, tags: &[String]) -> bool {
        self.monitor_ids.contains(&monitor_id) || self.tags.iter().any(|t| tags.contains(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub source: String,
    pub title: String,
    pub severity: String,
    pub description: String,
    pub status: IncidentStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIncident {
    pub source: String,
    pub title: String,
    pub severity: String,
    pub description: String,
    pub opened_at: DateTime<Utc>,
}
