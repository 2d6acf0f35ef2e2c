//! Protocol checker.
//!
//! Executes exactly one attempt for a monitor. Supports the HTTP family
//! (plain, keyword, JSON), TCP, ping-like and gRPC reachability checks.
//! Every network target passes the [`guard`] before a socket is opened.

pub mod guard;
mod grpc;
mod http;
mod tcp;
mod tls;

pub use guard::{GuardError, TargetPolicy};
pub use http::{parse_status_ranges, status_allowed};
pub use tls::{describe_certificate, TlsConnectors, TlsDescriptor};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::db::{ErrorKind, Monitor, MonitorType};

/// Probe error types.
///
/// These are attempt errors: the target could not be asked. A target that
/// answered wrongly is reported through [`CheckResult`] instead.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("dns lookup failed for {host}: {message}")]
    Dns { host: String, message: String },
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unsupported monitor type: {0}")]
    Unsupported(String),
    #[error("network error: {0}")]
    Network(String),
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub ok: bool,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub tls: Option<TlsDescriptor>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(checked_at: DateTime<Utc>) -> Self {
        Self {
            ok: false,
            latency_ms: 0,
            status_code: None,
            tls: None,
            error: None,
            error_kind: None,
            checked_at,
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.ok = true;
        self.error = None;
        self.error_kind = None;
        self
    }

    /// Mark as a semantic failure (the target answered, but wrongly).
    pub fn failed(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.ok = false;
        self.error = Some(message.into());
        self.error_kind = Some(kind);
        self
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_tls(mut self, tls: TlsDescriptor) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Runs a single attempt for a monitor.
///
/// The returned error, not `CheckResult::ok`, is what the retry policy
/// inspects.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, monitor: &Monitor, policy: TargetPolicy) -> (CheckResult, Option<ProbeError>);
}

/// Production checker that talks to the network.
#[derive(Clone)]
pub struct ProtocolChecker {
    tls: TlsConnectors,
}

impl ProtocolChecker {
    pub fn new() -> Result<Self, ProbeError> {
        Ok(Self {
            tls: TlsConnectors::new()?,
        })
    }

    async fn dispatch(
        &self,
        monitor: &Monitor,
        policy: TargetPolicy,
        timeout: Duration,
    ) -> Result<CheckResult, ProbeError> {
        let kind = MonitorType::parse(&monitor.monitor_type)
            .ok_or_else(|| ProbeError::Unsupported(monitor.monitor_type.clone()))?;

        match kind {
            MonitorType::Http | MonitorType::HttpKeyword | MonitorType::HttpJson => {
                http::check_http(monitor, kind, policy, timeout).await
            }
            MonitorType::Tcp => tcp::check_tcp(monitor, policy, timeout).await,
            MonitorType::Ping => tcp::check_ping(monitor, policy, timeout).await,
            MonitorType::Grpc => grpc::check_grpc(monitor, policy, timeout, &self.tls).await,
        }
    }
}

#[async_trait]
impl CheckRunner for ProtocolChecker {
    async fn run(&self, monitor: &Monitor, policy: TargetPolicy) -> (CheckResult, Option<ProbeError>) {
        let timeout = Duration::from_secs(monitor.timeout_seconds.max(1));
        let checked_at = Utc::now();
        let start = Instant::now();

        let outcome = tokio::time::timeout(timeout, self.dispatch(monitor, policy, timeout)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(mut result)) => {
                result.latency_ms = latency_ms;
                result.checked_at = checked_at;
                (result, None)
            }
            Ok(Err(e)) => {
                let mut result = CheckResult::new(checked_at).with_latency(latency_ms);
                result.error = Some(e.to_string());
                (result, Some(e))
            }
            Err(_) => {
                let e = ProbeError::Timeout(timeout);
                let mut result = CheckResult::new(checked_at).with_latency(latency_ms);
                result.error = Some(e.to_string());
                (result, Some(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unsupported_type() {
        let checker = ProtocolChecker::new().unwrap();
        let monitor = Monitor {
            monitor_type: "smtp".to_string(),
            target: "mail.example.com:25".to_string(),
            ..Default::default()
        };
        let (result, err) = checker.run(&monitor, TargetPolicy::default()).await;
        assert!(!result.ok);
        assert!(matches!(err, Some(ProbeError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_run_measures_and_stamps() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checker = ProtocolChecker::new().unwrap();
        let monitor = Monitor {
            monitor_type: "port".to_string(),
            host: "127.0.0.1".to_string(),
            port: Some(port),
            ..Default::default()
        };
        let before = Utc::now();
        let (result, err) = checker
            .run(&monitor, TargetPolicy { allow_private: false, allow_loopback: true })
            .await;
        assert!(err.is_none());
        assert!(result.ok);
        assert!(result.checked_at >= before);
    }

    #[tokio::test]
    async fn test_guard_error_surfaces() {
        let checker = ProtocolChecker::new().unwrap();
        let monitor = Monitor {
            monitor_type: "http".to_string(),
            target: "http://169.254.169.254/latest/meta-data".to_string(),
            ..Default::default()
        };
        let (result, err) = checker
            .run(&monitor, TargetPolicy { allow_private: true, allow_loopback: true })
            .await;
        assert!(!result.ok);
        assert!(matches!(err, Some(ProbeError::Guard(GuardError::Restricted(_)))));
    }
}
