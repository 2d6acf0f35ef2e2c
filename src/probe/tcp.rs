//! TCP port and ping-like checks.

use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

use super::guard::{resolve_and_validate, split_host_port, TargetPolicy};
use super::{CheckResult, ProbeError};
use crate::db::Monitor;

/// Resolve the host/port for a TCP probe.
///
/// `monitor.host` wins; otherwise the host (and port, if any) embedded in
/// `target` is used. An explicit `monitor.port` always overrides.
pub(crate) fn split_target(monitor: &Monitor) -> Result<(String, u16), ProbeError> {
    let (host, embedded_port) = if !monitor.host.trim().is_empty() {
        split_host_port(monitor.host.trim())
    } else if monitor.target.contains("://") {
        let url = url::Url::parse(monitor.target.trim())
            .map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", monitor.target, e)))?;
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .unwrap_or_default();
        (host, url.port_or_known_default())
    } else {
        let authority = monitor.target.trim().split('/').next().unwrap_or_default();
        split_host_port(authority)
    };

    if host.is_empty() {
        return Err(ProbeError::Config("empty host".to_string()));
    }
    let port = monitor
        .port
        .or(embedded_port)
        .ok_or_else(|| ProbeError::Config(format!("no port for {}", host)))?;
    if port == 0 {
        return Err(ProbeError::Config("invalid port 0".to_string()));
    }
    Ok((host, port))
}

/// Guard the target, then dial each approved address until one connects.
pub(crate) async fn dial(
    host: &str,
    port: u16,
    policy: TargetPolicy,
    timeout: Duration,
) -> Result<TcpStream, ProbeError> {
    let addrs = resolve_and_validate(host, port, policy).await?;

    let mut last_err = None;
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(map_io_error(e, timeout)),
            Err(_) => last_err = Some(ProbeError::Timeout(timeout)),
        }
    }
    Err(last_err.unwrap_or_else(|| ProbeError::Connect(format!("no address for {}", host))))
}

pub(crate) fn map_io_error(e: io::Error, timeout: Duration) -> ProbeError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused(e.to_string()),
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
            ProbeError::NetworkUnreachable(e.to_string())
        }
        io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
        _ => ProbeError::Connect(e.to_string()),
    }
}

pub(super) async fn check_tcp(
    monitor: &Monitor,
    policy: TargetPolicy,
    timeout: Duration,
) -> Result<CheckResult, ProbeError> {
    let (host, port) = split_target(monitor)?;
    let _stream = dial(&host, port, policy, timeout).await?;
    Ok(CheckResult::new(chrono::Utc::now()).succeeded())
}

/// Ping-like reachability: a TCP dial when a port is known, else a DNS lookup.
pub(super) async fn check_ping(
    monitor: &Monitor,
    policy: TargetPolicy,
    timeout: Duration,
) -> Result<CheckResult, ProbeError> {
    let raw = if monitor.host.trim().is_empty() {
        monitor.target.trim()
    } else {
        monitor.host.trim()
    };

    let (host, port) = if raw.contains("://") {
        let url = url::Url::parse(raw)
            .map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", raw, e)))?;
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .unwrap_or_default();
        (host, url.port())
    } else {
        split_host_port(raw.split('/').next().unwrap_or_default())
    };
    if host.is_empty() {
        return Err(ProbeError::Config("empty host".to_string()));
    }

    match monitor.port.or(port) {
        Some(port) => {
            let _stream = dial(&host, port, policy, timeout).await?;
        }
        None => {
            resolve_and_validate(&host, 0, policy).await?;
        }
    }
    Ok(CheckResult::new(chrono::Utc::now()).succeeded())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::GuardError;
    use tokio::net::TcpListener;

    const LOOPBACK: TargetPolicy = TargetPolicy {
        allow_private: false,
        allow_loopback: true,
    };

    fn monitor(host: &str, target: &str, port: Option<u16>) -> Monitor {
        Monitor {
            id: 3,
            monitor_type: "tcp".to_string(),
            host: host.to_string(),
            target: target.to_string(),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn test_split_target_sources() {
        assert_eq!(
            split_target(&monitor("db.internal", "", Some(5432))).unwrap(),
            ("db.internal".to_string(), 5432)
        );
        assert_eq!(
            split_target(&monitor("", "https://example.com/x", None)).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_target(&monitor("", "example.com:2222", None)).unwrap(),
            ("example.com".to_string(), 2222)
        );
        assert_eq!(
            split_target(&monitor("", "example.com:2222", Some(22))).unwrap(),
            ("example.com".to_string(), 22)
        );
        assert!(matches!(
            split_target(&monitor("", "", Some(80))),
            Err(ProbeError::Config(_))
        ));
        assert!(matches!(
            split_target(&monitor("example.com", "", None)),
            Err(ProbeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let result = check_tcp(&monitor("127.0.0.1", "", Some(port)), LOOPBACK, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_tcp_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = check_tcp(&monitor("127.0.0.1", "", Some(port)), LOOPBACK, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ConnectionRefused(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_tcp_guarded() {
        let err = check_tcp(&monitor("10.0.0.5", "", Some(22)), LOOPBACK, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Guard(GuardError::PrivateBlocked(_))));
    }

    #[tokio::test]
    async fn test_ping_variants() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut m = monitor("", &format!("http://127.0.0.1:{}/status", port), None);
        m.monitor_type = "ping".to_string();
        assert!(check_ping(&m, LOOPBACK, Duration::from_secs(2)).await.unwrap().ok);

        m.target = "127.0.0.1".to_string();
        assert!(check_ping(&m, LOOPBACK, Duration::from_secs(2)).await.unwrap().ok);

        m.target = "169.254.169.254".to_string();
        assert!(check_ping(&m, LOOPBACK, Duration::from_secs(2)).await.is_err());
    }
}
