//! HTTP family checks: plain status, keyword and JSON body variants.

use reqwest::redirect::Policy;
use std::error::Error as StdError;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use super::guard::{resolve_and_validate, TargetPolicy};
use super::tls::describe_certificate;
use super::{CheckResult, ProbeError};
use crate::db::{ErrorKind, Monitor, MonitorType};

/// Parse allowed status entries ("200", "200-299", "2xx").
///
/// Malformed entries are skipped; an empty result means `200..=299`.
pub fn parse_status_ranges(entries: &[String]) -> Vec<RangeInclusive<u16>> {
    let ranges: Vec<_> = entries.iter().filter_map(|e| parse_status_entry(e)).collect();
    if ranges.is_empty() {
        vec![200..=299]
    } else {
        ranges
    }
}

fn parse_status_entry(raw: &str) -> Option<RangeInclusive<u16>> {
    let raw = raw.trim().to_ascii_lowercase();
    if let Some((lo, hi)) = raw.split_once('-') {
        let lo: u16 = lo.trim().parse().ok()?;
        let hi: u16 = hi.trim().parse().ok()?;
        return (lo <= hi && (100..=599).contains(&lo)).then_some(lo..=hi);
    }
    if raw.len() == 3 && raw.ends_with("xx") {
        let class: u16 = raw[..1].parse().ok()?;
        return (1..=5).contains(&class).then_some(class * 100..=class * 100 + 99);
    }
    let code: u16 = raw.parse().ok()?;
    (100..=599).contains(&code).then_some(code..=code)
}

pub fn status_allowed(code: u16, ranges: &[RangeInclusive<u16>]) -> bool {
    ranges.iter().any(|r| r.contains(&code))
}

/// Run one HTTP attempt. Redirects are never followed.
pub(super) async fn check_http(
    monitor: &Monitor,
    kind: MonitorType,
    policy: TargetPolicy,
    timeout: Duration,
) -> Result<CheckResult, ProbeError> {
    let url = url::Url::parse(monitor.target.trim())
        .map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", monitor.target, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProbeError::InvalidUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProbeError::InvalidUrl(format!("no host in {}", monitor.target)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProbeError::InvalidUrl(format!("no port for {}", monitor.target)))?;

    let addrs = resolve_and_validate(&host, port, policy).await?;

    let mut builder = reqwest::Client::builder()
        .redirect(Policy::none())
        .danger_accept_invalid_certs(monitor.ignore_tls)
        .tls_info(true)
        .timeout(timeout);
    // Pin the connection to the addresses the guard just approved
    if host.parse::<IpAddr>().is_err() {
        builder = builder.resolve_to_addrs(&host, &addrs);
    }
    let client = builder
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let method = if monitor.method.trim().is_empty() {
        reqwest::Method::GET
    } else {
        reqwest::Method::from_bytes(monitor.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ProbeError::Config(format!("invalid method {}", monitor.method)))?
    };

    let mut request = client.request(method, url);
    for (name, value) in &monitor.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &monitor.body {
        request = request.body(body.clone());
    }

    let response = request
        .send()
        .await
        .map_err(|e| map_reqwest_error(e, timeout))?;

    let status = response.status().as_u16();
    let tls = response
        .extensions()
        .get::<reqwest::tls::TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .and_then(|der| describe_certificate(der).ok());

    let mut result = CheckResult::new(chrono::Utc::now()).with_status(status);
    if let Some(desc) = tls {
        result = result.with_tls(desc);
    }

    let ranges = parse_status_ranges(&monitor.allowed_status);
    if !status_allowed(status, &ranges) {
        return Ok(result.failed(
            ErrorKind::HttpStatus,
            format!("http status {} not allowed", status),
        ));
    }

    match kind {
        MonitorType::HttpKeyword => {
            let keyword = monitor
                .keyword
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| ProbeError::Config("keyword monitor without keyword".to_string()))?;
            let body = response
                .text()
                .await
                .map_err(|e| map_reqwest_error(e, timeout))?;
            if !body.contains(keyword) {
                return Ok(result.failed(
                    ErrorKind::Keyword,
                    format!("keyword {:?} not found in response", keyword),
                ));
            }
        }
        MonitorType::HttpJson => {
            let body = response
                .bytes()
                .await
                .map_err(|e| map_reqwest_error(e, timeout))?;
            if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
                return Ok(result.failed(ErrorKind::Json, format!("json body invalid: {}", e)));
            }
        }
        _ => {}
    }

    Ok(result.succeeded())
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout(timeout);
    }
    let detail = error_chain(&e);
    if e.is_builder() {
        return ProbeError::InvalidUrl(detail);
    }
    if e.is_connect() {
        if let Some(io) = find_io_error(&e) {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return ProbeError::ConnectionRefused(detail)
                }
                std::io::ErrorKind::NetworkUnreachable | std::io::ErrorKind::HostUnreachable => {
                    return ProbeError::NetworkUnreachable(detail)
                }
                std::io::ErrorKind::TimedOut => return ProbeError::Timeout(timeout),
                _ => {}
            }
        }
        let lower = detail.to_ascii_lowercase();
        if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
            return ProbeError::Tls(detail);
        }
        return ProbeError::Connect(detail);
    }
    ProbeError::Request(detail)
}

fn find_io_error<'a>(e: &'a (dyn StdError + 'static)) -> Option<&'a std::io::Error> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        current = err.source();
    }
    None
}

/// Flatten an error and its sources into one line.
fn error_chain(e: &(dyn StdError + 'static)) -> String {
    let mut out = e.to_string();
    let mut current = e.source();
    while let Some(err) = current {
        let text = err.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        current = err.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LOOPBACK: TargetPolicy = TargetPolicy {
        allow_private: false,
        allow_loopback: true,
    };

    /// Serve one canned HTTP response per connection.
    async fn serve(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{}/health", addr)
    }

    fn monitor(target: String, kind: &str) -> Monitor {
        Monitor {
            id: 1,
            monitor_type: kind.to_string(),
            target,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_status_ranges() {
        let entries: Vec<String> = ["200", "300-302", "4xx", "bogus", "700"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ranges = parse_status_ranges(&entries);
        assert_eq!(ranges, vec![200..=200, 300..=302, 400..=499]);
        assert!(status_allowed(404, &ranges));
        assert!(!status_allowed(201, &ranges));

        assert_eq!(parse_status_ranges(&[]), vec![200..=299]);
        assert_eq!(parse_status_ranges(&["nope".to_string()]), vec![200..=299]);
    }

    #[tokio::test]
    async fn test_http_ok() {
        let url = serve("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let result = check_http(&monitor(url, "http"), MonitorType::Http, LOOPBACK, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.status_code, Some(200));
        assert!(result.tls.is_none());
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let url = serve(
            "HTTP/1.1 302 Found\r\nLocation: http://169.254.169.254/\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let result = check_http(&monitor(url.clone(), "http"), MonitorType::Http, LOOPBACK, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.status_code, Some(302));
        assert_eq!(result.error_kind, Some(ErrorKind::HttpStatus));

        let mut allowed = monitor(url, "http");
        allowed.allowed_status = vec!["3xx".to_string()];
        let result = check_http(&allowed, MonitorType::Http, LOOPBACK, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_keyword_and_json() {
        let url = serve(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 15\r\nConnection: close\r\n\r\n{\"status\":\"up\"}",
        )
        .await;

        let mut kw = monitor(url.clone(), "keyword");
        kw.keyword = Some("\"up\"".to_string());
        let result = check_http(&kw, MonitorType::HttpKeyword, LOOPBACK, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.ok);

        kw.keyword = Some("degraded".to_string());
        let result = check_http(&kw, MonitorType::HttpKeyword, LOOPBACK, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::Keyword));

        let result = check_http(&monitor(url, "json"), MonitorType::HttpJson, LOOPBACK, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let url = serve("HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\n{oops").await;
        let result = check_http(&monitor(url, "json"), MonitorType::HttpJson, LOOPBACK, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::Json));
    }

    #[tokio::test]
    async fn test_guard_runs_before_request() {
        let err = check_http(
            &monitor("http://127.0.0.1:9/".to_string(), "http"),
            MonitorType::Http,
            TargetPolicy::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Guard(_)));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = check_http(
            &monitor("not a url".to_string(), "http"),
            MonitorType::Http,
            LOOPBACK,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidUrl(_)));
    }
}
