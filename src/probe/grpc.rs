//! gRPC reachability: plain TCP for `grpc://`, a TLS handshake for `grpcs://`.

use rustls::pki_types::ServerName;
use std::time::Duration;

use super::guard::{split_host_port, TargetPolicy};
use super::tcp::dial;
use super::tls::{describe_certificate, TlsConnectors};
use super::{CheckResult, ProbeError};
use crate::db::Monitor;

/// Parsed gRPC target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GrpcTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

pub(crate) fn parse_grpc_target(raw: &str) -> Result<GrpcTarget, ProbeError> {
    let raw = raw.trim();
    let (tls, rest) = if let Some(rest) = raw.strip_prefix("grpcs://") {
        (true, rest)
    } else if let Some(rest) = raw.strip_prefix("grpc://") {
        (false, rest)
    } else if raw.contains("://") {
        return Err(ProbeError::InvalidUrl(format!("unsupported grpc target {}", raw)));
    } else {
        (false, raw)
    };

    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = split_host_port(authority);
    if host.is_empty() {
        return Err(ProbeError::InvalidUrl(format!("no host in {}", raw)));
    }
    let port = port.unwrap_or(if tls { 443 } else { 80 });
    if port == 0 {
        return Err(ProbeError::Config("invalid port 0".to_string()));
    }
    Ok(GrpcTarget { host, port, tls })
}

/// Target for a gRPC monitor. `monitor.host` wins over `target`, the same
/// way TCP probes resolve; a `grpcs://` scheme on either enables TLS.
pub(crate) fn grpc_target(monitor: &Monitor) -> Result<GrpcTarget, ProbeError> {
    let host = monitor.host.trim();
    if host.is_empty() {
        return parse_grpc_target(&monitor.target);
    }
    let tls = host.starts_with("grpcs://") || monitor.target.trim().starts_with("grpcs://");
    let bare = host
        .strip_prefix("grpcs://")
        .or_else(|| host.strip_prefix("grpc://"))
        .unwrap_or(host);
    if bare.contains("://") {
        return Err(ProbeError::InvalidUrl(format!("unsupported grpc host {}", host)));
    }
    let scheme = if tls { "grpcs" } else { "grpc" };
    parse_grpc_target(&format!("{}://{}", scheme, bare))
}

pub(super) async fn check_grpc(
    monitor: &Monitor,
    policy: TargetPolicy,
    timeout: Duration,
    connectors: &TlsConnectors,
) -> Result<CheckResult, ProbeError> {
    let target = grpc_target(monitor)?;
    let port = monitor.port.unwrap_or(target.port);
    let stream = dial(&target.host, port, policy, timeout).await?;

    let result = CheckResult::new(chrono::Utc::now());
    if !target.tls {
        return Ok(result.succeeded());
    }

    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", target.host, e)))?;
    let tls_stream = connectors
        .connector(monitor.ignore_tls)
        .connect(server_name, stream)
        .await
        .map_err(|e| ProbeError::Tls(e.to_string()))?;

    let (_, session) = tls_stream.get_ref();
    let descriptor = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|leaf| describe_certificate(leaf.as_ref()))
        .transpose()?;

    Ok(match descriptor {
        Some(desc) => result.with_tls(desc).succeeded(),
        None => result.succeeded(),
    })
}
