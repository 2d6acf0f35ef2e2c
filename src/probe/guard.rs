//! SSRF guard applied to every probe target before a socket is opened.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Which non-public address families a probe may reach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetPolicy {
    pub allow_private: bool,
    pub allow_loopback: bool,
}

/// Target validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("private network blocked: {0}")]
    PrivateBlocked(IpAddr),
    #[error("restricted target: {0}")]
    Restricted(IpAddr),
    #[error("dns lookup failed for {host}: {message}")]
    Dns { host: String, message: String },
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

const METADATA_V4: [Ipv4Addr; 2] = [
    Ipv4Addr::new(169, 254, 169, 254),
    Ipv4Addr::new(169, 254, 170, 2),
];

/// fd00:ec2::/32 holds the EC2 metadata, DNS and time sync endpoints.
fn is_metadata_v6(v6: Ipv6Addr) -> bool {
    let seg = v6.segments();
    seg[0] == 0xfd00 && seg[1] == 0x0ec2
}

/// Validate a single address against the policy.
pub fn check_ip(ip: IpAddr, policy: TargetPolicy) -> Result<(), GuardError> {
    let ip = normalize(ip);

    match ip {
        IpAddr::V4(v4) => {
            if METADATA_V4.contains(&v4)
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_link_local()
            {
                return Err(GuardError::Restricted(ip));
            }
            if v4.is_loopback() {
                return if policy.allow_loopback {
                    Ok(())
                } else {
                    Err(GuardError::PrivateBlocked(ip))
                };
            }
            if is_private_v4(v4) && !policy.allow_private {
                return Err(GuardError::PrivateBlocked(ip));
            }
        }
        IpAddr::V6(v6) => {
            if is_metadata_v6(v6) || v6.is_unspecified() || v6.is_multicast() || is_link_local_v6(v6)
            {
                return Err(GuardError::Restricted(ip));
            }
            if v6.is_loopback() {
                return if policy.allow_loopback {
                    Ok(())
                } else {
                    Err(GuardError::PrivateBlocked(ip))
                };
            }
            if is_unique_local_v6(v6) && !policy.allow_private {
                return Err(GuardError::PrivateBlocked(ip));
            }
        }
    }
    Ok(())
}

/// Resolve `host` (IP literal or DNS name) and validate every address.
///
/// All returned addresses carry `port`. DNS is queried on every call, so a
/// target whose answer changes between attempts is re-checked.
pub async fn resolve_and_validate(
    host: &str,
    port: u16,
    policy: TargetPolicy,
) -> Result<Vec<SocketAddr>, GuardError> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(GuardError::InvalidTarget("empty host".to_string()));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        check_ip(ip, policy)?;
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| GuardError::Dns {
            host: host.to_string(),
            message: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(GuardError::Dns {
            host: host.to_string(),
            message: "no addresses returned".to_string(),
        });
    }

    for addr in &addrs {
        check_ip(addr.ip(), policy)?;
    }
    Ok(addrs)
}

/// Validate a raw host, `host:port` or URL target and return its addresses.
pub async fn validate_target(raw: &str, policy: TargetPolicy) -> Result<Vec<IpAddr>, GuardError> {
    let host = extract_host(raw)?;
    let addrs = resolve_and_validate(&host, 0, policy).await?;
    Ok(addrs.into_iter().map(|a| a.ip()).collect())
}

/// Pull the host portion out of a URL, `host:port`, `[v6]:port` or bare host.
pub fn extract_host(raw: &str) -> Result<String, GuardError> {
    let raw = raw.trim();
    if raw.contains("://") {
        let url = url::Url::parse(raw).map_err(|e| GuardError::InvalidTarget(e.to_string()))?;
        return url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GuardError::InvalidTarget(format!("no host in {}", raw)));
    }

    let authority = raw.split('/').next().unwrap_or_default();
    let (host, _) = split_host_port(authority);
    if host.is_empty() {
        return Err(GuardError::InvalidTarget("empty host".to_string()));
    }
    Ok(host)
}

/// Split `host[:port]`, accepting bracketed and bare IPv6 literals.
///
/// A bare IPv6 address (more than one colon, no brackets) never carries a port.
pub fn split_host_port(raw: &str) -> (String, Option<u16>) {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    if raw.matches(':').count() == 1 {
        if let Some((host, port)) = raw.rsplit_once(':') {
            return (host.to_string(), port.parse().ok());
        }
    }
    (raw.to_string(), None)
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_private()
        // CGNAT 100.64.0.0/10
        || (o[0] == 100 && (o[1] & 0xc0) == 64)
        // Benchmarking 198.18.0.0/15
        || (o[0] == 198 && (o[1] & 0xfe) == 18)
        // IETF protocol assignments 192.0.0.0/24
        || (o[0] == 192 && o[1] == 0 && o[2] == 0)
}

fn is_unique_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_link_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: TargetPolicy = TargetPolicy {
        allow_private: false,
        allow_loopback: false,
    };
    const OPEN: TargetPolicy = TargetPolicy {
        allow_private: true,
        allow_loopback: true,
    };

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_metadata_always_restricted() {
        for addr in [
            "169.254.169.254",
            "169.254.170.2",
            "fd00:ec2::254",
            "fd00:ec2::253",
            "fd00:ec2::23",
            "fd00:ec2::1",
            "::ffff:169.254.169.254",
        ] {
            assert_eq!(
                check_ip(ip(addr), OPEN),
                Err(GuardError::Restricted(normalize(ip(addr)))),
                "{}",
                addr
            );
        }
    }

    #[test]
    fn test_ula_outside_metadata_prefix_follows_policy() {
        assert!(check_ip(ip("fd00:ec3::254"), OPEN).is_ok());
        assert!(matches!(
            check_ip(ip("fd00:ec3::254"), STRICT),
            Err(GuardError::PrivateBlocked(_))
        ));
    }

    #[test]
    fn test_private_depends_on_policy() {
        assert!(matches!(
            check_ip(ip("10.0.0.1"), STRICT),
            Err(GuardError::PrivateBlocked(_))
        ));
        assert!(check_ip(ip("10.0.0.1"), TargetPolicy { allow_private: true, allow_loopback: false }).is_ok());
        assert!(matches!(
            check_ip(ip("100.64.1.1"), STRICT),
            Err(GuardError::PrivateBlocked(_))
        ));
        assert!(matches!(
            check_ip(ip("fd12:3456::1"), STRICT),
            Err(GuardError::PrivateBlocked(_))
        ));
    }

    #[test]
    fn test_loopback_depends_on_policy() {
        assert!(matches!(
            check_ip(ip("127.0.0.1"), TargetPolicy { allow_private: true, allow_loopback: false }),
            Err(GuardError::PrivateBlocked(_))
        ));
        assert!(check_ip(ip("127.0.0.1"), TargetPolicy { allow_private: false, allow_loopback: true }).is_ok());
        assert!(check_ip(ip("::1"), OPEN).is_ok());
        assert!(check_ip(ip("::ffff:127.0.0.1"), STRICT).is_err());
    }

    #[test]
    fn test_unconditional_rejections() {
        for addr in ["0.0.0.0", "224.0.0.1", "169.254.1.1", "::", "ff02::1", "fe80::1"] {
            assert!(
                matches!(check_ip(ip(addr), OPEN), Err(GuardError::Restricted(_))),
                "{}",
                addr
            );
        }
    }

    #[test]
    fn test_public_allowed() {
        assert!(check_ip(ip("93.184.216.34"), STRICT).is_ok());
        assert!(check_ip(ip("2606:2800:220:1::1"), STRICT).is_ok());
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("https://example.com:8443/x").unwrap(), "example.com");
        assert_eq!(extract_host("http://[::1]:80/").unwrap(), "::1");
        assert_eq!(extract_host("example.com:22").unwrap(), "example.com");
        assert_eq!(extract_host("example.com/health").unwrap(), "example.com");
        assert_eq!(extract_host("[2001:db8::1]:443").unwrap(), "2001:db8::1");
        assert!(extract_host("").is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("db:5432"), ("db".to_string(), Some(5432)));
        assert_eq!(split_host_port("db"), ("db".to_string(), None));
        assert_eq!(split_host_port("2001:db8::1"), ("2001:db8::1".to_string(), None));
        assert_eq!(split_host_port("[::1]:9000"), ("::1".to_string(), Some(9000)));
    }

    #[tokio::test]
    async fn test_validate_target_literals() {
        let addrs = validate_target("http://127.0.0.1:8080/health", OPEN).await.unwrap();
        assert_eq!(addrs, vec![ip("127.0.0.1")]);

        let err = validate_target("http://169.254.169.254/latest", OPEN).await.unwrap_err();
        assert!(matches!(err, GuardError::Restricted(_)));

        let err = validate_target("10.1.2.3:22", STRICT).await.unwrap_err();
        assert!(matches!(err, GuardError::PrivateBlocked(_)));
    }
}
