//! TLS client configuration and peer certificate inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use x509_parser::extensions::GeneralName;

use super::ProbeError;

/// What a successful handshake tells us about the peer certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDescriptor {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub issuer: String,
    pub common_name: String,
    pub san: Vec<String>,
    /// Lowercase hex SHA-256 of the DER certificate.
    pub fingerprint_sha256: String,
}

impl TlsDescriptor {
    /// Whole days (floored) until `not_after`, negative once expired.
    pub fn days_left(&self, at: DateTime<Utc>) -> i64 {
        (self.not_after - at).num_seconds().div_euclid(86_400)
    }
}

/// Build a descriptor from a DER-encoded leaf certificate.
pub fn describe_certificate(der: &[u8]) -> Result<TlsDescriptor, ProbeError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ProbeError::Tls(format!("certificate parse failed: {}", e)))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| ProbeError::Tls("certificate not_before out of range".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| ProbeError::Tls("certificate not_after out of range".to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut san = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => san.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        san.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    Ok(TlsDescriptor {
        not_before,
        not_after,
        issuer: cert.issuer().to_string(),
        common_name,
        san,
        fingerprint_sha256: hex::encode(Sha256::digest(der)),
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Pre-built connectors for `grpcs://` probes.
#[derive(Clone)]
pub struct TlsConnectors {
    verified: TlsConnector,
    insecure: TlsConnector,
}

impl TlsConnectors {
    /// Mozilla roots for verified dials, plus a no-verify config for
    /// monitors with `ignore_tls` set.
    pub fn new() -> Result<Self, ProbeError> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let verified = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Config(format!("tls protocol version error: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        let insecure = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Config(format!("tls protocol version error: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
        .with_no_client_auth();

        Ok(Self {
            verified: TlsConnector::from(Arc::new(verified)),
            insecure: TlsConnector::from(Arc::new(insecure)),
        })
    }

    pub fn connector(&self, ignore_tls: bool) -> &TlsConnector {
        if ignore_tls {
            &self.insecure
        } else {
            &self.verified
        }
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate. Only used for `ignore_tls` monitors.
    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &[u8] = include_bytes!("testdata/self_signed.der");

    #[test]
    fn test_describe_certificate() {
        let desc = describe_certificate(CERT).unwrap();
        assert_eq!(desc.common_name, "uptrail.test");
        assert!(desc.issuer.contains("Uptrail Test CA"));
        assert_eq!(
            desc.san,
            vec!["uptrail.test".to_string(), "www.uptrail.test".to_string(), "127.0.0.1".to_string()]
        );
        assert_eq!(
            desc.fingerprint_sha256,
            "9ec4d97b24d8b39038500a655fc165b23d196372f417c92955714d6abb03dc0d"
        );
        assert_eq!((desc.not_after - desc.not_before).num_days(), 3650);
    }

    #[test]
    fn test_describe_garbage_fails() {
        assert!(matches!(describe_certificate(b"not a cert"), Err(ProbeError::Tls(_))));
    }

    #[test]
    fn test_days_left_floors() {
        let desc = describe_certificate(CERT).unwrap();
        let at = desc.not_after - chrono::Duration::hours(36);
        assert_eq!(desc.days_left(at), 1);
        let after = desc.not_after + chrono::Duration::hours(1);
        assert_eq!(desc.days_left(after), -1);
    }

    #[test]
    fn test_connectors_build() {
        assert!(TlsConnectors::new().is_ok());
    }
}
