//! Error classification.
//!
//! Downstream code (state, alerts, stats) only ever sees an [`ErrorKind`],
//! never raw library error text.

use crate::db::ErrorKind;
use crate::probe::{GuardError, ProbeError};

/// Classify an attempt error.
///
/// Guard errors first, then timeouts, then the typed network variants; the
/// message heuristics only apply to opaque variants.
pub fn classify_attempt_error(err: Option<&ProbeError>) -> ErrorKind {
    let Some(err) = err else {
        return ErrorKind::Unknown;
    };

    match err {
        ProbeError::Guard(GuardError::PrivateBlocked(_)) => ErrorKind::PrivateBlocked,
        ProbeError::Guard(GuardError::Restricted(_)) => ErrorKind::RestrictedTarget,
        ProbeError::Guard(GuardError::Dns { .. }) => ErrorKind::Dns,
        ProbeError::Guard(GuardError::InvalidTarget(_)) => ErrorKind::InvalidUrl,
        ProbeError::Timeout(_) => ErrorKind::Timeout,
        ProbeError::Dns { .. } => ErrorKind::Dns,
        ProbeError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
        ProbeError::NetworkUnreachable(_) => ErrorKind::NetworkUnreachable,
        ProbeError::Tls(_) => ErrorKind::Tls,
        ProbeError::Connect(_) => ErrorKind::Connect,
        ProbeError::InvalidUrl(_) | ProbeError::Config(_) => ErrorKind::InvalidUrl,
        ProbeError::Unsupported(_) => ErrorKind::Unknown,
        ProbeError::Request(msg) => classify_message(msg).unwrap_or(ErrorKind::RequestFailed),
        ProbeError::Network(msg) => classify_message(msg).unwrap_or(ErrorKind::Unknown),
    }
}

fn classify_message(msg: &str) -> Option<ErrorKind> {
    let lower = msg.to_ascii_lowercase();
    let kind = if lower.contains("deadline exceeded") || lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::Timeout
    } else if lower.contains("no such host") || lower.contains("dns") || lower.contains("failed to lookup") {
        ErrorKind::Dns
    } else if lower.contains("connection refused") {
        ErrorKind::ConnectionRefused
    } else if lower.contains("network is unreachable") || lower.contains("no route to host") {
        ErrorKind::NetworkUnreachable
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("x509") {
        ErrorKind::Tls
    } else if lower.contains("connect") {
        ErrorKind::Connect
    } else {
        return None;
    };
    Some(kind)
}

/// Classify the error string of a failed result that had no attempt error.
pub fn classify_result_error(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("http status") {
        ErrorKind::HttpStatus
    } else if lower.contains("keyword") {
        ErrorKind::Keyword
    } else if lower.contains("json") {
        ErrorKind::Json
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("invalid url") {
        ErrorKind::InvalidUrl
    } else if lower.contains("private network") {
        ErrorKind::PrivateBlocked
    } else if lower.contains("restricted") {
        ErrorKind::RestrictedTarget
    } else if lower.contains("tls") || lower.contains("certificate") {
        ErrorKind::Tls
    } else {
        ErrorKind::RequestFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_attempt_precedence() {
        let cases = vec![
            (ProbeError::Guard(GuardError::PrivateBlocked("10.0.0.1".parse().unwrap())), ErrorKind::PrivateBlocked),
            (ProbeError::Guard(GuardError::Restricted("169.254.169.254".parse().unwrap())), ErrorKind::RestrictedTarget),
            (ProbeError::Guard(GuardError::Dns { host: "x".into(), message: "nx".into() }), ErrorKind::Dns),
            (ProbeError::Timeout(Duration::from_secs(1)), ErrorKind::Timeout),
            (ProbeError::ConnectionRefused("refused".into()), ErrorKind::ConnectionRefused),
            (ProbeError::NetworkUnreachable("x".into()), ErrorKind::NetworkUnreachable),
            // Typed variant wins over message text
            (ProbeError::Connect("tls timeout".into()), ErrorKind::Connect),
            (ProbeError::Tls("bad cert".into()), ErrorKind::Tls),
            (ProbeError::InvalidUrl("x".into()), ErrorKind::InvalidUrl),
            (ProbeError::Config("empty host".into()), ErrorKind::InvalidUrl),
            (ProbeError::Unsupported("smtp".into()), ErrorKind::Unknown),
            (ProbeError::Request("connection reset".into()), ErrorKind::Connect),
            (ProbeError::Request("body error".into()), ErrorKind::RequestFailed),
            (ProbeError::Network("context deadline exceeded".into()), ErrorKind::Timeout),
            (ProbeError::Network("x509: certificate expired".into()), ErrorKind::Tls),
            (ProbeError::Network("weird".into()), ErrorKind::Unknown),
        ];
        for (err, expected) in cases {
            assert_eq!(classify_attempt_error(Some(&err)), expected, "{:?}", err);
        }
        assert_eq!(classify_attempt_error(None), ErrorKind::Unknown);
    }

    #[test]
    fn test_result_classification_is_total() {
        assert_eq!(classify_result_error("http status 503 not allowed"), ErrorKind::HttpStatus);
        assert_eq!(classify_result_error("keyword \"ok\" not found"), ErrorKind::Keyword);
        assert_eq!(classify_result_error("json body invalid"), ErrorKind::Json);
        assert_eq!(classify_result_error("probe timed out"), ErrorKind::Timeout);
        assert_eq!(classify_result_error("private network blocked: 10.0.0.1"), ErrorKind::PrivateBlocked);
        assert_eq!(classify_result_error("restricted target"), ErrorKind::RestrictedTarget);
        assert_eq!(classify_result_error(""), ErrorKind::RequestFailed);
        assert_eq!(classify_result_error("???"), ErrorKind::RequestFailed);
    }

    #[test]
    fn test_error_text_feeds_back_into_result_classifier() {
        let errors = [
            ProbeError::Guard(GuardError::PrivateBlocked("10.0.0.1".parse().unwrap())),
            ProbeError::Guard(GuardError::Restricted("0.0.0.0".parse().unwrap())),
            ProbeError::Timeout(Duration::from_secs(3)),
            ProbeError::InvalidUrl("nope".into()),
            ProbeError::Tls("handshake".into()),
        ];
        for err in &errors {
            assert_eq!(
                classify_result_error(&err.to_string()),
                classify_attempt_error(Some(err)),
                "{}",
                err
            );
        }
    }
}
