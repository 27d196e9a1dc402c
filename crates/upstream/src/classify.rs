//! Upstream error classification
//!
//! Converts an HTTP status and free-text error body into a structured
//! `Error`. Distinguishes quota exhaustion (credential is done for good) from
//! short-term rate limiting (credential cools down for the hinted duration).
//! The provider's message format is not a stable contract, so all text
//! matching lives here and nowhere else.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::Error;

/// Phrases in 429 bodies that mean the credential's quota is exhausted,
/// not a per-minute limit.
const QUOTA_PATTERNS: &[&str] = &[
    "exceeded your current quota",
    "insufficient_quota",
    "check your plan and billing",
    "billing hard limit",
];

/// Matches hints like "Please try again in 1.772s" or "try again in 250ms".
static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)try again in\s+([0-9]+(?:\.[0-9]+)?)\s*(ms|s)\b")
        .expect("retry-after pattern is valid")
});

/// Extract the retry-after hint from an error message.
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = RETRY_AFTER.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let millis = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "ms" => value,
        _ => value * 1000.0,
    };
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    Some(Duration::from_millis(millis.round() as u64))
}

/// Parse a `Retry-After` header carrying delta-seconds.
pub fn parse_retry_after_header(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Classify a 429 body as quota exhaustion or rate limiting.
pub fn classify_429(body: &str) -> Error {
    let lower = body.to_lowercase();
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Error::QuotaExceeded(body.to_string());
    }
    Error::RateLimited {
        retry_after: parse_retry_after(body),
        message: body.to_string(),
    }
}

/// Classify an upstream error by HTTP status and response body.
///
/// 429 dispatches to `classify_429`. 408 and 5xx are transient. Every other
/// status is a permanent API error surfaced as-is.
pub fn classify_status(status: u16, body: &str) -> Error {
    match status {
        429 => classify_429(body),
        408 | 500..=599 => Error::Transient(format!("status {status}: {body}")),
        _ => Error::Permanent {
            status,
            message: body.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_message_is_quota_exceeded() {
        let body = r#"{"error":{"message":"You exceeded your current quota, please check your plan and billing details.","type":"insufficient_quota"}}"#;
        assert!(matches!(classify_429(body), Error::QuotaExceeded(_)));
    }

    #[test]
    fn quota_code_alone_is_quota_exceeded() {
        let body = r#"{"error":{"message":"nope","code":"insufficient_quota"}}"#;
        assert!(matches!(classify_status(429, body), Error::QuotaExceeded(_)));
    }

    #[test]
    fn rate_limit_extracts_seconds_hint() {
        let body = "Rate limit reached for gpt-4o-mini on tokens per min (TPM): Limit 200000, Used 130491, Requested 75418. Please try again in 1.772s. Visit the docs.";
        match classify_429(body) {
            Error::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_millis(1772)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_extracts_millisecond_hint() {
        assert_eq!(
            parse_retry_after("Please try again in 250ms."),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn rate_limit_without_hint_has_none() {
        match classify_429("Rate limit exceeded") {
            Error::RateLimited { retry_after, .. } => assert!(retry_after.is_none()),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn retry_after_header_parses_delta_seconds() {
        assert_eq!(parse_retry_after_header(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after_header("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [408, 500, 502, 503, 504] {
            assert!(classify_status(status, "oops").is_transient(), "{status}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 422] {
            match classify_status(status, "bad") {
                Error::Permanent { status: s, .. } => assert_eq!(s, status),
                other => panic!("expected Permanent for {status}, got {other:?}"),
            }
        }
    }
}
