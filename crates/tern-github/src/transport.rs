//! Retry classification and backoff helpers for GitHub REST calls.

use std::time::Duration;

const RETRY_DELAY_CAP_MS: u64 = 30_000;

/// Statuses worth retrying: rate limiting and transient server failures.
pub fn is_retryable_github_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Reads a `Retry-After` header expressed in whole seconds.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff from `base_delay_ms`, overridden by a server-provided delay.
pub fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after: Option<Duration>) -> Duration {
    if let Some(retry_after) = retry_after {
        return retry_after.min(Duration::from_millis(RETRY_DELAY_CAP_MS));
    }
    let exponent = attempt.saturating_sub(1).min(10) as u32;
    let delay_ms = base_delay_ms
        .max(1)
        .saturating_mul(2_u64.saturating_pow(exponent))
        .min(RETRY_DELAY_CAP_MS);
    Duration::from_millis(delay_ms)
}

pub fn truncate_for_error(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let truncated = body.chars().take(max_chars).collect::<String>();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{is_retryable_github_status, parse_retry_after, retry_delay, truncate_for_error};

    #[test]
    fn unit_is_retryable_github_status_covers_rate_limit_and_server_errors() {
        assert!(is_retryable_github_status(429));
        assert!(is_retryable_github_status(502));
        assert!(!is_retryable_github_status(404));
        assert!(!is_retryable_github_status(422));
    }

    #[test]
    fn functional_retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(100, 1, None), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 3, None), Duration::from_millis(400));
        assert_eq!(retry_delay(10_000, 9, None), Duration::from_millis(30_000));
        assert_eq!(
            retry_delay(100, 1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn integration_parse_retry_after_reads_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert!(parse_retry_after(&headers).is_none());
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("3"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));
    }

    #[test]
    fn regression_truncate_for_error_respects_char_boundaries() {
        assert_eq!(truncate_for_error("héllo", 10), "héllo");
        assert_eq!(truncate_for_error("héllo", 2), "hé...");
    }
}
