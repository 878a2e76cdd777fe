/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current UTC time as an RFC 3339 string with millisecond precision.
pub fn current_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Returns true once `since_unix_ms + timeout_ms` is no longer in the future.
pub fn is_idle_past(since_unix_ms: u64, timeout_ms: u64, now_unix_ms: u64) -> bool {
    now_unix_ms.saturating_sub(since_unix_ms) >= timeout_ms
}
