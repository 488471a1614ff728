//! Response headers the client reads, and lenient parsers for them.
//!
//! `HeaderMap` lookups are case-insensitive. Values that are missing, not
//! ASCII, or not a plain non-negative integer read as `None`.

use reqwest::header::HeaderMap;
use std::time::Duration;

/// Tokens left in the group's window, as counted by the upstream.
pub const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Tokens the upstream charged for this call.
pub const RATELIMIT_USED: &str = "x-ratelimit-used";
/// Group the upstream metered this call against.
pub const RATELIMIT_GROUP: &str = "x-ratelimit-group";
/// Seconds to wait after a 429.
pub const RETRY_AFTER: &str = "retry-after";
/// Legacy error budget: errors left before the upstream starts refusing calls.
pub const ERROR_LIMIT_REMAIN: &str = "x-esi-error-limit-remain";
/// Legacy error budget: seconds until the budget resets.
pub const ERROR_LIMIT_RESET: &str = "x-esi-error-limit-reset";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Integer value of header `name`.
pub fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

/// Authoritative (remaining, used) token counts, each if present.
pub fn reported_tokens(headers: &HeaderMap) -> (Option<u32>, Option<u32>) {
    (header_u32(headers, RATELIMIT_REMAINING), header_u32(headers, RATELIMIT_USED))
}

/// Upstream group name, if reported.
pub fn reported_group(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, RATELIMIT_GROUP).filter(|v| !v.is_empty())
}

/// `retry-after` in delta-seconds form.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, RETRY_AFTER)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Legacy error budget (remain, reset seconds), each if present.
pub fn error_limit(headers: &HeaderMap) -> (Option<u32>, Option<u32>) {
    (header_u32(headers, ERROR_LIMIT_REMAIN), header_u32(headers, ERROR_LIMIT_RESET))
}
