//! Response headers the gate attaches to every request it sees.

use std::time::Duration;

/// Header list as (lowercase name, value).
pub type HeaderList = Vec<(&'static str, String)>;

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
pub const RETRY_AFTER: &str = "retry-after";
pub const EMERGENCY_MODE: &str = "x-emergency-mode";

/// Standard hardening headers.
pub fn hardening() -> HeaderList {
    vec![
        ("x-content-type-options", "nosniff".to_string()),
        ("x-frame-options", "DENY".to_string()),
        ("x-xss-protection", "1; mode=block".to_string()),
        ("referrer-policy", "no-referrer".to_string()),
        (
            "strict-transport-security",
            "max-age=31536000; includeSubDomains".to_string(),
        ),
    ]
}

/// Rate-limit counters. `reset` is rounded up to whole seconds.
pub fn rate_limit(limit: u32, remaining: u32, reset: Duration) -> HeaderList {
    vec![
        (RATE_LIMIT_LIMIT, limit.to_string()),
        (RATE_LIMIT_REMAINING, remaining.to_string()),
        (RATE_LIMIT_RESET, ceil_secs(reset).to_string()),
    ]
}

/// Whole seconds, rounded up, never below 1 for a non-zero duration.
pub fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
