//! The security gate: admission decision per request.
//!
//! Order of checks for a non-allow-listed identity:
//!
//! 1. emergency breaker (aggregate volume, every request is metered)
//! 2. blocked user agents
//! 3. suspicion flag
//! 4. probe paths (counted as failures, not denied outright)
//! 5. sliding-window budget
//!
//! Every decision carries the header set to attach to the response, denial
//! or not. A panic inside the check is logged and the request is allowed.

use crate::emergency::EmergencyBreaker;
use crate::headers::{self, HeaderList, EMERGENCY_MODE, RETRY_AFTER};
use crate::limiter::SlidingWindowLimiter;
use crate::scorer::{ScorerConfig, SuspicionScorer};
use fleetlink_types::config::SecurityConfig;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const EMERGENCY_REASON: &str = "Service under attack: DDoS protection engaged, retry later";
const BLOCKED_REASON: &str = "Client blocked: user agent not permitted";
const SUSPICIOUS_REASON: &str = "Suspicious activity detected, access temporarily restricted";

// ---------------------------------------------------------------------------
// Decision types
// ---------------------------------------------------------------------------

/// Structured denial reason. The HTTP status comes from here, not from text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCode {
    RateLimited,
    Suspicious,
    Blocked,
    Emergency,
}

impl DenyCode {
    pub fn status(&self) -> u16 {
        match self {
            DenyCode::RateLimited => 429,
            DenyCode::Suspicious | DenyCode::Blocked => 403,
            DenyCode::Emergency => 503,
        }
    }

    /// Machine-readable `error` field of the denial body.
    pub fn error_code(&self) -> &'static str {
        match self {
            DenyCode::RateLimited => "rate_limited",
            DenyCode::Suspicious => "suspicious_activity",
            DenyCode::Blocked => "blocked",
            DenyCode::Emergency => "emergency_mode",
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub code: DenyCode,
    pub message: String,
    /// Seconds the client should wait, when known.
    pub retry_after: Option<u64>,
}

/// Result of [`SecurityGate::check_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub denial: Option<Denial>,
    /// Attach to the response in every case.
    pub headers: HeaderList,
}

impl GateDecision {
    fn allow(headers: HeaderList) -> Self {
        Self {
            allowed: true,
            denial: None,
            headers,
        }
    }

    fn deny(code: DenyCode, message: impl Into<String>, retry_after: Option<Duration>, headers: HeaderList) -> Self {
        Self {
            allowed: false,
            denial: Some(Denial {
                code,
                message: message.into(),
                retry_after: retry_after.map(headers::ceil_secs),
            }),
            headers,
        }
    }

    /// HTTP status this decision implies (200 when allowed).
    pub fn status(&self) -> u16 {
        self.denial.as_ref().map_or(200, |d| d.code.status())
    }

    pub fn reason(&self) -> Option<&str> {
        self.denial.as_ref().map(|d| d.message.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status for a free-text reason, by substring.
///
/// Agrees with [`DenyCode::status`] for every reason the gate produces.
pub fn status_for_reason(reason: &str) -> u16 {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("ddos") || lower.contains("attack") {
        503
    } else if lower.contains("suspicious") || lower.contains("blocked") {
        403
    } else {
        429
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Counters for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySnapshot {
    pub identity: String,
    pub requests_in_window: u32,
    pub score: u32,
    pub flagged_for_secs: Option<u64>,
}

/// Gate-wide view for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSnapshot {
    pub enabled: bool,
    pub emergency_mode: bool,
    pub tracked_identities: usize,
    pub flagged: Vec<IdentitySnapshot>,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Admission control in front of the hub's entry points.
#[derive(Debug)]
pub struct SecurityGate {
    config: SecurityConfig,
    limiter: SlidingWindowLimiter,
    scorer: SuspicionScorer,
    emergency: EmergencyBreaker,
    allow_list: HashSet<String>,
    blocked_agents: Vec<String>,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig) -> Self {
        let limiter = SlidingWindowLimiter::new(
            Duration::from_millis(config.rate_limit_window_ms),
            config.rate_limit_max_requests,
        );
        let scorer = SuspicionScorer::new(ScorerConfig {
            window: Duration::from_millis(config.suspicious_window_ms),
            threshold: config.suspicious_threshold,
            decay: Duration::from_millis(config.suspicious_decay_ms),
            failure_weight: config.failure_weight,
        });
        let emergency = EmergencyBreaker::new(
            config.ddos_requests_per_second,
            Duration::from_millis(config.emergency_cooldown_ms),
        );
        let allow_list = config.allow_list.iter().cloned().collect();
        let blocked_agents = config
            .blocked_user_agents
            .iter()
            .map(|a| a.to_ascii_lowercase())
            .collect();
        Self {
            config,
            limiter,
            scorer,
            emergency,
            allow_list,
            blocked_agents,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Decide whether to admit a request.
    pub fn check_request(
        &self,
        ip: &str,
        user_id: Option<&str>,
        path: &str,
        user_agent: Option<&str>,
    ) -> GateDecision {
        self.check_request_at(ip, user_id, path, user_agent, Instant::now())
    }

    /// [`check_request`](Self::check_request) at an explicit instant.
    pub fn check_request_at(
        &self,
        ip: &str,
        user_id: Option<&str>,
        path: &str,
        user_agent: Option<&str>,
        now: Instant,
    ) -> GateDecision {
        let checked = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.evaluate(ip, user_id, path, user_agent, now)
        }));
        match checked {
            Ok(decision) => decision,
            Err(_) => {
                error!(ip, path, "Security gate check panicked, failing open");
                let mut headers = headers::hardening();
                headers.extend(headers::rate_limit(
                    self.config.rate_limit_max_requests,
                    self.config.rate_limit_max_requests,
                    Duration::from_millis(self.config.rate_limit_window_ms),
                ));
                GateDecision::allow(headers)
            }
        }
    }

    /// Record a request that completed with a success status.
    pub fn record_api_success(&self, ip: &str, user_id: Option<&str>) {
        self.record_api_success_at(ip, user_id, Instant::now());
    }

    pub fn record_api_success_at(&self, ip: &str, user_id: Option<&str>, now: Instant) {
        if self.is_exempt(ip) {
            return;
        }
        self.scorer.record_success(&identity_key(ip, user_id), now);
    }

    /// Record a request that completed with an error status.
    pub fn record_api_failure(&self, ip: &str, user_id: Option<&str>) {
        self.record_api_failure_at(ip, user_id, Instant::now());
    }

    pub fn record_api_failure_at(&self, ip: &str, user_id: Option<&str>, now: Instant) {
        if self.is_exempt(ip) {
            return;
        }
        self.scorer.record_failure(&identity_key(ip, user_id), now, 1);
    }

    /// Evict idle identities. Returns how many entries were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let ttl = Duration::from_millis(self.config.idle_ttl_ms);
        let removed = self.limiter.sweep(now, ttl) + self.scorer.sweep(now, ttl);
        if removed > 0 {
            debug!(removed, "Evicted idle security identities");
        }
        removed
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.is_active(Instant::now())
    }

    /// Counters for `ip` (and `user_id`).
    pub fn identity(&self, ip: &str, user_id: Option<&str>) -> IdentitySnapshot {
        self.identity_at(&identity_key(ip, user_id), Instant::now())
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let now = Instant::now();
        let mut tracked: BTreeSet<String> = self.limiter.keys().into_iter().collect();
        tracked.extend(self.scorer.keys());
        let mut flagged: Vec<IdentitySnapshot> = self
            .scorer
            .flagged(now)
            .into_iter()
            .map(|(key, _)| self.identity_at(&key, now))
            .collect();
        flagged.sort_by(|a, b| a.identity.cmp(&b.identity));
        GateSnapshot {
            enabled: self.config.enabled,
            emergency_mode: self.emergency.is_active(now),
            tracked_identities: tracked.len(),
            flagged,
        }
    }

    fn identity_at(&self, key: &str, now: Instant) -> IdentitySnapshot {
        IdentitySnapshot {
            identity: key.to_string(),
            requests_in_window: self.limiter.count(key, now),
            score: self.scorer.score(key, now),
            flagged_for_secs: self.scorer.flagged_for(key, now).map(headers::ceil_secs),
        }
    }

    fn is_exempt(&self, ip: &str) -> bool {
        !self.config.enabled || self.allow_list.contains(ip)
    }

    fn is_blocked_agent(&self, user_agent: Option<&str>) -> bool {
        let Some(agent) = user_agent else {
            return false;
        };
        let agent = agent.to_ascii_lowercase();
        self.blocked_agents.iter().any(|b| agent.contains(b.as_str()))
    }

    fn is_probe(&self, path: &str) -> bool {
        self.config
            .probe_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }

    fn evaluate(
        &self,
        ip: &str,
        user_id: Option<&str>,
        path: &str,
        user_agent: Option<&str>,
        now: Instant,
    ) -> GateDecision {
        let mut headers = headers::hardening();
        let key = identity_key(ip, user_id);
        if self.is_exempt(ip) {
            // Exempt callers are never counted; report what the window holds.
            self.push_counters(&mut headers, &key, now);
            return GateDecision::allow(headers);
        }

        if self.emergency.observe(now) {
            headers.push((EMERGENCY_MODE, "true".to_string()));
            self.push_counters(&mut headers, &key, now);
            return GateDecision::deny(
                DenyCode::Emergency,
                EMERGENCY_REASON,
                Some(self.emergency.retry_after(now)),
                headers,
            );
        }

        if self.is_blocked_agent(user_agent) {
            warn!(identity = %key, user_agent = user_agent.unwrap_or(""), "Blocked user agent");
            self.push_counters(&mut headers, &key, now);
            return GateDecision::deny(DenyCode::Blocked, BLOCKED_REASON, None, headers);
        }

        if let Some(remaining) = self.scorer.flagged_for(&key, now) {
            self.push_counters(&mut headers, &key, now);
            return GateDecision::deny(
                DenyCode::Suspicious,
                SUSPICIOUS_REASON,
                Some(remaining),
                headers,
            );
        }

        if self.is_probe(path) {
            warn!(identity = %key, path, "Probe path requested");
            self.scorer
                .record_failure(&key, now, self.config.probe_weight);
        }

        let verdict = self.limiter.hit(&key, now);
        headers.extend(headers::rate_limit(
            verdict.limit,
            verdict.remaining,
            verdict.reset_after,
        ));
        if !verdict.allowed {
            headers.push((RETRY_AFTER, headers::ceil_secs(verdict.reset_after).to_string()));
            let window_secs = self.config.rate_limit_window_ms / 1000;
            return GateDecision::deny(
                DenyCode::RateLimited,
                format!(
                    "Rate limit exceeded: {} requests per {}s",
                    verdict.limit, window_secs
                ),
                Some(verdict.reset_after),
                headers,
            );
        }

        GateDecision::allow(headers)
    }

    fn push_counters(&self, headers: &mut HeaderList, key: &str, now: Instant) {
        let v = self.limiter.peek(key, now);
        headers.extend(headers::rate_limit(v.limit, v.remaining, v.reset_after));
    }
}

/// Identity key: `ip`, or `ip|user_id` when a user is known.
pub fn identity_key(ip: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user) if !user.is_empty() => format!("{ip}|{user}"),
        _ => ip.to_string(),
    }
}
