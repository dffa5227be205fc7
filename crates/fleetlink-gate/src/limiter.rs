//! Sliding-window request limiter keyed by identity.
//!
//! Each identity keeps the timestamps of its admitted requests inside the
//! window. A request is admitted while fewer than `max_requests` remain.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of one [`SlidingWindowLimiter::hit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowVerdict {
    pub allowed: bool,
    pub limit: u32,
    /// Requests still available in the current window.
    pub remaining: u32,
    /// Time until the oldest counted request leaves the window.
    pub reset_after: Duration,
}

/// Per-identity sliding window.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: u32,
    hits: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            hits: DashMap::new(),
        }
    }

    /// Count a request for `key` at `now` if the budget allows it.
    ///
    /// Denied requests are not recorded.
    pub fn hit(&self, key: &str, now: Instant) -> WindowVerdict {
        let mut entry = self.hits.entry(key.to_string()).or_default();
        evict(&mut entry, now, self.window);

        let used = entry.len() as u32;
        if used >= self.max_requests {
            return WindowVerdict {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_after: self.reset_after(&entry, now),
            };
        }

        entry.push_back(now);
        WindowVerdict {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - used - 1,
            reset_after: self.reset_after(&entry, now),
        }
    }

    /// Current counters for `key` without recording anything.
    pub fn peek(&self, key: &str, now: Instant) -> WindowVerdict {
        let (used, reset_after) = match self.hits.get(key) {
            Some(entry) => {
                let live = entry
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) < self.window)
                    .count() as u32;
                (live, self.reset_after(&entry, now))
            }
            None => (0, self.window),
        };
        WindowVerdict {
            allowed: used < self.max_requests,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(used),
            reset_after,
        }
    }

    /// Requests counted for `key` within the window.
    pub fn count(&self, key: &str, now: Instant) -> u32 {
        self.max_requests - self.peek(key, now).remaining
    }

    /// Drop identities whose newest request is older than `idle_ttl`.
    pub fn sweep(&self, now: Instant, idle_ttl: Duration) -> usize {
        let before = self.hits.len();
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|&last| now.saturating_duration_since(last) < idle_ttl)
        });
        before - self.hits.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.hits.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    fn reset_after(&self, hits: &VecDeque<Instant>, now: Instant) -> Duration {
        hits.iter()
            .find(|&&t| now.saturating_duration_since(t) < self.window)
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or(self.window)
    }
}

fn evict(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while hits
        .front()
        .is_some_and(|&t| now.saturating_duration_since(t) >= window)
    {
        hits.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_budget() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        let v = limiter.hit("1.2.3.4", now);
        assert!(v.allowed);
        assert_eq!(v.remaining, 2);
        assert!(limiter.hit("1.2.3.4", now).allowed);
        let v = limiter.hit("1.2.3.4", now);
        assert!(v.allowed);
        assert_eq!(v.remaining, 0);
    }

    #[test]
    fn test_denies_over_budget_with_reset() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        limiter.hit("ip", t0);
        limiter.hit("ip", t0 + Duration::from_secs(10));
        let v = limiter.hit("ip", t0 + Duration::from_secs(20));
        assert!(!v.allowed);
        assert_eq!(v.reset_after, Duration::from_secs(40));
        // Denials are not counted.
        assert_eq!(limiter.count("ip", t0 + Duration::from_secs(20)), 2);
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 1);
        let t0 = Instant::now();
        assert!(limiter.hit("ip", t0).allowed);
        assert!(!limiter.hit("ip", t0 + Duration::from_secs(59)).allowed);
        assert!(limiter.hit("ip", t0 + Duration::from_secs(60)).allowed);
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 1);
        let now = Instant::now();
        assert!(limiter.hit("a", now).allowed);
        assert!(limiter.hit("b", now).allowed);
        assert!(!limiter.hit("a", now).allowed);
    }

    #[test]
    fn test_sweep_evicts_idle() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 10);
        let t0 = Instant::now();
        limiter.hit("old", t0);
        limiter.hit("fresh", t0 + Duration::from_secs(500));
        let removed = limiter.sweep(t0 + Duration::from_secs(601), Duration::from_secs(600));
        assert_eq!(removed, 1);
        assert_eq!(limiter.keys(), vec!["fresh".to_string()]);
    }
}
