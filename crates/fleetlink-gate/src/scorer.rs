//! Suspicious-activity scorer.
//!
//! Score over the short window: `successes + failure_weight * failures`.
//! Reaching the threshold flags the identity for the decay period; the flag
//! then lapses on its own.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Scorer tuning.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub window: Duration,
    pub threshold: u32,
    pub decay: Duration,
    pub failure_weight: u32,
}

#[derive(Debug)]
struct ScoreState {
    successes: VecDeque<Instant>,
    /// (when, how many failures)
    failures: VecDeque<(Instant, u32)>,
    flagged_until: Option<Instant>,
    last_seen: Instant,
}

impl ScoreState {
    fn new(now: Instant) -> Self {
        Self {
            successes: VecDeque::new(),
            failures: VecDeque::new(),
            flagged_until: None,
            last_seen: now,
        }
    }

    fn evict(&mut self, now: Instant, window: Duration) {
        while self
            .successes
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= window)
        {
            self.successes.pop_front();
        }
        while self
            .failures
            .front()
            .is_some_and(|&(t, _)| now.saturating_duration_since(t) >= window)
        {
            self.failures.pop_front();
        }
        if self.flagged_until.is_some_and(|until| now >= until) {
            self.flagged_until = None;
        }
    }

    fn score(&self, failure_weight: u32) -> u32 {
        let failures: u32 = self.failures.iter().map(|&(_, n)| n).sum();
        (self.successes.len() as u32).saturating_add(failure_weight.saturating_mul(failures))
    }
}

/// Per-identity suspicion tracking.
#[derive(Debug)]
pub struct SuspicionScorer {
    config: ScorerConfig,
    states: DashMap<String, ScoreState>,
}

impl SuspicionScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn record_success(&self, key: &str, now: Instant) {
        self.update(key, now, |st| st.successes.push_back(now));
    }

    /// Record `count` failures at once (probe paths weigh more than one).
    pub fn record_failure(&self, key: &str, now: Instant, count: u32) {
        if count == 0 {
            return;
        }
        self.update(key, now, |st| st.failures.push_back((now, count)));
    }

    /// Remaining flag time, or `None` when the identity is not flagged.
    pub fn flagged_for(&self, key: &str, now: Instant) -> Option<Duration> {
        let mut st = self.states.get_mut(key)?;
        st.evict(now, self.config.window);
        st.flagged_until.map(|until| until.saturating_duration_since(now))
    }

    /// Current score for `key`.
    pub fn score(&self, key: &str, now: Instant) -> u32 {
        match self.states.get_mut(key) {
            Some(mut st) => {
                st.evict(now, self.config.window);
                st.score(self.config.failure_weight)
            }
            None => 0,
        }
    }

    /// Identities currently flagged, with their remaining flag time.
    pub fn flagged(&self, now: Instant) -> Vec<(String, Duration)> {
        self.states
            .iter()
            .filter_map(|e| {
                e.value()
                    .flagged_until
                    .filter(|&until| until > now)
                    .map(|until| (e.key().clone(), until - now))
            })
            .collect()
    }

    /// Drop identities idle longer than `idle_ttl` that are not flagged.
    pub fn sweep(&self, now: Instant, idle_ttl: Duration) -> usize {
        let before = self.states.len();
        self.states.retain(|_, st| {
            let flagged = st.flagged_until.is_some_and(|until| until > now);
            flagged || now.saturating_duration_since(st.last_seen) < idle_ttl
        });
        before - self.states.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.states.iter().map(|e| e.key().clone()).collect()
    }

    fn update(&self, key: &str, now: Instant, record: impl FnOnce(&mut ScoreState)) {
        let mut st = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| ScoreState::new(now));
        st.last_seen = now;
        st.evict(now, self.config.window);
        record(&mut *st);

        if st.flagged_until.is_none() {
            let score = st.score(self.config.failure_weight);
            if score >= self.config.threshold {
                st.flagged_until = Some(now + self.config.decay);
                warn!(
                    identity = key,
                    score,
                    threshold = self.config.threshold,
                    decay_secs = self.config.decay.as_secs(),
                    "Identity flagged for suspicious activity"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer(threshold: u32) -> SuspicionScorer {
        SuspicionScorer::new(ScorerConfig {
            window: Duration::from_secs(10),
            threshold,
            decay: Duration::from_secs(300),
            failure_weight: 3,
        })
    }

    #[test]
    fn test_successes_cross_threshold() {
        let s = scorer(5);
        let t0 = Instant::now();
        for _ in 0..4 {
            s.record_success("ip", t0);
        }
        assert!(s.flagged_for("ip", t0).is_none());
        s.record_success("ip", t0);
        assert_eq!(s.flagged_for("ip", t0), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_failures_weigh_more() {
        let s = scorer(9);
        let t0 = Instant::now();
        s.record_failure("ip", t0, 2);
        assert_eq!(s.score("ip", t0), 6);
        s.record_failure("ip", t0, 1);
        assert!(s.flagged_for("ip", t0).is_some());
    }

    #[test]
    fn test_old_activity_leaves_window() {
        let s = scorer(5);
        let t0 = Instant::now();
        for _ in 0..4 {
            s.record_success("ip", t0);
        }
        s.record_success("ip", t0 + Duration::from_secs(11));
        assert_eq!(s.score("ip", t0 + Duration::from_secs(11)), 1);
        assert!(s.flagged_for("ip", t0 + Duration::from_secs(11)).is_none());
    }

    #[test]
    fn test_flag_decays() {
        let s = scorer(1);
        let t0 = Instant::now();
        s.record_success("ip", t0);
        assert!(s.flagged_for("ip", t0 + Duration::from_secs(299)).is_some());
        assert!(s.flagged_for("ip", t0 + Duration::from_secs(300)).is_none());
        assert!(s.flagged(t0 + Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn test_sweep_keeps_flagged() {
        let s = scorer(1);
        let t0 = Instant::now();
        s.record_success("flagged", t0);
        s.record_failure("quiet", t0, 0);
        let s2 = scorer(100);
        s2.record_success("idle", t0);

        assert_eq!(s.sweep(t0 + Duration::from_secs(200), Duration::from_secs(100)), 0);
        assert_eq!(s2.sweep(t0 + Duration::from_secs(200), Duration::from_secs(100)), 1);
    }
}
