//! Process-wide emergency breaker.
//!
//! Aggregate request volume is metered by a direct GCRA limiter at the
//! configured requests-per-second. A rejected cell is a breach: it engages
//! emergency mode. Emergency clears once a full cooldown passes without a
//! breach.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct BreakerState {
    active: bool,
    last_breach: Option<Instant>,
}

/// DDoS breaker shared by every identity.
pub struct EmergencyBreaker {
    meter: DefaultDirectRateLimiter,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl EmergencyBreaker {
    pub fn new(requests_per_second: u32, cooldown: Duration) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            meter: RateLimiter::direct(Quota::per_second(rps)),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Meter one request and return whether emergency mode is active.
    pub fn observe(&self, now: Instant) -> bool {
        let breached = self.meter.check().is_err();
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if breached {
            st.last_breach = Some(now);
            if !st.active {
                st.active = true;
                warn!(
                    cooldown_secs = self.cooldown.as_secs(),
                    "Aggregate request volume over threshold, emergency mode engaged"
                );
            }
        } else if st.active && self.cooled_down(&st, now) {
            st.active = false;
            info!("Request volume back under threshold, emergency mode cleared");
        }
        st.active
    }

    /// Whether emergency mode is active at `now`, without metering.
    pub fn is_active(&self, now: Instant) -> bool {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.active && !self.cooled_down(&st, now)
    }

    /// Time left before emergency can clear.
    pub fn retry_after(&self, now: Instant) -> Duration {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.last_breach
            .map(|at| (at + self.cooldown).saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn cooled_down(&self, st: &BreakerState, now: Instant) -> bool {
        st.last_breach
            .map_or(true, |at| now.saturating_duration_since(at) >= self.cooldown)
    }
}

impl std::fmt::Debug for EmergencyBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyBreaker")
            .field("cooldown", &self.cooldown)
            .field("state", &self.state)
            .finish()
    }
}
