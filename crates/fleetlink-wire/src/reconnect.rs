//! Reconnection manager: exponential backoff with a hard ceiling.
//!
//! One manager per bridge. It arms at most one timer at a time and invokes
//! the reconnect callback once per timer. It never chains retries on its own:
//! after a failed attempt the owner calls [`ReconnectionManager::schedule_reconnect`]
//! again (the bridge does this when it sees [`ReconnectEvent::Failed`]).

use crate::scheduler::{Scheduler, TaskHandle};
use fleetlink_types::config::ReconnectConfig;
use fleetlink_types::error::FleetResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Callback that re-establishes the connection.
pub type ReconnectFn = Arc<dyn Fn() -> BoxFuture<'static, FleetResult<()>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Manager phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPhase {
    Idle,
    Scheduled,
    Attempting,
    Disabled,
}

/// Lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    Scheduled { attempt: u32, delay_ms: u64 },
    Attempting { attempt: u32 },
    Succeeded { attempt: u32 },
    Failed { attempt: u32, error: String },
    MaxAttemptsReached { attempts: u32 },
    Disabled,
    Enabled,
}

/// Point-in-time copy of the manager's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectStatus {
    pub phase: ReconnectPhase,
    pub current_attempts: u32,
    pub total_attempts: u64,
    pub max_attempts: u32,
    pub next_interval_ms: u64,
    pub disabled: bool,
    pub is_reconnecting: bool,
}

struct State {
    phase: ReconnectPhase,
    current_attempts: u32,
    total_attempts: u64,
    next_interval_ms: u64,
    disabled: bool,
    timer: Option<TaskHandle>,
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Delay before attempt `attempt` (1-based), floored to whole milliseconds.
///
/// Formula: `min(base * multiplier^(attempt - 1), max_interval)`
pub fn compute_interval(config: &ReconnectConfig, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = config.base_interval_ms as f64 * config.multiplier.powi(exponent);
    if !raw.is_finite() || raw >= config.max_interval_ms as f64 {
        return config.max_interval_ms;
    }
    raw.floor() as u64
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Drives reconnect attempts for one peer.
pub struct ReconnectionManager {
    server_id: String,
    config: ReconnectConfig,
    state: Mutex<State>,
    callback: ReconnectFn,
    scheduler: Arc<dyn Scheduler>,
    events: broadcast::Sender<ReconnectEvent>,
}

impl ReconnectionManager {
    pub fn new(
        server_id: impl Into<String>,
        config: ReconnectConfig,
        scheduler: Arc<dyn Scheduler>,
        callback: ReconnectFn,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let disabled = !config.enabled;
        Arc::new(Self {
            server_id: server_id.into(),
            state: Mutex::new(State {
                phase: if disabled {
                    ReconnectPhase::Disabled
                } else {
                    ReconnectPhase::Idle
                },
                current_attempts: 0,
                total_attempts: 0,
                next_interval_ms: config.base_interval_ms,
                disabled,
                timer: None,
            }),
            config,
            callback,
            scheduler,
            events,
        })
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    /// Arm the next attempt.
    ///
    /// No-op while disabled or while an attempt is already scheduled or
    /// running. Once `max_attempts` is exhausted this reports
    /// [`ReconnectEvent::MaxAttemptsReached`] and, when configured, disables
    /// the manager until [`enable`](Self::enable).
    pub fn schedule_reconnect(self: &Arc<Self>) {
        let mut st = self.lock();
        if st.disabled
            || matches!(
                st.phase,
                ReconnectPhase::Scheduled | ReconnectPhase::Attempting
            )
        {
            return;
        }

        if st.current_attempts >= self.config.max_attempts {
            let attempts = st.current_attempts;
            warn!(server_id = %self.server_id, attempts, "Reconnect attempts exhausted");
            self.emit(ReconnectEvent::MaxAttemptsReached { attempts });
            if self.config.disable_on_max_attempts {
                st.disabled = true;
                st.phase = ReconnectPhase::Disabled;
                self.emit(ReconnectEvent::Disabled);
            }
            return;
        }

        st.current_attempts += 1;
        st.total_attempts += 1;
        let attempt = st.current_attempts;
        let delay_ms = compute_interval(&self.config, attempt);
        st.next_interval_ms = delay_ms;
        st.phase = ReconnectPhase::Scheduled;

        let this = Arc::clone(self);
        st.timer = Some(self.scheduler.submit_delayed(
            Duration::from_millis(delay_ms),
            async move { this.fire(attempt).await }.boxed(),
        ));
        drop(st);

        info!(server_id = %self.server_id, attempt, delay_ms, "Reconnect scheduled");
        self.emit(ReconnectEvent::Scheduled { attempt, delay_ms });
    }

    async fn fire(self: Arc<Self>, attempt: u32) {
        {
            let mut st = self.lock();
            if st.phase != ReconnectPhase::Scheduled {
                return;
            }
            st.phase = ReconnectPhase::Attempting;
            st.timer = None;
        }
        debug!(server_id = %self.server_id, attempt, "Reconnect attempt");
        self.emit(ReconnectEvent::Attempting { attempt });

        let result = (self.callback)().await;

        let mut st = self.lock();
        let settled = if st.disabled {
            ReconnectPhase::Disabled
        } else {
            ReconnectPhase::Idle
        };
        if st.phase == ReconnectPhase::Attempting {
            st.phase = settled;
        }
        match result {
            Ok(()) => {
                st.current_attempts = 0;
                drop(st);
                info!(server_id = %self.server_id, attempt, "Reconnected");
                self.emit(ReconnectEvent::Succeeded { attempt });
            }
            Err(e) => {
                drop(st);
                warn!(server_id = %self.server_id, attempt, error = %e, "Reconnect attempt failed");
                self.emit(ReconnectEvent::Failed {
                    attempt,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Clear any pending timer. Attempt counters are untouched.
    pub fn cancel(&self) {
        let mut st = self.lock();
        if let Some(timer) = st.timer.take() {
            timer.cancel();
        }
        if st.phase == ReconnectPhase::Scheduled {
            st.phase = ReconnectPhase::Idle;
        }
    }

    /// [`cancel`](Self::cancel) and zero the current attempt counter.
    pub fn reset(&self) {
        self.cancel();
        self.lock().current_attempts = 0;
    }

    /// Operator override: allow reconnects again.
    pub fn enable(&self) {
        let mut st = self.lock();
        st.disabled = false;
        st.current_attempts = 0;
        if st.phase == ReconnectPhase::Disabled {
            st.phase = ReconnectPhase::Idle;
        }
        drop(st);
        info!(server_id = %self.server_id, "Reconnect enabled");
        self.emit(ReconnectEvent::Enabled);
    }

    /// Operator override: stop reconnecting until [`enable`](Self::enable).
    pub fn disable(&self) {
        self.cancel();
        let mut st = self.lock();
        st.disabled = true;
        if st.phase != ReconnectPhase::Attempting {
            st.phase = ReconnectPhase::Disabled;
        }
        drop(st);
        info!(server_id = %self.server_id, "Reconnect disabled");
        self.emit(ReconnectEvent::Disabled);
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }

    pub fn status(&self) -> ReconnectStatus {
        let st = self.lock();
        ReconnectStatus {
            phase: st.phase,
            current_attempts: st.current_attempts,
            total_attempts: st.total_attempts,
            max_attempts: self.config.max_attempts,
            next_interval_ms: st.next_interval_ms,
            disabled: st.disabled,
            is_reconnecting: matches!(
                st.phase,
                ReconnectPhase::Scheduled | ReconnectPhase::Attempting
            ),
        }
    }

    fn emit(&self, event: ReconnectEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ReconnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionManager")
            .field("server_id", &self.server_id)
            .field("status", &self.status())
            .finish()
    }
}
