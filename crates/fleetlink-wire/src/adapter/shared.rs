//! State shared by every adapter: lifecycle, liveness and event emission.

use super::{AdapterEvent, AdapterEventSender, ConnectionState};
use fleetlink_types::capability::CapabilitySet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

pub(crate) struct AdapterCore {
    pub server_id: String,
    state: watch::Sender<ConnectionState>,
    events: AdapterEventSender,
    peer_caps: RwLock<Option<CapabilitySet>>,
    last_seen: Mutex<Instant>,
    /// Bumped for every new channel; stale tasks compare against it.
    generation: AtomicU64,
    /// Set when the current channel is being closed on purpose.
    closing: AtomicBool,
}

impl AdapterCore {
    pub fn new(server_id: String, events: AdapterEventSender) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            server_id,
            state,
            events,
            peer_caps: RwLock::new(None),
            last_seen: Mutex::new(Instant::now()),
            generation: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: ConnectionState) -> ConnectionState {
        self.state.send_replace(state)
    }

    /// Start a new channel and return its generation.
    pub fn begin(&self) -> u64 {
        self.closing.store(false, Ordering::SeqCst);
        self.touch();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Closing);
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Connected and heard from within `window`.
    pub fn is_live(&self, window: Duration) -> bool {
        self.state() == ConnectionState::Connected && self.idle_for() < window
    }

    pub fn set_peer_caps(&self, caps: Option<CapabilitySet>) {
        *self.peer_caps.write().unwrap_or_else(|e| e.into_inner()) = caps;
    }

    pub fn peer_caps(&self) -> Option<CapabilitySet> {
        self.peer_caps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn emit(&self, event: AdapterEvent) {
        // The bridge owns the receiver; a closed channel means it is gone.
        let _ = self.events.send(event);
    }

    pub fn mark_connected(&self) {
        self.touch();
        self.set_state(ConnectionState::Connected);
        info!(server_id = %self.server_id, "Peer connected");
        self.emit(AdapterEvent::Connected);
    }

    /// Record that channel `generation` has ended.
    ///
    /// Emits `Disconnected` only if that channel had reached `Connected`.
    /// Returns false for stale generations.
    pub fn closed(&self, generation: u64, reason: &str) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        let prev = self.set_state(ConnectionState::Disconnected);
        if matches!(prev, ConnectionState::Connected | ConnectionState::Closing) {
            let graceful = self.closing.load(Ordering::SeqCst);
            if graceful {
                info!(server_id = %self.server_id, reason, "Peer disconnected");
            } else {
                warn!(server_id = %self.server_id, reason, "Peer connection lost");
            }
            self.emit(AdapterEvent::Disconnected {
                reason: reason.to_string(),
                graceful,
            });
        }
        true
    }

    /// Wait up to `grace` for the state to reach `Disconnected`.
    pub async fn wait_disconnected(&self, grace: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(grace, rx.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}
