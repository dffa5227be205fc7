//! The hub: one bridge per configured peer, the security gate, and the
//! background tasks that keep them tidy.

use dashmap::DashMap;
use fleetlink_gate::SecurityGate;
use fleetlink_types::config::HubConfig;
use fleetlink_wire::{Bridge, BridgeEvent, ConnectionStatus, EventSink, Scheduler, TaskHandle, TokioScheduler};
use futures::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Capacity of the forwarded-event broadcast.
const EVENT_FANOUT_CAPACITY: usize = 1024;

/// Answer to `GET /api/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub peers: usize,
    pub connected: usize,
    pub emergency: bool,
    pub uptime_secs: u64,
    pub events_forwarded: u64,
}

/// Peer registry plus shared services.
pub struct Hub {
    config: HubConfig,
    bridges: DashMap<String, Arc<Bridge>>,
    gate: Arc<SecurityGate>,
    scheduler: Arc<dyn Scheduler>,
    sink: EventSink,
    fanout: broadcast::Sender<BridgeEvent>,
    events_forwarded: Arc<AtomicU64>,
    started_at: Instant,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Hub {
    /// Build the hub on the tokio runtime. Must be called inside one.
    pub fn new(config: HubConfig) -> Arc<Self> {
        Self::with_scheduler(config, Arc::new(TokioScheduler))
    }

    pub fn with_scheduler(config: HubConfig, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        let (sink, events) = mpsc::unbounded_channel();
        let (fanout, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        let gate = Arc::new(SecurityGate::new(config.security.clone()));
        let events_forwarded = Arc::new(AtomicU64::new(0));

        let consumer = consume_events(events, fanout.clone(), Arc::clone(&events_forwarded));
        let tasks = vec![scheduler.submit(consumer.boxed())];

        let hub = Arc::new(Self {
            config,
            bridges: DashMap::new(),
            gate,
            scheduler,
            sink,
            fanout,
            events_forwarded,
            started_at: Instant::now(),
            tasks: Mutex::new(tasks),
        });

        let default_timeout = Duration::from_millis(hub.config.commands.default_timeout_ms);
        for peer in &hub.config.peers {
            let bridge = Bridge::from_peer_config(
                peer,
                &hub.config.hub_id,
                hub.config.reconnect.clone(),
                default_timeout,
                Arc::clone(&hub.scheduler),
                hub.sink.clone(),
            );
            hub.bridges.insert(peer.server_id.clone(), bridge);
        }
        hub
    }

    /// Add a bridge built outside the config. Replaces one with the same id.
    pub fn register(&self, bridge: Arc<Bridge>) -> Option<Arc<Bridge>> {
        info!(server_id = %bridge.server_id(), "Peer registered");
        self.bridges.insert(bridge.server_id().to_string(), bridge)
    }

    /// Sender to hand to bridges built with [`register`](Self::register).
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Connect every enabled peer and start housekeeping.
    pub async fn start(&self) {
        let sweep_every = Duration::from_millis(self.config.security.sweep_interval_ms.max(1));
        let gate = Arc::clone(&self.gate);
        let sweeper = async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.sweep();
            }
        };
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.scheduler.submit(sweeper.boxed()));

        let bridges = self.bridges();
        info!(peers = bridges.len(), "Starting hub");
        let statuses = futures::future::join_all(bridges.iter().map(|b| b.connect())).await;
        for (bridge, status) in bridges.iter().zip(statuses) {
            info!(server_id = %bridge.server_id(), status = ?status, "Peer started");
        }
    }

    /// Disconnect every peer and stop background tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down hub");
        let bridges = self.bridges();
        futures::future::join_all(bridges.iter().map(|b| b.shutdown())).await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.cancel();
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    pub fn bridge(&self, server_id: &str) -> Option<Arc<Bridge>> {
        self.bridges.get(server_id).map(|b| Arc::clone(b.value()))
    }

    /// All bridges, ordered by server id.
    pub fn bridges(&self) -> Vec<Arc<Bridge>> {
        let mut all: Vec<Arc<Bridge>> = self.bridges.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.server_id().cmp(b.server_id()));
        all
    }

    /// Events forwarded by any bridge, as they arrive.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.fanout.subscribe()
    }

    pub fn health(&self) -> HealthReport {
        let bridges = self.bridges();
        let connected = bridges
            .iter()
            .filter(|b| b.connection_status() == ConnectionStatus::Connected)
            .count();
        HealthReport {
            status: "ok",
            peers: bridges.len(),
            connected,
            emergency: self.gate.is_emergency(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
        }
    }
}

async fn consume_events(
    mut events: mpsc::UnboundedReceiver<BridgeEvent>,
    fanout: broadcast::Sender<BridgeEvent>,
    counter: Arc<AtomicU64>,
) {
    while let Some(event) = events.recv().await {
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            server_id = %event.server_id,
            op = %event.message.op,
            "Event forwarded"
        );
        // No subscribers is fine.
        let _ = fanout.send(event);
    }
}
