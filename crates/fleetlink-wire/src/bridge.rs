//! Bridge: one logical peer behind one stable interface.
//!
//! A [`Bridge`] owns a connection adapter, a reconnection manager, the peer's
//! subscription registry and its command lane. A single pump task consumes
//! the adapter's event channel in order, dispatches inbound messages and
//! turns unexpected disconnects into reconnect attempts.

use crate::adapter::{self, AdapterContext, AdapterEvent, AdapterEventReceiver, ConnectionAdapter, ConnectionState};
use crate::command_queue::{CommandLane, LaneError, LaneOccupancy};
use crate::reconnect::{ReconnectEvent, ReconnectFn, ReconnectStatus, ReconnectionManager};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::subscription::{Subscription, SubscriptionRegistry};
use chrono::Utc;
use fleetlink_types::capability::{negotiate, Capability, CapabilitySet};
use fleetlink_types::command::CommandResult;
use fleetlink_types::config::{PeerConfig, ReconnectConfig, TransportKind};
use fleetlink_types::error::{FleetError, FleetResult};
use fleetlink_types::filter::{extract_attributes, EventFilter};
use fleetlink_types::message::{into_payload, ops, Message, MessageType};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// An event a peer delivered that passed its subscription filters.
#[derive(Debug, Clone)]
pub struct BridgeEvent {
    pub server_id: String,
    pub message: Message,
}

/// Where bridges deliver forwarded events.
pub type EventSink = mpsc::UnboundedSender<BridgeEvent>;

/// Caller-facing connection status.
///
/// Derived from the adapter state and the enabled flag only. A peer waiting
/// out a backoff is `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disabled,
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time view of a bridge for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSnapshot {
    pub server_id: String,
    pub name: String,
    pub transport: TransportKind,
    pub status: ConnectionStatus,
    pub capabilities: CapabilitySet,
    pub healthy: bool,
    pub reconnect: ReconnectStatus,
    pub subscriptions: Vec<Subscription>,
    pub commands: LaneOccupancy,
}

/// Construction parameters for a [`Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub server_id: String,
    pub name: String,
    pub enabled: bool,
    pub reconnect: ReconnectConfig,
    /// Applied when `execute_command` is called without a timeout.
    pub default_timeout: Duration,
}

/// Per-peer facade over an adapter.
pub struct Bridge {
    server_id: String,
    name: String,
    adapter: Arc<dyn ConnectionAdapter>,
    reconnect: Arc<ReconnectionManager>,
    subscriptions: SubscriptionRegistry,
    commands: CommandLane,
    enabled: AtomicBool,
    /// Set by `disconnect`, cleared by `connect`. Suppresses reconnects.
    manual_disconnect: AtomicBool,
    default_timeout: Duration,
    sink: EventSink,
    pump: Mutex<Option<TaskHandle>>,
}

impl Bridge {
    /// Wire a bridge around an already-built adapter.
    ///
    /// `events` must be the receiving end of the channel the adapter was
    /// built with. The pump task is submitted to `scheduler`.
    pub fn new(
        options: BridgeOptions,
        adapter: Arc<dyn ConnectionAdapter>,
        events: AdapterEventReceiver,
        scheduler: Arc<dyn Scheduler>,
        sink: EventSink,
    ) -> Arc<Self> {
        let bridge = Arc::new_cyclic(|weak: &Weak<Bridge>| {
            let target = weak.clone();
            let callback: ReconnectFn = Arc::new(move || {
                let target = target.clone();
                async move {
                    match target.upgrade() {
                        Some(bridge) => bridge.reconnect_attempt().await,
                        None => Err(FleetError::ConnectionClosed),
                    }
                }
                .boxed()
            });
            let reconnect = ReconnectionManager::new(
                options.server_id.clone(),
                options.reconnect.clone(),
                Arc::clone(&scheduler),
                callback,
            );
            Bridge {
                server_id: options.server_id,
                name: options.name,
                adapter,
                reconnect,
                subscriptions: SubscriptionRegistry::new(),
                commands: CommandLane::new(),
                enabled: AtomicBool::new(options.enabled),
                manual_disconnect: AtomicBool::new(false),
                default_timeout: options.default_timeout,
                sink,
                pump: Mutex::new(None),
            }
        });

        let pump = pump(Arc::downgrade(&bridge), events, bridge.reconnect.subscribe());
        *bridge.pump.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(scheduler.submit(pump.boxed()));
        bridge
    }

    /// Build the adapter described by `peer` and wrap it in a bridge with the
    /// peer's configured subscriptions.
    pub fn from_peer_config(
        peer: &PeerConfig,
        hub_id: &str,
        reconnect: ReconnectConfig,
        default_timeout: Duration,
        scheduler: Arc<dyn Scheduler>,
        sink: EventSink,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = AdapterContext {
            server_id: peer.server_id.clone(),
            hub_id: hub_id.to_string(),
            events: tx,
        };
        let adapter = adapter::build(&peer.transport, ctx);
        let bridge = Bridge::new(
            BridgeOptions {
                server_id: peer.server_id.clone(),
                name: peer.display_name().to_string(),
                enabled: peer.enabled,
                reconnect,
                default_timeout,
            },
            adapter,
            rx,
            scheduler,
            sink,
        );
        for sub in &peer.subscriptions {
            bridge.subscribe(sub.op.clone(), sub.filter.clone());
        }
        bridge
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &Arc<dyn ConnectionAdapter> {
        &self.adapter
    }

    /// Reconnection manager, for operator controls.
    pub fn reconnect(&self) -> &Arc<ReconnectionManager> {
        &self.reconnect
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open the connection.
    ///
    /// A failed attempt is not returned to the caller: it schedules a
    /// reconnect and the resulting status is reported instead.
    pub async fn connect(&self) -> ConnectionStatus {
        if !self.is_enabled() {
            return ConnectionStatus::Disabled;
        }
        self.manual_disconnect.store(false, Ordering::SeqCst);
        if let Err(e) = self.adapter.connect().await {
            warn!(server_id = %self.server_id, error = %e, "Connect failed, scheduling reconnect");
            self.reconnect.schedule_reconnect();
        }
        self.connection_status()
    }

    /// Close the connection on purpose.
    ///
    /// Cancels any pending reconnect and rejects queued commands. A command
    /// already handed to the transport keeps running until its timeout.
    pub async fn disconnect(&self) {
        self.manual_disconnect.store(true, Ordering::SeqCst);
        self.reconnect.cancel();
        self.commands.close_pending();
        self.adapter.disconnect().await;
    }

    /// Enable or disable the peer. Disabling disconnects it.
    pub async fn set_enabled(&self, enabled: bool) -> ConnectionStatus {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        match (was, enabled) {
            (false, true) => {
                info!(server_id = %self.server_id, "Peer enabled");
                self.connect().await
            }
            (true, false) => {
                info!(server_id = %self.server_id, "Peer disabled");
                self.disconnect().await;
                ConnectionStatus::Disabled
            }
            _ => self.connection_status(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disconnect and stop the pump. The bridge is unusable afterwards.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.cancel();
        }
    }

    async fn reconnect_attempt(&self) -> FleetResult<()> {
        if !self.is_enabled() || self.manual_disconnect.load(Ordering::SeqCst) {
            return Err(FleetError::Connection("peer is disabled".to_string()));
        }
        self.adapter.connect().await
    }

    fn wants_reconnect(&self) -> bool {
        self.is_enabled()
            && !self.manual_disconnect.load(Ordering::SeqCst)
            && self.adapter.state() != ConnectionState::Connected
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Run a console command on the peer.
    ///
    /// Fails only when the peer cannot execute commands. Every other failure
    /// (multi-line text, closed connection, timeout, peer error) is a failed
    /// [`CommandResult`].
    pub async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> FleetResult<CommandResult> {
        if !self.capabilities().contains(&Capability::CommandExecution) {
            return Err(FleetError::CapabilityDenied(Capability::CommandExecution));
        }
        if command.contains(['\r', '\n']) {
            warn!(server_id = %self.server_id, "Rejected multi-line command");
            return Ok(CommandResult::failed(
                FleetError::InvalidCommand("command must be a single line".to_string()).to_string(),
                Duration::ZERO,
            ));
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let started = tokio::time::Instant::now();
        let adapter = Arc::clone(&self.adapter);

        let outcome = self
            .commands
            .run(timeout, async move {
                let remaining = timeout.saturating_sub(started.elapsed());
                adapter.send_command(command, remaining).await
            })
            .await;

        Ok(match outcome {
            Ok(result) => result,
            Err(LaneError::Closed) => {
                CommandResult::failed(FleetError::ConnectionClosed.to_string(), started.elapsed())
            }
            Err(LaneError::TimedOut) => CommandResult::failed(
                FleetError::CommandTimeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .to_string(),
                started.elapsed(),
            ),
        })
    }

    /// Push an event to the peer if it registered interest.
    ///
    /// Returns `Ok(false)` without touching the transport when the op is not
    /// subscribed or its filter rejects `data`, and `Ok(false)` when the
    /// transport write fails. Only a missing capability is an error.
    pub async fn send_event(&self, op: &str, data: Value) -> FleetResult<bool> {
        let payload = into_payload(data);
        if !self
            .subscriptions
            .matches_filters(op, &extract_attributes(&payload))
        {
            debug!(server_id = %self.server_id, op, "No subscriber for event");
            return Ok(false);
        }
        if !self.capabilities().contains(&Capability::RealtimeEvents) {
            return Err(FleetError::CapabilityDenied(Capability::RealtimeEvents));
        }
        let msg = Message::event(op, Value::Object(payload)).with_server_id(self.server_id.clone());
        if let Err(e) = self.adapter.send_message(msg).await {
            warn!(server_id = %self.server_id, op, error = %e, "Event not delivered");
            return Ok(false);
        }
        Ok(true)
    }

    pub fn subscribe(&self, op: impl Into<String>, filter: Option<EventFilter>) {
        let op = op.into();
        debug!(server_id = %self.server_id, op = %op, "Subscribed");
        self.subscriptions.subscribe(op, filter);
    }

    pub fn unsubscribe(&self, op: &str) -> bool {
        self.subscriptions.unsubscribe(op)
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Effective capabilities: intrinsic, narrowed by the peer's handshake.
    pub fn capabilities(&self) -> CapabilitySet {
        negotiate(
            &self.adapter.capabilities(),
            self.adapter.peer_capabilities().as_ref(),
        )
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        if !self.is_enabled() {
            return ConnectionStatus::Disabled;
        }
        match self.adapter.state() {
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Disconnected | ConnectionState::Closing => {
                ConnectionStatus::Disconnected
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_enabled() && self.adapter.is_healthy()
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            server_id: self.server_id.clone(),
            name: self.name.clone(),
            transport: self.adapter.kind(),
            status: self.connection_status(),
            capabilities: self.capabilities(),
            healthy: self.is_healthy(),
            reconnect: self.reconnect.status(),
            subscriptions: self.subscriptions.list(),
            commands: self.commands.occupancy(),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    async fn on_adapter_event(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::Connected => self.reconnect.reset(),
            AdapterEvent::Disconnected { reason, graceful } => {
                self.commands.close_pending();
                if !graceful && self.wants_reconnect() {
                    info!(server_id = %self.server_id, reason = %reason, "Unexpected disconnect");
                    self.reconnect.schedule_reconnect();
                }
            }
            AdapterEvent::Message(msg) => self.dispatch(msg).await,
            AdapterEvent::Error(e) => {
                debug!(server_id = %self.server_id, error = %e, "Adapter error");
            }
        }
    }

    async fn dispatch(&self, msg: Message) {
        match msg.kind {
            MessageType::Event => self.forward_event(msg),
            MessageType::System => self.handle_system(&msg),
            MessageType::Request => self.handle_request(&msg).await,
            MessageType::Response => {
                debug!(server_id = %self.server_id, request_id = ?msg.request_id, "Unmatched response");
            }
        }
    }

    fn forward_event(&self, mut msg: Message) {
        if !self
            .subscriptions
            .matches_filters(&msg.op, &extract_attributes(&msg.data))
        {
            debug!(server_id = %self.server_id, op = %msg.op, "Event filtered out");
            return;
        }
        if msg.server_id.is_none() {
            msg.server_id = Some(self.server_id.clone());
        }
        let _ = self.sink.send(BridgeEvent {
            server_id: self.server_id.clone(),
            message: msg,
        });
    }

    fn handle_system(&self, msg: &Message) {
        match msg.op.as_str() {
            ops::SUBSCRIBE => match msg.data_str("op") {
                Some(op) => {
                    let filter = msg
                        .data
                        .get("filter")
                        .filter(|v| !v.is_null())
                        .and_then(|v| serde_json::from_value::<EventFilter>(v.clone()).ok());
                    self.subscribe(op, filter);
                }
                None => warn!(server_id = %self.server_id, "subscribe without op"),
            },
            ops::UNSUBSCRIBE => match msg.data_str("op") {
                Some(op) => {
                    self.unsubscribe(op);
                }
                None => warn!(server_id = %self.server_id, "unsubscribe without op"),
            },
            ops::DISCONNECT => {
                info!(
                    server_id = %self.server_id,
                    reason = msg.data_str("reason").unwrap_or(""),
                    "Peer announced disconnect"
                );
            }
            other => debug!(server_id = %self.server_id, op = other, "Ignoring system message"),
        }
    }

    async fn handle_request(&self, msg: &Message) {
        let response = match msg.op.as_str() {
            ops::PING => Message::response_to(
                msg,
                true,
                json!({ "pong": Utc::now().timestamp_millis() }),
                None,
            ),
            other => Message::response_to(
                msg,
                false,
                json!({}),
                Some(format!("unknown operation: {other}")),
            ),
        };
        if let Err(e) = self.adapter.send_message(response).await {
            warn!(server_id = %self.server_id, op = %msg.op, error = %e, "Failed to answer request");
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("server_id", &self.server_id)
            .field("transport", &self.adapter.kind())
            .field("status", &self.connection_status())
            .finish()
    }
}

/// Drain one bridge's adapter events in order. Exits when the bridge is
/// dropped or the adapter channel closes.
async fn pump(
    bridge: Weak<Bridge>,
    mut events: AdapterEventReceiver,
    mut reconnects: broadcast::Receiver<ReconnectEvent>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(bridge) = bridge.upgrade() else { break };
                bridge.on_adapter_event(event).await;
            }
            event = reconnects.recv() => match event {
                Ok(ReconnectEvent::Failed { .. }) => {
                    let Some(bridge) = bridge.upgrade() else { break };
                    if bridge.wants_reconnect() {
                        bridge.reconnect.schedule_reconnect();
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Reconnect events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ConnectionStatus::Connected).unwrap(),
            "connected"
        );
        assert_eq!(
            serde_json::to_value(ConnectionStatus::Disabled).unwrap(),
            "disabled"
        );
    }
}
