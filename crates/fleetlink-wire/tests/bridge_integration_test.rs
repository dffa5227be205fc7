//! Integration tests for the Bridge dispatch and policy layer.
//!
//! A mock connection adapter records every transport write and lets tests
//! inject peer traffic and connection drops. It is wired through the real
//! Bridge, ReconnectionManager and command lane.
//!
//! Timer-driven tests run on a paused clock.

use async_trait::async_trait;
use fleetlink_types::capability::{Capability, CapabilitySet};
use fleetlink_types::command::CommandResult;
use fleetlink_types::config::{ReconnectConfig, TransportKind};
use fleetlink_types::error::{FleetError, FleetResult};
use fleetlink_types::filter::EventFilter;
use fleetlink_types::message::{ops, Message, MessageType};
use fleetlink_wire::adapter::AdapterEventSender;
use fleetlink_wire::bridge::{Bridge, BridgeEvent, BridgeOptions, ConnectionStatus};
use fleetlink_wire::reconnect::ReconnectPhase;
use fleetlink_wire::{AdapterEvent, ConnectionAdapter, ConnectionState, TokioScheduler};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Mock adapter: records writes and injects peer traffic
// ---------------------------------------------------------------------------

struct MockAdapter {
    caps: CapabilitySet,
    peer_caps: Option<CapabilitySet>,
    state: Mutex<ConnectionState>,
    events: AdapterEventSender,
    /// Every message handed to the transport.
    writes: Mutex<Vec<Message>>,
    /// Every command handed to the transport.
    commands: Mutex<Vec<String>>,
    /// Scripted connect outcomes; empty means success.
    connect_results: Mutex<VecDeque<bool>>,
    connect_calls: AtomicU32,
    command_delay: Duration,
}

impl MockAdapter {
    fn new(events: AdapterEventSender) -> Self {
        Self {
            caps: [Capability::CommandExecution, Capability::RealtimeEvents].into(),
            peer_caps: None,
            state: Mutex::new(ConnectionState::Disconnected),
            events,
            writes: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            connect_results: Mutex::new(VecDeque::new()),
            connect_calls: AtomicU32::new(0),
            command_delay: Duration::from_millis(10),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Simulate the peer vanishing.
    fn drop_connection(&self) {
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events.send(AdapterEvent::Disconnected {
            reason: "socket reset".into(),
            graceful: false,
        });
    }

    /// Simulate a frame from the peer.
    fn inject(&self, msg: Message) {
        let _ = self.events.send(AdapterEvent::Message(msg));
    }

    fn writes(&self) -> Vec<Message> {
        self.writes.lock().unwrap().clone()
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionAdapter for MockAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::OutboundSocket
    }

    fn capabilities(&self) -> CapabilitySet {
        self.caps.clone()
    }

    fn peer_capabilities(&self) -> Option<CapabilitySet> {
        self.peer_caps.clone()
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn connect(&self) -> FleetResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let ok = self.connect_results.lock().unwrap().pop_front().unwrap_or(true);
        if !ok {
            return Err(FleetError::Connection("refused".into()));
        }
        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(AdapterEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            let _ = self.events.send(AdapterEvent::Disconnected {
                reason: "closed locally".into(),
                graceful: true,
            });
        }
    }

    async fn send_message(&self, msg: Message) -> FleetResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(FleetError::ConnectionClosed);
        }
        self.writes.lock().unwrap().push(msg);
        Ok(())
    }

    async fn send_command(&self, command: &str, _timeout: Duration) -> CommandResult {
        let started = tokio::time::Instant::now();
        if self.state() != ConnectionState::Connected {
            return CommandResult::failed(FleetError::ConnectionClosed.to_string(), started.elapsed());
        }
        self.commands.lock().unwrap().push(command.to_string());
        tokio::time::sleep(self.command_delay).await;
        CommandResult::ok(vec![format!("ran {command}")], started.elapsed())
    }

    fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn options() -> BridgeOptions {
    BridgeOptions {
        server_id: "survival-1".into(),
        name: "Survival".into(),
        enabled: true,
        reconnect: ReconnectConfig::default(),
        default_timeout: Duration::from_secs(30),
    }
}

/// Build a bridge around a mock adapter customised by `tweak`.
fn setup(
    tweak: impl FnOnce(&mut MockAdapter),
) -> (Arc<Bridge>, Arc<MockAdapter>, mpsc::UnboundedReceiver<BridgeEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut mock = MockAdapter::new(events_tx);
    tweak(&mut mock);
    let mock = Arc::new(mock);
    let (sink, forwarded) = mpsc::unbounded_channel();
    let bridge = Bridge::new(
        options(),
        mock.clone(),
        events_rx,
        Arc::new(TokioScheduler),
        sink,
    );
    (bridge, mock, forwarded)
}

/// Let the pump task drain what has been queued so far.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_send_event_is_noop_without_subscription() {
    let (bridge, mock, _rx) = setup(|_| {});
    assert_eq!(bridge.connect().await, ConnectionStatus::Connected);

    let sent = bridge
        .send_event(ops::PLAYER_JOIN, json!({"name": "Steve"}))
        .await
        .unwrap();
    assert!(!sent);
    assert!(mock.writes().is_empty());

    bridge.subscribe(ops::PLAYER_JOIN, None);
    let sent = bridge
        .send_event(ops::PLAYER_JOIN, json!({"name": "Steve"}))
        .await
        .unwrap();
    assert!(sent);
    let writes = mock.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].kind, MessageType::Event);
    assert_eq!(writes[0].server_id.as_deref(), Some("survival-1"));
}

#[tokio::test(start_paused = true)]
async fn test_send_event_respects_filter() {
    let (bridge, mock, _rx) = setup(|_| {});
    bridge.connect().await;
    bridge.subscribe(
        ops::PLAYER_JOIN,
        Some(EventFilter::new().equals("firstJoin", true)),
    );

    let sent = bridge
        .send_event(ops::PLAYER_JOIN, json!({"name": "Steve", "firstJoin": false}))
        .await
        .unwrap();
    assert!(!sent);
    let sent = bridge
        .send_event(ops::PLAYER_JOIN, json!({"name": "Alex", "firstJoin": true}))
        .await
        .unwrap();
    assert!(sent);
    assert_eq!(mock.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_event_on_dead_transport_is_not_an_error() {
    let (bridge, mock, _rx) = setup(|_| {});
    bridge.subscribe(ops::PLAYER_JOIN, None);
    assert_eq!(bridge.connection_status(), ConnectionStatus::Disconnected);

    let sent = bridge
        .send_event(ops::PLAYER_JOIN, json!({"name": "Steve"}))
        .await
        .unwrap();
    assert!(!sent);
    assert!(mock.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_multi_line_command_never_reaches_adapter() {
    let (bridge, mock, _rx) = setup(|_| {});
    bridge.connect().await;

    for text in ["say hi\nstop", "say hi\r\nstop", "list\r"] {
        let result = bridge.execute_command(text, None).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("single line"));
    }
    assert!(mock.commands().is_empty());

    let result = bridge.execute_command("say hi", None).await.unwrap();
    assert!(result.success);
    assert_eq!(mock.commands(), vec!["say hi"]);
}

#[tokio::test(start_paused = true)]
async fn test_execute_command_without_capability_fails_fast() {
    let (bridge, mock, _rx) = setup(|m| {
        m.caps = [Capability::RealtimeEvents].into();
    });
    bridge.connect().await;

    let err = bridge.execute_command("list", None).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::CapabilityDenied(Capability::CommandExecution)
    ));
    assert!(mock.commands().is_empty());
    assert!(mock.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_peer_advertisement_narrows_capabilities() {
    let (bridge, mock, _rx) = setup(|m| {
        m.peer_caps = Some([Capability::RealtimeEvents, Capability::ConsoleAccess].into());
    });
    bridge.connect().await;

    assert_eq!(
        bridge.capabilities(),
        CapabilitySet::from([Capability::RealtimeEvents])
    );
    assert!(bridge.execute_command("list", None).await.is_err());
    assert!(mock.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_commands_run_one_at_a_time_in_order() {
    let (bridge, mock, _rx) = setup(|m| m.command_delay = Duration::from_secs(1));
    bridge.connect().await;

    let mut handles = Vec::new();
    for cmd in ["first", "second", "third"] {
        let b = bridge.clone();
        handles.push(tokio::spawn(async move {
            b.execute_command(cmd, None).await.unwrap()
        }));
        settle().await;
    }

    // Only the first has reached the transport.
    assert_eq!(mock.commands(), vec!["first"]);
    let occupancy = bridge.snapshot().commands;
    assert_eq!(occupancy.in_flight, 1);
    assert_eq!(occupancy.queued, 2);

    let mut outputs = Vec::new();
    for h in handles {
        let result = h.await.unwrap();
        assert!(result.success);
        outputs.push(result.output[0].clone());
    }
    assert_eq!(outputs, vec!["ran first", "ran second", "ran third"]);
    assert_eq!(mock.commands(), vec!["first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn test_command_timeout_is_structured_failure() {
    let (bridge, _mock, _rx) = setup(|m| m.command_delay = Duration::from_secs(60));
    bridge.connect().await;

    let result = bridge
        .execute_command("save-all", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_rejects_queued_commands() {
    let (bridge, mock, _rx) = setup(|m| m.command_delay = Duration::from_secs(10));
    bridge.connect().await;

    let mut handles = Vec::new();
    for cmd in ["a", "b", "c"] {
        let b = bridge.clone();
        handles.push(tokio::spawn(async move {
            b.execute_command(cmd, None).await.unwrap()
        }));
        settle().await;
    }

    bridge.disconnect().await;
    assert_eq!(bridge.connection_status(), ConnectionStatus::Disconnected);

    let results: Vec<CommandResult> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    // The in-flight command finishes on its own; the queued ones are rejected.
    assert!(results[0].success);
    for queued in &results[1..] {
        assert!(!queued.success);
        assert!(queued.error.as_deref().unwrap().contains("Connection closed"));
    }
    assert_eq!(mock.commands(), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_disconnect_reconnects_with_backoff() {
    let (bridge, mock, _rx) = setup(|m| {
        // initial connect ok, first retry refused, second retry ok
        m.connect_results = Mutex::new(VecDeque::from([true, false, true]));
    });
    bridge.connect().await;
    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 1);

    mock.drop_connection();
    settle().await;
    let status = bridge.reconnect().status();
    assert!(status.is_reconnecting);
    assert_eq!(status.next_interval_ms, 5000);
    assert_eq!(bridge.connection_status(), ConnectionStatus::Disconnected);

    // First retry at 5s fails, the bridge re-arms for 7.5s.
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    settle().await;
    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 2);
    let status = bridge.reconnect().status();
    assert_eq!(status.phase, ReconnectPhase::Scheduled);
    assert_eq!(status.next_interval_ms, 7500);

    tokio::time::sleep(Duration::from_millis(7_500)).await;
    settle().await;
    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 3);
    assert_eq!(bridge.connection_status(), ConnectionStatus::Connected);

    let status = bridge.reconnect().status();
    assert_eq!(status.current_attempts, 0);
    assert_eq!(status.total_attempts, 2);
    assert!(!status.is_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_cancels_pending_reconnect() {
    let (bridge, mock, _rx) = setup(|_| {});
    bridge.connect().await;

    mock.drop_connection();
    settle().await;
    assert!(bridge.reconnect().status().is_reconnecting);

    bridge.disconnect().await;
    assert!(!bridge.reconnect().status().is_reconnecting);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_disconnect_does_not_reconnect() {
    let (bridge, mock, _rx) = setup(|_| {});
    bridge.connect().await;
    bridge.disconnect().await;
    settle().await;

    assert_eq!(bridge.reconnect().status().phase, ReconnectPhase::Idle);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_initial_connect_schedules_reconnect() {
    let (bridge, mock, _rx) = setup(|m| {
        m.connect_results = Mutex::new(VecDeque::from([false]));
    });
    assert_eq!(bridge.connect().await, ConnectionStatus::Disconnected);
    assert!(bridge.reconnect().status().is_reconnecting);

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    settle().await;
    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 2);
    assert_eq!(bridge.connection_status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_ping_and_unknown_requests_are_answered() {
    let (bridge, mock, _rx) = setup(|_| {});
    bridge.connect().await;

    let ping = Message::request(ops::PING, json!({}));
    let bogus = Message::request("world.save", json!({}));
    mock.inject(ping.clone());
    mock.inject(bogus.clone());
    settle().await;

    let writes = mock.writes();
    assert_eq!(writes.len(), 2);

    assert!(writes[0].is_response_to(&ping.id));
    assert_eq!(writes[0].success, Some(true));
    assert!(writes[0].data.contains_key("pong"));

    assert!(writes[1].is_response_to(&bogus.id));
    assert_eq!(writes[1].success, Some(false));
    assert_eq!(
        writes[1].error.as_deref(),
        Some("unknown operation: world.save")
    );
}

#[tokio::test(start_paused = true)]
async fn test_peer_events_forwarded_per_subscription() {
    let (bridge, mock, mut forwarded) = setup(|_| {});
    bridge.connect().await;

    // Not subscribed yet: dropped.
    mock.inject(Message::event(ops::PLAYER_JOIN, json!({"name": "Steve"})));
    settle().await;
    assert!(forwarded.try_recv().is_err());

    // The peer registers interest itself, with a filter.
    mock.inject(Message::system(
        ops::SUBSCRIBE,
        json!({"op": ops::PLAYER_CHAT, "filter": {"name": "Steve"}}),
    ));
    mock.inject(Message::event(ops::PLAYER_CHAT, json!({"name": "Alex", "message": "hi"})));
    mock.inject(Message::event(ops::PLAYER_CHAT, json!({"name": "Steve", "message": "hello"})));
    settle().await;

    let ev = forwarded.try_recv().unwrap();
    assert_eq!(ev.server_id, "survival-1");
    assert_eq!(ev.message.data["message"], "hello");
    assert_eq!(ev.message.server_id.as_deref(), Some("survival-1"));
    assert!(forwarded.try_recv().is_err());

    mock.inject(Message::system(ops::UNSUBSCRIBE, json!({"op": ops::PLAYER_CHAT})));
    settle().await;
    assert!(!bridge.subscriptions().has_subscription(ops::PLAYER_CHAT));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_bridge_reports_disabled() {
    let (bridge, mock, _rx) = setup(|_| {});
    bridge.connect().await;

    assert_eq!(bridge.set_enabled(false).await, ConnectionStatus::Disabled);
    assert_eq!(bridge.connection_status(), ConnectionStatus::Disabled);
    assert_eq!(mock.state(), ConnectionState::Disconnected);
    assert_eq!(bridge.connect().await, ConnectionStatus::Disabled);
    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 1);

    assert_eq!(bridge.set_enabled(true).await, ConnectionStatus::Connected);
    assert_eq!(mock.connect_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_reflects_state() {
    let (bridge, _mock, _rx) = setup(|_| {});
    bridge.subscribe(ops::PLAYER_JOIN, None);
    bridge.connect().await;

    let snap = bridge.snapshot();
    assert_eq!(snap.server_id, "survival-1");
    assert_eq!(snap.name, "Survival");
    assert_eq!(snap.transport, TransportKind::OutboundSocket);
    assert_eq!(snap.status, ConnectionStatus::Connected);
    assert!(snap.healthy);
    assert_eq!(snap.subscriptions.len(), 1);

    let v = serde_json::to_value(&snap).unwrap();
    assert_eq!(v["serverId"], "survival-1");
    assert_eq!(v["reconnect"]["currentAttempts"], 0);
}
