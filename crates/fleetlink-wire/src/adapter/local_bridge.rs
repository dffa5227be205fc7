//! Local bridge adapter: the peer exposes an HTTP endpoint on localhost.
//!
//! Requests are POSTed to `{base}/wbp` and the response body is the U-WBP
//! response. Events are long-polled from `GET {base}/wbp/events?since=<id>`
//! as newline-delimited JSON.

use super::shared::AdapterCore;
use super::{
    command_message, command_outcome, handshake_message, handshake_rejected,
    protocol_capabilities, AdapterContext, AdapterEvent, ConnectionAdapter, ConnectionState,
};
use crate::codec::{self, FrameBuffer};
use async_trait::async_trait;
use fleetlink_types::capability::{parse_capability_list, CapabilitySet};
use fleetlink_types::command::CommandResult;
use fleetlink_types::config::TransportKind;
use fleetlink_types::error::{FleetError, FleetResult};
use fleetlink_types::message::{ops, Message, MessageType};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consecutive failed polls that count as a lost connection.
const MAX_POLL_FAILURES: u32 = 3;

/// HTTP long-poll connection to a co-located peer.
pub struct LocalBridgeAdapter {
    ctx: AdapterContext,
    base_url: String,
    poll_interval: Duration,
    request_timeout: Duration,
    client: reqwest::Client,
    core: Arc<AdapterCore>,
    poller: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl LocalBridgeAdapter {
    pub fn new(
        ctx: AdapterContext,
        base_url: String,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        let core = Arc::new(AdapterCore::new(ctx.server_id.clone(), ctx.events.clone()));
        Self {
            ctx,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
            request_timeout,
            client: reqwest::Client::new(),
            core,
            poller: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// POST one message; the body, if any, is the peer's reply.
    async fn post(&self, msg: &Message, timeout: Duration) -> FleetResult<Option<Message>> {
        let resp = self
            .client
            .post(format!("{}/wbp", self.base_url))
            .timeout(timeout)
            .json(msg)
            .send()
            .await
            .map_err(|e| FleetError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FleetError::Connection(format!("peer returned {status}")));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| FleetError::Connection(e.to_string()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(codec::decode_bytes(&body)?))
    }

    fn stop_poller(&self) {
        if let Some(task) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    fn spawn_poller(&self, generation: u64) {
        let core = Arc::clone(&self.core);
        let client = self.client.clone();
        let url = format!("{}/wbp/events", self.base_url);
        let poll_interval = self.poll_interval;
        let request_timeout = self.request_timeout;

        let task = tokio::spawn(async move {
            let mut since: Option<String> = None;
            let mut failures = 0u32;
            loop {
                if !core.is_current(generation) || core.state() != ConnectionState::Connected {
                    break;
                }
                let mut req = client.get(&url).timeout(request_timeout);
                if let Some(id) = &since {
                    req = req.query(&[("since", id.as_str())]);
                }
                let body = match req.send().await.and_then(|r| r.error_for_status()) {
                    Ok(resp) => resp.bytes().await,
                    Err(e) => Err(e),
                };
                match body {
                    Ok(body) => {
                        failures = 0;
                        core.touch();
                        let mut frames = FrameBuffer::new();
                        let mut items = frames.push(&body);
                        if frames.pending() > 0 {
                            debug!(server_id = %core.server_id, bytes = frames.pending(), "event body ends without newline");
                            items.extend(frames.finish());
                        }
                        for item in items {
                            match item {
                                Ok(msg) => {
                                    since = Some(msg.id.clone());
                                    if msg.kind == MessageType::Response {
                                        debug!(server_id = %core.server_id, "ignoring response on event stream");
                                    } else {
                                        core.emit(AdapterEvent::Message(msg));
                                    }
                                }
                                Err(e) => {
                                    warn!(server_id = %core.server_id, error = %e, "Dropping undecodable event");
                                    core.emit(AdapterEvent::Error(format!("decode error: {e}")));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        debug!(server_id = %core.server_id, failures, error = %e, "event poll failed");
                        if failures >= MAX_POLL_FAILURES {
                            core.closed(generation, "event polling failed");
                            break;
                        }
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        });
        *self.poller.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }
}

#[async_trait]
impl ConnectionAdapter for LocalBridgeAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalBridge
    }

    fn capabilities(&self) -> CapabilitySet {
        protocol_capabilities()
    }

    fn peer_capabilities(&self) -> Option<CapabilitySet> {
        self.core.peer_caps()
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    async fn connect(&self) -> FleetResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.stop_poller();
        self.core.set_state(ConnectionState::Connecting);
        info!(server_id = %self.ctx.server_id, base_url = %self.base_url, "Connecting to local bridge");

        let handshake = handshake_message(&self.ctx, &protocol_capabilities());
        let result = match self.post(&handshake, self.request_timeout).await {
            Ok(Some(resp)) if resp.is_response_to(&handshake.id) && resp.success == Some(true) => {
                Ok(resp)
            }
            Ok(Some(resp)) => Err(handshake_rejected(&resp)),
            Ok(None) => Err(FleetError::Connection("empty handshake response".to_string())),
            Err(e) => Err(e),
        };
        let resp = match result {
            Ok(r) => r,
            Err(e) => {
                self.core.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let generation = self.core.begin();
        self.core
            .set_peer_caps(resp.data.get("capabilities").and_then(parse_capability_list));
        self.core.mark_connected();
        self.spawn_poller(generation);
        Ok(())
    }

    async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        let generation = self.core.generation();
        self.core.mark_closing();
        let bye = Message::system(ops::DISCONNECT, json!({ "reason": "hub disconnect" }))
            .with_server_id(self.ctx.server_id.clone());
        if let Err(e) = self.post(&bye, self.request_timeout.min(Duration::from_secs(5))).await {
            debug!(server_id = %self.ctx.server_id, error = %e, "disconnect notice not delivered");
        }
        self.stop_poller();
        self.core.closed(generation, "closed locally");
    }

    async fn send_message(&self, msg: Message) -> FleetResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(FleetError::ConnectionClosed);
        }
        if let Some(reply) = self.post(&msg, self.request_timeout).await? {
            if reply.kind != MessageType::Response {
                self.core.emit(AdapterEvent::Message(reply));
            }
        }
        Ok(())
    }

    async fn send_command(&self, command: &str, timeout: Duration) -> CommandResult {
        let started = tokio::time::Instant::now();
        if self.state() != ConnectionState::Connected {
            return CommandResult::failed(FleetError::ConnectionClosed.to_string(), started.elapsed());
        }
        let req = command_message(&self.ctx.server_id, command);
        let outcome = match tokio::time::timeout(timeout, self.post(&req, timeout)).await {
            Ok(Ok(Some(resp))) if resp.is_response_to(&req.id) => Ok(resp),
            Ok(Ok(_)) => Err(FleetError::Connection(
                "peer did not answer the command".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FleetError::CommandTimeout {
                command: command.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        command_outcome(outcome, started.elapsed())
    }

    fn is_healthy(&self) -> bool {
        self.core
            .is_live(self.request_timeout + self.poll_interval * 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[derive(Clone)]
    struct PeerState {
        served_event: Arc<AtomicBool>,
        fail_events: bool,
    }

    async fn wbp(Json(msg): Json<Message>) -> Json<Message> {
        let reply = match msg.op.as_str() {
            ops::HANDSHAKE => Message::response_to(
                &msg,
                true,
                json!({"capabilities": ["command_execution", "realtime_events"]}),
                None,
            ),
            ops::SERVER_COMMAND => Message::response_to(
                &msg,
                true,
                json!({"output": "There are 0 of a max of 20 players online"}),
                None,
            ),
            other => Message::response_to(&msg, false, json!({}), Some(format!("unknown op {other}"))),
        };
        Json(reply)
    }

    async fn events(State(st): State<PeerState>) -> Result<String, StatusCode> {
        if st.fail_events {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        if st.served_event.swap(true, Ordering::SeqCst) {
            return Ok(String::new());
        }
        let ev = Message::event(ops::PLAYER_JOIN, json!({"name": "Steve"}));
        Ok(codec::encode_line(&ev).unwrap())
    }

    async fn spawn_peer(fail_events: bool) -> String {
        let state = PeerState {
            served_event: Arc::new(AtomicBool::new(false)),
            fail_events,
        };
        let app = Router::new()
            .route("/wbp", post(wbp))
            .route("/wbp/events", get(events))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn adapter(base: String) -> (LocalBridgeAdapter, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = AdapterContext {
            server_id: "local-1".into(),
            hub_id: "hub".into(),
            events: tx,
        };
        (
            LocalBridgeAdapter::new(ctx, base, Duration::from_millis(20), Duration::from_secs(2)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_connect_poll_and_command() {
        let (a, mut events) = adapter(spawn_peer(false).await);
        a.connect().await.unwrap();
        assert!(matches!(events.recv().await, Some(AdapterEvent::Connected)));
        assert_eq!(a.peer_capabilities(), Some(protocol_capabilities()));

        match events.recv().await {
            Some(AdapterEvent::Message(m)) => {
                assert_eq!(m.op, ops::PLAYER_JOIN);
                assert_eq!(m.data["name"], "Steve");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let result = a.send_command("list", Duration::from_secs(2)).await;
        assert!(result.success);
        assert_eq!(result.output, vec!["There are 0 of a max of 20 players online"]);

        a.disconnect().await;
        match events.recv().await {
            Some(AdapterEvent::Disconnected { graceful, .. }) => assert!(graceful),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_three_failed_polls_disconnect() {
        let (a, mut events) = adapter(spawn_peer(true).await);
        a.connect().await.unwrap();
        assert!(matches!(events.recv().await, Some(AdapterEvent::Connected)));
        match events.recv().await {
            Some(AdapterEvent::Disconnected { graceful, reason }) => {
                assert!(!graceful);
                assert!(reason.contains("polling"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let (a, _events) = adapter("http://127.0.0.1:9".into());
        assert!(a.connect().await.is_err());
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }
}
