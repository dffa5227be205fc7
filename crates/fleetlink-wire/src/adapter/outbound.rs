//! Outbound socket adapter: the hub dials the peer's WebSocket endpoint.
//!
//! `connect` opens the socket, sends a `handshake` and waits for the peer's
//! response. After that a reader task feeds incoming frames to the link and a
//! writer task drains the outgoing queue and pings every heartbeat interval.

use super::shared::AdapterCore;
use super::socket::SocketLink;
use super::{
    command_message, command_outcome, handshake_message, handshake_rejected,
    protocol_capabilities, AdapterContext, ConnectionAdapter, ConnectionState,
};
use async_trait::async_trait;
use fleetlink_types::capability::{parse_capability_list, CapabilitySet};
use fleetlink_types::command::CommandResult;
use fleetlink_types::config::TransportKind;
use fleetlink_types::error::{FleetError, FleetResult};
use fleetlink_types::message::{ops, Message};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Grace period for the peer to close after a `disconnect` message.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Hub-initiated WebSocket connection to a peer.
pub struct OutboundSocketAdapter {
    ctx: AdapterContext,
    url: String,
    handshake_timeout: Duration,
    heartbeat: Duration,
    link: Arc<SocketLink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl OutboundSocketAdapter {
    pub fn new(
        ctx: AdapterContext,
        url: String,
        handshake_timeout: Duration,
        heartbeat: Duration,
    ) -> Self {
        let core = AdapterCore::new(ctx.server_id.clone(), ctx.events.clone());
        Self {
            ctx,
            url,
            handshake_timeout,
            heartbeat,
            link: Arc::new(SocketLink::new(core)),
            tasks: Mutex::new(Vec::new()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    async fn open_and_handshake(&self) -> FleetResult<()> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| FleetError::Connection(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(FleetError::Connection(format!(
                "unsupported scheme '{}' (expected ws or wss)",
                url.scheme()
            )));
        }

        info!(server_id = %self.ctx.server_id, url = %self.url, "Connecting to peer");
        let (ws, _) = tokio::time::timeout(
            self.handshake_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| FleetError::Connection("connect timed out".to_string()))?
        .map_err(|e| FleetError::Connection(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();
        let (generation, mut outgoing) = self.link.open();

        // `interval` panics on a zero period.
        let heartbeat = self.heartbeat.max(Duration::from_millis(1));
        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    frame = outgoing.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                                debug!("outbound writer stopped: {e}");
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let link = Arc::clone(&self.link);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => link.incoming(generation, &text),
                    Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => link.incoming(generation, text),
                        Err(_) => warn!(server_id = %link.core.server_id, "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Ping(_))) => {
                        link.core.touch()
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by peer: {}", f.reason))
                            .unwrap_or_else(|| "closed by peer".to_string());
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => break format!("socket error: {e}"),
                    None => break "socket closed".to_string(),
                }
            };
            link.closed(generation, &reason);
        });

        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(writer);
            tasks.push(reader);
        }

        let handshake = handshake_message(&self.ctx, &protocol_capabilities());
        let response = match self.link.request(handshake, self.handshake_timeout).await {
            Ok(r) => r,
            Err(e) => {
                self.link.release();
                self.abort_tasks();
                return Err(FleetError::Connection(format!("handshake failed: {e}")));
            }
        };
        if response.success != Some(true) {
            self.link.release();
            self.abort_tasks();
            return Err(handshake_rejected(&response));
        }

        self.link
            .core
            .set_peer_caps(response.data.get("capabilities").and_then(parse_capability_list));
        self.link.core.mark_connected();
        Ok(())
    }
}

#[async_trait]
impl ConnectionAdapter for OutboundSocketAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::OutboundSocket
    }

    fn capabilities(&self) -> CapabilitySet {
        protocol_capabilities()
    }

    fn peer_capabilities(&self) -> Option<CapabilitySet> {
        self.link.core.peer_caps()
    }

    fn state(&self) -> ConnectionState {
        self.link.core.state()
    }

    async fn connect(&self) -> FleetResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.abort_tasks();
        self.link.core.set_state(ConnectionState::Connecting);
        let result = self.open_and_handshake().await;
        if result.is_err() {
            self.link.core.set_state(ConnectionState::Disconnected);
        }
        result
    }

    async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        let generation = self.link.core.generation();
        let bye = Message::system(ops::DISCONNECT, json!({ "reason": "hub disconnect" }))
            .with_server_id(self.ctx.server_id.clone());
        let _ = self.link.send(&bye);
        self.link.core.mark_closing();
        self.link.release();

        if !self.link.core.wait_disconnected(CLOSE_GRACE).await {
            warn!(server_id = %self.ctx.server_id, "Peer did not close in time, dropping socket");
            self.abort_tasks();
            self.link.closed(generation, "closed locally");
        }
        self.abort_tasks();
    }

    async fn send_message(&self, msg: Message) -> FleetResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(FleetError::ConnectionClosed);
        }
        self.link.send(&msg)
    }

    async fn send_command(&self, command: &str, timeout: Duration) -> CommandResult {
        let started = tokio::time::Instant::now();
        if self.state() != ConnectionState::Connected {
            return CommandResult::failed(FleetError::ConnectionClosed.to_string(), started.elapsed());
        }
        let outcome = self
            .link
            .request(command_message(&self.ctx.server_id, command), timeout)
            .await
            .map_err(|e| match e {
                FleetError::CommandTimeout { timeout_ms, .. } => FleetError::CommandTimeout {
                    command: command.to_string(),
                    timeout_ms,
                },
                other => other,
            });
        command_outcome(outcome, started.elapsed())
    }

    fn is_healthy(&self) -> bool {
        self.link.core.is_live(self.heartbeat * 3)
    }
}
