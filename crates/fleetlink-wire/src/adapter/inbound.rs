//! Inbound socket adapter: the peer dials the hub.
//!
//! `connect` only makes the adapter ready to accept. The hub's socket
//! endpoint authenticates the peer's handshake, then calls
//! [`InboundSocketAdapter::attach`] and pumps frames through the returned
//! [`InboundSession`]. Attaching a new socket retires the previous one.

use super::shared::AdapterCore;
use super::socket::SocketLink;
use super::{
    command_message, command_outcome, protocol_capabilities, AdapterContext, ConnectionAdapter,
    ConnectionState,
};
use async_trait::async_trait;
use fleetlink_types::capability::CapabilitySet;
use fleetlink_types::command::CommandResult;
use fleetlink_types::config::TransportKind;
use fleetlink_types::error::{FleetError, FleetResult};
use fleetlink_types::message::{ops, Message};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Interval at which the hub pings attached peers.
pub const INBOUND_HEARTBEAT: Duration = Duration::from_secs(15);

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Peer-initiated WebSocket connection.
pub struct InboundSocketAdapter {
    server_id: String,
    /// SECURITY: shared token is zeroized on drop.
    token: Zeroizing<String>,
    link: Arc<SocketLink>,
}

impl InboundSocketAdapter {
    pub fn new(ctx: AdapterContext, token: String) -> Self {
        let core = AdapterCore::new(ctx.server_id.clone(), ctx.events);
        Self {
            server_id: ctx.server_id,
            token: Zeroizing::new(token),
            link: Arc::new(SocketLink::new(core)),
        }
    }

    /// Constant-time token check. An empty configured token accepts anyone.
    pub fn verify_token(&self, presented: Option<&str>) -> bool {
        if self.token.is_empty() {
            return true;
        }
        let presented = presented.unwrap_or("");
        self.token.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Whether a peer may attach right now.
    pub fn is_accepting(&self) -> bool {
        matches!(
            self.link.core.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    /// Bind an authenticated socket to this adapter.
    ///
    /// Fails when the adapter is not accepting (never connected, or
    /// disconnected by the hub).
    pub fn attach(&self, advertised: Option<CapabilitySet>) -> FleetResult<InboundSession> {
        if !self.is_accepting() {
            return Err(FleetError::Connection(format!(
                "peer '{}' is not accepting connections",
                self.server_id
            )));
        }
        if self.link.core.state() == ConnectionState::Connected {
            info!(server_id = %self.server_id, "Replacing existing inbound socket");
        }
        let (generation, outgoing) = self.link.open();
        self.link.core.set_peer_caps(advertised);
        self.link.core.mark_connected();
        Ok(InboundSession {
            link: Arc::clone(&self.link),
            generation,
            outgoing,
        })
    }
}

/// One attached socket, driven by the hub's socket task.
pub struct InboundSession {
    link: Arc<SocketLink>,
    generation: u64,
    outgoing: mpsc::UnboundedReceiver<String>,
}

impl InboundSession {
    /// Feed one text frame from the peer.
    pub fn deliver(&self, text: &str) {
        self.link.incoming(self.generation, text);
    }

    /// Record non-data traffic (pong) for liveness.
    pub fn touch(&self) {
        if self.is_current() {
            self.link.core.touch();
        }
    }

    /// Next frame to write to the socket. `None` means close the socket.
    pub async fn next_outgoing(&mut self) -> Option<String> {
        self.outgoing.recv().await
    }

    /// False once a newer socket has been attached.
    pub fn is_current(&self) -> bool {
        self.link.core.is_current(self.generation)
    }

    /// Report that the socket has closed.
    pub fn closed(self, reason: &str) {
        self.link.closed(self.generation, reason);
    }
}

#[async_trait]
impl ConnectionAdapter for InboundSocketAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::InboundSocket
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
        if self.state() == ConnectionState::Disconnected {
            self.link.core.set_state(ConnectionState::Connecting);
            info!(server_id = %self.server_id, "Waiting for inbound peer");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        match self.state() {
            ConnectionState::Disconnected => return,
            ConnectionState::Connecting => {
                self.link.core.set_state(ConnectionState::Disconnected);
                return;
            }
            ConnectionState::Connected | ConnectionState::Closing => {}
        }

        let generation = self.link.core.generation();
        let bye = Message::system(ops::DISCONNECT, json!({ "reason": "hub disconnect" }))
            .with_server_id(self.server_id.clone());
        let _ = self.link.send(&bye);
        self.link.core.mark_closing();
        self.link.release();

        if !self.link.core.wait_disconnected(CLOSE_GRACE).await {
            warn!(server_id = %self.server_id, "Inbound socket did not close in time");
            self.link.closed(generation, "closed locally");
        }
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
            .request(command_message(&self.server_id, command), timeout)
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
        self.link.core.is_live(INBOUND_HEARTBEAT * 3)
    }

    fn as_inbound(&self) -> Option<&InboundSocketAdapter> {
        Some(self)
    }
}
