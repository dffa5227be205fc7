//! Connection adapters.
//!
//! One [`ConnectionAdapter`] trait, four transports:
//!
//! - **outbound**: the hub dials the peer's WebSocket endpoint
//! - **inbound**: the peer dials the hub; the hub attaches the socket
//! - **local_bridge**: the peer exposes an HTTP endpoint on localhost
//! - **process**: the hub owns the engine process and drives its console
//!
//! Every adapter reports lifecycle and traffic on an ordered
//! [`AdapterEvent`] channel owned by its bridge.

mod shared;
pub mod inbound;
pub mod local_bridge;
pub mod log_patterns;
pub mod outbound;
pub mod process;
mod socket;

use async_trait::async_trait;
use fleetlink_types::capability::{Capability, CapabilitySet};
use fleetlink_types::command::CommandResult;
use fleetlink_types::config::{TransportConfig, TransportKind};
use fleetlink_types::error::{FleetError, FleetResult};
use fleetlink_types::message::{ops, Message};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use inbound::{InboundSession, InboundSocketAdapter};
pub use local_bridge::LocalBridgeAdapter;
pub use outbound::OutboundSocketAdapter;
pub use process::ProcessAdapter;

/// Lifecycle state of the adapter's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Notification from an adapter to its bridge.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Connected,
    /// `graceful` is true only when the close was requested locally.
    Disconnected { reason: String, graceful: bool },
    Message(Message),
    Error(String),
}

pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;
pub type AdapterEventReceiver = mpsc::UnboundedReceiver<AdapterEvent>;

/// What every adapter needs to know about its peer.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub server_id: String,
    /// Identifier the hub presents in handshakes.
    pub hub_id: String,
    pub events: AdapterEventSender,
}

/// Transport strategy behind a bridge.
#[async_trait]
pub trait ConnectionAdapter: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Capabilities this transport can provide.
    fn capabilities(&self) -> CapabilitySet;

    /// Capabilities the peer advertised in its handshake, if any.
    fn peer_capabilities(&self) -> Option<CapabilitySet> {
        None
    }

    fn state(&self) -> ConnectionState;

    /// Establish the channel. Calling this while connected is a no-op.
    async fn connect(&self) -> FleetResult<()>;

    /// Graceful close, bounded wait, then force. Idempotent.
    async fn disconnect(&self);

    async fn send_message(&self, msg: Message) -> FleetResult<()>;

    /// Execute a console command. Failures come back as a failed result.
    async fn send_command(&self, command: &str, timeout: Duration) -> CommandResult;

    /// Channel open and, where measurable, traffic seen within the liveness window.
    fn is_healthy(&self) -> bool;

    /// Downcast hook for the hub's inbound acceptor.
    fn as_inbound(&self) -> Option<&InboundSocketAdapter> {
        None
    }
}

/// Build the adapter for a transport configuration.
pub fn build(transport: &TransportConfig, ctx: AdapterContext) -> Arc<dyn ConnectionAdapter> {
    match transport {
        TransportConfig::OutboundSocket {
            url,
            handshake_timeout_ms,
            heartbeat_interval_ms,
        } => Arc::new(OutboundSocketAdapter::new(
            ctx,
            url.clone(),
            Duration::from_millis(*handshake_timeout_ms),
            Duration::from_millis(*heartbeat_interval_ms),
        )),
        TransportConfig::InboundSocket { token } => {
            Arc::new(InboundSocketAdapter::new(ctx, token.clone()))
        }
        TransportConfig::LocalBridge {
            base_url,
            poll_interval_ms,
            request_timeout_ms,
        } => Arc::new(LocalBridgeAdapter::new(
            ctx,
            base_url.clone(),
            Duration::from_millis(*poll_interval_ms),
            Duration::from_millis(*request_timeout_ms),
        )),
        TransportConfig::Process {
            command,
            args,
            working_dir,
            stop_command,
            settle_ms,
            shutdown_grace_ms,
        } => Arc::new(ProcessAdapter::new(
            ctx,
            process::ProcessSpec {
                command: command.clone(),
                args: args.clone(),
                working_dir: working_dir.clone(),
                stop_command: stop_command.clone(),
                settle: Duration::from_millis(*settle_ms),
                shutdown_grace: Duration::from_millis(*shutdown_grace_ms),
            },
        )),
    }
}

/// Intrinsic capabilities of the WebSocket and local-bridge transports.
pub(crate) fn protocol_capabilities() -> CapabilitySet {
    [Capability::CommandExecution, Capability::RealtimeEvents].into()
}

/// Handshake request the hub sends to protocol-speaking peers.
pub(crate) fn handshake_message(ctx: &AdapterContext, capabilities: &CapabilitySet) -> Message {
    Message::system(
        ops::HANDSHAKE,
        json!({
            "serverId": ctx.server_id,
            "hubId": ctx.hub_id,
            "version": fleetlink_types::message::PROTOCOL_VERSION,
            "capabilities": fleetlink_types::capability::capability_list(capabilities),
        }),
    )
    .with_server_id(ctx.server_id.clone())
}

/// `server.command` request carrying `command`.
pub(crate) fn command_message(server_id: &str, command: &str) -> Message {
    Message::request(ops::SERVER_COMMAND, json!({ "command": command }))
        .with_server_id(server_id.to_string())
}

/// Turn the outcome of a command request into a [`CommandResult`].
pub(crate) fn command_outcome(
    outcome: FleetResult<Message>,
    elapsed: Duration,
) -> CommandResult {
    match outcome {
        Ok(response) => CommandResult::from_response(&response, elapsed),
        Err(e) => CommandResult::failed(e.to_string(), elapsed),
    }
}

/// Error for a handshake response that refused the connection.
pub(crate) fn handshake_rejected(response: &Message) -> FleetError {
    FleetError::Connection(format!(
        "handshake rejected: {}",
        response.error.as_deref().unwrap_or("no reason given")
    ))
}
