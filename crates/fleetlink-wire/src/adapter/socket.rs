//! Text-frame channel shared by the outbound and inbound socket adapters.
//!
//! The socket itself lives in a task owned by the transport; this side only
//! sees a queue of outgoing frames and a stream of incoming text.

use super::shared::AdapterCore;
use super::AdapterEvent;
use crate::codec;
use crate::pending::PendingRequests;
use fleetlink_types::error::{FleetError, FleetResult};
use fleetlink_types::message::{Message, MessageType};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) struct SocketLink {
    pub core: AdapterCore,
    pub pending: PendingRequests,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl SocketLink {
    pub fn new(core: AdapterCore) -> Self {
        Self {
            core,
            pending: PendingRequests::new(),
            outgoing: Mutex::new(None),
        }
    }

    /// Install a fresh outgoing queue. Any previous queue is dropped, which
    /// ends the writer of the previous socket.
    pub fn open(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.core.begin();
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        (generation, rx)
    }

    /// Drop the outgoing queue so the writer closes the socket.
    pub fn release(&self) {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn send(&self, msg: &Message) -> FleetResult<()> {
        let text = codec::encode(msg)?;
        let guard = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard.as_ref().ok_or(FleetError::ConnectionClosed)?;
        tx.send(text).map_err(|_| FleetError::ConnectionClosed)?;
        debug!(server_id = %self.core.server_id, op = %msg.op, id = %msg.id, "frame queued");
        Ok(())
    }

    /// Send `msg` and wait for the response that references its id.
    pub async fn request(&self, msg: Message, timeout: Duration) -> FleetResult<Message> {
        let id = msg.id.clone();
        let rx = self.pending.register(&id);
        if let Err(e) = self.send(&msg) {
            self.pending.cancel(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(FleetError::ConnectionClosed),
            Err(_) => {
                self.pending.cancel(&id);
                Err(FleetError::CommandTimeout {
                    command: msg.op,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Handle one incoming text frame from channel `generation`.
    pub fn incoming(&self, generation: u64, text: &str) {
        if !self.core.is_current(generation) {
            return;
        }
        self.core.touch();
        match codec::decode(text) {
            Ok(msg) if msg.kind == MessageType::Response => {
                self.pending.resolve(msg);
            }
            Ok(msg) => self.core.emit(AdapterEvent::Message(msg)),
            Err(e) => {
                warn!(server_id = %self.core.server_id, error = %e, "Dropping undecodable frame");
                self.core.emit(AdapterEvent::Error(format!("decode error: {e}")));
            }
        }
    }

    /// Channel `generation` has closed.
    pub fn closed(&self, generation: u64, reason: &str) {
        if !self.core.is_current(generation) {
            return;
        }
        self.release();
        self.pending.clear();
        self.core.closed(generation, reason);
    }
}
