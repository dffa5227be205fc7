//! Request/response correlation.
//!
//! Each outstanding request owns one slot keyed by its message id. The first
//! response carrying that id as `requestId` takes the slot; anything after
//! that (duplicates, responses to timed-out requests) is dropped.

use dashmap::DashMap;
use fleetlink_types::message::Message;
use tokio::sync::oneshot;
use tracing::debug;

/// Table of requests awaiting a response.
#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: DashMap<String, oneshot::Sender<Message>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `request_id` and return the receiving half.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(request_id.to_string(), tx);
        rx
    }

    /// Deliver a response. Returns `true` when it resolved a waiting request.
    pub fn resolve(&self, response: Message) -> bool {
        let Some(request_id) = response.request_id.clone() else {
            debug!(id = %response.id, "response without requestId dropped");
            return false;
        };
        match self.slots.remove(&request_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!(request_id = %request_id, "late or duplicate response dropped");
                false
            }
        }
    }

    /// Forget a request, e.g. after its timeout elapsed.
    pub fn cancel(&self, request_id: &str) {
        self.slots.remove(request_id);
    }

    /// Drop every slot. Waiters observe a closed channel.
    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
