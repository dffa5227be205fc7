//! U-WBP message envelope.
//!
//! Every frame exchanged between the hub and a peer is a [`Message`]: a flat
//! JSON object carrying a type tag, a time-ordered id, an operation name and
//! an open key/value payload. Responses additionally reference the request
//! they answer through `requestId`.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current protocol version string.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Length of the random suffix appended to message ids.
const ID_SUFFIX_LEN: usize = 9;

/// Well-known operation names.
///
/// The core treats `op` as an opaque string; these constants only exist so
/// call sites do not repeat string literals.
pub mod ops {
    pub const HANDSHAKE: &str = "handshake";
    pub const DISCONNECT: &str = "disconnect";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";

    pub const PLAYER_JOIN: &str = "player.join";
    pub const PLAYER_LEAVE: &str = "player.leave";
    pub const PLAYER_CHAT: &str = "player.chat";
    pub const PLAYER_DEATH: &str = "player.death";
    pub const SERVER_START: &str = "server.start";
    pub const SERVER_STOP: &str = "server.stop";
    pub const SERVER_METRICS: &str = "server.metrics";

    pub const SERVER_COMMAND: &str = "server.command";
}

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    System,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Request => write!(f, "request"),
            MessageType::Response => write!(f, "response"),
            MessageType::Event => write!(f, "event"),
            MessageType::System => write!(f, "system"),
        }
    }
}

/// A U-WBP protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Envelope type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Globally unique, time-ordered id (`<ms>-<suffix>`).
    pub id: String,
    /// Operation or event name.
    pub op: String,
    /// Operation-specific payload.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    /// Protocol version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Peer this message concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Id of the request this response answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Outcome flag (responses only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Human-readable failure reason (responses only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Message {
    /// Build a new message of the given type, stamped with a fresh id and the
    /// current time.
    pub fn new(kind: MessageType, op: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            id: generate_message_id(),
            op: op.into(),
            data: into_payload(data),
            timestamp: Utc::now().timestamp_millis(),
            version: PROTOCOL_VERSION.to_string(),
            server_id: None,
            request_id: None,
            success: None,
            error: None,
        }
    }

    pub fn request(op: impl Into<String>, data: Value) -> Self {
        Self::new(MessageType::Request, op, data)
    }

    pub fn event(op: impl Into<String>, data: Value) -> Self {
        Self::new(MessageType::Event, op, data)
    }

    pub fn system(op: impl Into<String>, data: Value) -> Self {
        Self::new(MessageType::System, op, data)
    }

    /// Build the response to `request`. The response reuses the request's
    /// `op` and `serverId` and references its id through `requestId`.
    pub fn response_to(request: &Message, success: bool, data: Value, error: Option<String>) -> Self {
        let mut msg = Self::new(MessageType::Response, request.op.clone(), data);
        msg.server_id = request.server_id.clone();
        msg.request_id = Some(request.id.clone());
        msg.success = Some(success);
        msg.error = error;
        msg
    }

    /// Attach the peer id this message concerns.
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// True when this is a response to the request with the given id.
    pub fn is_response_to(&self, request_id: &str) -> bool {
        self.kind == MessageType::Response && self.request_id.as_deref() == Some(request_id)
    }

    /// Read a string field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Generate a time-ordered message id: milliseconds since the epoch followed
/// by a random lowercase alphanumeric suffix.
pub fn generate_message_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{}", Utc::now().timestamp_millis(), suffix)
}

/// Normalise an arbitrary JSON value into a message payload.
///
/// Objects are used as-is, `null` becomes an empty payload and any other value
/// is wrapped as `{"value": ...}`.
pub fn into_payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
