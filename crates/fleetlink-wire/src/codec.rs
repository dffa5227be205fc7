//! Message codec: U-WBP envelopes to and from JSON text.
//!
//! Decoding never panics and never hands a half-valid message to callers.
//! Unknown `op` values decode fine; rejecting them is the dispatcher's job.
//! Stream transports frame messages as newline-delimited JSON through
//! [`FrameBuffer`].

use fleetlink_types::error::FleetError;
use fleetlink_types::message::{Message, MessageType};
use serde_json::Value;
use thiserror::Error;

/// Maximum size of a single NDJSON frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl From<DecodeError> for FleetError {
    fn from(e: DecodeError) -> Self {
        FleetError::Decode(e.to_string())
    }
}

/// Encode a message as compact JSON text.
pub fn encode(msg: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Encode a message as one NDJSON line (trailing `\n` included).
pub fn encode_line(msg: &Message) -> Result<String, serde_json::Error> {
    let mut line = encode(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode a message from JSON text.
pub fn decode(text: &str) -> Result<Message, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    decode_value(value)
}

/// Decode a message from raw bytes. Invalid UTF-8 is malformed input.
pub fn decode_bytes(bytes: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    decode(text)
}

/// Decode a message from an already-parsed JSON value.
pub fn decode_value(value: Value) -> Result<Message, DecodeError> {
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

    for field in ["type", "id", "op"] {
        match obj.get(field) {
            None | Some(Value::Null) => return Err(DecodeError::MissingField(field)),
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(DecodeError::InvalidField(format!(
                    "'{field}' must be a string, got {other}"
                )))
            }
        }
    }
    if let Some(t) = obj.get("type").and_then(Value::as_str) {
        if serde_json::from_value::<MessageType>(Value::from(t)).is_err() {
            return Err(DecodeError::InvalidField(format!("unknown message type '{t}'")));
        }
    }

    serde_json::from_value(value).map_err(|e| DecodeError::InvalidField(e.to_string()))
}

/// Accumulates stream bytes and yields complete newline-delimited messages.
///
/// Partial trailing lines are kept until more input arrives. A line longer
/// than [`MAX_FRAME_SIZE`] is reported once and its bytes are discarded up to
/// the next newline.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    discarding: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Message, DecodeError>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let segment = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }
            if self.buf.len() + segment.len() > MAX_FRAME_SIZE {
                out.push(Err(DecodeError::FrameTooLarge {
                    size: self.buf.len() + segment.len(),
                    max: MAX_FRAME_SIZE,
                }));
                self.buf.clear();
                continue;
            }
            self.buf.extend_from_slice(segment);
            let line = std::mem::take(&mut self.buf);
            if let Some(result) = decode_line(&line) {
                out.push(result);
            }
        }

        if !self.discarding && !rest.is_empty() {
            if self.buf.len() + rest.len() > MAX_FRAME_SIZE {
                out.push(Err(DecodeError::FrameTooLarge {
                    size: self.buf.len() + rest.len(),
                    max: MAX_FRAME_SIZE,
                }));
                self.buf.clear();
                self.discarding = true;
            } else {
                self.buf.extend_from_slice(rest);
            }
        }

        out
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Result<Message, DecodeError>> {
        self.discarding = false;
        let line = std::mem::take(&mut self.buf);
        decode_line(&line)
    }
}

/// Decode one line; blank lines yield nothing.
fn decode_line(line: &[u8]) -> Option<Result<Message, DecodeError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(decode_bytes(line))
}
