//! Structured command results.

use crate::message::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Outcome of a console command executed on a peer.
///
/// Callers always receive one of these, even when the transport failed or the
/// command timed out; the failure is reported through `success` and `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    /// Output lines in the order the peer produced them.
    #[serde(default)]
    pub output: Vec<String>,
    /// Wall-clock execution time in milliseconds.
    #[serde(default)]
    pub execution_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(output: Vec<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            output,
            execution_time: elapsed.as_millis() as u64,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: Vec::new(),
            execution_time: elapsed.as_millis() as u64,
            error: Some(error.into()),
        }
    }

    /// Keep partial output on a failed result.
    pub fn with_output(mut self, output: Vec<String>) -> Self {
        self.output = output;
        self
    }

    /// Build a result from a `server.command` response message.
    ///
    /// `data.output` may be an array of lines or a single string, which is
    /// split on newlines. A missing `success` flag counts as failure.
    pub fn from_response(response: &Message, elapsed: Duration) -> Self {
        let output = match response.data.get("output") {
            Some(Value::Array(lines)) => lines
                .iter()
                .map(|l| match l {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(text)) => text.lines().map(str::to_string).collect(),
            _ => Vec::new(),
        };
        let success = response.success.unwrap_or(false);
        let error = if success {
            None
        } else {
            Some(
                response
                    .error
                    .clone()
                    .unwrap_or_else(|| "peer reported failure".to_string()),
            )
        };
        Self {
            success,
            output,
            execution_time: elapsed.as_millis() as u64,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_response_array_output() {
        let req = Message::request("server.command", json!({"command": "list"}));
        let resp = Message::response_to(
            &req,
            true,
            json!({"output": ["There are 0 of a max of 20 players online"]}),
            None,
        );
        let result = CommandResult::from_response(&resp, Duration::from_millis(12));
        assert!(result.success);
        assert_eq!(result.output, vec!["There are 0 of a max of 20 players online"]);
        assert_eq!(result.execution_time, 12);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_from_response_string_output() {
        let req = Message::request("server.command", json!({"command": "help"}));
        let resp = Message::response_to(&req, true, json!({"output": "a\nb"}), None);
        let result = CommandResult::from_response(&resp, Duration::ZERO);
        assert_eq!(result.output, vec!["a", "b"]);
    }

    #[test]
    fn test_from_response_failure() {
        let req = Message::request("server.command", json!({"command": "nope"}));
        let resp = Message::response_to(&req, false, json!({}), Some("Unknown command".into()));
        let result = CommandResult::from_response(&resp, Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unknown command"));
    }

    #[test]
    fn test_serialized_shape() {
        let result = CommandResult::failed("timed out", Duration::from_secs(1))
            .with_output(vec!["partial".into()]);
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["executionTime"], 1000);
        assert_eq!(v["output"][0], "partial");
        assert_eq!(v["success"], false);
    }
}
