//! Capability tokens.
//!
//! A capability names a feature a transport can actually perform. Bridges
//! check capabilities before dispatching an operation so that unsupported
//! calls fail fast instead of silently doing nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A named feature supported by a connection adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can execute console commands and return their output.
    CommandExecution,
    /// Delivers events as they happen.
    RealtimeEvents,
    /// Has direct access to the engine console.
    ConsoleAccess,
    /// Owns the server process (start/stop/kill).
    ProcessControl,
    /// Synthesizes events by scanning the engine log.
    LogMonitoring,
}

/// Ordered set of capabilities.
pub type CapabilitySet = BTreeSet<Capability>;

impl Capability {
    /// Every known capability.
    pub const ALL: [Capability; 5] = [
        Capability::CommandExecution,
        Capability::RealtimeEvents,
        Capability::ConsoleAccess,
        Capability::ProcessControl,
        Capability::LogMonitoring,
    ];

    /// Wire token for this capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CommandExecution => "command_execution",
            Capability::RealtimeEvents => "realtime_events",
            Capability::ConsoleAccess => "console_access",
            Capability::ProcessControl => "process_control",
            Capability::LogMonitoring => "log_monitoring",
        }
    }

    /// Parse a wire token. Unknown tokens yield `None`.
    pub fn parse(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == token)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a JSON array of capability tokens, as advertised in a handshake.
///
/// Returns `None` when the value is not an array. Unknown tokens are skipped
/// so newer peers can advertise features this hub does not know about.
pub fn parse_capability_list(value: &Value) -> Option<CapabilitySet> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(Capability::parse)
            .collect(),
    )
}

/// Serialize a capability set as a JSON array of tokens.
pub fn capability_list(set: &CapabilitySet) -> Value {
    Value::Array(set.iter().map(|c| Value::from(c.as_str())).collect())
}

/// Effective capabilities: the transport's intrinsic set, narrowed to what the
/// peer advertised when it advertised anything at all.
pub fn negotiate(intrinsic: &CapabilitySet, advertised: Option<&CapabilitySet>) -> CapabilitySet {
    match advertised {
        Some(adv) => intrinsic.intersection(adv).copied().collect(),
        None => intrinsic.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_roundtrip() {
        for cap in Capability::ALL {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
            let json = serde_json::to_string(&cap).unwrap();
            assert_eq!(json, format!("\"{}\"", cap.as_str()));
        }
        assert_eq!(Capability::parse("teleport"), None);
    }

    #[test]
    fn test_parse_list_skips_unknown() {
        let set = parse_capability_list(&json!(["command_execution", "teleport", 7])).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&Capability::CommandExecution));
        assert!(parse_capability_list(&json!("command_execution")).is_none());
    }

    #[test]
    fn test_negotiate_intersects() {
        let intrinsic: CapabilitySet =
            [Capability::CommandExecution, Capability::RealtimeEvents].into();
        let advertised: CapabilitySet =
            [Capability::RealtimeEvents, Capability::ProcessControl].into();

        let effective = negotiate(&intrinsic, Some(&advertised));
        assert_eq!(effective, CapabilitySet::from([Capability::RealtimeEvents]));
        assert_eq!(negotiate(&intrinsic, None), intrinsic);
    }
}
