//! Per-peer event subscriptions.

use dashmap::DashMap;
use fleetlink_types::filter::EventFilter;
use serde::Serialize;
use serde_json::{Map, Value};

/// One registered interest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<EventFilter>,
}

/// Event interest list for one peer, keyed by `op`.
///
/// Re-subscribing to an `op` replaces its filter.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<String, Option<EventFilter>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, op: impl Into<String>, filter: Option<EventFilter>) {
        // An empty filter matches everything; store it as "no filter".
        let filter = filter.filter(|f| !f.is_empty());
        self.entries.insert(op.into(), filter);
    }

    /// Returns `true` when a subscription was removed.
    pub fn unsubscribe(&self, op: &str) -> bool {
        self.entries.remove(op).is_some()
    }

    pub fn has_subscription(&self, op: &str) -> bool {
        self.entries.contains_key(op)
    }

    /// True if `op` is subscribed and its filter (if any) accepts `attributes`.
    pub fn matches_filters(&self, op: &str, attributes: &Map<String, Value>) -> bool {
        match self.entries.get(op) {
            Some(entry) => match entry.value() {
                Some(filter) => filter.matches(attributes),
                None => true,
            },
            None => false,
        }
    }

    /// Snapshot of all subscriptions, sorted by op.
    pub fn list(&self) -> Vec<Subscription> {
        let mut out: Vec<Subscription> = self
            .entries
            .iter()
            .map(|e| Subscription {
                op: e.key().clone(),
                filter: e.value().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.op.cmp(&b.op));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_unsubscribed_op_never_matches() {
        let reg = SubscriptionRegistry::new();
        assert!(!reg.has_subscription("player.join"));
        assert!(!reg.matches_filters("player.join", &attrs(json!({"name": "Steve"}))));
    }

    #[test]
    fn test_no_filter_matches_all() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe("player.join", None);
        assert!(reg.matches_filters("player.join", &Map::new()));
    }

    #[test]
    fn test_filter_and_replace() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe("player.join", Some(EventFilter::new().equals("firstJoin", true)));
        assert!(!reg.matches_filters("player.join", &attrs(json!({"firstJoin": false}))));
        assert!(reg.matches_filters("player.join", &attrs(json!({"firstJoin": true}))));

        reg.subscribe("player.join", Some(EventFilter::new()));
        assert!(reg.matches_filters("player.join", &attrs(json!({"firstJoin": false}))));
        assert_eq!(reg.list()[0].filter, None);
    }

    #[test]
    fn test_unsubscribe() {
        let reg = SubscriptionRegistry::new();
        reg.subscribe("server.start", None);
        reg.subscribe("player.chat", None);
        assert!(reg.unsubscribe("server.start"));
        assert!(!reg.unsubscribe("server.start"));
        let ops: Vec<String> = reg.list().into_iter().map(|s| s.op).collect();
        assert_eq!(ops, vec!["player.chat"]);
    }
}
