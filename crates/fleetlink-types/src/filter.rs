//! Attribute filters for event subscriptions.
//!
//! A filter is a flat map from attribute name to an expected value. A JSON
//! scalar means equality, a JSON array means membership. All entries must
//! match; an attribute missing from the event never matches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Expected value of a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Attribute must equal one of these values.
    OneOf(Vec<Value>),
    /// Attribute must equal this value.
    Equals(Value),
}

impl FilterValue {
    fn matches(&self, actual: &Value) -> bool {
        match self {
            FilterValue::OneOf(allowed) => allowed.iter().any(|v| v == actual),
            FilterValue::Equals(expected) => expected == actual,
        }
    }
}

/// Equality/membership matcher over event attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFilter {
    pub conditions: BTreeMap<String, FilterValue>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key == value`.
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .insert(key.into(), FilterValue::Equals(value.into()));
        self
    }

    /// Require `key` to be one of `values`.
    pub fn one_of(mut self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.insert(key.into(), FilterValue::OneOf(values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate the filter against an attribute map.
    pub fn matches(&self, attributes: &Map<String, Value>) -> bool {
        self.conditions.iter().all(|(key, expected)| {
            attributes
                .get(key)
                .map(|actual| expected.matches(actual))
                .unwrap_or(false)
        })
    }
}

/// Extract the flat attribute map used by filters: the top-level scalar
/// entries of an event payload. Nested objects and arrays are skipped.
pub fn extract_attributes(data: &Map<String, Value>) -> Map<String, Value> {
    data.iter()
        .filter(|(_, v)| !v.is_object() && !v.is_array())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
