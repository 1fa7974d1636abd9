//! Statement conditions.
//!
//! Conditions are a two-level map: operator (`StringEquals`, `ArnLike`, ...)
//! to condition key (`aws:SourceArn`, ...) to the expected value. Values are
//! kept as JSON so lists and scalars both round-trip unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Condition block of a policy statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(BTreeMap<String, BTreeMap<String, Value>>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition. When the operator/key pair already exists the values
    /// are unioned into a list.
    pub fn add(&mut self, operator: impl Into<String>, key: impl Into<String>, value: Value) {
        let keys = self.0.entry(operator.into()).or_default();
        let key = key.into();
        match keys.remove(&key) {
            None => {
                keys.insert(key, value);
            }
            Some(existing) => {
                keys.insert(key, union_values(existing, value));
            }
        }
    }

    /// Merge another condition block into this one.
    pub fn extend(&mut self, other: &Conditions) {
        for (operator, keys) in &other.0 {
            for (key, value) in keys {
                self.add(operator.clone(), key.clone(), value.clone());
            }
        }
    }

    pub fn get(&self, operator: &str, key: &str) -> Option<&Value> {
        self.0.get(operator).and_then(|keys| keys.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|keys| keys.is_empty())
    }

    pub fn len(&self) -> usize {
        self.0.values().map(|keys| keys.len()).sum()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.0).unwrap_or(Value::Null)
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

fn union_values(existing: Value, incoming: Value) -> Value {
    if existing == incoming {
        return existing;
    }
    let mut items = match existing {
        Value::Array(items) => items,
        other => vec![other],
    };
    let incoming = match incoming {
        Value::Array(items) => items,
        other => vec![other],
    };
    for item in incoming {
        if !items.contains(&item) {
            items.push(item);
        }
    }
    Value::Array(items)
}
